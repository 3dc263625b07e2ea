use std::path::PathBuf;
use std::time::Duration;

use crate::models::{CoreError, CoreErrorKind};

pub const DOWNLOAD_DIR_VAR: &str = "DOWNLOAD_DIR";
pub const PROGRESS_INTERVAL_VAR: &str = "PROCESS_POLL_INTERVAL_S";
pub const CANCEL_TIMEOUT_VAR: &str = "PROCESS_CANCEL_TIMEOUT_S";
pub const KILL_POLL_VAR: &str = "MEDIAFLOW_KILL_POLL_MS";
pub const KILL_WAIT_VAR: &str = "MEDIAFLOW_KILL_WAIT_MS";
pub const DIAGNOSTIC_LINES_VAR: &str = "MEDIAFLOW_DIAGNOSTIC_LINES";
pub const ERROR_LIMIT_VAR: &str = "MEDIAFLOW_ERROR_MESSAGE_LIMIT";
pub const DATABASE_VAR: &str = "MEDIAFLOW_DATABASE";

/// Runtime knobs for the task engine.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    /// Root of the per-task working directories (`<root>/<user>/<task>`).
    pub download_dir: PathBuf,
    /// Minimum spacing between progress events for one task.
    pub progress_interval: Duration,
    /// Grace period between SIGTERM and SIGKILL when cancelling.
    pub cancel_timeout: Duration,
    pub kill_poll_interval: Duration,
    /// How long to wait for the OS to reap a group after SIGKILL.
    pub kill_wait_bound: Duration,
    pub diagnostic_lines: usize,
    pub error_message_limit: usize,
    /// SQLite database file; `None` keeps task records in memory.
    pub database_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            progress_interval: Duration::from_secs(3),
            cancel_timeout: Duration::from_secs(3),
            kill_poll_interval: Duration::from_millis(100),
            kill_wait_bound: Duration::from_millis(2000),
            diagnostic_lines: 20,
            error_message_limit: 3500,
            database_path: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup, falling back to defaults for unset keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).map(|raw| clean(&raw)).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(dir) = read(DOWNLOAD_DIR_VAR) {
            config.download_dir = PathBuf::from(dir);
        }
        if let Some(raw) = read(PROGRESS_INTERVAL_VAR) {
            config.progress_interval = parse_seconds(PROGRESS_INTERVAL_VAR, &raw)?;
        }
        if let Some(raw) = read(CANCEL_TIMEOUT_VAR) {
            config.cancel_timeout = parse_seconds(CANCEL_TIMEOUT_VAR, &raw)?;
        }
        if let Some(raw) = read(KILL_POLL_VAR) {
            config.kill_poll_interval = Duration::from_millis(parse_count(KILL_POLL_VAR, &raw)? as u64);
        }
        if let Some(raw) = read(KILL_WAIT_VAR) {
            config.kill_wait_bound = Duration::from_millis(parse_count(KILL_WAIT_VAR, &raw)? as u64);
        }
        if let Some(raw) = read(DIAGNOSTIC_LINES_VAR) {
            config.diagnostic_lines = parse_count(DIAGNOSTIC_LINES_VAR, &raw)?;
        }
        if let Some(raw) = read(ERROR_LIMIT_VAR) {
            config.error_message_limit = parse_count(ERROR_LIMIT_VAR, &raw)?;
        }
        if let Some(path) = read(DATABASE_VAR) {
            config.database_path = Some(PathBuf::from(path));
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.download_dir.as_os_str().is_empty() {
            return Err(invalid("download_dir must not be empty"));
        }
        for (name, value) in [
            ("progress_interval", self.progress_interval),
            ("cancel_timeout", self.cancel_timeout),
            ("kill_poll_interval", self.kill_poll_interval),
            ("kill_wait_bound", self.kill_wait_bound),
        ] {
            if value.is_zero() {
                return Err(invalid(format!("{name} must be greater than zero")));
            }
        }
        if self.diagnostic_lines == 0 {
            return Err(invalid("diagnostic_lines must be greater than zero"));
        }
        if self.error_message_limit == 0 {
            return Err(invalid("error_message_limit must be greater than zero"));
        }
        Ok(())
    }
}

fn clean(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .trim()
        .to_string()
}

fn parse_seconds(key: &str, raw: &str) -> Result<Duration, CoreError> {
    let seconds: f64 = raw
        .parse()
        .map_err(|_| invalid(format!("{key} must be a number of seconds, got '{raw}'")))?;
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(invalid(format!("{key} must be positive, got '{raw}'")));
    }
    Duration::try_from_secs_f64(seconds)
        .map_err(|_| invalid(format!("{key} is out of range, got '{raw}'")))
}

fn parse_count(key: &str, raw: &str) -> Result<usize, CoreError> {
    match raw.parse::<usize>() {
        Ok(0) => Err(invalid(format!("{key} must be positive, got '{raw}'"))),
        Ok(value) => Ok(value),
        Err(_) => Err(invalid(format!("{key} must be a positive integer, got '{raw}'"))),
    }
}

fn invalid(message: impl Into<String>) -> CoreError {
    CoreError::new(CoreErrorKind::InvalidInput, message)
}
