pub mod lines;
pub mod supervisor;
#[cfg(unix)]
pub mod tokio_process;

pub use lines::DiagnosticLines;
pub use supervisor::{ProcessHandle, ProcessSupervisor, RegistrationGuard};
#[cfg(unix)]
pub use tokio_process::TokioProcessExecutor;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::SystemTime;

use tokio::io::AsyncRead;
use tokio::sync::watch;

use crate::models::{CoreError, CoreErrorKind, TaskId, UserId};

pub type ExecutionResult<T> = Result<T, CoreError>;

pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    /// Builds a command from a full argv, the first element being the program.
    pub fn from_argv<I, S>(argv: I) -> ExecutionResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = argv.into_iter().map(Into::into);
        let program = argv.next().ok_or_else(|| {
            CoreError::new(CoreErrorKind::InvalidInput, "command argv must not be empty")
        })?;
        Ok(Self::new(program).args(argv))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(working_dir.into());
        self
    }

    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect()
    }

    pub fn validate(&self) -> ExecutionResult<()> {
        if self.program.as_os_str().is_empty() {
            return Err(invalid_input("command program path must not be empty"));
        }

        if self.args.iter().any(|arg| arg.contains('\0')) {
            return Err(invalid_input("command args must not contain NUL bytes"));
        }

        if self
            .env
            .iter()
            .any(|(key, value)| key.is_empty() || key.contains('\0') || value.contains('\0'))
        {
            return Err(invalid_input(
                "environment keys must be non-empty and entries must not contain NUL bytes",
            ));
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessSpawnRequest {
    pub task_id: TaskId,
    pub user_id: UserId,
    pub command: CommandSpec,
    pub requested_at: SystemTime,
}

impl ProcessSpawnRequest {
    pub fn new(task_id: TaskId, user_id: UserId, command: CommandSpec) -> Self {
        Self {
            task_id,
            user_id,
            command,
            requested_at: SystemTime::now(),
        }
    }

    pub fn validate(&self) -> ExecutionResult<()> {
        self.command
            .validate()
            .map_err(|error| error.task(self.task_id).user(self.user_id))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessExitStatus {
    ExitCode(i32),
    Terminated,
}

impl ProcessExitStatus {
    pub fn success(self) -> bool {
        self == Self::ExitCode(0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessSignal {
    Terminate,
    Kill,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignalDelivery {
    Delivered,
    NoSuchProcess,
}

/// Observer of a child's exit status, fed by whoever reaps the child.
#[derive(Clone, Debug)]
pub struct ExitWatch {
    receiver: watch::Receiver<Option<ProcessExitStatus>>,
}

impl ExitWatch {
    pub fn channel() -> (watch::Sender<Option<ProcessExitStatus>>, Self) {
        let (sender, receiver) = watch::channel(None);
        (sender, Self { receiver })
    }

    pub fn has_exited(&self) -> bool {
        self.receiver.borrow().is_some()
    }

    /// Resolves once the child has been reaped. A reaper that vanished
    /// without reporting counts as a terminated child.
    pub async fn wait(&mut self) -> ProcessExitStatus {
        match self.receiver.wait_for(Option::is_some).await {
            Ok(status) => (*status).unwrap_or(ProcessExitStatus::Terminated),
            Err(_) => ProcessExitStatus::Terminated,
        }
    }
}

pub struct SpawnedProcess {
    pub pid: u32,
    pub pgid: u32,
    pub stdout: Option<OutputStream>,
    pub stderr: Option<OutputStream>,
    pub exit: ExitWatch,
}

pub trait ProcessExecutor: Send + Sync {
    fn spawn(&self, request: ProcessSpawnRequest) -> ExecutionResult<SpawnedProcess>;

    fn signal_group(&self, pgid: u32, signal: ProcessSignal) -> ExecutionResult<SignalDelivery>;
}

pub fn spawn_validated(
    executor: &dyn ProcessExecutor,
    request: ProcessSpawnRequest,
) -> ExecutionResult<SpawnedProcess> {
    request.validate()?;
    executor.spawn(request)
}

fn invalid_input(message: &str) -> CoreError {
    CoreError::new(CoreErrorKind::InvalidInput, message)
}

#[cfg(test)]
mod tests {
    use super::CommandSpec;
    use crate::models::CoreErrorKind;

    #[test]
    fn argv_splits_program_from_arguments() {
        let command = CommandSpec::from_argv(["ffmpeg", "-i", "in.mp4", "out.mp4"]).unwrap();
        assert_eq!(command.program.to_str(), Some("ffmpeg"));
        assert_eq!(command.args, vec!["-i", "in.mp4", "out.mp4"]);
        assert_eq!(command.argv()[0], "ffmpeg");
    }

    #[test]
    fn empty_argv_is_rejected() {
        let error = CommandSpec::from_argv(Vec::<String>::new()).unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::InvalidInput);
    }

    #[test]
    fn nul_bytes_fail_validation() {
        let command = CommandSpec::new("ffmpeg").arg("bad\0arg");
        assert!(command.validate().is_err());
    }
}
