use std::fmt::{Display, Formatter};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::models::{CoreError, CoreErrorKind, InputSource, TaskError, ToolKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub i64);

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Starting,
    Downloading,
    Processing,
    Uploading,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ACTIVE: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Starting,
        TaskStatus::Downloading,
        TaskStatus::Processing,
        TaskStatus::Uploading,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Downloading => "downloading",
            Self::Processing => "processing",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Position along the happy path; `None` for the failure sinks.
    fn happy_path_rank(self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::Starting => Some(1),
            Self::Downloading => Some(2),
            Self::Processing => Some(3),
            Self::Uploading => Some(4),
            Self::Completed => Some(5),
            Self::Failed | Self::Cancelled => None,
        }
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }

        match next {
            Self::Failed | Self::Cancelled => true,
            _ => match (self.happy_path_rank(), next.happy_path_rank()) {
                (Some(current), Some(desired)) => desired > current,
                _ => false,
            },
        }
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "starting" => Ok(Self::Starting),
            "downloading" => Ok(Self::Downloading),
            "processing" => Ok(Self::Processing),
            "uploading" => Ok(Self::Uploading),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub user_id: UserId,
    pub tool: ToolKind,
    pub input_source: InputSource,
    pub status: TaskStatus,
    pub progress_percent: f64,
    pub upload_target: Option<String>,
    pub output_name: Option<String>,
    pub error_msg: Option<String>,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

impl TaskRecord {
    pub fn new(id: TaskId, task: NewTask, now: SystemTime) -> Self {
        Self {
            id,
            user_id: task.user_id,
            tool: task.tool,
            input_source: task.input_source,
            status: TaskStatus::Pending,
            progress_percent: 0.0,
            upload_target: None,
            output_name: None,
            error_msg: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies a partial update under the task state machine.
    ///
    /// Terminal records are frozen: repeating the same terminal status is a
    /// no-op, every other write is rejected with `InvalidTransition`.
    pub fn apply(&mut self, update: &TaskUpdate, now: SystemTime) -> Result<(), CoreError> {
        if self.status.is_terminal() {
            if update.status == Some(self.status) {
                return Ok(());
            }
            return Err(invalid_transition(self, update.status));
        }

        if let Some(next) = update.status
            && next != self.status
            && !self.status.can_transition_to(next)
        {
            return Err(invalid_transition(self, Some(next)));
        }

        if let Some(next) = update.status {
            self.status = next;
        }
        if let Some(percent) = update.progress_percent {
            self.progress_percent = clamp_percent(percent);
        }
        if let Some(target) = &update.upload_target {
            self.upload_target = Some(target.clone());
        }
        if let Some(name) = &update.output_name {
            self.output_name = Some(name.clone());
        }
        if let Some(message) = &update.error_msg {
            self.error_msg = Some(message.clone());
        }
        self.updated_at = now;

        Ok(())
    }
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

fn invalid_transition(record: &TaskRecord, desired: Option<TaskStatus>) -> CoreError {
    let message = match desired {
        Some(desired) => format!(
            "task '{}' cannot transition from '{}' to '{desired}'",
            record.id, record.status
        ),
        None => format!(
            "task '{}' is '{}' and no longer accepts updates",
            record.id, record.status
        ),
    };
    CoreError::new(CoreErrorKind::InvalidTransition, message)
        .task(record.id)
        .user(record.user_id)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub user_id: UserId,
    pub tool: ToolKind,
    pub input_source: InputSource,
}

impl NewTask {
    pub fn new(user_id: UserId, tool: ToolKind, input_source: InputSource) -> Self {
        Self {
            user_id,
            tool,
            input_source,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub progress_percent: Option<f64>,
    pub upload_target: Option<String>,
    pub output_name: Option<String>,
    pub error_msg: Option<String>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn progress(percent: f64) -> Self {
        Self {
            progress_percent: Some(percent),
            ..Self::default()
        }
    }

    pub fn with_progress(mut self, percent: f64) -> Self {
        self.progress_percent = Some(percent);
        self
    }

    pub fn with_upload_target(mut self, target: impl Into<String>) -> Self {
        self.upload_target = Some(target.into());
        self
    }

    pub fn with_output_name(mut self, name: impl Into<String>) -> Self {
        self.output_name = Some(name.into());
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_msg = Some(message.into());
        self
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub success: bool,
    pub final_size: u64,
    pub destination: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TaskOutcome {
    Completed(UploadReceipt),
    Failed(TaskError),
    Cancelled,
}

impl TaskOutcome {
    pub fn status(&self) -> TaskStatus {
        match self {
            Self::Completed(_) => TaskStatus::Completed,
            Self::Failed(_) => TaskStatus::Failed,
            Self::Cancelled => TaskStatus::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::{NewTask, TaskId, TaskRecord, TaskStatus, TaskUpdate, UserId};
    use crate::models::{CoreErrorKind, InputSource, ToolKind};

    fn record() -> TaskRecord {
        TaskRecord::new(
            TaskId(1),
            NewTask::new(
                UserId(42),
                ToolKind::Encode,
                InputSource::Url("https://example.com/a.mp4".to_string()),
            ),
            SystemTime::UNIX_EPOCH,
        )
    }

    #[test]
    fn happy_path_moves_forward_only() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Starting));
        assert!(TaskStatus::Downloading.can_transition_to(TaskStatus::Uploading));
        assert!(!TaskStatus::Processing.can_transition_to(TaskStatus::Downloading));
        assert!(!TaskStatus::Uploading.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn failure_sinks_are_reachable_from_every_active_state() {
        for status in TaskStatus::ACTIVE {
            assert!(status.can_transition_to(TaskStatus::Failed));
            assert!(status.can_transition_to(TaskStatus::Cancelled));
        }
    }

    #[test]
    fn terminal_records_are_frozen() {
        let mut task = record();
        task.apply(&TaskUpdate::status(TaskStatus::Cancelled), SystemTime::now())
            .unwrap();

        let error = task
            .apply(
                &TaskUpdate::status(TaskStatus::Failed).with_error("boom"),
                SystemTime::now(),
            )
            .unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::InvalidTransition);
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.error_msg, None);

        let progress = task.apply(&TaskUpdate::progress(50.0), SystemTime::now());
        assert!(progress.is_err());
    }

    #[test]
    fn repeated_terminal_status_is_a_no_op() {
        let mut task = record();
        task.apply(&TaskUpdate::status(TaskStatus::Cancelled), SystemTime::now())
            .unwrap();
        let before = task.updated_at;
        task.apply(
            &TaskUpdate::status(TaskStatus::Cancelled),
            before + Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(task.updated_at, before);
    }

    #[test]
    fn updates_refresh_timestamp_and_clamp_progress() {
        let mut task = record();
        let later = SystemTime::UNIX_EPOCH + Duration::from_secs(60);
        task.apply(&TaskUpdate::progress(140.0), later).unwrap();
        assert_eq!(task.progress_percent, 100.0);
        assert_eq!(task.updated_at, later);
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>(), Ok(status));
        }
    }
}
