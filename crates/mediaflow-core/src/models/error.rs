use std::error::Error;
use std::fmt::{Display, Formatter};

use crate::models::{TaskId, UserId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CoreErrorKind {
    InvalidInput,
    NotFound,
    AlreadyRunning,
    InvalidTransition,
    PermissionDenied,
    SpawnFailure,
    ProcessFailure,
    StorageFailure,
    Internal,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CoreError {
    pub task_id: Option<TaskId>,
    pub user_id: Option<UserId>,
    pub kind: CoreErrorKind,
    pub message: String,
}

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            task_id: None,
            user_id: None,
            kind,
            message: message.into(),
        }
    }

    pub fn task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }
}

impl Display for CoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl Error for CoreError {}

const TRUNCATION_MARKER: &str = "\n\n... (message truncated)";
const SYSTEM_INTERRUPTED_MESSAGE: &str =
    "the task was interrupted by a system error (connection lost or service shutdown)";

/// Failure classification for one orchestrated task.
///
/// User cancellation is deliberately absent: it is reported through
/// `TaskOutcome::Cancelled` so that catch-all failure handling can never
/// swallow it.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum TaskError {
    #[error("download failed: {message}")]
    DownloadFailed { message: String },

    #[error("processing failed: {message}")]
    ProcessingFailed {
        message: String,
        exit_code: Option<i32>,
        diagnostics: String,
    },

    #[error("upload failed: {message}")]
    UploadFailed { message: String },

    #[error("system interrupted: {detail}")]
    SystemInterrupted { detail: String },
}

impl TaskError {
    pub fn download(message: impl Into<String>) -> Self {
        Self::DownloadFailed {
            message: message.into(),
        }
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self::ProcessingFailed {
            message: message.into(),
            exit_code: None,
            diagnostics: String::new(),
        }
    }

    pub fn upload(message: impl Into<String>) -> Self {
        Self::UploadFailed {
            message: message.into(),
        }
    }

    pub fn interrupted(detail: impl Into<String>) -> Self {
        Self::SystemInterrupted {
            detail: detail.into(),
        }
    }

    /// Text suitable for the task record and the end user, bounded to `limit` bytes.
    pub fn user_message(&self, limit: usize) -> String {
        let text = match self {
            Self::DownloadFailed { message } => format!("Download failed: {message}"),
            Self::ProcessingFailed {
                message,
                diagnostics,
                ..
            } => {
                if diagnostics.trim().is_empty() {
                    format!("Processing failed: {message}")
                } else {
                    format!("Processing failed: {message}\n\n--- engine output ---\n{diagnostics}")
                }
            }
            Self::UploadFailed { message } => format!("Upload failed: {message}"),
            Self::SystemInterrupted { .. } => SYSTEM_INTERRUPTED_MESSAGE.to_string(),
        };
        truncate_message(&text, limit)
    }
}

pub fn truncate_message(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }

    let budget = limit.saturating_sub(TRUNCATION_MARKER.len());
    let mut cut = budget.min(text.len());
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }

    let mut truncated = text[..cut].to_string();
    if limit >= TRUNCATION_MARKER.len() {
        truncated.push_str(TRUNCATION_MARKER);
    }
    truncated
}

#[cfg(test)]
mod tests {
    use super::{TaskError, truncate_message};

    #[test]
    fn short_messages_are_untouched() {
        assert_eq!(truncate_message("disk full", 100), "disk full");
    }

    #[test]
    fn long_messages_are_bounded_and_marked() {
        let text = "x".repeat(5000);
        let truncated = truncate_message(&text, 3500);
        assert!(truncated.len() <= 3500);
        assert!(truncated.ends_with("(message truncated)"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "é".repeat(100);
        let truncated = truncate_message(&text, 51);
        assert!(truncated.len() <= 51);
        assert!(truncated.starts_with('é'));
    }

    #[test]
    fn system_interruption_never_leaks_detail() {
        let error = TaskError::interrupted("JoinError::Cancelled at runtime.rs:812");
        let message = error.user_message(3500);
        assert!(!message.contains("runtime.rs"));
    }

    #[test]
    fn processing_failure_carries_engine_tail() {
        let error = TaskError::ProcessingFailed {
            message: "engine exited with code 1".to_string(),
            exit_code: Some(1),
            diagnostics: "Invalid data found when processing input".to_string(),
        };
        let message = error.user_message(3500);
        assert!(message.contains("exited with code 1"));
        assert!(message.contains("Invalid data found"));
    }
}
