use std::time::Duration;

use serde::Serialize;

use crate::models::{TaskId, TaskStatus};

/// Normalised snapshot derived from engine diagnostic output.
///
/// `percentage` is always within `[0, 1]`; `eta` is absent whenever the
/// engine did not report a positive speed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProgressRecord {
    pub percentage: f64,
    pub elapsed: Duration,
    pub total: Duration,
    pub speed: Option<f64>,
    pub eta: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusEvent {
    pub task_id: TaskId,
    pub stage: TaskStatus,
    pub percent: Option<f64>,
    pub speed: Option<f64>,
    pub eta: Option<Duration>,
    pub message: Option<String>,
    pub output_size: Option<u64>,
    pub destination: Option<String>,
}

impl StatusEvent {
    pub fn stage(task_id: TaskId, stage: TaskStatus) -> Self {
        Self {
            task_id,
            stage,
            percent: None,
            speed: None,
            eta: None,
            message: None,
            output_size: None,
            destination: None,
        }
    }

    /// Progress event for the processing stage; `percent` is on the 0-100 scale.
    pub fn progress(task_id: TaskId, record: &ProgressRecord) -> Self {
        Self {
            percent: Some(record.percentage * 100.0),
            speed: record.speed,
            eta: record.eta,
            ..Self::stage(task_id, TaskStatus::Processing)
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn percent(mut self, percent: f64) -> Self {
        self.percent = Some(percent);
        self
    }

    pub fn is_progress(&self) -> bool {
        self.percent.is_some() && !self.stage.is_terminal()
    }
}
