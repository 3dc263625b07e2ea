use std::time::{Duration, SystemTime};

use serde::Serialize;

use crate::models::{TaskId, UserId};

/// Registry view of a task's live engine process.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ProcessEntry {
    pub task_id: TaskId,
    pub user_id: UserId,
    pub pid: u32,
    pub pgid: u32,
    pub command: Vec<String>,
    pub start_time: SystemTime,
}

impl ProcessEntry {
    pub fn elapsed(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.start_time)
            .unwrap_or_default()
    }
}
