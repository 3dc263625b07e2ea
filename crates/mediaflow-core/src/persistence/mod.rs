pub mod in_memory;

pub use in_memory::InMemoryTaskStore;

use crate::models::{CoreError, NewTask, TaskId, TaskRecord, TaskUpdate, UserId};

pub type PersistenceResult<T> = Result<T, CoreError>;

pub trait MigrationStore: Send + Sync {
    fn current_version(&self) -> PersistenceResult<i64>;

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()>;
}

/// Durable task lifecycle records.
///
/// Implementations are synchronous; async callers go through
/// `tokio::task::spawn_blocking`.
pub trait TaskStore: Send + Sync {
    /// Inserts a `pending` record, or fails with `AlreadyRunning` if the user
    /// already owns a non-terminal task.
    fn create_task(&self, task: NewTask) -> PersistenceResult<TaskRecord>;

    fn get_task(&self, task_id: TaskId) -> PersistenceResult<TaskRecord>;

    /// Applies `update` under the task state machine and returns the stored record.
    fn update_task(&self, task_id: TaskId, update: &TaskUpdate) -> PersistenceResult<TaskRecord>;

    fn is_user_busy(&self, user_id: UserId) -> PersistenceResult<bool> {
        Ok(self.active_task_for_user(user_id)?.is_some())
    }

    fn active_task_for_user(&self, user_id: UserId) -> PersistenceResult<Option<TaskRecord>>;

    /// Most recently created records first.
    fn list_recent_tasks(&self, limit: usize) -> PersistenceResult<Vec<TaskRecord>>;
}
