use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use crate::models::{CoreError, CoreErrorKind, NewTask, TaskId, TaskRecord, TaskUpdate, UserId};
use crate::persistence::{PersistenceResult, TaskStore};

#[derive(Default)]
pub struct InMemoryTaskStore {
    state: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    last_task_id: u64,
    tasks: BTreeMap<TaskId, TaskRecord>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> PersistenceResult<MutexGuard<'_, StoreState>> {
        self.state.lock().map_err(|_| {
            CoreError::new(CoreErrorKind::Internal, "task store mutex poisoned")
        })
    }
}

impl TaskStore for InMemoryTaskStore {
    fn create_task(&self, task: NewTask) -> PersistenceResult<TaskRecord> {
        let mut state = self.lock_state()?;

        if let Some(active) = active_for(&state, task.user_id) {
            return Err(already_running(active));
        }

        state.last_task_id = state.last_task_id.saturating_add(1);
        let record = TaskRecord::new(TaskId(state.last_task_id), task, SystemTime::now());
        state.tasks.insert(record.id, record.clone());

        Ok(record)
    }

    fn get_task(&self, task_id: TaskId) -> PersistenceResult<TaskRecord> {
        let state = self.lock_state()?;
        state
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or_else(|| not_found(task_id))
    }

    fn update_task(&self, task_id: TaskId, update: &TaskUpdate) -> PersistenceResult<TaskRecord> {
        let mut state = self.lock_state()?;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| not_found(task_id))?;

        task.apply(update, SystemTime::now())?;
        Ok(task.clone())
    }

    fn active_task_for_user(&self, user_id: UserId) -> PersistenceResult<Option<TaskRecord>> {
        let state = self.lock_state()?;
        Ok(active_for(&state, user_id).cloned())
    }

    fn list_recent_tasks(&self, limit: usize) -> PersistenceResult<Vec<TaskRecord>> {
        let state = self.lock_state()?;
        Ok(state.tasks.values().rev().take(limit).cloned().collect())
    }
}

fn active_for(state: &StoreState, user_id: UserId) -> Option<&TaskRecord> {
    state
        .tasks
        .values()
        .rev()
        .find(|task| task.user_id == user_id && task.status.is_active())
}

pub(crate) fn already_running(active: &TaskRecord) -> CoreError {
    CoreError::new(
        CoreErrorKind::AlreadyRunning,
        format!(
            "user '{}' already has task '{}' in status '{}'",
            active.user_id, active.id, active.status
        ),
    )
    .task(active.id)
    .user(active.user_id)
}

pub(crate) fn not_found(task_id: TaskId) -> CoreError {
    CoreError::new(
        CoreErrorKind::NotFound,
        format!("task '{task_id}' was not found"),
    )
    .task(task_id)
}
