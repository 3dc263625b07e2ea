use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::execution::ProcessSupervisor;
use crate::models::{
    CoreError, CoreErrorKind, InputSource, NewTask, ProcessEntry, QueueItem, TaskId, TaskOutcome,
    TaskRecord, TaskStatus, TaskUpdate, ToolKind, ToolSettings, UploadSettings, UserId,
};
use crate::orchestration::{
    BatchQueue, Collaborators, OrchestrationResult, StatusSink, TaskCancellationToken,
    TaskOrchestrator, TaskRunRequest, with_store,
};
use crate::persistence::TaskStore;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CancelAck {
    pub task_id: TaskId,
    /// Status observed before the cancel request was applied.
    pub previous_status: TaskStatus,
    /// `true` when the task had already finished and nothing was changed.
    pub already_finished: bool,
    pub process_killed: bool,
}

/// Admin view of a running engine process.
#[derive(Clone, Debug, PartialEq)]
pub struct ActiveProcess {
    pub entry: ProcessEntry,
    pub tool: Option<ToolKind>,
    pub status: Option<TaskStatus>,
    pub elapsed: Duration,
}

/// Front-end facade over the task store, process registry, batch queue and
/// the orchestrators running in the background.
#[derive(Clone)]
pub struct TaskService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    store: Arc<dyn TaskStore>,
    supervisor: Arc<ProcessSupervisor>,
    orchestrator: TaskOrchestrator,
    queue: BatchQueue,
    tokens: Mutex<HashMap<TaskId, TaskCancellationToken>>,
}

impl TaskService {
    pub fn new(
        store: Arc<dyn TaskStore>,
        supervisor: Arc<ProcessSupervisor>,
        collaborators: Collaborators,
        config: EngineConfig,
    ) -> Self {
        let orchestrator = TaskOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&supervisor),
            collaborators,
            config,
        );
        Self {
            inner: Arc::new(ServiceInner {
                store,
                supervisor,
                orchestrator,
                queue: BatchQueue::new(),
                tokens: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.inner.store
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.inner.supervisor
    }

    pub fn config(&self) -> &EngineConfig {
        self.inner.orchestrator.config()
    }

    /// Records a new `pending` task, or fails with `AlreadyRunning` while the
    /// user still owns a non-terminal one.
    pub async fn create_task(
        &self,
        user_id: UserId,
        tool: ToolKind,
        input_source: InputSource,
    ) -> OrchestrationResult<TaskId> {
        let task = NewTask::new(user_id, tool, input_source);
        let record = with_store(&self.inner.store, move |store| store.create_task(task)).await?;
        tracing::info!(task_id = %record.id, user_id = %user_id, tool = %tool, "task created");
        Ok(record.id)
    }

    /// Creates a task over everything the user has queued.
    ///
    /// The queue is drained in one step, so inputs added while the task is
    /// being created stay queued for the next batch. On failure the drained
    /// items go back to the front of the queue.
    pub async fn create_batch_task(
        &self,
        user_id: UserId,
        tool: ToolKind,
    ) -> OrchestrationResult<TaskId> {
        let items = self.inner.queue.drain(user_id);
        if items.len() < tool.min_inputs() {
            let found = items.len();
            self.inner.queue.restore(user_id, items);
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                format!(
                    "'{tool}' needs at least {} queued inputs, found {found}",
                    tool.min_inputs()
                ),
            )
            .user(user_id));
        }

        let source = InputSource::Batch(items.iter().map(|item| item.descriptor.clone()).collect());
        match self.create_task(user_id, tool, source).await {
            Ok(task_id) => Ok(task_id),
            Err(error) => {
                self.inner.queue.restore(user_id, items);
                Err(error)
            }
        }
    }

    /// Spawns the orchestrator for an already created task.
    pub fn start_task(
        &self,
        request: TaskRunRequest,
        sink: Arc<dyn StatusSink>,
    ) -> JoinHandle<TaskOutcome> {
        let token = TaskCancellationToken::new();
        self.lock_tokens().insert(request.task_id, token.clone());

        let service = self.clone();
        tokio::spawn(async move {
            let task_id = request.task_id;
            let outcome = service.inner.orchestrator.run(request, sink, token).await;
            service.lock_tokens().remove(&task_id);
            outcome
        })
    }

    /// `create_task` followed by `start_task`.
    pub async fn submit(
        &self,
        user_id: UserId,
        settings: ToolSettings,
        input_source: InputSource,
        upload: UploadSettings,
        sink: Arc<dyn StatusSink>,
    ) -> OrchestrationResult<(TaskId, JoinHandle<TaskOutcome>)> {
        let task_id = self
            .create_task(user_id, settings.kind(), input_source)
            .await?;
        let handle = self.start_task(
            TaskRunRequest {
                task_id,
                user_id,
                settings,
                upload,
            },
            sink,
        );
        Ok((task_id, handle))
    }

    /// Marks the task `cancelled`, wakes its orchestrator and kills any
    /// registered engine process. Finished tasks are left untouched.
    pub async fn cancel_task(&self, task_id: TaskId) -> OrchestrationResult<CancelAck> {
        let record = self.get_task(task_id).await?;
        if record.status.is_terminal() {
            return Ok(CancelAck {
                task_id,
                previous_status: record.status,
                already_finished: true,
                process_killed: false,
            });
        }

        let written = with_store(&self.inner.store, move |store| {
            store.update_task(task_id, &TaskUpdate::status(TaskStatus::Cancelled))
        })
        .await;
        match written {
            Ok(_) => {}
            Err(error) if error.kind == CoreErrorKind::InvalidTransition => {
                let current = self.get_task(task_id).await?;
                return Ok(CancelAck {
                    task_id,
                    previous_status: current.status,
                    already_finished: true,
                    process_killed: false,
                });
            }
            Err(error) => return Err(error),
        }

        let token = self.lock_tokens().get(&task_id).cloned();
        if let Some(token) = token {
            token.cancel();
        }

        let process_killed = if self.inner.supervisor.info(task_id).is_some() {
            self.inner
                .supervisor
                .kill(task_id, self.config().cancel_timeout)
                .await?
        } else {
            false
        };

        tracing::info!(
            task_id = %task_id,
            user_id = %record.user_id,
            previous_status = %record.status,
            process_killed,
            "task cancelled"
        );

        Ok(CancelAck {
            task_id,
            previous_status: record.status,
            already_finished: false,
            process_killed,
        })
    }

    /// Cancels on behalf of `requester`, who must own the task.
    pub async fn cancel_task_as(
        &self,
        task_id: TaskId,
        requester: UserId,
    ) -> OrchestrationResult<CancelAck> {
        let record = self.get_task(task_id).await?;
        if record.user_id != requester {
            return Err(CoreError::new(
                CoreErrorKind::PermissionDenied,
                format!("user '{requester}' does not own task '{task_id}'"),
            )
            .task(task_id)
            .user(requester));
        }
        self.cancel_task(task_id).await
    }

    /// Cancels whatever the user is running and empties their batch queue.
    ///
    /// A task with a registered engine process wins; otherwise the user's
    /// non-terminal record is cancelled, which covers tasks stuck before or
    /// after the processing stage.
    pub async fn cancel_user_task(&self, user_id: UserId) -> OrchestrationResult<Option<CancelAck>> {
        let cleared = self.inner.queue.clear(user_id);
        if cleared > 0 {
            tracing::debug!(user_id = %user_id, cleared, "batch queue cleared");
        }

        let registered = self
            .inner
            .supervisor
            .list()
            .into_iter()
            .find(|entry| entry.user_id == user_id)
            .map(|entry| entry.task_id);

        let task_id = match registered {
            Some(task_id) => Some(task_id),
            None => with_store(&self.inner.store, move |store| {
                store.active_task_for_user(user_id)
            })
            .await?
            .map(|record| record.id),
        };

        match task_id {
            Some(task_id) => Ok(Some(self.cancel_task(task_id).await?)),
            None => Ok(None),
        }
    }

    pub async fn get_task(&self, task_id: TaskId) -> OrchestrationResult<TaskRecord> {
        with_store(&self.inner.store, move |store| store.get_task(task_id)).await
    }

    pub async fn list_recent_tasks(&self, limit: usize) -> OrchestrationResult<Vec<TaskRecord>> {
        with_store(&self.inner.store, move |store| store.list_recent_tasks(limit)).await
    }

    pub fn list_active_processes(&self) -> Vec<ProcessEntry> {
        self.inner.supervisor.list()
    }

    pub async fn describe_active_processes(&self) -> Vec<ActiveProcess> {
        let mut described = Vec::new();
        for entry in self.inner.supervisor.list() {
            let record = self.get_task(entry.task_id).await.ok();
            described.push(ActiveProcess {
                elapsed: entry.elapsed(),
                tool: record.as_ref().map(|record| record.tool),
                status: record.as_ref().map(|record| record.status),
                entry,
            });
        }
        described
    }

    pub fn add_to_queue(&self, user_id: UserId, item: InputSource) -> usize {
        self.inner.queue.add(user_id, item)
    }

    pub fn queued_items(&self, user_id: UserId) -> Vec<QueueItem> {
        self.inner.queue.get(user_id)
    }

    pub fn queue_count(&self, user_id: UserId) -> usize {
        self.inner.queue.count(user_id)
    }

    pub fn has_queue(&self, user_id: UserId) -> bool {
        self.inner.queue.has(user_id)
    }

    pub fn clear_queue(&self, user_id: UserId) -> usize {
        self.inner.queue.clear(user_id)
    }

    /// Interrupts every running orchestrator without marking tasks cancelled,
    /// then kills every registered engine. Returns the number of engines killed.
    pub async fn shutdown(&self) -> usize {
        let tokens: Vec<TaskCancellationToken> = self.lock_tokens().values().cloned().collect();
        for token in tokens {
            token.cancel();
        }
        self.inner
            .supervisor
            .kill_all(self.config().cancel_timeout)
            .await
    }

    fn lock_tokens(&self) -> MutexGuard<'_, HashMap<TaskId, TaskCancellationToken>> {
        self.inner
            .tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
