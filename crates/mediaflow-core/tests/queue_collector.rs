#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mediaflow_core::config::EngineConfig;
use mediaflow_core::execution::{CommandSpec, ProcessSupervisor, TokioProcessExecutor};
use mediaflow_core::models::{
    CoreErrorKind, InputSource, NewTask, TaskError, TaskId, TaskRecord, TaskStatus, TaskUpdate,
    ToolKind, ToolSettings, UploadReceipt, UserId,
};
use mediaflow_core::orchestration::{
    Abort, BatchQueue, BuiltCommand, CollaboratorFuture, Collaborators, DownloadRequest,
    Downloader, TaskService, UploadRequest, Uploader,
};
use mediaflow_core::persistence::{InMemoryTaskStore, PersistenceResult, TaskStore};

struct NoDownloads;

impl Downloader for NoDownloads {
    fn download<'a>(
        &'a self,
        _request: DownloadRequest,
    ) -> CollaboratorFuture<'a, Result<Vec<PathBuf>, Abort>> {
        Box::pin(async { Err(Abort::Failed(TaskError::download("offline"))) })
    }
}

struct NoUploads;

impl Uploader for NoUploads {
    fn upload<'a>(
        &'a self,
        _request: UploadRequest,
    ) -> CollaboratorFuture<'a, Result<UploadReceipt, Abort>> {
        Box::pin(async { Err(Abort::Failed(TaskError::upload("offline"))) })
    }
}

/// Holds every insert long enough for the queue to change underneath it.
struct SlowCreateStore {
    inner: InMemoryTaskStore,
    delay: Duration,
}

impl TaskStore for SlowCreateStore {
    fn create_task(&self, task: NewTask) -> PersistenceResult<TaskRecord> {
        std::thread::sleep(self.delay);
        self.inner.create_task(task)
    }

    fn get_task(&self, task_id: TaskId) -> PersistenceResult<TaskRecord> {
        self.inner.get_task(task_id)
    }

    fn update_task(&self, task_id: TaskId, update: &TaskUpdate) -> PersistenceResult<TaskRecord> {
        self.inner.update_task(task_id, update)
    }

    fn active_task_for_user(&self, user_id: UserId) -> PersistenceResult<Option<TaskRecord>> {
        self.inner.active_task_for_user(user_id)
    }

    fn list_recent_tasks(&self, limit: usize) -> PersistenceResult<Vec<TaskRecord>> {
        self.inner.list_recent_tasks(limit)
    }
}

fn service() -> TaskService {
    service_with_store(Arc::new(InMemoryTaskStore::new()))
}

fn slow_service() -> TaskService {
    service_with_store(Arc::new(SlowCreateStore {
        inner: InMemoryTaskStore::new(),
        delay: Duration::from_millis(300),
    }))
}

fn service_with_store(store: Arc<dyn TaskStore>) -> TaskService {
    let config = EngineConfig::default();
    let supervisor = Arc::new(ProcessSupervisor::from_config(
        Arc::new(TokioProcessExecutor),
        &config,
    ));
    let collaborators = Collaborators {
        downloader: Arc::new(NoDownloads),
        command_builder: Arc::new(
            |_settings: &ToolSettings,
             _inputs: &[PathBuf],
             work_dir: &Path|
             -> Result<BuiltCommand, TaskError> {
                Ok(BuiltCommand {
                    command: CommandSpec::new("/bin/true"),
                    output: work_dir.join("out"),
                })
            },
        ),
        uploader: Arc::new(NoUploads),
    };
    TaskService::new(
        store,
        supervisor,
        collaborators,
        config,
    )
}

fn url(name: &str) -> InputSource {
    InputSource::Url(format!("https://example.com/{name}"))
}

#[test]
fn items_accumulate_in_order_without_dedup() {
    let queue = BatchQueue::new();
    assert_eq!(queue.add(UserId(1), url("a.mp4")), 1);
    assert_eq!(queue.add(UserId(1), url("a.mp4")), 2);
    assert_eq!(queue.add(UserId(1), url("b.mp4")), 3);

    let items = queue.get(UserId(1));
    let names: Vec<String> = items.iter().map(|item| item.descriptor.display_name()).collect();
    assert_eq!(
        names,
        vec![
            "https://example.com/a.mp4",
            "https://example.com/a.mp4",
            "https://example.com/b.mp4",
        ]
    );
    assert!(items[0].added_at <= items[2].added_at);
}

#[test]
fn clear_reports_dropped_items_and_empties_the_queue() {
    let queue = BatchQueue::new();
    queue.add(UserId(3), url("a.mp4"));
    queue.add(UserId(3), url("b.mp4"));

    assert_eq!(queue.clear(UserId(3)), 2);
    assert_eq!(queue.clear(UserId(3)), 0);
    assert!(queue.get(UserId(3)).is_empty());
    assert!(!queue.has(UserId(3)));
}

#[tokio::test]
async fn batch_task_needs_enough_inputs() {
    let service = service();
    service.add_to_queue(UserId(42), url("a.mp4"));

    let error = service
        .create_batch_task(UserId(42), ToolKind::Merge)
        .await
        .unwrap_err();

    assert_eq!(error.kind, CoreErrorKind::InvalidInput);
    assert_eq!(service.queue_count(UserId(42)), 1);
}

#[tokio::test]
async fn batch_task_takes_the_whole_queue() {
    let service = service();
    service.add_to_queue(UserId(42), url("a.mp4"));
    service.add_to_queue(
        UserId(42),
        InputSource::Batch(vec![url("b.mp4"), url("c.mp4")]),
    );

    let task_id = service
        .create_batch_task(UserId(42), ToolKind::Merge)
        .await
        .unwrap();

    let record = service.get_task(task_id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Pending);
    assert_eq!(record.tool, ToolKind::Merge);
    assert_eq!(record.input_source.item_count(), 3);
    assert!(!service.has_queue(UserId(42)));
}

#[tokio::test]
async fn busy_user_keeps_their_queue() {
    let service = service();
    service
        .create_task(UserId(9), ToolKind::Encode, url("x.mp4"))
        .await
        .unwrap();
    service.add_to_queue(UserId(9), url("a.mp4"));
    service.add_to_queue(UserId(9), url("b.mp4"));

    let error = service
        .create_batch_task(UserId(9), ToolKind::Merge)
        .await
        .unwrap_err();

    assert_eq!(error.kind, CoreErrorKind::AlreadyRunning);
    assert_eq!(service.queue_count(UserId(9)), 2);
    assert_eq!(service.queued_items(UserId(9)).len(), 2);
}

fn queued_names(service: &TaskService, user: UserId) -> Vec<String> {
    service
        .queued_items(user)
        .into_iter()
        .map(|item| item.descriptor.display_name())
        .collect()
}

#[tokio::test]
async fn inputs_added_during_batch_creation_stay_queued() {
    let service = slow_service();
    service.add_to_queue(UserId(21), url("a.mp4"));
    service.add_to_queue(UserId(21), url("b.mp4"));

    let creating = {
        let service = service.clone();
        tokio::spawn(async move { service.create_batch_task(UserId(21), ToolKind::Merge).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(service.add_to_queue(UserId(21), url("c.mp4")), 1);

    let task_id = creating.await.unwrap().unwrap();

    let record = service.get_task(task_id).await.unwrap();
    assert_eq!(
        record.input_source,
        InputSource::Batch(vec![url("a.mp4"), url("b.mp4")])
    );
    assert_eq!(queued_names(&service, UserId(21)), vec!["https://example.com/c.mp4"]);
}

#[tokio::test]
async fn failed_batch_creation_returns_inputs_ahead_of_new_ones() {
    let service = slow_service();
    service
        .create_task(UserId(22), ToolKind::Encode, url("x.mp4"))
        .await
        .unwrap();
    service.add_to_queue(UserId(22), url("a.mp4"));
    service.add_to_queue(UserId(22), url("b.mp4"));

    let creating = {
        let service = service.clone();
        tokio::spawn(async move { service.create_batch_task(UserId(22), ToolKind::Merge).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    service.add_to_queue(UserId(22), url("c.mp4"));

    let error = creating.await.unwrap().unwrap_err();

    assert_eq!(error.kind, CoreErrorKind::AlreadyRunning);
    assert_eq!(
        queued_names(&service, UserId(22)),
        vec![
            "https://example.com/a.mp4",
            "https://example.com/b.mp4",
            "https://example.com/c.mp4",
        ]
    );
}
