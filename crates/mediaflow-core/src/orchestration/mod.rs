pub mod batch_queue;
pub mod orchestrator;
pub mod service;
pub mod workspace;

pub use batch_queue::BatchQueue;
pub use orchestrator::{TaskOrchestrator, TaskRunRequest};
pub use service::{ActiveProcess, CancelAck, TaskService};
pub use workspace::TaskWorkspace;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

use crate::execution::CommandSpec;
use crate::models::{
    CoreError, CoreErrorKind, InputSource, StatusEvent, TaskError, TaskId, TaskStatus,
    ToolSettings, UploadReceipt, UploadSettings, UserId,
};
use crate::persistence::{PersistenceResult, TaskStore};

pub type OrchestrationResult<T> = Result<T, CoreError>;

pub type CollaboratorFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Why a stage stopped early. Cancellation is kept apart from failures so a
/// catch-all failure path can never absorb it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Abort {
    Cancelled,
    Failed(TaskError),
}

impl From<TaskError> for Abort {
    fn from(error: TaskError) -> Self {
        Self::Failed(error)
    }
}

#[derive(Clone, Debug, Default)]
pub struct TaskCancellationToken {
    inner: Arc<CancellationState>,
}

#[derive(Debug, Default)]
struct CancellationState {
    flag: AtomicBool,
    notify: Notify,
}

impl TaskCancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called, immediately if it already was.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

pub trait StatusSink: Send + Sync {
    fn notify(&self, event: StatusEvent);
}

impl<F> StatusSink for F
where
    F: Fn(StatusEvent) + Send + Sync,
{
    fn notify(&self, event: StatusEvent) {
        self(event)
    }
}

/// Handle given to transfer collaborators for reporting their own progress.
#[derive(Clone)]
pub struct ProgressReporter {
    task_id: TaskId,
    stage: TaskStatus,
    sink: Arc<dyn StatusSink>,
}

impl ProgressReporter {
    pub fn new(task_id: TaskId, stage: TaskStatus, sink: Arc<dyn StatusSink>) -> Self {
        Self {
            task_id,
            stage,
            sink,
        }
    }

    /// Reports `percent` (0-100) for the current stage.
    pub fn report(&self, percent: f64, message: Option<&str>) {
        let mut event = StatusEvent::stage(self.task_id, self.stage).percent(percent.clamp(0.0, 100.0));
        if let Some(message) = message {
            event = event.message(message);
        }
        self.sink.notify(event);
    }
}

pub struct DownloadRequest {
    pub task_id: TaskId,
    pub user_id: UserId,
    pub input: InputSource,
    pub target_dir: PathBuf,
    pub progress: ProgressReporter,
    pub cancellation: TaskCancellationToken,
}

/// Fetches a task's input into its working directory.
///
/// An empty file list counts as a failed download. Implementations should
/// watch `cancellation` and return [`Abort::Cancelled`] when it fires.
pub trait Downloader: Send + Sync {
    fn download<'a>(
        &'a self,
        request: DownloadRequest,
    ) -> CollaboratorFuture<'a, Result<Vec<PathBuf>, Abort>>;
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuiltCommand {
    pub command: CommandSpec,
    /// File the engine is expected to write.
    pub output: PathBuf,
}

/// Maps tool settings and downloaded inputs to an engine invocation.
/// Errors must surface here, before anything is spawned.
pub trait CommandBuilder: Send + Sync {
    fn build(
        &self,
        settings: &ToolSettings,
        inputs: &[PathBuf],
        work_dir: &Path,
    ) -> Result<BuiltCommand, TaskError>;
}

impl<F> CommandBuilder for F
where
    F: Fn(&ToolSettings, &[PathBuf], &Path) -> Result<BuiltCommand, TaskError> + Send + Sync,
{
    fn build(
        &self,
        settings: &ToolSettings,
        inputs: &[PathBuf],
        work_dir: &Path,
    ) -> Result<BuiltCommand, TaskError> {
        self(settings, inputs, work_dir)
    }
}

pub struct UploadRequest {
    pub task_id: TaskId,
    pub user_id: UserId,
    pub file: PathBuf,
    pub settings: UploadSettings,
    pub progress: ProgressReporter,
    pub cancellation: TaskCancellationToken,
}

pub trait Uploader: Send + Sync {
    fn upload<'a>(
        &'a self,
        request: UploadRequest,
    ) -> CollaboratorFuture<'a, Result<UploadReceipt, Abort>>;
}

#[derive(Clone)]
pub struct Collaborators {
    pub downloader: Arc<dyn Downloader>,
    pub command_builder: Arc<dyn CommandBuilder>,
    pub uploader: Arc<dyn Uploader>,
}

/// Runs a synchronous store operation on the blocking pool.
pub(crate) async fn with_store<T, F>(
    store: &Arc<dyn TaskStore>,
    operation: F,
) -> OrchestrationResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn TaskStore) -> PersistenceResult<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || operation(store.as_ref()))
        .await
        .map_err(|join_error| {
            CoreError::new(
                CoreErrorKind::Internal,
                format!("task persistence join failure: {join_error}"),
            )
        })?
}
