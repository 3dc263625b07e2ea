use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;

use crate::config::EngineConfig;
use crate::execution::{DiagnosticLines, OutputStream, ProcessExitStatus, ProcessSupervisor};
use crate::models::{
    CoreError, CoreErrorKind, InputSource, ProgressRecord, StatusEvent, TaskError, TaskId, TaskOutcome,
    TaskStatus, TaskUpdate, ToolSettings, UploadReceipt, UploadSettings, UserId,
};
use crate::orchestration::{
    Abort, Collaborators, DownloadRequest, ProgressReporter, StatusSink, TaskCancellationToken,
    TaskWorkspace, UploadRequest, with_store,
};
use crate::persistence::TaskStore;
use crate::progress::ProgressParser;

/// How long to keep reading engine diagnostics after the engine has exited.
const STDERR_DRAIN_WINDOW: Duration = Duration::from_millis(250);

const TERMINAL_WRITE_ATTEMPTS: u32 = 3;
const TERMINAL_WRITE_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, PartialEq)]
pub struct TaskRunRequest {
    pub task_id: TaskId,
    pub user_id: UserId,
    pub settings: ToolSettings,
    pub upload: UploadSettings,
}

struct RunContext {
    task_id: TaskId,
    user_id: UserId,
    settings: ToolSettings,
    upload: UploadSettings,
    sink: Arc<dyn StatusSink>,
    token: TaskCancellationToken,
}

impl RunContext {
    fn notify(&self, event: StatusEvent) {
        self.sink.notify(event);
    }

    fn reporter(&self, stage: TaskStatus) -> ProgressReporter {
        ProgressReporter::new(self.task_id, stage, Arc::clone(&self.sink))
    }
}

/// Drives one task from `pending` to a terminal state.
pub struct TaskOrchestrator {
    store: Arc<dyn TaskStore>,
    supervisor: Arc<ProcessSupervisor>,
    collaborators: Collaborators,
    config: EngineConfig,
}

impl TaskOrchestrator {
    pub fn new(
        store: Arc<dyn TaskStore>,
        supervisor: Arc<ProcessSupervisor>,
        collaborators: Collaborators,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            supervisor,
            collaborators,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs the task to completion. The returned outcome matches the terminal
    /// status written to the store, and the task workspace is gone by the time
    /// this resolves.
    pub async fn run(
        &self,
        request: TaskRunRequest,
        sink: Arc<dyn StatusSink>,
        token: TaskCancellationToken,
    ) -> TaskOutcome {
        let span = tracing::info_span!(
            "task",
            task_id = %request.task_id,
            user_id = %request.user_id,
            tool = %request.settings.kind(),
        );

        let ctx = RunContext {
            task_id: request.task_id,
            user_id: request.user_id,
            settings: request.settings,
            upload: request.upload,
            sink,
            token,
        };

        self.run_in_span(ctx).instrument(span).await
    }

    async fn run_in_span(&self, ctx: RunContext) -> TaskOutcome {
        let mut workspace =
            match TaskWorkspace::create(&self.config.download_dir, ctx.user_id, ctx.task_id).await
            {
                Ok(workspace) => workspace,
                Err(error) => {
                    let failure = TaskError::download(format!(
                        "could not prepare working directory: {error}"
                    ));
                    return self.finish(&ctx, Err(Abort::Failed(failure))).await;
                }
            };

        let result = self.execute(&ctx, &workspace).await;
        let outcome = self.finish(&ctx, result).await;
        workspace.release().await;
        outcome
    }

    async fn execute(
        &self,
        ctx: &RunContext,
        workspace: &TaskWorkspace,
    ) -> Result<UploadReceipt, Abort> {
        self.advance(ctx, TaskUpdate::status(TaskStatus::Starting))
            .await?;

        self.advance(ctx, TaskUpdate::status(TaskStatus::Downloading))
            .await?;
        let inputs = self.download(ctx, workspace.path()).await?;

        self.advance(ctx, TaskUpdate::status(TaskStatus::Processing).with_progress(0.0))
            .await?;
        let output = self.process(ctx, &inputs, workspace.path()).await?;

        let output_name = ctx.upload.file_name.clone().unwrap_or_else(|| {
            output
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default()
        });
        self.advance(
            ctx,
            TaskUpdate::status(TaskStatus::Uploading)
                .with_upload_target(ctx.upload.target.clone())
                .with_output_name(output_name),
        )
        .await?;
        let receipt = self.upload(ctx, output).await?;

        self.check_cancelled(ctx).await?;
        Ok(receipt)
    }

    /// Stage boundary: observe cancellation, then move the record forward.
    async fn advance(&self, ctx: &RunContext, update: TaskUpdate) -> Result<(), Abort> {
        self.check_cancelled(ctx).await?;

        let Some(stage) = update.status else {
            return Ok(());
        };

        let task_id = ctx.task_id;
        match with_store(&self.store, move |store| store.update_task(task_id, &update)).await {
            Ok(_) => {}
            Err(error) if error.kind == CoreErrorKind::InvalidTransition => {
                return Err(self
                    .classify_abort(ctx, format!("store rejected '{stage}': {}", error.message))
                    .await);
            }
            Err(error) => {
                return Err(Abort::Failed(TaskError::interrupted(format!(
                    "could not record '{stage}': {}",
                    error.message
                ))));
            }
        }

        tracing::debug!(task_id = %task_id, stage = %stage, "stage started");
        ctx.notify(StatusEvent::stage(ctx.task_id, stage));
        Ok(())
    }

    async fn check_cancelled(&self, ctx: &RunContext) -> Result<(), Abort> {
        if ctx.token.is_cancelled() {
            return Err(self.classify_abort(ctx, "cancellation token fired").await);
        }

        match self.current_status(ctx.task_id).await {
            Ok(TaskStatus::Cancelled) => Err(Abort::Cancelled),
            Ok(status) if status.is_terminal() => Err(Abort::Failed(TaskError::interrupted(
                format!("task was finalised externally as '{status}'"),
            ))),
            Ok(_) => Ok(()),
            Err(error) => {
                tracing::warn!(
                    task_id = %ctx.task_id,
                    kind = ?error.kind,
                    message = %error.message,
                    "could not read task status at stage boundary"
                );
                Ok(())
            }
        }
    }

    /// The store is the single source of truth for what an abort means: a
    /// `cancelled` record is a user cancellation, anything else a system interruption.
    async fn classify_abort(&self, ctx: &RunContext, detail: impl Into<String>) -> Abort {
        let detail = detail.into();
        match self.current_status(ctx.task_id).await {
            Ok(TaskStatus::Cancelled) => Abort::Cancelled,
            Ok(status) => Abort::Failed(TaskError::interrupted(format!(
                "{detail} (task status '{status}')"
            ))),
            Err(error) => Abort::Failed(TaskError::interrupted(format!(
                "{detail} (status unavailable: {})",
                error.message
            ))),
        }
    }

    async fn current_status(&self, task_id: TaskId) -> Result<TaskStatus, CoreError> {
        with_store(&self.store, move |store| store.get_task(task_id))
            .await
            .map(|record| record.status)
    }

    async fn download(&self, ctx: &RunContext, target_dir: &Path) -> Result<Vec<PathBuf>, Abort> {
        let request = DownloadRequest {
            task_id: ctx.task_id,
            user_id: ctx.user_id,
            input: self.input_source(ctx).await?,
            target_dir: target_dir.to_path_buf(),
            progress: ctx.reporter(TaskStatus::Downloading),
            cancellation: ctx.token.clone(),
        };

        let result = tokio::select! {
            biased;
            _ = ctx.token.cancelled() => Err(Abort::Cancelled),
            result = self.collaborators.downloader.download(request) => result,
        };

        let files = match result {
            Ok(files) => files,
            Err(Abort::Cancelled) => {
                return Err(self.classify_abort(ctx, "download interrupted").await);
            }
            Err(failure) => return Err(failure),
        };

        if files.is_empty() {
            return Err(Abort::Failed(TaskError::download(
                "the downloader returned no file",
            )));
        }
        Ok(files)
    }

    async fn input_source(&self, ctx: &RunContext) -> Result<InputSource, Abort> {
        let task_id = ctx.task_id;
        with_store(&self.store, move |store| store.get_task(task_id))
            .await
            .map(|record| record.input_source)
            .map_err(|error| {
                Abort::Failed(TaskError::interrupted(format!(
                    "could not load task input: {}",
                    error.message
                )))
            })
    }

    async fn process(
        &self,
        ctx: &RunContext,
        inputs: &[PathBuf],
        work_dir: &Path,
    ) -> Result<PathBuf, Abort> {
        let built = self
            .collaborators
            .command_builder
            .build(&ctx.settings, inputs, work_dir)?;
        let mut command = built.command;
        if command.working_dir.is_none() {
            command.working_dir = Some(work_dir.to_path_buf());
        }

        let mut handle = self
            .supervisor
            .start(ctx.task_id, ctx.user_id, command)
            .map_err(|error| {
                Abort::Failed(TaskError::processing(format!(
                    "could not start the engine: {}",
                    error.message
                )))
            })?;
        let mut guard = self.supervisor.guard(&handle);

        if let Some(stdout) = handle.take_stdout() {
            tokio::spawn(drain(stdout));
        }

        let mut parser =
            ProgressParser::new(self.config.progress_interval, self.config.diagnostic_lines);
        let mut lines = handle.take_stderr().map(DiagnosticLines::new);
        let mut exit = handle.exit_watch();

        let finished = loop {
            tokio::select! {
                biased;
                _ = ctx.token.cancelled() => break None,
                line = next_line(&mut lines), if lines.is_some() => match line {
                    Some(line) => {
                        if let Some(record) = parser.feed_line(&line)
                            && !self.report_progress(ctx, &record).await
                        {
                            break None;
                        }
                    }
                    None => lines = None,
                },
                status = exit.wait() => break Some(status),
            }
        };

        let Some(status) = finished else {
            self.stop_engine(ctx).await;
            guard.disarm();
            return Err(self.classify_abort(ctx, "engine run interrupted").await);
        };

        if let Some(remaining) = lines.as_mut() {
            let _ = tokio::time::timeout(STDERR_DRAIN_WINDOW, async {
                while let Ok(Some(line)) = remaining.next_line().await {
                    parser.parse_line(&line);
                }
            })
            .await;
        }

        self.supervisor.unregister(ctx.task_id);
        guard.disarm();

        match status {
            ProcessExitStatus::ExitCode(0) => {
                if tokio::fs::try_exists(&built.output).await.unwrap_or(false) {
                    Ok(built.output)
                } else {
                    Err(Abort::Failed(TaskError::processing(
                        "engine produced no output",
                    )))
                }
            }
            ProcessExitStatus::ExitCode(code) => {
                self.engine_failure(ctx, format!("engine exited with code {code}"), Some(code), &parser)
                    .await
            }
            ProcessExitStatus::Terminated => {
                self.engine_failure(ctx, "engine was terminated by a signal".to_string(), None, &parser)
                    .await
            }
        }
    }

    async fn engine_failure(
        &self,
        ctx: &RunContext,
        message: String,
        exit_code: Option<i32>,
        parser: &ProgressParser,
    ) -> Result<PathBuf, Abort> {
        // A cancel request kills the engine, which then exits non-zero.
        if matches!(self.current_status(ctx.task_id).await, Ok(TaskStatus::Cancelled)) {
            return Err(Abort::Cancelled);
        }

        let diagnostics = parser.diagnostic_tail();
        tracing::warn!(
            task_id = %ctx.task_id,
            exit_code = ?exit_code,
            diagnostics = %diagnostics,
            "engine failed"
        );
        Err(Abort::Failed(TaskError::ProcessingFailed {
            message,
            exit_code,
            diagnostics,
        }))
    }

    /// Mirrors a progress record into the store and the sink. Returns `false`
    /// when the store no longer accepts updates for the task.
    async fn report_progress(&self, ctx: &RunContext, record: &ProgressRecord) -> bool {
        let percent = record.percentage * 100.0;
        let task_id = ctx.task_id;
        match with_store(&self.store, move |store| {
            store.update_task(task_id, &TaskUpdate::progress(percent))
        })
        .await
        {
            Ok(_) => {}
            Err(error) if error.kind == CoreErrorKind::InvalidTransition => return false,
            Err(error) => tracing::warn!(
                task_id = %task_id,
                kind = ?error.kind,
                message = %error.message,
                "failed to mirror progress into the task store"
            ),
        }

        ctx.notify(StatusEvent::progress(task_id, record));
        true
    }

    async fn upload(&self, ctx: &RunContext, file: PathBuf) -> Result<UploadReceipt, Abort> {
        let request = UploadRequest {
            task_id: ctx.task_id,
            user_id: ctx.user_id,
            file,
            settings: ctx.upload.clone(),
            progress: ctx.reporter(TaskStatus::Uploading),
            cancellation: ctx.token.clone(),
        };

        let result = tokio::select! {
            biased;
            _ = ctx.token.cancelled() => Err(Abort::Cancelled),
            result = self.collaborators.uploader.upload(request) => result,
        };

        match result {
            Ok(receipt) if receipt.success => Ok(receipt),
            Ok(_) => Err(Abort::Failed(TaskError::upload(
                "the uploader reported an unsuccessful transfer",
            ))),
            Err(Abort::Cancelled) => Err(self.classify_abort(ctx, "upload interrupted").await),
            Err(failure) => Err(failure),
        }
    }

    async fn stop_engine(&self, ctx: &RunContext) {
        if self.supervisor.info(ctx.task_id).is_none() {
            return;
        }
        if let Err(error) = self
            .supervisor
            .kill(ctx.task_id, self.config.cancel_timeout)
            .await
        {
            tracing::warn!(
                task_id = %ctx.task_id,
                kind = ?error.kind,
                message = %error.message,
                "failed to stop engine"
            );
        }
    }

    async fn finish(&self, ctx: &RunContext, result: Result<UploadReceipt, Abort>) -> TaskOutcome {
        let abort = match result {
            Ok(receipt) => match self.mark_completed(ctx, &receipt).await {
                Ok(()) => return TaskOutcome::Completed(receipt),
                Err(abort) => abort,
            },
            Err(abort) => abort,
        };

        self.stop_engine(ctx).await;

        match abort {
            Abort::Cancelled => self.mark_cancelled(ctx).await,
            Abort::Failed(error) => self.mark_failed(ctx, error).await,
        }
    }

    async fn mark_completed(&self, ctx: &RunContext, receipt: &UploadReceipt) -> Result<(), Abort> {
        let task_id = ctx.task_id;
        let update = TaskUpdate::status(TaskStatus::Completed).with_progress(100.0);
        match self.write_terminal(task_id, update).await {
            Ok(()) => {}
            Err(error) if error.kind == CoreErrorKind::InvalidTransition => {
                return Err(self.classify_abort(ctx, error.message).await);
            }
            Err(error) => {
                return Err(Abort::Failed(TaskError::interrupted(format!(
                    "could not record completion: {}",
                    error.message
                ))));
            }
        }

        tracing::info!(
            task_id = %task_id,
            final_size = receipt.final_size,
            destination = ?receipt.destination,
            "task completed"
        );
        let mut event = StatusEvent::stage(task_id, TaskStatus::Completed).percent(100.0);
        event.output_size = Some(receipt.final_size);
        event.destination = receipt.destination.clone();
        ctx.notify(event);
        Ok(())
    }

    async fn mark_cancelled(&self, ctx: &RunContext) -> TaskOutcome {
        let task_id = ctx.task_id;
        if let Err(error) = self
            .write_terminal(task_id, TaskUpdate::status(TaskStatus::Cancelled))
            .await
            && !matches!(self.current_status(task_id).await, Ok(TaskStatus::Cancelled))
        {
            return self.report_unrecorded(
                ctx,
                TaskError::interrupted(format!("could not record cancellation: {}", error.message)),
            );
        }

        tracing::info!(task_id = %task_id, "task cancelled");
        ctx.notify(StatusEvent::stage(task_id, TaskStatus::Cancelled).message("cancelled by user"));
        TaskOutcome::Cancelled
    }

    async fn mark_failed(&self, ctx: &RunContext, error: TaskError) -> TaskOutcome {
        let task_id = ctx.task_id;
        let message = error.user_message(self.config.error_message_limit);

        let update = TaskUpdate::status(TaskStatus::Failed).with_error(message.clone());
        if let Err(store_error) = self.write_terminal(task_id, update).await {
            if matches!(self.current_status(task_id).await, Ok(TaskStatus::Cancelled)) {
                return self.mark_cancelled(ctx).await;
            }
            tracing::warn!(task_id = %task_id, error = %error, "unrecorded task failure");
            return self.report_unrecorded(
                ctx,
                TaskError::interrupted(format!("could not record failure: {}", store_error.message)),
            );
        }

        tracing::error!(task_id = %task_id, error = %error, "task failed");
        ctx.notify(StatusEvent::stage(task_id, TaskStatus::Failed).message(message));
        TaskOutcome::Failed(error)
    }

    /// The store refused every terminal write. The outcome says so instead of
    /// claiming a state the record does not hold.
    fn report_unrecorded(&self, ctx: &RunContext, error: TaskError) -> TaskOutcome {
        tracing::error!(
            task_id = %ctx.task_id,
            error = %error,
            "task finished without a terminal record"
        );
        let message = error.user_message(self.config.error_message_limit);
        ctx.notify(StatusEvent::stage(ctx.task_id, TaskStatus::Failed).message(message));
        TaskOutcome::Failed(error)
    }

    /// Writes a terminal status, retrying store failures a bounded number of
    /// times. State-machine rejections are returned at once.
    async fn write_terminal(&self, task_id: TaskId, update: TaskUpdate) -> Result<(), CoreError> {
        let mut attempt = 1;
        loop {
            let attempt_update = update.clone();
            let error = match with_store(&self.store, move |store| {
                store.update_task(task_id, &attempt_update)
            })
            .await
            {
                Ok(_) => return Ok(()),
                Err(error) => error,
            };

            if error.kind == CoreErrorKind::InvalidTransition || attempt >= TERMINAL_WRITE_ATTEMPTS {
                return Err(error);
            }
            tracing::warn!(
                task_id = %task_id,
                attempt,
                kind = ?error.kind,
                message = %error.message,
                "terminal status write failed, retrying"
            );
            tokio::time::sleep(TERMINAL_WRITE_BACKOFF * attempt).await;
            attempt += 1;
        }
    }
}

async fn next_line(lines: &mut Option<DiagnosticLines<OutputStream>>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}

async fn drain(mut stream: OutputStream) {
    let _ = tokio::io::copy(&mut stream, &mut tokio::io::sink()).await;
}
