use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use crate::config::EngineConfig;
use crate::execution::{
    CommandSpec, ExecutionResult, ExitWatch, OutputStream, ProcessExecutor, ProcessExitStatus,
    ProcessSignal, ProcessSpawnRequest, SignalDelivery, spawn_validated,
};
use crate::models::{CoreError, CoreErrorKind, ProcessEntry, TaskId, UserId};

struct RegisteredProcess {
    entry: ProcessEntry,
    exit: ExitWatch,
}

/// Process Registry plus the start/kill lifecycle for engine process groups.
pub struct ProcessSupervisor {
    executor: Arc<dyn ProcessExecutor>,
    entries: Mutex<HashMap<TaskId, RegisteredProcess>>,
    kill_poll_interval: Duration,
    kill_wait_bound: Duration,
}

impl ProcessSupervisor {
    pub fn new(
        executor: Arc<dyn ProcessExecutor>,
        kill_poll_interval: Duration,
        kill_wait_bound: Duration,
    ) -> Self {
        Self {
            executor,
            entries: Mutex::new(HashMap::new()),
            kill_poll_interval,
            kill_wait_bound,
        }
    }

    pub fn from_config(executor: Arc<dyn ProcessExecutor>, config: &EngineConfig) -> Self {
        Self::new(executor, config.kill_poll_interval, config.kill_wait_bound)
    }

    /// Spawns `command` as a new process group and registers it under `task_id`.
    ///
    /// A task may own at most one live process. A stale entry whose process
    /// already exited is replaced.
    pub fn start(
        &self,
        task_id: TaskId,
        user_id: UserId,
        command: CommandSpec,
    ) -> ExecutionResult<ProcessHandle> {
        if let Some(existing) = self.lock().get(&task_id)
            && !existing.exit.has_exited()
        {
            return Err(CoreError::new(
                CoreErrorKind::AlreadyRunning,
                format!(
                    "task '{task_id}' already owns running process {}",
                    existing.entry.pid
                ),
            )
            .task(task_id)
            .user(user_id));
        }

        let argv = command.argv();
        let spawned = spawn_validated(
            self.executor.as_ref(),
            ProcessSpawnRequest::new(task_id, user_id, command),
        )?;

        let entry = ProcessEntry {
            task_id,
            user_id,
            pid: spawned.pid,
            pgid: spawned.pgid,
            command: argv,
            start_time: SystemTime::now(),
        };

        tracing::info!(
            task_id = %task_id,
            user_id = %user_id,
            pid = entry.pid,
            pgid = entry.pgid,
            program = %entry.command.first().map(String::as_str).unwrap_or_default(),
            "engine process started"
        );

        self.lock().insert(
            task_id,
            RegisteredProcess {
                entry: entry.clone(),
                exit: spawned.exit.clone(),
            },
        );

        Ok(ProcessHandle {
            entry,
            stdout: spawned.stdout,
            stderr: spawned.stderr,
            exit: spawned.exit,
        })
    }

    /// Terminates the task's process group: SIGTERM, poll until `timeout`,
    /// then SIGKILL and wait at most the kill wait bound.
    ///
    /// The registry entry is removed on every path. Returns `true` when the
    /// process is known to be gone, including when nothing was registered;
    /// `false` only if it survived SIGKILL for the whole wait bound.
    pub async fn kill(&self, task_id: TaskId, timeout: Duration) -> ExecutionResult<bool> {
        let target = self
            .lock()
            .get(&task_id)
            .map(|registered| (registered.entry.clone(), registered.exit.clone()));
        let Some((entry, mut exit)) = target else {
            return Ok(true);
        };

        let result = self.terminate_group(&entry, &mut exit, timeout).await;
        self.lock().remove(&task_id);

        result.map_err(|error| error.task(task_id).user(entry.user_id))
    }

    async fn terminate_group(
        &self,
        entry: &ProcessEntry,
        exit: &mut ExitWatch,
        timeout: Duration,
    ) -> ExecutionResult<bool> {
        if self.executor.signal_group(entry.pgid, ProcessSignal::Terminate)?
            == SignalDelivery::NoSuchProcess
        {
            return Ok(true);
        }

        let started = Instant::now();
        while !exit.has_exited() {
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                break;
            }
            tokio::time::sleep(self.kill_poll_interval.min(timeout - elapsed)).await;
        }

        if exit.has_exited() {
            tracing::debug!(task_id = %entry.task_id, pgid = entry.pgid, "engine exited after SIGTERM");
            return Ok(true);
        }

        tracing::warn!(
            task_id = %entry.task_id,
            pgid = entry.pgid,
            timeout_ms = timeout.as_millis() as u64,
            "engine ignored SIGTERM, escalating to SIGKILL"
        );

        if self.executor.signal_group(entry.pgid, ProcessSignal::Kill)?
            == SignalDelivery::NoSuchProcess
        {
            return Ok(true);
        }

        match tokio::time::timeout(self.kill_wait_bound, exit.wait()).await {
            Ok(_) => Ok(true),
            Err(_) => {
                tracing::error!(
                    task_id = %entry.task_id,
                    pgid = entry.pgid,
                    "engine still not reaped after SIGKILL"
                );
                Ok(false)
            }
        }
    }

    pub fn info(&self, task_id: TaskId) -> Option<ProcessEntry> {
        self.lock()
            .get(&task_id)
            .map(|registered| registered.entry.clone())
    }

    pub fn unregister(&self, task_id: TaskId) -> Option<ProcessEntry> {
        self.lock()
            .remove(&task_id)
            .map(|registered| registered.entry)
    }

    pub fn is_running(&self, task_id: TaskId) -> bool {
        self.lock()
            .get(&task_id)
            .is_some_and(|registered| !registered.exit.has_exited())
    }

    /// Registered entries, oldest first.
    pub fn list(&self) -> Vec<ProcessEntry> {
        let mut entries: Vec<ProcessEntry> = self
            .lock()
            .values()
            .map(|registered| registered.entry.clone())
            .collect();
        entries.sort_by_key(|entry| (entry.start_time, entry.task_id));
        entries
    }

    /// Kills every process registered for `user_id`; returns how many were targeted.
    pub async fn kill_user_processes(
        &self,
        user_id: UserId,
        timeout: Duration,
    ) -> ExecutionResult<usize> {
        let task_ids: Vec<TaskId> = self
            .list()
            .into_iter()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| entry.task_id)
            .collect();

        for task_id in &task_ids {
            self.kill(*task_id, timeout).await?;
        }

        Ok(task_ids.len())
    }

    /// Kills every registered process. Signalling errors are logged and skipped.
    pub async fn kill_all(&self, timeout: Duration) -> usize {
        let mut killed = 0;
        for entry in self.list() {
            match self.kill(entry.task_id, timeout).await {
                Ok(_) => killed += 1,
                Err(error) => tracing::warn!(
                    task_id = %entry.task_id,
                    kind = ?error.kind,
                    message = %error.message,
                    "failed to kill engine during shutdown"
                ),
            }
        }
        killed
    }

    /// Guard that unregisters `handle` and SIGKILLs its group if dropped while armed.
    pub fn guard(self: &Arc<Self>, handle: &ProcessHandle) -> RegistrationGuard {
        RegistrationGuard {
            supervisor: Arc::clone(self),
            task_id: handle.entry.task_id,
            pgid: handle.entry.pgid,
            exit: handle.exit.clone(),
            armed: true,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, RegisteredProcess>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A started engine process: its registry entry, output streams and exit status.
pub struct ProcessHandle {
    pub entry: ProcessEntry,
    stdout: Option<OutputStream>,
    stderr: Option<OutputStream>,
    exit: ExitWatch,
}

impl ProcessHandle {
    pub fn task_id(&self) -> TaskId {
        self.entry.task_id
    }

    pub fn pid(&self) -> u32 {
        self.entry.pid
    }

    pub fn pgid(&self) -> u32 {
        self.entry.pgid
    }

    pub fn take_stdout(&mut self) -> Option<OutputStream> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<OutputStream> {
        self.stderr.take()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.has_exited()
    }

    pub fn exit_watch(&self) -> ExitWatch {
        self.exit.clone()
    }

    pub async fn wait(&mut self) -> ProcessExitStatus {
        self.exit.wait().await
    }
}

/// Drop guard tying a registry entry to the lifetime of the code driving it.
pub struct RegistrationGuard {
    supervisor: Arc<ProcessSupervisor>,
    task_id: TaskId,
    pgid: u32,
    exit: ExitWatch,
    armed: bool,
}

impl RegistrationGuard {
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        self.supervisor.unregister(self.task_id);
        if self.exit.has_exited() {
            return;
        }

        tracing::warn!(
            task_id = %self.task_id,
            pgid = self.pgid,
            "engine abandoned while running, sending SIGKILL"
        );
        if let Err(error) = self
            .supervisor
            .executor
            .signal_group(self.pgid, ProcessSignal::Kill)
        {
            tracing::warn!(
                task_id = %self.task_id,
                kind = ?error.kind,
                message = %error.message,
                "failed to kill abandoned engine"
            );
        }
    }
}
