use std::process::Stdio;

use crate::execution::{
    ExecutionResult, ExitWatch, OutputStream, ProcessExecutor, ProcessExitStatus, ProcessSignal,
    ProcessSpawnRequest, SignalDelivery, SpawnedProcess,
};
use crate::models::{CoreError, CoreErrorKind};

/// Spawns engines as leaders of their own process group so a single group
/// signal reaches every helper process they fork.
pub struct TokioProcessExecutor;

impl ProcessExecutor for TokioProcessExecutor {
    fn spawn(&self, request: ProcessSpawnRequest) -> ExecutionResult<SpawnedProcess> {
        let mut cmd = tokio::process::Command::new(&request.command.program);
        cmd.args(&request.command.args);

        for (key, value) in &request.command.env {
            cmd.env(key, value);
        }

        if let Some(dir) = &request.command.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|error| {
            spawn_failure(
                &request,
                format!(
                    "failed to spawn '{}': {error}",
                    request.command.program.display()
                ),
            )
        })?;

        let Some(pid) = child.id() else {
            return Err(spawn_failure(
                &request,
                "process exited before its pid could be read".to_string(),
            ));
        };

        let stdout = child
            .stdout
            .take()
            .map(|stream| Box::new(stream) as OutputStream);
        let stderr = child
            .stderr
            .take()
            .map(|stream| Box::new(stream) as OutputStream);

        let (sender, exit) = ExitWatch::channel();
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => match status.code() {
                    Some(code) => ProcessExitStatus::ExitCode(code),
                    None => ProcessExitStatus::Terminated,
                },
                Err(error) => {
                    tracing::warn!(pid, error = %error, "failed to wait for engine process");
                    ProcessExitStatus::Terminated
                }
            };
            sender.send_replace(Some(status));
        });

        Ok(SpawnedProcess {
            pid,
            pgid: pid,
            stdout,
            stderr,
            exit,
        })
    }

    fn signal_group(&self, pgid: u32, signal: ProcessSignal) -> ExecutionResult<SignalDelivery> {
        signal_process_group(pgid, signal)
    }
}

/// Sends `signal` to every member of process group `pgid`.
///
/// `ESRCH` means the group is already gone and is reported as
/// [`SignalDelivery::NoSuchProcess`] rather than an error.
pub fn signal_process_group(pgid: u32, signal: ProcessSignal) -> ExecutionResult<SignalDelivery> {
    let Ok(group) = libc::pid_t::try_from(pgid) else {
        return Err(CoreError::new(
            CoreErrorKind::InvalidInput,
            format!("process group id {pgid} is out of range"),
        ));
    };
    if group <= 1 {
        return Err(CoreError::new(
            CoreErrorKind::InvalidInput,
            format!("refusing to signal process group {pgid}"),
        ));
    }

    let signal_number = match signal {
        ProcessSignal::Terminate => libc::SIGTERM,
        ProcessSignal::Kill => libc::SIGKILL,
    };

    let result = unsafe { libc::kill(-group, signal_number) };
    if result == 0 {
        return Ok(SignalDelivery::Delivered);
    }

    let os_error = std::io::Error::last_os_error();
    if os_error.raw_os_error() == Some(libc::ESRCH) {
        return Ok(SignalDelivery::NoSuchProcess);
    }

    Err(CoreError::new(
        CoreErrorKind::ProcessFailure,
        format!("failed to send signal {signal_number} to process group {pgid}: {os_error}"),
    ))
}

fn spawn_failure(request: &ProcessSpawnRequest, message: String) -> CoreError {
    CoreError::new(CoreErrorKind::SpawnFailure, message)
        .task(request.task_id)
        .user(request.user_id)
}
