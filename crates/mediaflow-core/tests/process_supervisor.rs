#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use mediaflow_core::execution::{
    CommandSpec, DiagnosticLines, ProcessExitStatus, ProcessHandle, ProcessSupervisor,
    TokioProcessExecutor,
};
use mediaflow_core::models::{CoreErrorKind, TaskId, UserId};

const KILL_WAIT_BOUND: Duration = Duration::from_millis(2000);

fn supervisor() -> Arc<ProcessSupervisor> {
    Arc::new(ProcessSupervisor::new(
        Arc::new(TokioProcessExecutor),
        Duration::from_millis(50),
        KILL_WAIT_BOUND,
    ))
}

fn sleeper() -> CommandSpec {
    CommandSpec::new("/bin/sleep").arg("30")
}

async fn wait_for_ready(handle: &mut ProcessHandle) {
    let stdout = handle.take_stdout().expect("stdout should be piped");
    let mut lines = DiagnosticLines::new(stdout);
    let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
        .await
        .expect("engine should report readiness")
        .expect("stdout should be readable");
    assert_eq!(line.as_deref(), Some("ready"));
}

#[tokio::test]
async fn registers_and_lists_started_processes() {
    let supervisor = supervisor();
    let handle = supervisor
        .start(TaskId(1), UserId(10), sleeper())
        .expect("spawn should succeed");

    let entry = supervisor.info(TaskId(1)).expect("entry should be registered");
    assert_eq!(entry.pid, handle.pid());
    assert_eq!(entry.pgid, handle.pid());
    assert_eq!(entry.user_id, UserId(10));
    assert_eq!(entry.command, vec!["/bin/sleep", "30"]);
    assert!(supervisor.is_running(TaskId(1)));
    assert_eq!(supervisor.list().len(), 1);

    assert!(supervisor.kill(TaskId(1), Duration::from_secs(3)).await.unwrap());
    assert!(supervisor.info(TaskId(1)).is_none());
}

#[tokio::test]
async fn cooperative_engine_stops_on_sigterm() {
    let supervisor = supervisor();
    let mut handle = supervisor.start(TaskId(2), UserId(1), sleeper()).unwrap();

    let started = Instant::now();
    assert!(supervisor.kill(TaskId(2), Duration::from_secs(5)).await.unwrap());

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(handle.wait().await, ProcessExitStatus::Terminated);
}

#[tokio::test]
async fn escalates_to_sigkill_when_sigterm_is_ignored() {
    let supervisor = supervisor();
    let mut handle = supervisor
        .start(
            TaskId(3),
            UserId(1),
            CommandSpec::new("/bin/sh").args(["-c", "trap '' TERM; echo ready; sleep 30"]),
        )
        .unwrap();
    wait_for_ready(&mut handle).await;

    let timeout = Duration::from_secs(1);
    let started = Instant::now();
    let killed = supervisor.kill(TaskId(3), timeout).await.unwrap();
    let elapsed = started.elapsed();

    assert!(killed);
    assert!(elapsed >= timeout, "SIGKILL came too early: {elapsed:?}");
    assert!(
        elapsed < timeout + KILL_WAIT_BOUND,
        "kill took too long: {elapsed:?}"
    );
    assert!(handle.has_exited());
    assert!(supervisor.info(TaskId(3)).is_none());
}

#[tokio::test]
async fn killing_unknown_or_finished_tasks_is_harmless() {
    let supervisor = supervisor();
    assert!(supervisor.kill(TaskId(404), Duration::from_secs(1)).await.unwrap());

    let mut handle = supervisor
        .start(TaskId(4), UserId(1), CommandSpec::new("/bin/echo").arg("done"))
        .unwrap();
    assert_eq!(handle.wait().await, ProcessExitStatus::ExitCode(0));

    assert!(supervisor.kill(TaskId(4), Duration::from_secs(1)).await.unwrap());
    assert!(supervisor.info(TaskId(4)).is_none());
}

#[tokio::test]
async fn second_live_process_for_a_task_is_rejected() {
    let supervisor = supervisor();
    let _handle = supervisor.start(TaskId(5), UserId(1), sleeper()).unwrap();

    let error = supervisor
        .start(TaskId(5), UserId(1), sleeper())
        .err()
        .expect("duplicate start should fail");
    assert_eq!(error.kind, CoreErrorKind::AlreadyRunning);
    assert_eq!(error.task_id, Some(TaskId(5)));

    supervisor.kill(TaskId(5), Duration::from_secs(3)).await.unwrap();
}

#[tokio::test]
async fn spawn_failure_leaves_no_entry() {
    let supervisor = supervisor();
    let error = supervisor
        .start(
            TaskId(6),
            UserId(1),
            CommandSpec::new("/definitely/not/an/engine"),
        )
        .err()
        .expect("missing program should fail");

    assert_eq!(error.kind, CoreErrorKind::SpawnFailure);
    assert!(supervisor.list().is_empty());
}

#[tokio::test]
async fn dropped_guard_kills_and_unregisters() {
    let supervisor = supervisor();
    let mut handle = supervisor.start(TaskId(7), UserId(1), sleeper()).unwrap();

    let guard = supervisor.guard(&handle);
    drop(guard);

    assert!(supervisor.info(TaskId(7)).is_none());
    let status = tokio::time::timeout(Duration::from_secs(3), handle.wait())
        .await
        .expect("abandoned engine should be killed");
    assert_eq!(status, ProcessExitStatus::Terminated);
}

#[tokio::test]
async fn disarmed_guard_leaves_the_entry_alone() {
    let supervisor = supervisor();
    let handle = supervisor.start(TaskId(8), UserId(1), sleeper()).unwrap();

    let mut guard = supervisor.guard(&handle);
    guard.disarm();
    drop(guard);

    assert!(supervisor.is_running(TaskId(8)));
    supervisor.kill(TaskId(8), Duration::from_secs(3)).await.unwrap();
}

#[tokio::test]
async fn bulk_kills_by_user_and_for_shutdown() {
    let supervisor = supervisor();
    let _a = supervisor.start(TaskId(11), UserId(1), sleeper()).unwrap();
    let _b = supervisor.start(TaskId(12), UserId(1), sleeper()).unwrap();
    let _c = supervisor.start(TaskId(13), UserId(2), sleeper()).unwrap();

    let killed = supervisor
        .kill_user_processes(UserId(1), Duration::from_secs(3))
        .await
        .unwrap();
    assert_eq!(killed, 2);

    let remaining: Vec<TaskId> = supervisor.list().iter().map(|entry| entry.task_id).collect();
    assert_eq!(remaining, vec![TaskId(13)]);

    assert_eq!(supervisor.kill_all(Duration::from_secs(3)).await, 1);
    assert!(supervisor.list().is_empty());
}
