use std::path::PathBuf;

use mediaflow_core::models::{
    CoreErrorKind, InputSource, NewTask, TaskId, TaskStatus, TaskUpdate, ToolKind, UserId,
};
use mediaflow_core::persistence::{InMemoryTaskStore, TaskStore};

fn new_task(user: i64) -> NewTask {
    NewTask::new(
        UserId(user),
        ToolKind::Encode,
        InputSource::LocalPath(PathBuf::from("/media/in.mp4")),
    )
}

fn advance(store: &InMemoryTaskStore, task_id: TaskId, statuses: &[TaskStatus]) {
    for status in statuses {
        store
            .update_task(task_id, &TaskUpdate::status(*status))
            .expect("forward transition should be accepted");
    }
}

#[test]
fn new_tasks_start_pending_with_increasing_ids() {
    let store = InMemoryTaskStore::new();

    let first = store.create_task(new_task(1)).unwrap();
    let second = store.create_task(new_task(2)).unwrap();

    assert_eq!(first.id, TaskId(1));
    assert_eq!(second.id, TaskId(2));
    assert_eq!(first.status, TaskStatus::Pending);
    assert_eq!(first.progress_percent, 0.0);
    assert!(first.error_msg.is_none());
}

#[test]
fn one_active_task_per_user() {
    let store = InMemoryTaskStore::new();
    let first = store.create_task(new_task(7)).unwrap();

    let error = store.create_task(new_task(7)).unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::AlreadyRunning);
    assert_eq!(error.user_id, Some(UserId(7)));
    assert!(store.is_user_busy(UserId(7)).unwrap());

    advance(&store, first.id, &[TaskStatus::Starting, TaskStatus::Failed]);
    assert!(!store.is_user_busy(UserId(7)).unwrap());
    assert!(store.create_task(new_task(7)).is_ok());
}

#[test]
fn happy_path_reaches_completed() {
    let store = InMemoryTaskStore::new();
    let task = store.create_task(new_task(1)).unwrap();

    advance(
        &store,
        task.id,
        &[
            TaskStatus::Starting,
            TaskStatus::Downloading,
            TaskStatus::Processing,
            TaskStatus::Uploading,
            TaskStatus::Completed,
        ],
    );

    assert_eq!(store.get_task(task.id).unwrap().status, TaskStatus::Completed);
}

#[test]
fn backward_transitions_are_rejected() {
    let store = InMemoryTaskStore::new();
    let task = store.create_task(new_task(1)).unwrap();
    advance(
        &store,
        task.id,
        &[TaskStatus::Starting, TaskStatus::Downloading, TaskStatus::Processing],
    );

    let error = store
        .update_task(task.id, &TaskUpdate::status(TaskStatus::Downloading))
        .unwrap_err();

    assert_eq!(error.kind, CoreErrorKind::InvalidTransition);
    assert_eq!(store.get_task(task.id).unwrap().status, TaskStatus::Processing);
}

#[test]
fn terminal_records_are_frozen() {
    let store = InMemoryTaskStore::new();
    let task = store.create_task(new_task(1)).unwrap();
    advance(&store, task.id, &[TaskStatus::Starting, TaskStatus::Processing]);
    store
        .update_task(task.id, &TaskUpdate::progress(40.0))
        .unwrap();
    store
        .update_task(task.id, &TaskUpdate::status(TaskStatus::Cancelled))
        .unwrap();

    // Repeating the terminal status is accepted and changes nothing.
    let repeated = store
        .update_task(task.id, &TaskUpdate::status(TaskStatus::Cancelled))
        .unwrap();
    assert_eq!(repeated.status, TaskStatus::Cancelled);

    let progress = store
        .update_task(task.id, &TaskUpdate::progress(90.0))
        .unwrap_err();
    assert_eq!(progress.kind, CoreErrorKind::InvalidTransition);

    let failed = store
        .update_task(
            task.id,
            &TaskUpdate::status(TaskStatus::Failed).with_error("late failure"),
        )
        .unwrap_err();
    assert_eq!(failed.kind, CoreErrorKind::InvalidTransition);

    let record = store.get_task(task.id).unwrap();
    assert_eq!(record.status, TaskStatus::Cancelled);
    assert_eq!(record.progress_percent, 40.0);
    assert!(record.error_msg.is_none());
}

#[test]
fn progress_is_clamped_and_kept_with_status() {
    let store = InMemoryTaskStore::new();
    let task = store.create_task(new_task(1)).unwrap();
    advance(&store, task.id, &[TaskStatus::Starting, TaskStatus::Processing]);

    let record = store
        .update_task(task.id, &TaskUpdate::progress(150.0))
        .unwrap();
    assert_eq!(record.progress_percent, 100.0);
    assert_eq!(record.status, TaskStatus::Processing);

    let record = store
        .update_task(task.id, &TaskUpdate::progress(-3.0))
        .unwrap();
    assert_eq!(record.progress_percent, 0.0);
}

#[test]
fn uploading_records_target_and_output_name() {
    let store = InMemoryTaskStore::new();
    let task = store.create_task(new_task(1)).unwrap();
    advance(&store, task.id, &[TaskStatus::Starting, TaskStatus::Processing]);

    let record = store
        .update_task(
            task.id,
            &TaskUpdate::status(TaskStatus::Uploading)
                .with_upload_target("chat:42")
                .with_output_name("movie.mkv"),
        )
        .unwrap();

    assert_eq!(record.upload_target.as_deref(), Some("chat:42"));
    assert_eq!(record.output_name.as_deref(), Some("movie.mkv"));
    assert!(record.updated_at >= record.created_at);
}

#[test]
fn missing_tasks_are_not_found() {
    let store = InMemoryTaskStore::new();

    assert_eq!(
        store.get_task(TaskId(99)).unwrap_err().kind,
        CoreErrorKind::NotFound
    );
    assert_eq!(
        store
            .update_task(TaskId(99), &TaskUpdate::progress(1.0))
            .unwrap_err()
            .kind,
        CoreErrorKind::NotFound
    );
}

#[test]
fn recent_tasks_are_newest_first() {
    let store = InMemoryTaskStore::new();
    for user in 1..=4 {
        store.create_task(new_task(user)).unwrap();
    }

    let recent = store.list_recent_tasks(3).unwrap();
    let ids: Vec<TaskId> = recent.iter().map(|record| record.id).collect();
    assert_eq!(ids, vec![TaskId(4), TaskId(3), TaskId(2)]);

    let active = store.active_task_for_user(UserId(2)).unwrap().unwrap();
    assert_eq!(active.id, TaskId(2));
    assert!(store.active_task_for_user(UserId(9)).unwrap().is_none());
}
