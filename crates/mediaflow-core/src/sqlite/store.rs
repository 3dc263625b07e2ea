use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};

use crate::models::{
    CoreError, CoreErrorKind, InputSource, NewTask, TaskId, TaskRecord, TaskStatus, TaskUpdate,
    ToolKind, UserId,
};
use crate::persistence::in_memory::{already_running, not_found};
use crate::persistence::{MigrationStore, PersistenceResult, TaskStore};
use crate::sqlite::migrations::{SqliteMigration, current_schema_version, migration, migrations};

const MIGRATIONS_TABLE: &str = "mediaflow_schema_migrations";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const TASK_COLUMNS: &str = "task_id, user_id, tool, input_source, status, progress_percent, \
     upload_target, output_name, error_msg, created_at_unix_ms, updated_at_unix_ms";

/// Task store over a SQLite file. Each operation opens its own connection.
pub struct SqliteTaskStore {
    database_path: PathBuf,
}

impl SqliteTaskStore {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    /// Opens the database at `database_path` and migrates it to the latest schema.
    pub fn open(database_path: impl Into<PathBuf>) -> PersistenceResult<Self> {
        let store = Self::new(database_path);
        store.migrate_to_latest()?;
        Ok(store)
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn planned_migrations(&self, from_version: i64) -> Vec<&'static SqliteMigration> {
        migrations()
            .iter()
            .filter(|entry| entry.version > from_version)
            .collect()
    }

    pub fn migrate_to_latest(&self) -> PersistenceResult<()> {
        for entry in self.planned_migrations(self.current_version()?) {
            tracing::info!(
                version = entry.version,
                name = entry.name,
                path = %self.database_path.display(),
                "applying task store migration"
            );
        }
        self.apply_migration(current_schema_version())
    }

    fn with_connection<T>(
        &self,
        operation_name: &str,
        operation: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> PersistenceResult<T> {
        let mut connection = open_connection(&self.database_path)
            .map_err(|error| storage_error(operation_name, error))?;
        operation(&mut connection).map_err(|error| storage_error(operation_name, error))
    }
}

impl MigrationStore for SqliteTaskStore {
    fn current_version(&self) -> PersistenceResult<i64> {
        self.with_connection("current_version", |connection| {
            ensure_migrations_table(connection)?;
            read_current_version(connection)
        })
    }

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()> {
        if !(0..=current_schema_version()).contains(&target_version) {
            return Err(storage_error_text(
                "apply_migration",
                format!("invalid migration target version '{target_version}'"),
            ));
        }

        self.with_connection("apply_migration", |connection| {
            ensure_migrations_table(connection)?;
            let current_version = read_current_version(connection)?;

            if target_version >= current_version {
                for version in (current_version + 1)..=target_version {
                    apply_up_migration(connection, defined_migration(version)?)?;
                }
            } else {
                for version in ((target_version + 1)..=current_version).rev() {
                    apply_down_migration(connection, defined_migration(version)?)?;
                }
            }

            Ok(())
        })
    }
}

impl TaskStore for SqliteTaskStore {
    fn create_task(&self, task: NewTask) -> PersistenceResult<TaskRecord> {
        self.with_connection("create_task", |connection| {
            ensure_schema_ready(connection)?;
            // IMMEDIATE takes the write lock up front so the busy check and the
            // insert cannot interleave with another writer.
            let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if let Some(active) = query_active_task(&transaction, task.user_id)? {
                return Ok(Err(already_running(&active)));
            }

            let now_ms = to_unix_millis(SystemTime::now())?;
            transaction.execute(
                "
INSERT INTO task_records (
    user_id, tool, input_source, status, progress_percent,
    created_at_unix_ms, updated_at_unix_ms
) VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)
",
                params![
                    task.user_id.0,
                    task.tool.as_str(),
                    input_source_to_json(&task.input_source)?,
                    TaskStatus::Pending.as_str(),
                    now_ms,
                ],
            )?;
            let task_id = TaskId(i64_to_u64(transaction.last_insert_rowid())?);
            transaction.commit()?;

            // Timestamps are truncated to the stored millisecond precision.
            let stored_at = from_unix_millis(now_ms)?;
            Ok(Ok(TaskRecord::new(task_id, task, stored_at)))
        })?
    }

    fn get_task(&self, task_id: TaskId) -> PersistenceResult<TaskRecord> {
        self.with_connection("get_task", |connection| {
            ensure_schema_ready(connection)?;
            query_task(connection, task_id)
        })?
        .ok_or_else(|| not_found(task_id))
    }

    fn update_task(&self, task_id: TaskId, update: &TaskUpdate) -> PersistenceResult<TaskRecord> {
        self.with_connection("update_task", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let Some(mut record) = query_task(&transaction, task_id)? else {
                return Ok(Err(not_found(task_id)));
            };
            let already_terminal = record.status.is_terminal();
            if let Err(error) = record.apply(update, SystemTime::now()) {
                return Ok(Err(error));
            }
            if already_terminal {
                return Ok(Ok(record));
            }

            let updated_ms = to_unix_millis(record.updated_at)?;
            transaction.execute(
                "
UPDATE task_records
SET status = ?2, progress_percent = ?3, upload_target = ?4, output_name = ?5,
    error_msg = ?6, updated_at_unix_ms = ?7
WHERE task_id = ?1
",
                params![
                    task_id_to_i64(task_id)?,
                    record.status.as_str(),
                    record.progress_percent,
                    record.upload_target.as_deref(),
                    record.output_name.as_deref(),
                    record.error_msg.as_deref(),
                    updated_ms,
                ],
            )?;
            transaction.commit()?;

            record.updated_at = from_unix_millis(updated_ms)?;
            Ok(Ok(record))
        })?
    }

    fn active_task_for_user(&self, user_id: UserId) -> PersistenceResult<Option<TaskRecord>> {
        self.with_connection("active_task_for_user", |connection| {
            ensure_schema_ready(connection)?;
            query_active_task(connection, user_id)
        })
    }

    fn list_recent_tasks(&self, limit: usize) -> PersistenceResult<Vec<TaskRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        self.with_connection("list_recent_tasks", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM task_records ORDER BY task_id DESC LIMIT ?1"
            ))?;
            let rows = statement.query_map(params![to_i64(limit)?], read_task)?;
            rows.collect()
        })
    }
}

fn query_task(connection: &Connection, task_id: TaskId) -> rusqlite::Result<Option<TaskRecord>> {
    connection
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM task_records WHERE task_id = ?1"),
            params![task_id_to_i64(task_id)?],
            read_task,
        )
        .optional()
}

fn query_active_task(
    connection: &Connection,
    user_id: UserId,
) -> rusqlite::Result<Option<TaskRecord>> {
    connection
        .query_row(
            &format!(
                "SELECT {TASK_COLUMNS} FROM task_records
                 WHERE user_id = ?1
                   AND status IN ('pending', 'starting', 'downloading', 'processing', 'uploading')
                 ORDER BY task_id DESC
                 LIMIT 1"
            ),
            params![user_id.0],
            read_task,
        )
        .optional()
}

fn read_task(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let task_id_raw: i64 = row.get(0)?;
    let user_id_raw: i64 = row.get(1)?;
    let tool_raw: String = row.get(2)?;
    let input_raw: String = row.get(3)?;
    let status_raw: String = row.get(4)?;
    let created_ms: i64 = row.get(9)?;
    let updated_ms: i64 = row.get(10)?;

    Ok(TaskRecord {
        id: TaskId(i64_to_u64(task_id_raw)?),
        user_id: UserId(user_id_raw),
        tool: parse_tool(&tool_raw)?,
        input_source: input_source_from_json(&input_raw)?,
        status: parse_task_status(&status_raw)?,
        progress_percent: row.get(5)?,
        upload_target: row.get(6)?,
        output_name: row.get(7)?,
        error_msg: row.get(8)?,
        created_at: from_unix_millis(created_ms)?,
        updated_at: from_unix_millis(updated_ms)?,
    })
}

fn open_connection(database_path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    }
    let connection = Connection::open(database_path)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    Ok(connection)
}

fn ensure_migrations_table(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(&format!(
        "
CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at_unix INTEGER NOT NULL
);
"
    ))
}

fn ensure_schema_ready(connection: &Connection) -> rusqlite::Result<()> {
    ensure_migrations_table(connection)?;
    if read_current_version(connection)? < current_schema_version() {
        return Err(storage_error_sqlite(
            "database schema is out of date; apply migrations before task operations",
        ));
    }
    Ok(())
}

fn read_current_version(connection: &Connection) -> rusqlite::Result<i64> {
    connection.query_row(
        &format!("SELECT COALESCE(MAX(version), 0) FROM {MIGRATIONS_TABLE}"),
        [],
        |row| row.get(0),
    )
}

fn defined_migration(version: i64) -> rusqlite::Result<&'static SqliteMigration> {
    migration(version)
        .ok_or_else(|| storage_error_sqlite(&format!("migration version '{version}' is not defined")))
}

fn apply_up_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.up_sql)?;
    transaction.execute(
        &format!(
            "INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at_unix)
             VALUES (?1, ?2, strftime('%s', 'now'))"
        ),
        (migration.version, migration.name),
    )?;
    transaction.commit()
}

fn apply_down_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.down_sql)?;
    transaction.execute(
        &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE version = ?1"),
        [migration.version],
    )?;
    transaction.commit()
}

fn storage_error(operation: &str, error: rusqlite::Error) -> CoreError {
    storage_error_text(operation, error.to_string())
}

fn storage_error_text(operation: &str, message: impl AsRef<str>) -> CoreError {
    CoreError::new(
        CoreErrorKind::StorageFailure,
        format!("sqlite store '{operation}' failed: {}", message.as_ref()),
    )
}

fn storage_error_sqlite(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}

fn parse_tool(raw: &str) -> rusqlite::Result<ToolKind> {
    raw.parse::<ToolKind>()
        .map_err(|_| storage_error_sqlite(&format!("unknown tool '{raw}' in sqlite record")))
}

fn parse_task_status(raw: &str) -> rusqlite::Result<TaskStatus> {
    raw.parse::<TaskStatus>()
        .map_err(|_| storage_error_sqlite(&format!("unknown task status '{raw}' in sqlite record")))
}

fn input_source_to_json(source: &InputSource) -> rusqlite::Result<String> {
    serde_json::to_string(source)
        .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))
}

fn input_source_from_json(raw: &str) -> rusqlite::Result<InputSource> {
    serde_json::from_str(raw).map_err(|error| {
        storage_error_sqlite(&format!("malformed input_source in sqlite record: {error}"))
    })
}

fn to_unix_millis(value: SystemTime) -> rusqlite::Result<i64> {
    let duration = value.duration_since(UNIX_EPOCH).map_err(|error| {
        storage_error_sqlite(&format!("time before unix epoch is not supported: {error}"))
    })?;
    i64::try_from(duration.as_millis())
        .map_err(|_| storage_error_sqlite("unix timestamp milliseconds exceed i64 range"))
}

fn from_unix_millis(value: i64) -> rusqlite::Result<SystemTime> {
    let millis = u64::try_from(value)
        .map_err(|_| storage_error_sqlite("negative unix timestamps are not supported"))?;
    Ok(UNIX_EPOCH + Duration::from_millis(millis))
}

fn task_id_to_i64(value: TaskId) -> rusqlite::Result<i64> {
    i64::try_from(value.0).map_err(|_| storage_error_sqlite("task id exceeds i64 range"))
}

fn i64_to_u64(value: i64) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| storage_error_sqlite("negative task id in sqlite record"))
}

fn to_i64(value: usize) -> rusqlite::Result<i64> {
    i64::try_from(value).map_err(|_| storage_error_sqlite("value exceeds i64 range"))
}
