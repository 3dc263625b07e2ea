#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "initial_task_records",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS task_records (
    task_id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    tool TEXT NOT NULL,
    input_source TEXT NOT NULL,
    status TEXT NOT NULL,
    progress_percent REAL NOT NULL DEFAULT 0,
    upload_target TEXT,
    output_name TEXT,
    error_msg TEXT,
    created_at_unix_ms INTEGER NOT NULL,
    updated_at_unix_ms INTEGER NOT NULL
);
"#,
    down_sql: r#"
DROP TABLE IF EXISTS task_records;
"#,
};

const MIGRATION_0002: SqliteMigration = SqliteMigration {
    version: 2,
    name: "index_active_tasks_by_user",
    up_sql: r#"
CREATE INDEX IF NOT EXISTS idx_task_records_user_status
    ON task_records (user_id, status);
"#,
    down_sql: r#"
DROP INDEX IF EXISTS idx_task_records_user_status;
"#,
};

const MIGRATIONS: [SqliteMigration; 2] = [MIGRATION_0001, MIGRATION_0002];

pub fn migrations() -> &'static [SqliteMigration] {
    &MIGRATIONS
}

pub fn migration(version: i64) -> Option<&'static SqliteMigration> {
    MIGRATIONS.iter().find(|entry| entry.version == version)
}

pub fn current_schema_version() -> i64 {
    MIGRATIONS.last().map(|entry| entry.version).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::{current_schema_version, migration, migrations};

    #[test]
    fn versions_are_contiguous_from_one() {
        for (index, entry) in migrations().iter().enumerate() {
            assert_eq!(entry.version, index as i64 + 1);
        }
        assert_eq!(current_schema_version(), migrations().len() as i64);
        assert!(migration(0).is_none());
    }
}
