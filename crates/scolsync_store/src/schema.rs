//! Versioned schema migration for the device store.

use crate::error::{StoreError, StoreResult};
use rusqlite::Connection;

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// One schema migration, applied atomically.
struct Migration {
    version: i32,
    description: &'static str,
    up_sql: &'static str,
}

/// All migrations in order.
fn migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "initial device schema",
        up_sql: r#"
            CREATE TABLE IF NOT EXISTS academic_years (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                start_date TEXT NOT NULL DEFAULT '',
                end_date TEXT NOT NULL DEFAULT '',
                is_current INTEGER NOT NULL DEFAULT 0,
                server_id TEXT,
                is_dirty INTEGER NOT NULL DEFAULT 1,
                last_modified_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS classes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                level TEXT NOT NULL DEFAULT '',
                option TEXT NOT NULL DEFAULT '',
                section TEXT NOT NULL DEFAULT '',
                academic_year_id INTEGER REFERENCES academic_years(id),
                server_id TEXT,
                is_dirty INTEGER NOT NULL DEFAULT 1,
                last_modified_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS domains (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                display_order INTEGER NOT NULL DEFAULT 0,
                server_id TEXT,
                is_dirty INTEGER NOT NULL DEFAULT 1,
                last_modified_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS students (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                first_name TEXT NOT NULL,
                last_name TEXT NOT NULL,
                post_name TEXT NOT NULL DEFAULT '',
                gender TEXT NOT NULL DEFAULT '',
                birth_date TEXT NOT NULL DEFAULT '',
                birthplace TEXT NOT NULL DEFAULT '',
                is_abandoned INTEGER NOT NULL DEFAULT 0,
                abandon_reason TEXT NOT NULL DEFAULT '',
                class_id INTEGER REFERENCES classes(id),
                server_id TEXT,
                is_dirty INTEGER NOT NULL DEFAULT 1,
                last_modified_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id);

            CREATE TABLE IF NOT EXISTS subjects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                code TEXT NOT NULL DEFAULT '',
                category TEXT NOT NULL DEFAULT '',
                sub_domain TEXT NOT NULL DEFAULT '',
                max_p1 REAL NOT NULL DEFAULT 10,
                max_p2 REAL NOT NULL DEFAULT 10,
                max_exam1 REAL NOT NULL DEFAULT 20,
                max_p3 REAL NOT NULL DEFAULT 10,
                max_p4 REAL NOT NULL DEFAULT 10,
                max_exam2 REAL NOT NULL DEFAULT 20,
                class_id INTEGER REFERENCES classes(id),
                domain_id INTEGER REFERENCES domains(id),
                server_id TEXT,
                is_dirty INTEGER NOT NULL DEFAULT 1,
                last_modified_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_subjects_class ON subjects(class_id);

            CREATE TABLE IF NOT EXISTS grades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                student_id INTEGER NOT NULL REFERENCES students(id),
                subject_id INTEGER NOT NULL REFERENCES subjects(id),
                period TEXT NOT NULL,
                value REAL NOT NULL DEFAULT 0,
                server_id TEXT,
                is_dirty INTEGER NOT NULL DEFAULT 1,
                last_modified_at TEXT NOT NULL,
                UNIQUE(student_id, subject_id, period)
            );

            CREATE TABLE IF NOT EXISTS notes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                content TEXT NOT NULL DEFAULT '',
                academic_year_id INTEGER REFERENCES academic_years(id),
                server_id TEXT,
                is_dirty INTEGER NOT NULL DEFAULT 1,
                last_modified_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sync_deletions (
                table_name TEXT NOT NULL,
                local_id INTEGER NOT NULL,
                queued_at TEXT NOT NULL,
                PRIMARY KEY (table_name, local_id)
            );

            CREATE TABLE IF NOT EXISTS sync_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                records_synced TEXT NOT NULL DEFAULT '{}',
                error_message TEXT,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
        "#,
    }]
}

/// Applies every pending migration to the connection.
pub fn migrate(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )?;

    let current: i32 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
            row.get(0)
        })?;

    for migration in migrations() {
        if migration.version <= current {
            continue;
        }
        tracing::info!(
            version = migration.version,
            description = migration.description,
            "applying store migration"
        );
        conn.execute_batch("BEGIN")?;
        let applied = conn
            .execute_batch(migration.up_sql)
            .and_then(|_| {
                conn.execute(
                    "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                    rusqlite::params![migration.version, crate::now_rfc3339()],
                )
                .map(|_| ())
            });
        match applied {
            Ok(()) => conn.execute_batch("COMMIT")?,
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(StoreError::Migration {
                    version: migration.version,
                    message: e.to_string(),
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn grade_cells_are_unique_per_period() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        let now = crate::now_rfc3339();
        // Grades carry foreign keys to students/subjects, and foreign-key
        // enforcement is on for this connection, so seed the referenced rows
        // (each gets id 1) before exercising the UNIQUE(student, subject, period)
        // constraint below.
        conn.execute(
            "INSERT INTO students (first_name, last_name, last_modified_at)
             VALUES ('A', 'B', ?1)",
            [&now],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO subjects (name, last_modified_at) VALUES ('Maths', ?1)",
            [&now],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO grades (student_id, subject_id, period, value, last_modified_at)
             VALUES (1, 1, '1', 10, ?1)",
            [&now],
        )
        .unwrap();

        let dup = conn.execute(
            "INSERT INTO grades (student_id, subject_id, period, value, last_modified_at)
             VALUES (1, 1, '1', 12, ?1)",
            [&now],
        );
        assert!(dup.is_err());
    }
}

