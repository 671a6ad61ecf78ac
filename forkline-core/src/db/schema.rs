//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: threads, message graph, pending interrupts
    r#"
    CREATE TABLE IF NOT EXISTS threads (
        id               TEXT PRIMARY KEY,
        title            TEXT,
        status           TEXT NOT NULL DEFAULT 'regular',
        head_id          TEXT,
        created_at       DATETIME NOT NULL,
        updated_at       DATETIME NOT NULL
    );

    -- One row per graph node; position keeps insertion order so sibling
    -- order survives a reload. Rows need not be in topological order.
    CREATE TABLE IF NOT EXISTS messages (
        thread_id        TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
        id               TEXT NOT NULL,
        parent_id        TEXT,
        position         INTEGER NOT NULL,
        role             TEXT NOT NULL,
        status           JSON NOT NULL,
        checkpoint_id    TEXT,
        content          JSON NOT NULL,
        created_at       DATETIME NOT NULL,
        PRIMARY KEY (thread_id, id)
    );

    CREATE INDEX IF NOT EXISTS idx_messages_thread_position
        ON messages(thread_id, position);

    CREATE TABLE IF NOT EXISTS interrupts (
        thread_id        TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
        checkpoint_id    TEXT NOT NULL,
        message_id       TEXT,
        payload          JSON NOT NULL,
        created_at       DATETIME NOT NULL,
        PRIMARY KEY (thread_id, checkpoint_id)
    );
    "#,
    // Version 2: run audit
    r#"
    CREATE TABLE IF NOT EXISTS runs (
        seq                  INTEGER PRIMARY KEY AUTOINCREMENT,
        id                   TEXT NOT NULL UNIQUE,
        thread_id            TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
        kind                 TEXT NOT NULL,
        status               TEXT NOT NULL,
        fork_checkpoint_id   TEXT,
        result_checkpoint_id TEXT,
        message_id           TEXT,
        error                TEXT,
        started_at           DATETIME NOT NULL,
        finished_at          DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_runs_thread ON runs(thread_id, seq);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        for table in ["threads", "messages", "interrupts", "runs"] {
            let exists: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(exists, 1, "Table {} should exist", table);
        }
    }

    #[test]
    fn test_foreign_keys() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        run_migrations(&conn).unwrap();

        for table in ["messages", "interrupts", "runs"] {
            let fk_tables: Vec<String> = conn
                .prepare(&format!("PRAGMA foreign_key_list({table})"))
                .unwrap()
                .query_map([], |row| row.get::<_, String>(2))
                .unwrap()
                .filter_map(|r| r.ok())
                .collect();
            assert!(
                fk_tables.iter().any(|t| t == "threads"),
                "{table} should reference threads"
            );
        }
    }
}
