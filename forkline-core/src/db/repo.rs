//! Database repository layer
//!
//! SQLite implementation of [`ThreadStore`].

use crate::error::{Error, Result};
use crate::lock_unpoisoned;
use crate::store::{ThreadStore, DEFAULT_HISTORY_LIMIT};
use crate::types::*;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

/// Database handle (single connection)
pub struct Database {
    conn: Mutex<Connection>,
    history_limit: usize,
}

fn parse_ts(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Map a JSON decode failure inside a row mapper onto rusqlite's error type.
/// Decode a JSON text column.
fn json_column<T: DeserializeOwned>(row: &Row, name: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(name)?;
    serde_json::from_str(&raw).map_err(|e| conversion_failure(row, name, Box::new(e)))
}

/// Parse an enum stored by its `as_str` name.
fn enum_column<T: FromStr<Err = String>>(row: &Row, name: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(name)?;
    raw.parse().map_err(|e: String| conversion_failure(row, name, e.into()))
}

fn conversion_failure(
    row: &Row,
    name: &str,
    e: Box<dyn std::error::Error + Send + Sync>,
) -> rusqlite::Error {
    match row.as_ref().column_index(name) {
        Ok(index) => rusqlite::Error::FromSqlConversionFailure(index, Type::Text, e),
        Err(missing) => missing,
    }
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // Enable foreign keys and WAL mode for better concurrency
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            history_limit: DEFAULT_HISTORY_LIMIT,
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
            history_limit: DEFAULT_HISTORY_LIMIT,
        })
    }

    /// Run records kept per thread
    pub fn with_history_limit(mut self, history_limit: usize) -> Self {
        self.history_limit = history_limit.max(1);
        self
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.connection();
        super::schema::run_migrations(&conn)
    }

    /// Get the underlying connection (for advanced use)
    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        lock_unpoisoned(&self.conn)
    }

    // ============================================
    // Thread catalog
    // ============================================

    fn ensure_thread_row(conn: &Connection, thread_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"
            INSERT INTO threads (id, title, status, head_id, created_at, updated_at)
            VALUES (?1, ?2, 'regular', NULL, ?3, ?3)
            ON CONFLICT(id) DO NOTHING
            "#,
            params![thread_id, DEFAULT_THREAD_TITLE, now],
        )?;
        Ok(())
    }

    fn query_thread_info(conn: &Connection, thread_id: &str) -> Result<Option<ThreadInfo>> {
        conn.query_row(
            r#"
            SELECT t.*,
                   (SELECT COUNT(*) FROM messages m WHERE m.thread_id = t.id) AS message_count
            FROM threads t
            WHERE t.id = ?
            "#,
            [thread_id],
            Self::row_to_thread_info,
        )
        .optional()
        .map_err(Error::from)
    }

    fn row_to_thread_info(row: &Row) -> rusqlite::Result<ThreadInfo> {
        let created_at_str: String = row.get("created_at")?;
        let updated_at_str: String = row.get("updated_at")?;
        let message_count: i64 = row.get("message_count")?;

        Ok(ThreadInfo {
            id: row.get("id")?,
            title: row.get("title")?,
            status: enum_column(row, "status")?,
            created_at: parse_ts(&created_at_str),
            updated_at: parse_ts(&updated_at_str),
            message_count: message_count.max(0) as usize,
        })
    }

    // ============================================
    // Messages
    // ============================================

    fn row_to_entry(row: &Row) -> rusqlite::Result<SnapshotEntry> {
        let created_at_str: String = row.get("created_at")?;
        let parent_id: Option<String> = row.get("parent_id")?;

        Ok(SnapshotEntry {
            parent_id: parent_id.clone(),
            message: Message {
                id: row.get("id")?,
                role: enum_column(row, "role")?,
                content: json_column(row, "content")?,
                parent_id,
                checkpoint_id: row.get("checkpoint_id")?,
                status: json_column(row, "status")?,
                created_at: parse_ts(&created_at_str),
            },
        })
    }

    fn row_to_run(row: &Row) -> rusqlite::Result<RunRecord> {
        let started_at_str: String = row.get("started_at")?;
        let finished_at_str: String = row.get("finished_at")?;

        Ok(RunRecord {
            id: row.get("id")?,
            thread_id: row.get("thread_id")?,
            kind: enum_column(row, "kind")?,
            status: enum_column(row, "status")?,
            fork_checkpoint_id: row.get("fork_checkpoint_id")?,
            result_checkpoint_id: row.get("result_checkpoint_id")?,
            message_id: row.get("message_id")?,
            error: row.get("error")?,
            started_at: parse_ts(&started_at_str),
            finished_at: parse_ts(&finished_at_str),
        })
    }
}

impl ThreadStore for Database {
    fn load_thread(&self, thread_id: &str) -> Result<Option<ThreadSnapshot>> {
        let conn = self.connection();
        let head: Option<Option<String>> = conn
            .query_row(
                "SELECT head_id FROM threads WHERE id = ?",
                [thread_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(head_id) = head else {
            return Ok(None);
        };

        let mut stmt =
            conn.prepare("SELECT * FROM messages WHERE thread_id = ? ORDER BY position ASC")?;
        let messages = stmt
            .query_map([thread_id], Self::row_to_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Some(ThreadSnapshot { head_id, messages }))
    }

    fn save_thread(&self, thread_id: &str, snapshot: &ThreadSnapshot) -> Result<()> {
        let mut conn = self.connection();
        let tx = conn.transaction()?;
        Self::ensure_thread_row(&tx, thread_id)?;
        tx.execute(
            "UPDATE threads SET head_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![thread_id, snapshot.head_id, Utc::now().to_rfc3339()],
        )?;
        tx.execute("DELETE FROM messages WHERE thread_id = ?", [thread_id])?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO messages (thread_id, id, parent_id, position, role, status,
                                      checkpoint_id, content, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(thread_id, id) DO UPDATE SET
                    parent_id = excluded.parent_id,
                    role = excluded.role,
                    status = excluded.status,
                    checkpoint_id = excluded.checkpoint_id,
                    content = excluded.content
                "#,
            )?;
            for (position, entry) in snapshot.messages.iter().enumerate() {
                let message = &entry.message;
                stmt.execute(params![
                    thread_id,
                    message.id,
                    entry.parent_id,
                    position as i64,
                    message.role.as_str(),
                    serde_json::to_string(&message.status)?,
                    message.checkpoint_id,
                    serde_json::to_string(&message.content)?,
                    message.created_at.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;

        tracing::debug!(
            thread_id,
            messages = snapshot.messages.len(),
            head_id = ?snapshot.head_id,
            "Saved thread snapshot"
        );
        Ok(())
    }

    fn initialize_thread(&self, thread_id: &str) -> Result<ThreadInfo> {
        let conn = self.connection();
        Self::ensure_thread_row(&conn, thread_id)?;
        Self::query_thread_info(&conn, thread_id)?
            .ok_or_else(|| Error::ThreadNotFound(thread_id.to_string()))
    }

    fn save_interrupt(&self, thread_id: &str, record: &InterruptRecord) -> Result<()> {
        let conn = self.connection();
        Self::ensure_thread_row(&conn, thread_id)?;
        conn.execute(
            r#"
            INSERT INTO interrupts (thread_id, checkpoint_id, message_id, payload, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(thread_id, checkpoint_id) DO UPDATE SET
                message_id = excluded.message_id,
                payload = excluded.payload
            "#,
            params![
                thread_id,
                record.checkpoint_id,
                record.message_id,
                serde_json::to_string(&record.payload)?,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn clear_interrupt(&self, thread_id: &str, checkpoint_id: &str) -> Result<()> {
        let conn = self.connection();
        conn.execute(
            "DELETE FROM interrupts WHERE thread_id = ?1 AND checkpoint_id = ?2",
            params![thread_id, checkpoint_id],
        )?;
        Ok(())
    }

    fn query_interrupt_status(&self, thread_id: &str, checkpoint_id: &str) -> Result<InterruptStatus> {
        let conn = self.connection();
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM interrupts WHERE thread_id = ?1 AND checkpoint_id = ?2",
                params![thread_id, checkpoint_id],
                |row| row.get(0),
            )
            .optional()?;

        match payload {
            Some(text) => Ok(InterruptStatus {
                interrupted: true,
                payload: Some(serde_json::from_str(&text)?),
            }),
            None => Ok(InterruptStatus::default()),
        }
    }

    fn list_threads(&self) -> Result<Vec<ThreadInfo>> {
        let conn = self.connection();
        let mut stmt = conn.prepare(
            r#"
            SELECT t.*, COALESCE(mc.message_count, 0) AS message_count
            FROM threads t
            LEFT JOIN (
                SELECT thread_id, COUNT(*) AS message_count
                FROM messages
                GROUP BY thread_id
            ) mc ON mc.thread_id = t.id
            ORDER BY t.updated_at DESC, t.id ASC
            "#,
        )?;

        let threads = stmt
            .query_map([], Self::row_to_thread_info)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(threads)
    }

    fn get_thread_info(&self, thread_id: &str) -> Result<Option<ThreadInfo>> {
        let conn = self.connection();
        Self::query_thread_info(&conn, thread_id)
    }

    fn rename_thread(&self, thread_id: &str, title: &str) -> Result<bool> {
        let conn = self.connection();
        let changed = conn.execute(
            "UPDATE threads SET title = ?2, updated_at = ?3 WHERE id = ?1",
            params![thread_id, title, Utc::now().to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    fn set_thread_status(&self, thread_id: &str, status: ThreadStatus) -> Result<bool> {
        let conn = self.connection();
        let changed = conn.execute(
            "UPDATE threads SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![thread_id, status.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    fn delete_thread(&self, thread_id: &str) -> Result<bool> {
        let mut conn = self.connection();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM messages WHERE thread_id = ?", [thread_id])?;
        tx.execute("DELETE FROM interrupts WHERE thread_id = ?", [thread_id])?;
        tx.execute("DELETE FROM runs WHERE thread_id = ?", [thread_id])?;
        let removed = tx.execute("DELETE FROM threads WHERE id = ?", [thread_id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    fn append_run(&self, record: &RunRecord) -> Result<()> {
        let mut conn = self.connection();
        let tx = conn.transaction()?;
        Self::ensure_thread_row(&tx, &record.thread_id)?;
        tx.execute(
            r#"
            INSERT INTO runs (id, thread_id, kind, status, fork_checkpoint_id,
                              result_checkpoint_id, message_id, error, started_at, finished_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                record.id,
                record.thread_id,
                record.kind.as_str(),
                record.status.as_str(),
                record.fork_checkpoint_id,
                record.result_checkpoint_id,
                record.message_id,
                record.error,
                record.started_at.to_rfc3339(),
                record.finished_at.to_rfc3339(),
            ],
        )?;
        tx.execute(
            r#"
            DELETE FROM runs
            WHERE thread_id = ?1
              AND seq NOT IN (
                  SELECT seq FROM runs WHERE thread_id = ?1 ORDER BY seq DESC LIMIT ?2
              )
            "#,
            params![record.thread_id, self.history_limit as i64],
        )?;
        tx.execute(
            "UPDATE threads SET updated_at = ?2 WHERE id = ?1",
            params![record.thread_id, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn list_runs(&self, thread_id: &str) -> Result<Vec<RunRecord>> {
        let conn = self.connection();
        let mut stmt = conn.prepare("SELECT * FROM runs WHERE thread_id = ? ORDER BY seq ASC")?;
        let runs = stmt
            .query_map([thread_id], Self::row_to_run)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    fn entry(id: &str, parent: Option<&str>, role: Role, text: &str) -> SnapshotEntry {
        SnapshotEntry {
            parent_id: parent.map(str::to_string),
            message: Message::new(role, vec![ContentPart::text(text)])
                .with_id(id)
                .with_parent(parent.map(str::to_string)),
        }
    }

    #[test]
    fn test_snapshot_round_trip_keeps_order_and_status() {
        let db = test_db();
        let mut assistant = entry("a1", Some("u1"), Role::Assistant, "hi");
        assistant.message.status = MessageStatus::awaiting_approval();
        assistant.message.checkpoint_id = Some("cp-2".to_string());
        assistant
            .message
            .content
            .push(ContentPart::ToolCall(ToolCallPart::new("call-1", "ls", json!({"dir": "/"}))));

        let snapshot = ThreadSnapshot {
            head_id: Some("a1".to_string()),
            // Child listed before its parent on purpose
            messages: vec![assistant, entry("u1", None, Role::User, "hello")],
        };
        db.save_thread("t1", &snapshot).unwrap();

        let loaded = db.load_thread("t1").unwrap().unwrap();
        assert_eq!(loaded.head_id.as_deref(), Some("a1"));
        let ids: Vec<_> = loaded.messages.iter().map(|e| e.message.id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "u1"]);
        let a1 = loaded.message("a1").unwrap();
        assert!(a1.status.requires_action());
        assert_eq!(a1.checkpoint_id.as_deref(), Some("cp-2"));
        assert_eq!(a1.tool_calls().next().unwrap().arguments, json!({"dir": "/"}));
    }

    #[test]
    fn test_save_replaces_previous_snapshot() {
        let db = test_db();
        db.save_thread(
            "t1",
            &ThreadSnapshot {
                head_id: Some("u1".to_string()),
                messages: vec![entry("u1", None, Role::User, "a"), entry("u2", None, Role::User, "b")],
            },
        )
        .unwrap();
        db.save_thread(
            "t1",
            &ThreadSnapshot {
                head_id: Some("u1".to_string()),
                messages: vec![entry("u1", None, Role::User, "a")],
            },
        )
        .unwrap();
        assert_eq!(db.load_thread("t1").unwrap().unwrap().messages.len(), 1);
        assert_eq!(db.get_thread_info("t1").unwrap().unwrap().message_count, 1);
    }

    #[test]
    fn test_missing_thread_loads_none() {
        let db = test_db();
        assert!(db.load_thread("nope").unwrap().is_none());
    }

    #[test]
    fn test_catalog_operations() {
        let db = test_db();
        let info = db.initialize_thread("t1").unwrap();
        assert_eq!(info.title.as_deref(), Some(DEFAULT_THREAD_TITLE));
        assert_eq!(info.status, ThreadStatus::Regular);

        assert!(db.rename_thread("t1", "Slogans").unwrap());
        assert!(db.set_thread_status("t1", ThreadStatus::Archived).unwrap());
        assert!(!db.rename_thread("t2", "x").unwrap());

        let threads = db.list_threads().unwrap();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].title.as_deref(), Some("Slogans"));
        assert_eq!(threads[0].status, ThreadStatus::Archived);
    }

    #[test]
    fn test_interrupts_are_scoped_to_checkpoint() {
        let db = test_db();
        let record = InterruptRecord {
            checkpoint_id: "cp-4".to_string(),
            message_id: Some("a1".to_string()),
            payload: InterruptPayload {
                tool_calls: vec![ToolCallRequest {
                    id: "call-1".to_string(),
                    name: "deploy".to_string(),
                    arguments: json!({"env": "prod"}),
                }],
            },
            created_at: Utc::now(),
        };
        db.save_interrupt("t1", &record).unwrap();

        let status = db.query_interrupt_status("t1", "cp-4").unwrap();
        assert!(status.interrupted);
        assert_eq!(status.payload.unwrap(), record.payload);
        assert!(!db.query_interrupt_status("t1", "cp-5").unwrap().interrupted);

        db.clear_interrupt("t1", "cp-4").unwrap();
        assert!(!db.query_interrupt_status("t1", "cp-4").unwrap().interrupted);
    }

    #[test]
    fn test_run_audit_trimmed_to_history_limit() {
        let db = test_db().with_history_limit(2);
        for n in 0..4 {
            db.append_run(&RunRecord {
                id: format!("run-{n}"),
                thread_id: "t1".to_string(),
                kind: RunKind::Regenerate,
                status: RunStatus::Complete,
                fork_checkpoint_id: Some("cp-1".to_string()),
                result_checkpoint_id: None,
                message_id: None,
                error: None,
                started_at: Utc::now(),
                finished_at: Utc::now(),
            })
            .unwrap();
        }
        let runs = db.list_runs("t1").unwrap();
        let ids: Vec<_> = runs.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["run-2", "run-3"]);
        assert_eq!(runs[0].kind, RunKind::Regenerate);
    }

    #[test]
    fn test_delete_thread_cascades() {
        let db = test_db();
        db.save_thread(
            "t1",
            &ThreadSnapshot {
                head_id: None,
                messages: vec![entry("u1", None, Role::User, "a")],
            },
        )
        .unwrap();
        assert!(db.delete_thread("t1").unwrap());
        assert!(db.load_thread("t1").unwrap().is_none());
        assert!(!db.delete_thread("t1").unwrap());
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("forkline.db");
        let db = Database::open(&path).unwrap();
        db.migrate().unwrap();
        assert!(path.exists());
    }

    fn stored_thread(db: &Database) {
        db.save_thread(
            "t1",
            &ThreadSnapshot {
                head_id: Some("a1".to_string()),
                messages: vec![
                    entry("u1", None, Role::User, "q"),
                    entry("a1", Some("u1"), Role::Assistant, "a"),
                ],
            },
        )
        .unwrap();
    }

    #[test]
    fn test_unknown_role_fails_load() {
        let db = test_db();
        stored_thread(&db);
        db.connection()
            .execute("UPDATE messages SET role = 'narrator' WHERE id = 'a1'", [])
            .unwrap();

        let err = db.load_thread("t1").unwrap_err();
        assert!(
            matches!(
                err,
                Error::Database(rusqlite::Error::FromSqlConversionFailure(_, Type::Text, _))
            ),
            "got {err:?}"
        );
        assert!(err.to_string().contains("narrator"), "got {err}");
    }

    #[test]
    fn test_corrupt_content_fails_load() {
        let db = test_db();
        stored_thread(&db);
        db.connection()
            .execute("UPDATE messages SET content = '{' WHERE id = 'u1'", [])
            .unwrap();

        assert!(matches!(
            db.load_thread("t1"),
            Err(Error::Database(rusqlite::Error::FromSqlConversionFailure(..)))
        ));
    }

    #[test]
    fn test_unknown_run_status_fails_list() {
        let db = test_db();
        db.initialize_thread("t1").unwrap();
        db.append_run(&RunRecord {
            id: "run-1".to_string(),
            thread_id: "t1".to_string(),
            kind: RunKind::SendNew,
            status: RunStatus::Complete,
            fork_checkpoint_id: None,
            result_checkpoint_id: None,
            message_id: None,
            error: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        })
        .unwrap();
        db.connection()
            .execute("UPDATE runs SET status = 'exploded'", [])
            .unwrap();

        assert!(matches!(
            db.list_runs("t1"),
            Err(Error::Database(rusqlite::Error::FromSqlConversionFailure(..)))
        ));
    }
}
