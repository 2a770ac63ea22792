//! Database repository layer
//!
//! Provides insert, update and query operations for invocation records.

use crate::error::{Error, Result};
use crate::stats::heuristics::categorize_tool;
use crate::stats::ConversationStats;
use crate::store::{
    CompletionStatus, InvocationError, InvocationRecord, InvocationStore, MessageStatsRow,
    NewInvocation, ToolUsageRow,
};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Default wait for a contended SQLite write.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

/// Database handle over a single mutex-guarded connection
pub struct Database {
    conn: Mutex<Connection>,
}

/// RFC 3339 with whole seconds and a `Z` suffix; SQLite's date functions parse it.
pub(super) fn to_db_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn from_db_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT_MS)
    }

    /// Open or create a database, waiting up to `busy_timeout_ms` on locked writes
    pub fn open_with_timeout(path: &Path, busy_timeout_ms: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_millis(busy_timeout_ms))?;

        // Several hook processes may write concurrently.
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.connection();
        super::schema::run_migrations(&conn)
    }

    /// Get the underlying connection (for advanced use)
    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ============================================
    // Invocation queries
    // ============================================

    /// Get an invocation by id
    pub fn get_invocation(&self, id: i64) -> Result<Option<InvocationRecord>> {
        let conn = self.connection();
        let record = conn
            .query_row(
                "SELECT * FROM invocations WHERE id = ?1",
                params![id],
                Self::row_to_invocation,
            )
            .optional()?;
        Ok(record)
    }

    /// All invocations of a session, oldest first
    pub fn list_session_invocations(&self, session_id: &str) -> Result<Vec<InvocationRecord>> {
        let conn = self.connection();
        let mut stmt = conn.prepare(
            "SELECT * FROM invocations WHERE session_id = ?1 ORDER BY start_timestamp ASC, id ASC",
        )?;
        let records = stmt
            .query_map(params![session_id], Self::row_to_invocation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Open invocations, optionally for one session, oldest first
    pub fn list_active_invocations(
        &self,
        session_id: Option<&str>,
    ) -> Result<Vec<InvocationRecord>> {
        let conn = self.connection();
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM invocations
            WHERE is_active = 1 AND (?1 IS NULL OR session_id = ?1)
            ORDER BY start_timestamp ASC, id ASC
            "#,
        )?;
        let records = stmt
            .query_map(params![session_id], Self::row_to_invocation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Tool histogram for an invocation, most used first
    pub fn get_tool_usage(&self, invocation_id: i64) -> Result<Vec<ToolUsageRow>> {
        let conn = self.connection();
        let mut stmt = conn.prepare(
            r#"
            SELECT tool_name, category, call_count FROM invocation_tool_usage
            WHERE invocation_id = ?1
            ORDER BY call_count DESC, tool_name ASC
            "#,
        )?;
        let rows = stmt
            .query_map(params![invocation_id], |row| {
                Ok(ToolUsageRow {
                    tool_name: row.get(0)?,
                    category: row.get(1)?,
                    call_count: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Message size statistics per role for an invocation
    pub fn get_message_stats(&self, invocation_id: i64) -> Result<Vec<MessageStatsRow>> {
        let conn = self.connection();
        let mut stmt = conn.prepare(
            r#"
            SELECT role, message_count, total_chars, avg_chars FROM invocation_message_stats
            WHERE invocation_id = ?1
            ORDER BY role ASC
            "#,
        )?;
        let rows = stmt
            .query_map(params![invocation_id], |row| {
                Ok(MessageStatsRow {
                    role: row.get(0)?,
                    message_count: row.get(1)?,
                    total_chars: row.get(2)?,
                    avg_chars: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Errors recorded against an invocation, oldest first
    pub fn get_errors(&self, invocation_id: i64) -> Result<Vec<InvocationError>> {
        let conn = self.connection();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, error_kind, message, occurred_at FROM invocation_errors
            WHERE invocation_id = ?1
            ORDER BY id ASC
            "#,
        )?;
        let rows = stmt
            .query_map(params![invocation_id], |row| {
                let occurred_at: String = row.get(3)?;
                Ok(InvocationError {
                    id: row.get(0)?,
                    error_kind: row.get(1)?,
                    message: row.get(2)?,
                    occurred_at: from_db_time(&occurred_at).unwrap_or_default(),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Delete closed invocations that started before `now - older_than`.
    /// Statistics rows go with them.
    pub fn cleanup_old_invocations(&self, older_than: Duration) -> Result<usize> {
        let cutoff = to_db_time(Utc::now() - older_than);
        let conn = self.connection();
        let deleted = conn.execute(
            "DELETE FROM invocations WHERE is_active = 0 AND start_timestamp < ?1",
            params![cutoff],
        )?;
        if deleted > 0 {
            tracing::info!(deleted, "Cleaned up old invocations");
        }
        Ok(deleted)
    }

    fn row_to_invocation(row: &Row) -> rusqlite::Result<InvocationRecord> {
        let start_str: String = row.get("start_timestamp")?;
        let end_str: Option<String> = row.get("end_timestamp")?;
        let file_paths_str: Option<String> = row.get("file_paths")?;

        Ok(InvocationRecord {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            subagent_type: row.get("subagent_type")?,
            description: row.get("description")?,
            tracking_id: row.get("tracking_id")?,
            is_active: row.get::<_, i64>("is_active")? != 0,
            status: row.get("status")?,
            start_timestamp: from_db_time(&start_str).unwrap_or_default(),
            end_timestamp: end_str.as_deref().and_then(from_db_time),
            duration_seconds: row.get("duration_seconds")?,
            transcript_path: row.get("transcript_path")?,
            cwd: row.get("cwd")?,
            total_tokens: row.get("total_tokens")?,
            total_tool_calls: row.get("total_tool_calls")?,
            total_messages: row.get("total_messages")?,
            runtime_secs: row.get("runtime_secs")?,
            turns: row.get("turns")?,
            files_created: row.get("files_created")?,
            files_modified: row.get("files_modified")?,
            files_read: row.get("files_read")?,
            files_deleted: row.get("files_deleted")?,
            file_paths: file_paths_str
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default(),
            documentation_updated: row.get::<_, i64>("documentation_updated")? != 0,
        })
    }
}

impl InvocationStore for Database {
    fn create_invocation_record(&self, invocation: &NewInvocation) -> Result<i64> {
        let now = to_db_time(Utc::now());
        let conn = self.connection();
        conn.execute(
            r#"
            INSERT INTO invocations (session_id, subagent_type, description, tracking_id,
                                     prompt_digest, is_active, status, start_timestamp,
                                     transcript_path, cwd, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 1, 'active', ?6, ?7, ?8, ?9, ?9)
            "#,
            params![
                invocation.session_id,
                invocation.subagent_type,
                invocation.description,
                invocation.tracking_id,
                invocation.prompt_digest,
                to_db_time(invocation.started_at),
                invocation.transcript_path,
                invocation.cwd,
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();
        tracing::debug!(
            id,
            session_id = %invocation.session_id,
            subagent_type = %invocation.subagent_type,
            "Created invocation record"
        );
        Ok(id)
    }

    fn close_invocation_record(&self, id: i64, status: CompletionStatus) -> Result<()> {
        let now = to_db_time(Utc::now());
        let conn = self.connection();
        let updated = conn.execute(
            r#"
            UPDATE invocations
            SET is_active = 0,
                status = ?2,
                end_timestamp = COALESCE(end_timestamp, ?3),
                updated_at = ?3
            WHERE id = ?1
            "#,
            params![id, status.as_str(), now],
        )?;
        if updated == 0 {
            return Err(Error::InvocationNotFound(id));
        }
        tracing::debug!(id, status = %status, "Closed invocation record");
        Ok(())
    }

    fn record_statistics(&self, id: i64, stats: &ConversationStats) -> Result<()> {
        let now = to_db_time(Utc::now());
        let file_paths = serde_json::to_string(&stats.file_paths)?;
        let mut conn = self.connection();
        let tx = conn.transaction()?;

        let updated = tx.execute(
            r#"
            UPDATE invocations
            SET total_tokens = ?2,
                total_tool_calls = ?3,
                total_messages = ?4,
                runtime_secs = ?5,
                turns = ?6,
                files_created = ?7,
                files_modified = ?8,
                files_read = ?9,
                files_deleted = ?10,
                file_paths = ?11,
                documentation_updated = ?12,
                updated_at = ?13
            WHERE id = ?1
            "#,
            params![
                id,
                stats.token_estimate as i64,
                stats.total_tool_calls() as i64,
                stats.message_count as i64,
                stats.runtime_secs,
                stats.turns as i64,
                stats.files_created as i64,
                stats.files_modified as i64,
                stats.files_read as i64,
                stats.files_deleted as i64,
                file_paths,
                stats.documentation_updated,
                now,
            ],
        )?;
        if updated == 0 {
            return Err(Error::InvocationNotFound(id));
        }

        // Last writer wins: drop rows the new statistics no longer mention.
        tx.execute(
            "DELETE FROM invocation_tool_usage WHERE invocation_id = ?1",
            params![id],
        )?;
        tx.execute(
            "DELETE FROM invocation_message_stats WHERE invocation_id = ?1",
            params![id],
        )?;

        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO invocation_tool_usage (invocation_id, tool_name, category, call_count)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(invocation_id, tool_name) DO UPDATE SET
                    category = excluded.category,
                    call_count = excluded.call_count
                "#,
            )?;
            for (tool_name, count) in &stats.tool_usage {
                stmt.execute(params![id, tool_name, categorize_tool(tool_name), *count as i64])?;
            }

            let mut stmt = tx.prepare(
                r#"
                INSERT INTO invocation_message_stats (invocation_id, role, message_count, total_chars, avg_chars)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(invocation_id, role) DO UPDATE SET
                    message_count = excluded.message_count,
                    total_chars = excluded.total_chars,
                    avg_chars = excluded.avg_chars
                "#,
            )?;
            for (role, role_stats) in &stats.message_stats {
                stmt.execute(params![
                    id,
                    role,
                    role_stats.count as i64,
                    role_stats.total_chars as i64,
                    role_stats.avg_chars,
                ])?;
            }
        }

        tx.commit()?;
        tracing::debug!(id, tools = stats.tool_usage.len(), "Recorded statistics");
        Ok(())
    }

    fn record_error(&self, id: i64, kind: &str, message: &str) -> Result<()> {
        let conn = self.connection();
        conn.execute(
            r#"
            INSERT INTO invocation_errors (invocation_id, error_kind, message, occurred_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![id, kind, message, to_db_time(Utc::now())],
        )?;
        Ok(())
    }

    fn find_open_record(&self, session_id: &str, subagent_type: &str) -> Result<Option<i64>> {
        let conn = self.connection();
        let id = conn
            .query_row(
                r#"
                SELECT id FROM invocations
                WHERE session_id = ?1 AND subagent_type = ?2 AND is_active = 1
                ORDER BY start_timestamp DESC, id DESC
                LIMIT 1
                "#,
                params![session_id, subagent_type],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::MessageStats;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    fn new_invocation(session: &str, subagent_type: &str, started_at: DateTime<Utc>) -> NewInvocation {
        NewInvocation {
            session_id: session.to_string(),
            subagent_type: subagent_type.to_string(),
            description: "Review changes".to_string(),
            tracking_id: Some("abcd1234".to_string()),
            prompt_digest: None,
            transcript_path: Some("/tmp/t.jsonl".to_string()),
            cwd: None,
            started_at,
        }
    }

    fn sample_stats() -> ConversationStats {
        let mut tool_usage = BTreeMap::new();
        tool_usage.insert("Read".to_string(), 3);
        tool_usage.insert("Bash".to_string(), 1);
        let mut message_stats = BTreeMap::new();
        message_stats.insert(
            "assistant".to_string(),
            MessageStats {
                count: 2,
                total_chars: 100,
                avg_chars: 50.0,
            },
        );
        ConversationStats {
            runtime_secs: 42,
            turns: 2,
            files_read: 3,
            file_paths: vec!["a.rs".to_string()],
            tool_usage,
            message_stats,
            token_estimate: 25,
            message_count: 5,
            ..Default::default()
        }
    }

    #[test]
    fn test_create_and_get_invocation() {
        let db = test_db();
        let started = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let id = db
            .create_invocation_record(&new_invocation("s1", "reviewer", started))
            .unwrap();

        let record = db.get_invocation(id).unwrap().unwrap();
        assert_eq!(record.session_id, "s1");
        assert_eq!(record.subagent_type, "reviewer");
        assert!(record.is_active);
        assert_eq!(record.status, "active");
        assert_eq!(record.start_timestamp, started);
        assert!(record.end_timestamp.is_none());
        assert!(db.get_invocation(id + 100).unwrap().is_none());
    }

    #[test]
    fn test_close_sets_status_and_duration() {
        let db = test_db();
        let started = Utc::now() - Duration::seconds(90);
        let id = db
            .create_invocation_record(&new_invocation("s1", "reviewer", started))
            .unwrap();

        db.close_invocation_record(id, CompletionStatus::LikelyCompleted)
            .unwrap();
        let record = db.get_invocation(id).unwrap().unwrap();
        assert!(!record.is_active);
        assert_eq!(record.status, "likely_completed");
        let duration = record.duration_seconds.unwrap();
        assert!((89..=91).contains(&duration), "duration was {}", duration);

        // Second close keeps the first end timestamp.
        let first_end = record.end_timestamp;
        db.close_invocation_record(id, CompletionStatus::Completed)
            .unwrap();
        let record = db.get_invocation(id).unwrap().unwrap();
        assert_eq!(record.end_timestamp, first_end);
        assert_eq!(record.status, "completed");
    }

    #[test]
    fn test_shared_handle_serializes_writers() {
        let db = std::sync::Arc::new(test_db());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let db = std::sync::Arc::clone(&db);
                std::thread::spawn(move || {
                    db.create_invocation_record(&new_invocation("s1", &format!("agent-{i}"), Utc::now()))
                        .unwrap()
                })
            })
            .collect();
        let mut ids: Vec<i64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ids.sort_unstable();
        ids.dedup();

        assert_eq!(ids.len(), 4);
        assert_eq!(db.list_session_invocations("s1").unwrap().len(), 4);
    }

    #[test]
    fn test_close_unknown_is_not_found() {
        let db = test_db();
        let result = db.close_invocation_record(99, CompletionStatus::Completed);
        assert!(matches!(result, Err(Error::InvocationNotFound(99))));
    }

    #[test]
    fn test_record_statistics_is_idempotent() {
        let db = test_db();
        let id = db
            .create_invocation_record(&new_invocation("s1", "reviewer", Utc::now()))
            .unwrap();
        let stats = sample_stats();

        db.record_statistics(id, &stats).unwrap();
        db.record_statistics(id, &stats).unwrap();

        let tools = db.get_tool_usage(id).unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].tool_name, "Read");
        assert_eq!(tools[0].call_count, 3);
        assert_eq!(tools[0].category, "file");
        assert_eq!(tools[1].category, "command");

        let messages = db.get_message_stats(id).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].total_chars, 100);

        let record = db.get_invocation(id).unwrap().unwrap();
        assert_eq!(record.total_tokens, 25);
        assert_eq!(record.total_tool_calls, 4);
        assert_eq!(record.total_messages, 5);
        assert_eq!(record.runtime_secs, Some(42));
        assert_eq!(record.file_paths, vec!["a.rs"]);
    }

    #[test]
    fn test_record_statistics_replaces_previous() {
        let db = test_db();
        let id = db
            .create_invocation_record(&new_invocation("s1", "reviewer", Utc::now()))
            .unwrap();
        db.record_statistics(id, &sample_stats()).unwrap();

        let mut smaller = sample_stats();
        smaller.tool_usage.remove("Bash");
        db.record_statistics(id, &smaller).unwrap();

        assert_eq!(db.get_tool_usage(id).unwrap().len(), 1);
    }

    #[test]
    fn test_find_open_record_prefers_latest() {
        let db = test_db();
        let t = Utc::now();
        let older = db
            .create_invocation_record(&new_invocation("s1", "reviewer", t - Duration::seconds(60)))
            .unwrap();
        let newer = db
            .create_invocation_record(&new_invocation("s1", "reviewer", t))
            .unwrap();
        db.create_invocation_record(&new_invocation("s1", "writer", t))
            .unwrap();

        assert_eq!(db.find_open_record("s1", "reviewer").unwrap(), Some(newer));
        db.close_invocation_record(newer, CompletionStatus::Completed)
            .unwrap();
        assert_eq!(db.find_open_record("s1", "reviewer").unwrap(), Some(older));
        assert_eq!(db.find_open_record("s2", "reviewer").unwrap(), None);
        assert_eq!(db.list_active_invocations(Some("s1")).unwrap().len(), 2);
        assert_eq!(db.list_session_invocations("s1").unwrap().len(), 3);
    }

    #[test]
    fn test_record_error() {
        let db = test_db();
        let id = db
            .create_invocation_record(&new_invocation("s1", "reviewer", Utc::now()))
            .unwrap();
        db.record_error(id, "transcript_parse_error", "missing file")
            .unwrap();

        let errors = db.get_errors(id).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_kind, "transcript_parse_error");
    }

    #[test]
    fn test_cleanup_old_invocations() {
        let db = test_db();
        let old = Utc::now() - Duration::days(40);
        let closed = db
            .create_invocation_record(&new_invocation("s1", "reviewer", old))
            .unwrap();
        let open = db
            .create_invocation_record(&new_invocation("s1", "writer", old))
            .unwrap();
        db.record_statistics(closed, &sample_stats()).unwrap();
        db.close_invocation_record(closed, CompletionStatus::Completed)
            .unwrap();

        assert_eq!(db.cleanup_old_invocations(Duration::days(30)).unwrap(), 1);
        assert!(db.get_invocation(closed).unwrap().is_none());
        assert!(db.get_invocation(open).unwrap().is_some());
        assert!(db.get_tool_usage(closed).unwrap().is_empty());
    }
}
