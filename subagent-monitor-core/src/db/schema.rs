//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 3;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: invocations and their statistics
    r#"
    CREATE TABLE IF NOT EXISTS invocations (
        id                    INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id            TEXT NOT NULL,
        subagent_type         TEXT NOT NULL,
        description           TEXT,
        tracking_id           TEXT,
        prompt_digest         TEXT,

        -- Lifecycle
        is_active             INTEGER NOT NULL DEFAULT 1,
        status                TEXT NOT NULL DEFAULT 'active',
        start_timestamp       DATETIME NOT NULL,
        end_timestamp         DATETIME,
        duration_seconds      INTEGER,

        -- Context
        transcript_path       TEXT,
        cwd                   TEXT,

        -- Totals
        total_tokens          INTEGER NOT NULL DEFAULT 0,
        total_tool_calls      INTEGER NOT NULL DEFAULT 0,
        total_messages        INTEGER NOT NULL DEFAULT 0,

        created_at            DATETIME NOT NULL,
        updated_at            DATETIME NOT NULL
    );

    CREATE TABLE IF NOT EXISTS invocation_tool_usage (
        invocation_id         INTEGER NOT NULL REFERENCES invocations(id) ON DELETE CASCADE,
        tool_name             TEXT NOT NULL,
        category              TEXT NOT NULL,
        call_count            INTEGER NOT NULL,
        PRIMARY KEY (invocation_id, tool_name)
    );

    CREATE TABLE IF NOT EXISTS invocation_message_stats (
        invocation_id         INTEGER NOT NULL REFERENCES invocations(id) ON DELETE CASCADE,
        role                  TEXT NOT NULL,
        message_count         INTEGER NOT NULL,
        total_chars           INTEGER NOT NULL,
        avg_chars             REAL NOT NULL,
        PRIMARY KEY (invocation_id, role)
    );

    CREATE TABLE IF NOT EXISTS invocation_errors (
        id                    INTEGER PRIMARY KEY AUTOINCREMENT,
        invocation_id         INTEGER REFERENCES invocations(id) ON DELETE CASCADE,
        error_kind            TEXT NOT NULL,
        message               TEXT NOT NULL,
        occurred_at           DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_invocations_session ON invocations(session_id);
    CREATE INDEX IF NOT EXISTS idx_invocations_active ON invocations(session_id, is_active);
    CREATE INDEX IF NOT EXISTS idx_invocations_type ON invocations(subagent_type);
    CREATE INDEX IF NOT EXISTS idx_invocations_start ON invocations(start_timestamp);
    CREATE INDEX IF NOT EXISTS idx_invocation_errors_invocation ON invocation_errors(invocation_id);

    -- Timestamps are stored as RFC 3339 with a Z suffix, which strftime parses.
    CREATE TRIGGER IF NOT EXISTS trg_invocations_duration
    AFTER UPDATE OF end_timestamp ON invocations
    WHEN NEW.end_timestamp IS NOT NULL
    BEGIN
        UPDATE invocations
        SET duration_seconds =
            CAST(strftime('%s', NEW.end_timestamp) AS INTEGER)
            - CAST(strftime('%s', NEW.start_timestamp) AS INTEGER)
        WHERE id = NEW.id;
    END;
    "#,
    // Version 2: enhanced conversation statistics
    r#"
    ALTER TABLE invocations ADD COLUMN runtime_secs INTEGER;
    ALTER TABLE invocations ADD COLUMN turns INTEGER;
    ALTER TABLE invocations ADD COLUMN files_created INTEGER;
    ALTER TABLE invocations ADD COLUMN files_modified INTEGER;
    ALTER TABLE invocations ADD COLUMN files_read INTEGER;
    ALTER TABLE invocations ADD COLUMN files_deleted INTEGER;
    ALTER TABLE invocations ADD COLUMN file_paths JSON;
    ALTER TABLE invocations ADD COLUMN documentation_updated INTEGER NOT NULL DEFAULT 0;
    "#,
    // Version 3: MCP tool-call correlation
    r#"
    -- timestamp and matched_at are unix seconds; lookups compare them numerically.
    CREATE TABLE IF NOT EXISTS mcp_correlations (
        id                    INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp             REAL NOT NULL,
        tool_name             TEXT NOT NULL,
        param_hash            TEXT NOT NULL,
        param_preview         TEXT,
        session_id            TEXT NOT NULL,
        subagent_type         TEXT,
        confidence            REAL,
        project_path          TEXT,
        matched               INTEGER NOT NULL DEFAULT 0,
        matched_at            REAL,
        created_at            DATETIME NOT NULL,
        UNIQUE (tool_name, param_hash, timestamp)
    );

    CREATE INDEX IF NOT EXISTS idx_mcp_correlations_lookup
        ON mcp_correlations(tool_name, param_hash, timestamp);
    CREATE INDEX IF NOT EXISTS idx_mcp_correlations_timestamp ON mcp_correlations(timestamp);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::debug!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute_batch(&format!("PRAGMA user_version = {}", version))?;
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

        let tables = [
            "invocations",
            "invocation_tool_usage",
            "invocation_message_stats",
            "invocation_errors",
            "mcp_correlations",
        ];

        for table in tables {
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
    fn test_duration_trigger() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        conn.execute(
            "INSERT INTO invocations (session_id, subagent_type, start_timestamp, created_at, updated_at)
             VALUES ('s', 't', '2024-01-01T10:00:00Z', '2024-01-01T10:00:00Z', '2024-01-01T10:00:00Z')",
            [],
        )
        .unwrap();
        conn.execute(
            "UPDATE invocations SET end_timestamp = '2024-01-01T10:02:30Z' WHERE id = 1",
            [],
        )
        .unwrap();

        let duration: i64 = conn
            .query_row(
                "SELECT duration_seconds FROM invocations WHERE id = 1",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(duration, 150);
    }
}
