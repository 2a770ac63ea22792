//! SQLite implementation of [`CorrelationStore`]

use super::repo::{to_db_time, Database};
use crate::correlation::{
    param_hash, param_preview, unix_secs, CorrelationContext, CorrelationStats, CorrelationStore,
    NewCorrelation, MATCH_WINDOW_SECS, RETENTION_SECS,
};
use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

impl CorrelationStore for Database {
    fn store_correlation(&self, correlation: &NewCorrelation, now: DateTime<Utc>) -> Result<String> {
        let timestamp = unix_secs(now);
        let hash = param_hash(&correlation.params);

        let conn = self.connection();
        conn.execute(
            r#"
            INSERT OR REPLACE INTO mcp_correlations
                (timestamp, tool_name, param_hash, param_preview, session_id,
                 subagent_type, confidence, project_path, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                timestamp,
                correlation.tool_name,
                hash,
                param_preview(&correlation.params),
                correlation.session_id,
                correlation.subagent_type,
                correlation.confidence,
                correlation.project_path,
                to_db_time(now),
            ],
        )?;

        let removed = conn.execute(
            "DELETE FROM mcp_correlations WHERE timestamp < ?1",
            params![timestamp - RETENTION_SECS],
        )?;
        if removed > 0 {
            tracing::debug!(removed, "Removed expired correlations");
        }

        Ok(format!("{}:{}:{:.3}", correlation.tool_name, &hash[..8], timestamp))
    }

    fn retrieve_correlation(
        &self,
        tool_name: &str,
        params: &Value,
        mark_matched: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<CorrelationContext>> {
        let current = unix_secs(now);
        let conn = self.connection();

        let row = conn
            .query_row(
                r#"
                SELECT id, timestamp, session_id, subagent_type, confidence,
                       project_path, param_preview
                FROM mcp_correlations
                WHERE tool_name = ?1
                  AND param_hash = ?2
                  AND timestamp > ?3
                  AND timestamp <= ?4
                  AND matched = 0
                ORDER BY timestamp DESC
                LIMIT 1
                "#,
                params![tool_name, param_hash(params), current - MATCH_WINDOW_SECS, current],
                |row| {
                    let id: i64 = row.get(0)?;
                    let timestamp: f64 = row.get(1)?;
                    Ok((
                        id,
                        CorrelationContext {
                            session_id: row.get(2)?,
                            subagent_type: row.get(3)?,
                            confidence: row.get(4)?,
                            project_path: row.get(5)?,
                            age_secs: current - timestamp,
                            param_preview: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
                        },
                    ))
                },
            )
            .optional()?;

        let Some((id, context)) = row else {
            return Ok(None);
        };
        if mark_matched {
            conn.execute(
                "UPDATE mcp_correlations SET matched = 1, matched_at = ?1 WHERE id = ?2",
                params![current, id],
            )?;
        }
        Ok(Some(context))
    }

    fn correlation_stats(&self, now: DateTime<Utc>) -> Result<CorrelationStats> {
        let current = unix_secs(now);
        let conn = self.connection();
        let stats = conn.query_row(
            r#"
            SELECT COUNT(*), COALESCE(SUM(matched), 0), COUNT(DISTINCT session_id),
                   COUNT(DISTINCT subagent_type), MIN(timestamp), MAX(timestamp)
            FROM mcp_correlations
            "#,
            [],
            |row| {
                let oldest: Option<f64> = row.get(4)?;
                let newest: Option<f64> = row.get(5)?;
                Ok(CorrelationStats {
                    total: row.get::<_, i64>(0)? as u64,
                    matched: row.get::<_, i64>(1)? as u64,
                    unique_sessions: row.get::<_, i64>(2)? as u64,
                    unique_subagents: row.get::<_, i64>(3)? as u64,
                    oldest_age_secs: oldest.map(|t| current - t),
                    newest_age_secs: newest.map(|t| current - t),
                })
            },
        )?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
    }

    fn correlation(params: Value, subagent_type: Option<&str>) -> NewCorrelation {
        NewCorrelation {
            tool_name: "mcp__db__query".to_string(),
            params,
            session_id: "s1".to_string(),
            subagent_type: subagent_type.map(str::to_string),
            confidence: subagent_type.map(|_| 1.0),
            project_path: Some("/work".to_string()),
        }
    }

    #[test]
    fn test_store_then_retrieve_once() {
        let db = test_db();
        let params = json!({"sql": "select 1", "limit": 10});
        let id = db
            .store_correlation(&correlation(params.clone(), Some("reviewer")), t0())
            .unwrap();
        assert!(id.starts_with("mcp__db__query:"));

        // Key order differs from the stored call.
        let lookup = json!({"limit": 10, "sql": "select 1"});
        let context = db
            .retrieve_correlation("mcp__db__query", &lookup, true, t0() + Duration::seconds(2))
            .unwrap()
            .unwrap();
        assert_eq!(context.session_id, "s1");
        assert_eq!(context.subagent_type.as_deref(), Some("reviewer"));
        assert_eq!(context.confidence, Some(1.0));
        assert!((context.age_secs - 2.0).abs() < 1e-6);

        let again = db
            .retrieve_correlation("mcp__db__query", &lookup, true, t0() + Duration::seconds(3))
            .unwrap();
        assert!(again.is_none());
    }

    #[test]
    fn test_peek_does_not_consume() {
        let db = test_db();
        let params = json!({"q": 1});
        db.store_correlation(&correlation(params.clone(), None), t0()).unwrap();

        for _ in 0..2 {
            let context = db
                .retrieve_correlation("mcp__db__query", &params, false, t0())
                .unwrap()
                .unwrap();
            assert!(context.subagent_type.is_none());
        }
    }

    #[test]
    fn test_match_window() {
        let db = test_db();
        let params = json!({"q": 1});
        db.store_correlation(&correlation(params.clone(), None), t0()).unwrap();

        let late = t0() + Duration::milliseconds(5001);
        assert!(db
            .retrieve_correlation("mcp__db__query", &params, true, late)
            .unwrap()
            .is_none());
        let early = t0() - Duration::seconds(1);
        assert!(db
            .retrieve_correlation("mcp__db__query", &params, true, early)
            .unwrap()
            .is_none());
        assert!(db
            .retrieve_correlation("mcp__db__other", &params, true, t0())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_newest_unmatched_wins() {
        let db = test_db();
        let params = json!({"q": 1});
        db.store_correlation(&correlation(params.clone(), Some("planner")), t0())
            .unwrap();
        db.store_correlation(
            &correlation(params.clone(), Some("coder")),
            t0() + Duration::seconds(1),
        )
        .unwrap();

        let now = t0() + Duration::seconds(2);
        let first = db
            .retrieve_correlation("mcp__db__query", &params, true, now)
            .unwrap()
            .unwrap();
        assert_eq!(first.subagent_type.as_deref(), Some("coder"));
        let second = db
            .retrieve_correlation("mcp__db__query", &params, true, now)
            .unwrap()
            .unwrap();
        assert_eq!(second.subagent_type.as_deref(), Some("planner"));
    }

    #[test]
    fn test_store_removes_expired_rows_and_stats() {
        let db = test_db();
        db.store_correlation(&correlation(json!({"q": 1}), Some("planner")), t0())
            .unwrap();
        let later = t0() + Duration::seconds(61);
        db.store_correlation(&correlation(json!({"q": 2}), Some("coder")), later)
            .unwrap();

        let stats = db.correlation_stats(later).unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.matched, 0);
        assert_eq!(stats.unique_sessions, 1);
        assert_eq!(stats.unique_subagents, 1);
        assert_eq!(stats.newest_age_secs, Some(0.0));

        db.retrieve_correlation("mcp__db__query", &json!({"q": 2}), true, later)
            .unwrap();
        assert_eq!(db.correlation_stats(later).unwrap().matched, 1);
    }

    #[test]
    fn test_stats_on_empty_table() {
        let stats = test_db().correlation_stats(t0()).unwrap();
        assert_eq!(stats, CorrelationStats::default());
    }
}
