//! Tool-call correlation for MCP servers
//!
//! An MCP server receives only its tool name and parameters; it cannot see
//! which session or subagent issued the call. The PreToolUse hook therefore
//! stores a fingerprint of every MCP tool call together with the caller
//! context, and the server looks the fingerprint up a moment later.
//!
//! ```text
//! PreToolUse(mcp__x, params) ──► store(fingerprint, session, subagent)
//! MCP server(x, params)      ──► retrieve(fingerprint) within 5 s, once
//! ```

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Tool-name prefix the assistant gives MCP tools.
pub const MCP_TOOL_PREFIX: &str = "mcp__";

/// How long after the hook a lookup still matches.
pub const MATCH_WINDOW_SECS: f64 = 5.0;

/// Rows older than this are deleted on every store.
pub const RETENTION_SECS: f64 = 60.0;

/// Characters of the parameters kept for debugging.
pub const PARAM_PREVIEW_LEN: usize = 200;

pub fn is_mcp_tool(tool_name: &str) -> bool {
    tool_name.starts_with(MCP_TOOL_PREFIX)
}

/// SHA-256 hex over a canonical rendering of the parameters.
///
/// Objects are rendered with sorted keys so the hash does not depend on key
/// order. `null` hashes the empty string and a bare string hashes its text.
pub fn param_hash(params: &Value) -> String {
    let normalized = match params {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => {
            let mut out = String::new();
            write_canonical(other, &mut out);
            out
        }
    };
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// First [`PARAM_PREVIEW_LEN`] characters of the parameters.
pub fn param_preview(params: &Value) -> String {
    let rendered = match params {
        Value::Null => return String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    rendered.chars().take(PARAM_PREVIEW_LEN).collect()
}

/// Seconds since the epoch with millisecond precision.
pub fn unix_secs(t: DateTime<Utc>) -> f64 {
    t.timestamp_millis() as f64 / 1000.0
}

/// A tool call about to be made, with the context of its caller.
#[derive(Debug, Clone, Default)]
pub struct NewCorrelation {
    pub tool_name: String,
    pub params: Value,
    pub session_id: String,
    /// `None` when the call comes from the main conversation
    pub subagent_type: Option<String>,
    pub confidence: Option<f64>,
    pub project_path: Option<String>,
}

/// What an MCP server learns about its caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrelationContext {
    pub session_id: String,
    pub subagent_type: Option<String>,
    pub confidence: Option<f64>,
    pub project_path: Option<String>,
    /// Seconds between the hook and the lookup
    pub age_secs: f64,
    pub param_preview: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CorrelationStats {
    pub total: u64,
    pub matched: u64,
    pub unique_sessions: u64,
    pub unique_subagents: u64,
    pub oldest_age_secs: Option<f64>,
    pub newest_age_secs: Option<f64>,
}

/// Persistence for correlation rows. `now` is passed in so callers and
/// tests control the clock.
pub trait CorrelationStore {
    /// Store a row and drop rows past [`RETENTION_SECS`]. Returns a
    /// `tool:hash8:timestamp` id for logs.
    fn store_correlation(&self, correlation: &NewCorrelation, now: DateTime<Utc>) -> Result<String>;

    /// Newest unmatched row for this tool and parameters stored within
    /// [`MATCH_WINDOW_SECS`] of `now`. With `mark_matched` the row cannot be
    /// returned again.
    fn retrieve_correlation(
        &self,
        tool_name: &str,
        params: &Value,
        mark_matched: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<CorrelationContext>>;

    fn correlation_stats(&self, now: DateTime<Utc>) -> Result<CorrelationStats>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_ignores_key_order() {
        let a = json!({"query": "users", "opts": {"limit": 5, "offset": 0}});
        let b = json!({"opts": {"offset": 0, "limit": 5}, "query": "users"});
        assert_eq!(param_hash(&a), param_hash(&b));
        assert_ne!(param_hash(&a), param_hash(&json!({"query": "orders"})));
        assert_eq!(param_hash(&a).len(), 64);
    }

    #[test]
    fn test_hash_of_null_and_string() {
        // SHA-256 of the empty string
        assert_eq!(
            param_hash(&Value::Null),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(param_hash(&json!("abc")), hex::encode(Sha256::digest(b"abc")));
        assert_eq!(
            param_hash(&json!({"b": [1, "x"], "a": null})),
            hex::encode(Sha256::digest(br#"{"a":null,"b":[1,"x"]}"#))
        );
    }

    #[test]
    fn test_preview_is_truncated() {
        let long = "x".repeat(500);
        assert_eq!(param_preview(&json!(long)).len(), PARAM_PREVIEW_LEN);
        assert_eq!(param_preview(&Value::Null), "");
        assert_eq!(param_preview(&json!({"a": 1})), r#"{"a":1}"#);
    }

    #[test]
    fn test_mcp_tool_prefix() {
        assert!(is_mcp_tool("mcp__github__create_issue"));
        assert!(!is_mcp_tool("Task"));
        assert!(!is_mcp_tool("mcp"));
    }
}
