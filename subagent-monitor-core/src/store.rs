//! Persistence contract for invocation records and their statistics
//!
//! The core only talks to storage through [`InvocationStore`]. The SQLite
//! implementation lives in [`crate::db::Database`].

use crate::error::Result;
use crate::stats::ConversationStats;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Final status written when an invocation record is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Completed,
    LikelyCompleted,
    Uncertain,
}

impl CompletionStatus {
    /// ≥ 0.8 completed, ≥ 0.5 likely completed, anything lower uncertain.
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.8 {
            CompletionStatus::Completed
        } else if confidence >= 0.5 {
            CompletionStatus::LikelyCompleted
        } else {
            CompletionStatus::Uncertain
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionStatus::Completed => "completed",
            CompletionStatus::LikelyCompleted => "likely_completed",
            CompletionStatus::Uncertain => "uncertain",
        }
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompletionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "completed" => Ok(CompletionStatus::Completed),
            "likely_completed" => Ok(CompletionStatus::LikelyCompleted),
            "uncertain" => Ok(CompletionStatus::Uncertain),
            other => Err(format!("unknown completion status: {}", other)),
        }
    }
}

/// Fields for a new invocation row.
#[derive(Debug, Clone)]
pub struct NewInvocation {
    pub session_id: String,
    pub subagent_type: String,
    pub description: String,
    pub tracking_id: Option<String>,
    pub prompt_digest: Option<String>,
    pub transcript_path: Option<String>,
    pub cwd: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// A stored invocation row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvocationRecord {
    pub id: i64,
    pub session_id: String,
    pub subagent_type: String,
    pub description: Option<String>,
    pub tracking_id: Option<String>,
    pub is_active: bool,
    /// `active` until closed, then a [`CompletionStatus`] string
    pub status: String,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub transcript_path: Option<String>,
    pub cwd: Option<String>,
    pub total_tokens: i64,
    pub total_tool_calls: i64,
    pub total_messages: i64,
    pub runtime_secs: Option<i64>,
    pub turns: Option<i64>,
    pub files_created: Option<i64>,
    pub files_modified: Option<i64>,
    pub files_read: Option<i64>,
    pub files_deleted: Option<i64>,
    pub file_paths: Vec<String>,
    pub documentation_updated: bool,
}

/// One row of the per-invocation tool histogram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolUsageRow {
    pub tool_name: String,
    pub category: String,
    pub call_count: i64,
}

/// One row of the per-invocation message size table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageStatsRow {
    pub role: String,
    pub message_count: i64,
    pub total_chars: i64,
    pub avg_chars: f64,
}

/// A recorded failure attached to an invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvocationError {
    pub id: i64,
    pub error_kind: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// Narrow CRUD contract the core uses for durable storage.
pub trait InvocationStore {
    /// Insert an active invocation row and return its id.
    fn create_invocation_record(&self, invocation: &NewInvocation) -> Result<i64>;

    /// Mark a row inactive with its final status. The first end timestamp
    /// written is kept.
    fn close_invocation_record(&self, id: i64, status: CompletionStatus) -> Result<()>;

    /// Store the statistics for a row, replacing any previous statistics.
    fn record_statistics(&self, id: i64, stats: &ConversationStats) -> Result<()>;

    fn record_error(&self, id: i64, kind: &str, message: &str) -> Result<()>;

    /// Most recent still-open row for a session and subagent type.
    fn find_open_record(&self, session_id: &str, subagent_type: &str) -> Result<Option<i64>>;
}
