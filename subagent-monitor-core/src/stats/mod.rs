//! Conversation statistics for a reconstructed subagent chain
//!
//! [`analyze`] turns a list of transcript entries into a [`ConversationStats`]
//! record: runtime, turns, tool usage, message sizes, a token estimate and a
//! classification of the files the subagent touched.

pub mod heuristics;

use crate::transcript::{Role, ToolInvocation, TranscriptEntry};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Characters per token for the rough token estimate.
pub const CHARS_PER_TOKEN: usize = 4;

/// Size statistics for one message role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageStats {
    pub count: usize,
    pub total_chars: usize,
    pub avg_chars: f64,
}

/// Aggregate statistics for one conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationStats {
    pub runtime_secs: i64,
    pub turns: usize,
    pub files_created: usize,
    pub files_modified: usize,
    pub files_read: usize,
    pub files_deleted: usize,
    /// Every path touched, sorted
    pub file_paths: Vec<String>,
    pub created_paths: Vec<String>,
    pub modified_paths: Vec<String>,
    pub read_paths: Vec<String>,
    pub deleted_paths: Vec<String>,
    pub documentation_updated: bool,
    /// Tool name → number of invocations by the assistant
    pub tool_usage: BTreeMap<String, usize>,
    /// Role → message size statistics
    pub message_stats: BTreeMap<String, MessageStats>,
    pub token_estimate: usize,
    pub message_count: usize,
}

impl ConversationStats {
    pub fn total_tool_calls(&self) -> usize {
        self.tool_usage.values().sum()
    }

    /// One-line human-readable summary.
    pub fn format_summary(&self) -> String {
        let mut parts = vec![
            format!("{} messages", self.message_count),
            format!("{} turns", self.turns),
            format!("{}s runtime", self.runtime_secs),
            format!("{} tool calls", self.total_tool_calls()),
            format!("~{} tokens", self.token_estimate),
        ];
        let file_ops = self.files_created + self.files_modified + self.files_deleted;
        if file_ops > 0 {
            parts.push(format!(
                "files: {} created, {} modified, {} deleted",
                self.files_created, self.files_modified, self.files_deleted
            ));
        }
        if self.documentation_updated {
            parts.push("docs updated".to_string());
        }
        parts.join(", ")
    }
}

/// Compute statistics over a conversation, earliest message first.
pub fn analyze(messages: &[TranscriptEntry]) -> ConversationStats {
    if messages.is_empty() {
        return ConversationStats::default();
    }

    let mut stats = ConversationStats {
        runtime_secs: runtime_secs(messages),
        turns: count_turns(messages),
        message_count: messages.len(),
        ..Default::default()
    };

    let mut total_chars = 0usize;
    for entry in messages {
        let chars = entry.content_chars();
        total_chars += chars;

        let role = entry
            .role
            .as_ref()
            .map(|r| r.as_str().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let role_stats = stats.message_stats.entry(role).or_default();
        role_stats.count += 1;
        role_stats.total_chars += chars;

        if entry.is_assistant() {
            for tool in entry.tool_invocations() {
                *stats.tool_usage.entry(tool.name.clone()).or_default() += 1;
            }
        }
    }
    for role_stats in stats.message_stats.values_mut() {
        role_stats.avg_chars = role_stats.total_chars as f64 / role_stats.count as f64;
    }
    stats.token_estimate = total_chars / CHARS_PER_TOKEN;

    let ops = FileOperations::classify(messages);
    stats.files_created = ops.created.len();
    stats.files_modified = ops.modified.len();
    stats.files_read = ops.read.len();
    stats.files_deleted = ops.deleted.len();
    stats.documentation_updated = ops
        .created
        .iter()
        .chain(ops.modified.iter())
        .any(|p| heuristics::is_documentation_path(p));
    stats.file_paths = ops.all.into_iter().collect();
    stats.created_paths = ops.created.into_iter().collect();
    stats.modified_paths = ops.modified.into_iter().collect();
    stats.read_paths = ops.read.into_iter().collect();
    stats.deleted_paths = ops.deleted.into_iter().collect();

    stats
}

/// Seconds between the earliest and latest timestamped message; 0 with fewer
/// than two timestamps.
fn runtime_secs(messages: &[TranscriptEntry]) -> i64 {
    let mut timestamps = messages.iter().filter_map(|m| m.timestamp);
    let Some(first) = timestamps.next() else {
        return 0;
    };
    let (mut min, mut max, mut count) = (first, first, 1);
    for ts in timestamps {
        min = min.min(ts);
        max = max.max(ts);
        count += 1;
    }
    if count < 2 {
        return 0;
    }
    (max - min).num_seconds()
}

/// Assistant → user transitions, plus one when the conversation ends on the
/// assistant.
fn count_turns(messages: &[TranscriptEntry]) -> usize {
    let mut turns = 0;
    let mut last_role: Option<&Role> = None;
    for entry in messages {
        let role = entry.role.as_ref();
        if last_role == Some(&Role::Assistant) && role == Some(&Role::User) {
            turns += 1;
        }
        last_role = role;
    }
    if last_role == Some(&Role::Assistant) {
        turns += 1;
    }
    turns
}

#[derive(Debug, Default)]
struct FileOperations {
    created: BTreeSet<String>,
    modified: BTreeSet<String>,
    read: BTreeSet<String>,
    deleted: BTreeSet<String>,
    all: BTreeSet<String>,
}

impl FileOperations {
    /// Two passes: first learn which paths already existed (read or edited),
    /// then classify every operation against that knowledge.
    fn classify(messages: &[TranscriptEntry]) -> Self {
        let tools: Vec<&ToolInvocation> = messages
            .iter()
            .flat_map(|m| m.tool_invocations())
            .collect();

        let pre_existing: BTreeSet<&str> = tools
            .iter()
            .filter(|t| matches!(t.name.as_str(), "Read" | "Edit" | "MultiEdit"))
            .filter_map(|t| t.str_param("file_path"))
            .collect();

        let mut ops = FileOperations::default();
        for tool in tools {
            if tool.name == "Bash" {
                let command = tool.str_param("command").unwrap_or_default();
                if heuristics::mentions_deletion(command) {
                    for target in heuristics::deletion_targets(command) {
                        ops.all.insert(target.clone());
                        ops.deleted.insert(target);
                    }
                }
                continue;
            }

            let Some(path) = tool.str_param("file_path") else {
                continue;
            };
            match tool.name.as_str() {
                "Write" => {
                    if pre_existing.contains(path) || ops.created.contains(path) {
                        ops.modified.insert(path.to_string());
                    } else {
                        ops.created.insert(path.to_string());
                    }
                }
                "Edit" | "MultiEdit" => {
                    ops.modified.insert(path.to_string());
                }
                "Read" => {
                    ops.read.insert(path.to_string());
                }
                _ => {}
            }
            ops.all.insert(path.to_string());
        }
        ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::Transcript;
    use serde_json::json;

    fn tool_entry(ts: &str, name: &str, input: serde_json::Value) -> String {
        json!({
            "uuid": uuid::Uuid::new_v4().to_string(),
            "type": "assistant",
            "timestamp": ts,
            "message": {"role": "assistant", "content": [
                {"type": "tool_use", "id": "t", "name": name, "input": input}
            ]}
        })
        .to_string()
    }

    fn text_entry(ts: &str, role: &str, text: &str) -> String {
        json!({
            "uuid": uuid::Uuid::new_v4().to_string(),
            "type": role,
            "timestamp": ts,
            "message": {"role": role, "content": text}
        })
        .to_string()
    }

    fn entries(lines: &[String]) -> Vec<TranscriptEntry> {
        Transcript::parse_str(&lines.join("\n")).entries
    }

    #[test]
    fn test_empty_conversation() {
        assert_eq!(analyze(&[]), ConversationStats::default());
    }

    #[test]
    fn test_file_operation_counts() {
        let messages = entries(&[
            tool_entry("2024-01-01T10:00:00Z", "Read", json!({"file_path": "src/a.rs"})),
            tool_entry("2024-01-01T10:00:01Z", "Write", json!({"file_path": "src/a.rs"})),
            tool_entry("2024-01-01T10:00:02Z", "Write", json!({"file_path": "src/new.rs"})),
            tool_entry("2024-01-01T10:00:03Z", "Write", json!({"file_path": "src/new.rs"})),
            tool_entry("2024-01-01T10:00:04Z", "Edit", json!({"file_path": "README.md"})),
            tool_entry("2024-01-01T10:00:05Z", "Bash", json!({"command": "rm old.txt"})),
            tool_entry("2024-01-01T10:00:06Z", "Bash", json!({"command": "cargo test"})),
        ]);
        let stats = analyze(&messages);

        assert_eq!(stats.files_created, 1);
        assert_eq!(stats.created_paths, vec!["src/new.rs"]);
        // a.rs was read first; new.rs was written twice; README.md edited.
        assert_eq!(stats.files_modified, 3);
        assert_eq!(stats.files_read, 1);
        assert_eq!(stats.files_deleted, 1);
        assert_eq!(stats.deleted_paths, vec!["old.txt"]);
        assert!(stats.documentation_updated);
        assert_eq!(
            stats.file_paths,
            vec!["README.md", "old.txt", "src/a.rs", "src/new.rs"]
        );
        assert_eq!(stats.tool_usage["Bash"], 2);
        assert_eq!(stats.tool_usage["Write"], 3);
        assert_eq!(stats.runtime_secs, 6);
    }

    #[test]
    fn test_edit_before_write_is_pre_existing() {
        // Pass one sees the later Edit, so the earlier Write is a modification.
        let messages = entries(&[
            tool_entry("2024-01-01T10:00:00Z", "Write", json!({"file_path": "x.rs"})),
            tool_entry("2024-01-01T10:00:01Z", "Edit", json!({"file_path": "x.rs"})),
        ]);
        let stats = analyze(&messages);
        assert_eq!(stats.files_created, 0);
        assert_eq!(stats.files_modified, 1);
    }

    #[test]
    fn test_turns_and_message_stats() {
        let messages = entries(&[
            text_entry("2024-01-01T10:00:00Z", "user", "abcd"),
            text_entry("2024-01-01T10:00:10Z", "assistant", "abcdefgh"),
            text_entry("2024-01-01T10:00:20Z", "user", "ab"),
            text_entry("2024-01-01T10:00:30Z", "assistant", "abcdef"),
        ]);
        let stats = analyze(&messages);

        assert_eq!(stats.turns, 2);
        assert_eq!(stats.runtime_secs, 30);
        assert_eq!(stats.token_estimate, 20 / 4);
        let user = &stats.message_stats["user"];
        assert_eq!(user.count, 2);
        assert_eq!(user.total_chars, 6);
        assert!((user.avg_chars - 3.0).abs() < f64::EPSILON);
        assert_eq!(stats.message_stats["assistant"].total_chars, 14);
    }

    #[test]
    fn test_runtime_needs_two_timestamps() {
        let messages = Transcript::parse_str(
            "{\"uuid\":\"a\",\"type\":\"user\",\"timestamp\":\"2024-01-01T10:00:00Z\"}\n{\"uuid\":\"b\",\"type\":\"assistant\"}",
        )
        .entries;
        let stats = analyze(&messages);
        assert_eq!(stats.runtime_secs, 0);
        assert_eq!(stats.turns, 1);
    }

    #[test]
    fn test_format_summary() {
        let stats = ConversationStats {
            message_count: 5,
            turns: 2,
            runtime_secs: 12,
            files_created: 1,
            documentation_updated: true,
            ..Default::default()
        };
        let summary = stats.format_summary();
        assert!(summary.contains("5 messages"));
        assert!(summary.contains("1 created"));
        assert!(summary.contains("docs updated"));
    }
}
