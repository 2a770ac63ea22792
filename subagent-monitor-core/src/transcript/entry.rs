//! Transcript entry types
//!
//! One [`TranscriptEntry`] is produced per JSONL line. The message payload is
//! resolved once into [`MessageContent`] at ingestion so downstream code never
//! has to sniff whether `message.content` was a string or a block list.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================
// Raw JSONL record types (serde deserialization)
// ============================================

/// Represents a single line from a Claude Code transcript.
///
/// Uses `#[serde(default)]` liberally to handle missing fields gracefully.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct RawRecord {
    uuid: Option<String>,
    parent_uuid: Option<String>,
    session_id: Option<String>,
    #[serde(rename = "type")]
    record_type: Option<String>,
    timestamp: Option<String>,
    is_sidechain: Option<bool>,
    message: Option<RawMessage>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawMessage {
    role: Option<String>,
    content: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawBlock {
    Text {
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: String,
        #[serde(default)]
        content: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },
}

// ============================================
// Resolved entry types
// ============================================

/// Author role of a transcript message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Other(String),
}

impl Role {
    fn parse(s: &str) -> Self {
        match s {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "system" => Role::System,
            other => Role::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Other(s) => s,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A tool call embedded in an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    /// Parameter mapping as sent by the assistant
    pub input: serde_json::Value,
}

impl ToolInvocation {
    /// String parameter lookup; empty strings count as absent.
    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.input
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }
}

/// One item of a structured message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse(ToolInvocation),
    ToolResult {
        tool_use_id: String,
        content: serde_json::Value,
        is_error: bool,
    },
    /// Block types we do not interpret (images, thinking, ...)
    Other {
        raw: serde_json::Value,
    },
}

impl From<RawBlock> for ContentBlock {
    fn from(raw: RawBlock) -> Self {
        match raw {
            RawBlock::Text { text } => ContentBlock::Text { text },
            RawBlock::ToolUse { id, name, input } => {
                ContentBlock::ToolUse(ToolInvocation { id, name, input })
            }
            RawBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            },
        }
    }
}

/// Message body: plain text or a list of typed blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", content = "value", rename_all = "snake_case")]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl MessageContent {
    /// Resolve a raw `message.content` value, returning the content and its
    /// raw stringified form (text verbatim, anything else as compact JSON).
    fn resolve(raw: Option<serde_json::Value>) -> (Self, String) {
        match raw {
            None | Some(serde_json::Value::Null) => (MessageContent::default(), String::new()),
            Some(serde_json::Value::String(text)) => {
                let raw_text = text.clone();
                (MessageContent::Text(text), raw_text)
            }
            Some(serde_json::Value::Array(items)) => {
                let raw_text = serde_json::Value::Array(items.clone()).to_string();
                let blocks = items
                    .into_iter()
                    .map(|item| {
                        serde_json::from_value::<RawBlock>(item.clone())
                            .map(ContentBlock::from)
                            .unwrap_or(ContentBlock::Other { raw: item })
                    })
                    .collect();
                (MessageContent::Blocks(blocks), raw_text)
            }
            Some(other) => {
                let raw_text = other.to_string();
                (
                    MessageContent::Blocks(vec![ContentBlock::Other { raw: other }]),
                    raw_text,
                )
            }
        }
    }

    /// Tool invocations embedded in this content, in order.
    pub fn tool_invocations(&self) -> impl Iterator<Item = &ToolInvocation> {
        let blocks: &[ContentBlock] = match self {
            MessageContent::Blocks(blocks) => blocks,
            MessageContent::Text(_) => &[],
        };
        blocks.iter().filter_map(|block| match block {
            ContentBlock::ToolUse(invocation) => Some(invocation),
            _ => None,
        })
    }

    /// Concatenated human-readable text (text blocks only).
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// One record from the transcript store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    /// 1-based line number in the transcript file
    pub sequence_index: usize,
    pub unique_id: Option<String>,
    /// `None` marks a chain root
    pub parent_id: Option<String>,
    pub is_sidechain: bool,
    pub timestamp: Option<DateTime<Utc>>,
    pub session_id: Option<String>,
    /// Record `type` field (`user`, `assistant`, `summary`, ...)
    pub record_type: Option<String>,
    pub role: Option<Role>,
    pub content: MessageContent,
    raw_content: String,
}

impl TranscriptEntry {
    pub(crate) fn from_raw(sequence_index: usize, record: RawRecord) -> Self {
        let (role, content) = match record.message {
            Some(message) => (message.role, message.content),
            None => (None, None),
        };
        let role = role
            .as_deref()
            .or(record.record_type.as_deref())
            .map(Role::parse);
        let (content, raw_content) = MessageContent::resolve(content);

        // Some writers serialize a missing parent as the string "null".
        let parent_id = record
            .parent_uuid
            .filter(|p| !p.is_empty() && p != "null");

        let timestamp = record
            .timestamp
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Self {
            sequence_index,
            unique_id: record.uuid.filter(|u| !u.is_empty()),
            parent_id,
            is_sidechain: record.is_sidechain.unwrap_or(false),
            timestamp,
            session_id: record.session_id,
            record_type: record.record_type,
            role,
            content,
            raw_content,
        }
    }

    /// Timestamp in epoch milliseconds; entries without one sort as epoch 0.
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.map(|t| t.timestamp_millis()).unwrap_or(0)
    }

    /// The raw stringified content used for prompt matching and size metrics.
    pub fn raw_content(&self) -> &str {
        &self.raw_content
    }

    /// Character length of the raw content.
    pub fn content_chars(&self) -> usize {
        self.raw_content.chars().count()
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Some(Role::Assistant)
    }

    pub fn tool_invocations(&self) -> impl Iterator<Item = &ToolInvocation> {
        self.content.tool_invocations()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(json: serde_json::Value) -> TranscriptEntry {
        let record: RawRecord = serde_json::from_value(json).unwrap();
        TranscriptEntry::from_raw(1, record)
    }

    #[test]
    fn test_text_content_resolves_once() {
        let e = entry(serde_json::json!({
            "uuid": "a",
            "type": "user",
            "message": {"role": "user", "content": "Review the diff"}
        }));
        assert_eq!(e.content, MessageContent::Text("Review the diff".to_string()));
        assert_eq!(e.raw_content(), "Review the diff");
        assert_eq!(e.role, Some(Role::User));
    }

    #[test]
    fn test_block_content_with_tool_use() {
        let e = entry(serde_json::json!({
            "uuid": "b",
            "type": "assistant",
            "message": {"role": "assistant", "content": [
                {"type": "text", "text": "Reading"},
                {"type": "tool_use", "id": "t1", "name": "Read", "input": {"file_path": "/a.rs"}},
                {"type": "thinking", "thinking": "hmm"}
            ]}
        }));
        let tools: Vec<_> = e.tool_invocations().collect();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "Read");
        assert_eq!(tools[0].str_param("file_path"), Some("/a.rs"));
        match &e.content {
            MessageContent::Blocks(blocks) => {
                assert!(matches!(blocks[2], ContentBlock::Other { .. }))
            }
            other => panic!("expected blocks, got {:?}", other),
        }
        assert!(e.raw_content().starts_with('['));
    }

    #[test]
    fn test_null_string_parent_is_root() {
        let e = entry(serde_json::json!({"uuid": "c", "parentUuid": "null"}));
        assert!(e.is_root());
        let e = entry(serde_json::json!({"uuid": "c", "parentUuid": null}));
        assert!(e.is_root());
    }

    #[test]
    fn test_missing_timestamp_is_epoch_zero() {
        let e = entry(serde_json::json!({"uuid": "d", "timestamp": "not a time"}));
        assert!(e.timestamp.is_none());
        assert_eq!(e.timestamp_millis(), 0);
    }

    #[test]
    fn test_role_falls_back_to_record_type() {
        let e = entry(serde_json::json!({"uuid": "e", "type": "assistant", "message": {"content": "hi"}}));
        assert!(e.is_assistant());
    }
}
