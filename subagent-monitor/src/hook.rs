//! Hook payloads and handlers
//!
//! The assistant invokes the hooks with a JSON document on stdin and reads a
//! JSON response from stdout. Handlers never fail: any problem is logged and
//! the response still tells the assistant to continue.

use std::io::Read;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use subagent_monitor_core::correlation::is_mcp_tool;
use subagent_monitor_core::reconstruct::{SPAWN_TOOL_NAME, UNKNOWN_SUBAGENT_TYPE};
use subagent_monitor_core::stats::heuristics::extract_subagent_type;
use subagent_monitor_core::{
    CorrelationStore, InvocationStore, Monitor, RegistryStore, SpawnSignal, StopSignal,
    ToolCallSignal,
};

/// Fields the assistant sends to hooks. Unknown fields are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct HookInput {
    pub session_id: Option<String>,
    pub transcript_path: Option<PathBuf>,
    pub hook_event_name: Option<String>,
    pub tool_name: Option<String>,
    pub tool_input: serde_json::Value,
    pub cwd: Option<String>,
}

impl HookInput {
    /// Parse stdin; empty or malformed input yields an empty payload.
    pub fn from_reader(mut reader: impl Read) -> Self {
        let mut raw = String::new();
        if let Err(e) = reader.read_to_string(&mut raw) {
            tracing::warn!(error = %e, "Failed to read hook input");
            return Self::default();
        }
        if raw.trim().is_empty() {
            tracing::debug!("Empty hook input");
            return Self::default();
        }
        match serde_json::from_str(&raw) {
            Ok(input) => input,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to parse hook input");
                Self::default()
            }
        }
    }

    fn tool_str(&self, key: &str) -> String {
        self.tool_input
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    }
}

/// Response printed to stdout.
#[derive(Debug, Serialize)]
pub struct HookResponse {
    #[serde(rename = "continue")]
    pub continue_: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HookResponse {
    pub fn proceed() -> Self {
        Self {
            continue_: true,
            message: None,
        }
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            continue_: true,
            message: Some(message.into()),
        }
    }

    pub fn print(&self) {
        match serde_json::to_string(self) {
            Ok(json) => println!("{}", json),
            Err(_) => println!("{{\"continue\":true}}"),
        }
    }
}

/// PreToolUse: register a subagent when the tool is `Task`, or record the
/// caller of an MCP tool.
pub fn pre_tool_use<S: RegistryStore, P: InvocationStore + CorrelationStore>(
    monitor: &Monitor<S, P>,
    input: &HookInput,
) -> HookResponse {
    let Some(tool_name) = input.tool_name.as_deref() else {
        return HookResponse::proceed();
    };
    if tool_name != SPAWN_TOOL_NAME && !is_mcp_tool(tool_name) {
        return HookResponse::proceed();
    }
    let Some(session_id) = input.session_id.clone() else {
        tracing::debug!(tool = tool_name, "PreToolUse hook without session id");
        return HookResponse::proceed();
    };

    if is_mcp_tool(tool_name) {
        monitor.on_mcp_tool_use(ToolCallSignal {
            session_id,
            tool_name: tool_name.to_string(),
            params: input.tool_input.clone(),
            cwd: input.cwd.clone(),
        });
        return HookResponse::proceed();
    }

    let subagent_type = extract_subagent_type(&input.tool_input);
    if subagent_type == UNKNOWN_SUBAGENT_TYPE {
        tracing::debug!(session_id = %session_id, "Task input names no subagent type, not tracking");
        return HookResponse::proceed();
    }
    let mut prompt_text = input.tool_str("prompt");
    if prompt_text.is_empty() {
        prompt_text = input.tool_str("task");
    }

    let outcome = monitor.on_spawn(SpawnSignal {
        session_id,
        subagent_type: subagent_type.clone(),
        description: input.tool_str("description"),
        prompt_text,
        transcript_path: input.transcript_path.clone(),
        cwd: input.cwd.clone(),
        approximate_position: None,
    });

    match outcome.tracking_id {
        Some(tracking_id) => HookResponse::with_message(format!(
            "Tracking subagent {} ({})",
            subagent_type, tracking_id
        )),
        None => HookResponse::proceed(),
    }
}

/// SubagentStop: attribute the stop, close the record and store statistics.
pub fn subagent_stop<S: RegistryStore, P: InvocationStore>(
    monitor: &Monitor<S, P>,
    input: &HookInput,
) -> HookResponse {
    let Some(session_id) = input.session_id.clone() else {
        tracing::debug!("SubagentStop hook without session id");
        return HookResponse::proceed();
    };

    let outcome = monitor.on_stop(StopSignal {
        session_id,
        transcript_path: input.transcript_path.clone(),
    });

    for error in &outcome.errors {
        tracing::warn!(error = %error, "SubagentStop step failed");
    }

    match (&outcome.detection.subagent_type, outcome.status) {
        (Some(subagent_type), Some(status)) => {
            let mut message = format!(
                "Subagent {} {} (confidence {:.2})",
                subagent_type, status, outcome.detection.confidence_score
            );
            if let Some(stats) = &outcome.stats {
                message.push_str(": ");
                message.push_str(&stats.format_summary());
            }
            HookResponse::with_message(message)
        }
        _ => HookResponse::proceed(),
    }
}
