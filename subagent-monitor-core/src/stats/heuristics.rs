//! Heuristics used by the statistics extractor and the hook entry points
//!
//! Every function here is pure and deliberately shallow. Known blind spots are
//! listed on each function.

use crate::reconstruct::UNKNOWN_SUBAGENT_TYPE;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

/// Shell verbs that remove files.
const DELETION_VERBS: &[&str] = &["rm", "unlink"];

/// Tokens that end a simple shell command.
const COMMAND_SEPARATORS: &[&str] = &["&&", "||", ";", "|"];

/// Whether a shell command looks like it deletes files.
///
/// Substring test on `rm ` / `unlink `, so `git rm x` and `echo "rm it"` both
/// count, while `rm\tx` does not.
pub fn mentions_deletion(command: &str) -> bool {
    command.contains("rm ") || command.contains("unlink ")
}

/// Paths a shell command appears to delete: the first non-flag argument after
/// each `rm` / `unlink` verb.
///
/// False negatives: only the first operand is taken (`rm a b` yields `a`),
/// and `find -delete`, `xargs rm` with piped input, globs or variables are not
/// expanded. False positives: `rm` inside quoted strings is still parsed.
pub fn deletion_targets(command: &str) -> Vec<String> {
    let tokens: Vec<&str> = command.split_whitespace().collect();
    let mut targets = Vec::new();

    for (i, token) in tokens.iter().enumerate() {
        let verb = token.trim_start_matches('(');
        if !DELETION_VERBS.contains(&verb) {
            continue;
        }
        let operand = tokens[i + 1..]
            .iter()
            .take_while(|t| !COMMAND_SEPARATORS.contains(*t))
            .find(|t| !t.starts_with('-'));
        if let Some(operand) = operand {
            let cleaned = operand
                .trim_end_matches(';')
                .trim_matches(|c: char| c == '"' || c == '\'');
            if !cleaned.is_empty() {
                targets.push(cleaned.to_string());
            }
        }
    }

    targets
}

/// Whether a path is documentation. Only the `.md` suffix counts; `.rst`,
/// `.txt` and `README` without an extension are not recognized.
pub fn is_documentation_path(path: &str) -> bool {
    path.ends_with(".md")
}

/// Coarse tool category used in the tool-usage table.
pub fn categorize_tool(tool_name: &str) -> &'static str {
    if tool_name.starts_with("mcp__") {
        return "mcp";
    }
    match tool_name {
        "Read" | "Write" | "Edit" | "MultiEdit" | "Create" | "Move" | "Delete" => "file",
        "WebSearch" | "WebFetch" => "web",
        "Bash" | "Shell" | "Command" => "command",
        "Notebook" | "NotebookEdit" | "Debug" | "Test" | "Lint" => "code",
        "GitAdd" | "GitCommit" | "GitPush" | "GitStatus" => "git",
        "Grep" | "Find" | "Glob" | "LS" => "search",
        "Task" => "subagent",
        _ => "other",
    }
}

fn task_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"use\s+the\s+([a-z0-9\-_]+)\s+subagent",
            r"invoke\s+([a-z0-9\-_]+)\s+agent",
            r"call\s+([a-z0-9\-_]+)\s+subagent",
            r"run\s+([a-z0-9\-_]+)\s+agent",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Subagent type named by a `Task` tool input.
///
/// Checks `subagent_type`, then the older `subagent` field, then phrases like
/// "use the X subagent" in a free-form `task` field. An unrecognized `task`
/// yields `unknown-<8 hex chars of its digest>` so repeated identical tasks
/// group together; no usable field at all yields `unknown`.
pub fn extract_subagent_type(tool_input: &serde_json::Value) -> String {
    for key in ["subagent_type", "subagent"] {
        if let Some(value) = tool_input.get(key).and_then(|v| v.as_str()) {
            if !value.is_empty() {
                return value.to_string();
            }
        }
    }

    let Some(task) = tool_input.get("task").and_then(|v| v.as_str()) else {
        return UNKNOWN_SUBAGENT_TYPE.to_string();
    };

    let lower = task.to_lowercase();
    for pattern in task_patterns() {
        if let Some(name) = pattern.captures(&lower).and_then(|c| c.get(1)) {
            return name.as_str().to_string();
        }
    }

    let digest = hex::encode(Sha256::digest(task.as_bytes()));
    format!("{}-{}", UNKNOWN_SUBAGENT_TYPE, &digest[..8])
}
