//! Caller context: which subagent, if any, is currently running
//!
//! Tools invoked while a subagent is active can ask the registry which
//! subagent they are serving. The answer is passed explicitly to whatever
//! needs it.

use crate::error::Result;
use crate::registry::{ActiveRegistry, RegistryStore};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Confidence when exactly one subagent is active.
pub const SOLE_ACTIVE_CONFIDENCE: f64 = 1.0;

/// Confidence when several are active and the newest is assumed.
pub const MOST_RECENT_CONFIDENCE: f64 = 0.7;

/// The subagent a caller is most likely running under.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallerContext {
    pub subagent_type: String,
    pub confidence: f64,
    pub description: String,
    pub started_at: DateTime<Utc>,
    pub tracking_id: String,
    /// Number of active subagents in the session
    pub active_count: usize,
}

/// Current subagent for a session; `None` outside any subagent.
pub fn current_subagent<S: RegistryStore>(
    registry: &ActiveRegistry<S>,
    session_id: &str,
) -> Result<Option<CallerContext>> {
    let active = registry.list_active(Some(session_id))?;
    let confidence = match active.len() {
        0 => return Ok(None),
        1 => SOLE_ACTIVE_CONFIDENCE,
        _ => MOST_RECENT_CONFIDENCE,
    };

    let newest = active
        .iter()
        .enumerate()
        .max_by_key(|(idx, r)| (r.started_at, *idx))
        .map(|(_, r)| r);

    Ok(newest.map(|record| CallerContext {
        subagent_type: record.subagent_type.clone(),
        confidence,
        description: record.description.clone(),
        started_at: record.started_at,
        tracking_id: record.tracking_id.clone(),
        active_count: active.len(),
    }))
}

/// Types of the active subagents in a session, oldest first.
pub fn active_lineage<S: RegistryStore>(
    registry: &ActiveRegistry<S>,
    session_id: &str,
) -> Result<Vec<String>> {
    let mut active = registry.list_active(Some(session_id))?;
    active.sort_by_key(|r| r.started_at);
    Ok(active.into_iter().map(|r| r.subagent_type).collect())
}

pub fn is_subagent_context<S: RegistryStore>(
    registry: &ActiveRegistry<S>,
    session_id: &str,
) -> Result<bool> {
    Ok(!registry.list_active(Some(session_id))?.is_empty())
}
