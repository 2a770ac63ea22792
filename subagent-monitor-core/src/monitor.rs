//! Spawn and stop orchestration
//!
//! [`Monitor`] ties the registry, the stop detector, the statistics extractor
//! and the persistence layer together for the two lifecycle signals.
//!
//! ## Flow
//!
//! ```text
//! spawn ──► count transcript lines ──► register active ──► create row ──► link row
//!
//! stop  ──► detect ──► close row ──► reconstruct latest chain ──► record stats ──► mark completed
//!
//! mcp   ──► current subagent ──► store correlation
//! ```
//!
//! Each step degrades on its own: a failure is logged, kept in the outcome's
//! `errors`, and the remaining steps still run. Neither signal returns an error.

use crate::config::{Config, DetectionConfig};
use crate::context::current_subagent;
use crate::correlation::{CorrelationStore, NewCorrelation};
use crate::detect::{DetectionResult, StopDetector};
use crate::reconstruct::reconstruct_all;
use crate::registry::{prompt_digest, ActiveRegistry, RegistryStore};
use crate::stats::{analyze, ConversationStats};
use crate::store::{CompletionStatus, InvocationStore, NewInvocation};
use crate::transcript::{self, Transcript};
use std::path::PathBuf;

/// Error kind recorded when the transcript cannot be read for statistics.
pub const TRANSCRIPT_PARSE_ERROR: &str = "transcript_parse_error";

/// A subagent is about to be spawned.
#[derive(Debug, Clone, Default)]
pub struct SpawnSignal {
    pub session_id: String,
    pub subagent_type: String,
    pub description: String,
    pub prompt_text: String,
    pub transcript_path: Option<PathBuf>,
    pub cwd: Option<String>,
    /// Overrides the transcript line count as the position hint
    pub approximate_position: Option<u64>,
}

/// Result of handling a spawn.
#[derive(Debug, Clone, Default)]
pub struct SpawnOutcome {
    pub tracking_id: Option<String>,
    pub record_id: Option<i64>,
    pub source_line_hint: u64,
    pub errors: Vec<String>,
}

/// Some subagent in a session stopped.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    pub session_id: String,
    pub transcript_path: Option<PathBuf>,
}

/// An MCP tool is about to be called.
#[derive(Debug, Clone, Default)]
pub struct ToolCallSignal {
    pub session_id: String,
    pub tool_name: String,
    pub params: serde_json::Value,
    pub cwd: Option<String>,
}

/// Result of handling a stop.
#[derive(Debug, Clone)]
pub struct StopOutcome {
    pub detection: DetectionResult,
    pub record_id: Option<i64>,
    pub status: Option<CompletionStatus>,
    pub stats: Option<ConversationStats>,
    /// Whether the row was closed and any statistics were written
    pub persisted: bool,
    pub errors: Vec<String>,
}

pub struct Monitor<S: RegistryStore, P: InvocationStore> {
    registry: ActiveRegistry<S>,
    store: P,
    detection: DetectionConfig,
}

impl<S: RegistryStore, P: InvocationStore> Monitor<S, P> {
    pub fn new(registry: ActiveRegistry<S>, store: P) -> Self {
        Self {
            registry,
            store,
            detection: DetectionConfig::default(),
        }
    }

    pub fn from_config(registry: ActiveRegistry<S>, store: P, config: &Config) -> Self {
        Self {
            registry,
            store,
            detection: config.detection.clone(),
        }
    }

    pub fn registry(&self) -> &ActiveRegistry<S> {
        &self.registry
    }

    pub fn store(&self) -> &P {
        &self.store
    }

    pub fn on_spawn(&self, signal: SpawnSignal) -> SpawnOutcome {
        let mut outcome = SpawnOutcome::default();

        outcome.source_line_hint = match (signal.approximate_position, &signal.transcript_path) {
            (Some(position), _) => position,
            (None, Some(path)) => match transcript::line_count(path) {
                Ok(count) => count,
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "Could not count transcript lines");
                    0
                }
            },
            (None, None) => 0,
        };

        match self.registry.register_start(
            &signal.session_id,
            &signal.subagent_type,
            &signal.description,
            &signal.prompt_text,
            outcome.source_line_hint,
        ) {
            Ok(tracking_id) => outcome.tracking_id = Some(tracking_id),
            Err(e) => {
                tracing::error!(session_id = %signal.session_id, error = %e, "Failed to register subagent start");
                outcome.errors.push(format!("register start: {}", e));
            }
        }

        let new_invocation = NewInvocation {
            session_id: signal.session_id.clone(),
            subagent_type: signal.subagent_type.clone(),
            description: signal.description.clone(),
            tracking_id: outcome.tracking_id.clone(),
            prompt_digest: Some(prompt_digest(&signal.prompt_text)),
            transcript_path: signal
                .transcript_path
                .as_ref()
                .map(|p| p.display().to_string()),
            cwd: signal.cwd.clone(),
            started_at: self.registry.now(),
        };
        match self.store.create_invocation_record(&new_invocation) {
            Ok(id) => outcome.record_id = Some(id),
            Err(e) => {
                tracing::error!(session_id = %signal.session_id, error = %e, "Failed to create invocation record");
                outcome.errors.push(format!("create record: {}", e));
            }
        }

        if let (Some(tracking_id), Some(record_id)) = (&outcome.tracking_id, outcome.record_id) {
            if let Err(e) = self.registry.link_record(tracking_id, record_id) {
                tracing::error!(tracking_id = %tracking_id, error = %e, "Failed to link invocation record");
                outcome.errors.push(format!("link record: {}", e));
            }
        }

        outcome
    }

    pub fn on_stop(&self, signal: StopSignal) -> StopOutcome {
        let detection = StopDetector::new(&self.registry)
            .with_config(self.detection.clone())
            .detect_stopped(&signal.session_id, signal.transcript_path.as_deref());

        let mut outcome = StopOutcome {
            detection,
            record_id: None,
            status: None,
            stats: None,
            persisted: false,
            errors: Vec::new(),
        };

        let (Some(subagent_type), Some(tracking_id)) = (
            outcome.detection.subagent_type.clone(),
            outcome.detection.selected_tracking_id.clone(),
        ) else {
            tracing::info!(
                session_id = %signal.session_id,
                method = ?outcome.detection.method,
                "Could not determine which subagent stopped"
            );
            return outcome;
        };

        let status = CompletionStatus::from_confidence(outcome.detection.confidence_score);
        outcome.status = Some(status);

        outcome.record_id = self.resolve_record_id(&signal.session_id, &subagent_type, &tracking_id, &mut outcome.errors);

        let mut closed = false;
        if let Some(id) = outcome.record_id {
            match self.store.close_invocation_record(id, status) {
                Ok(()) => closed = true,
                Err(e) => {
                    tracing::error!(id, error = %e, "Failed to close invocation record");
                    outcome.errors.push(format!("close record: {}", e));
                }
            }
        } else {
            tracing::info!(
                session_id = %signal.session_id,
                subagent_type = %subagent_type,
                "No open invocation record found"
            );
        }

        let mut stats_ok = true;
        if let Some(path) = signal.transcript_path.as_deref().filter(|p| p.exists()) {
            match Transcript::load(path) {
                Ok(transcript) => {
                    let reconstruction = reconstruct_all(&transcript);
                    match reconstruction.latest(&subagent_type) {
                        Some(chain) => {
                            let stats = analyze(&chain.messages);
                            tracing::debug!(
                                subagent_type = %subagent_type,
                                summary = %stats.format_summary(),
                                "Collected chain statistics"
                            );
                            if let Some(id) = outcome.record_id {
                                if let Err(e) = self.store.record_statistics(id, &stats) {
                                    tracing::error!(id, error = %e, "Failed to record statistics");
                                    outcome.errors.push(format!("record statistics: {}", e));
                                    stats_ok = false;
                                }
                            }
                            outcome.stats = Some(stats);
                        }
                        None => tracing::debug!(
                            subagent_type = %subagent_type,
                            "No reconstructed chain for stopped subagent"
                        ),
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Error parsing transcript for statistics");
                    outcome.errors.push(format!("{}: {}", TRANSCRIPT_PARSE_ERROR, e));
                    if let Some(id) = outcome.record_id {
                        if let Err(e) = self.store.record_error(id, TRANSCRIPT_PARSE_ERROR, &e.to_string()) {
                            outcome.errors.push(format!("record error: {}", e));
                        }
                    }
                }
            }
        }

        outcome.persisted = closed && stats_ok;

        if let Err(e) = self.registry.mark_completed(&tracking_id) {
            tracing::error!(tracking_id = %tracking_id, error = %e, "Failed to mark subagent completed");
            outcome.errors.push(format!("mark completed: {}", e));
        }

        outcome
    }

    /// Row linked at spawn time, else the newest open row of the same type.
    fn resolve_record_id(
        &self,
        session_id: &str,
        subagent_type: &str,
        tracking_id: &str,
        errors: &mut Vec<String>,
    ) -> Option<i64> {
        match self.registry.get(tracking_id) {
            Ok(Some(record)) if record.record_id.is_some() => return record.record_id,
            Ok(_) => {}
            Err(e) => errors.push(format!("registry lookup: {}", e)),
        }
        match self.store.find_open_record(session_id, subagent_type) {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(session_id, error = %e, "Failed to look up open invocation record");
                errors.push(format!("find open record: {}", e));
                None
            }
        }
    }
}

impl<S: RegistryStore, P: InvocationStore + CorrelationStore> Monitor<S, P> {
    /// Record which subagent (if any) is making an MCP tool call so the MCP
    /// server can look its caller up. Returns the correlation id.
    pub fn on_mcp_tool_use(&self, signal: ToolCallSignal) -> Option<String> {
        let caller = match current_subagent(&self.registry, &signal.session_id) {
            Ok(caller) => caller,
            Err(e) => {
                tracing::warn!(session_id = %signal.session_id, error = %e, "Could not read caller context");
                None
            }
        };

        let correlation = NewCorrelation {
            tool_name: signal.tool_name,
            params: signal.params,
            session_id: signal.session_id,
            subagent_type: caller.as_ref().map(|c| c.subagent_type.clone()),
            confidence: caller.as_ref().map(|c| c.confidence),
            project_path: signal.cwd,
        };
        match self.store.store_correlation(&correlation, self.registry.now()) {
            Ok(id) => {
                tracing::debug!(
                    correlation_id = %id,
                    subagent_type = ?correlation.subagent_type,
                    "Stored tool-call correlation"
                );
                Some(id)
            }
            Err(e) => {
                tracing::error!(tool = %correlation.tool_name, error = %e, "Failed to store tool-call correlation");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::registry::MemoryRegistryStore;

    fn monitor() -> Monitor<MemoryRegistryStore, Database> {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        Monitor::new(ActiveRegistry::new(MemoryRegistryStore::new()), db)
    }

    fn spawn(session: &str, subagent_type: &str) -> SpawnSignal {
        SpawnSignal {
            session_id: session.to_string(),
            subagent_type: subagent_type.to_string(),
            description: "desc".to_string(),
            prompt_text: "prompt".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_spawn_links_record_and_registry() {
        let monitor = monitor();
        let outcome = monitor.on_spawn(spawn("s1", "reviewer"));

        assert!(outcome.errors.is_empty());
        let record_id = outcome.record_id.unwrap();
        let tracked = monitor
            .registry()
            .get(outcome.tracking_id.as_deref().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(tracked.record_id, Some(record_id));
        let row = monitor.store().get_invocation(record_id).unwrap().unwrap();
        assert!(row.is_active);
        assert_eq!(row.tracking_id, outcome.tracking_id);
    }

    #[test]
    fn test_stop_without_transcript_closes_record() {
        let monitor = monitor();
        let spawned = monitor.on_spawn(spawn("s1", "reviewer"));

        let outcome = monitor.on_stop(StopSignal {
            session_id: "s1".to_string(),
            transcript_path: None,
        });

        assert_eq!(outcome.detection.confidence_score, 1.0);
        assert_eq!(outcome.status, Some(CompletionStatus::Completed));
        assert_eq!(outcome.record_id, spawned.record_id);
        assert!(outcome.persisted);
        assert!(outcome.stats.is_none());

        let record = monitor
            .store()
            .get_invocation(spawned.record_id.unwrap())
            .unwrap()
            .unwrap();
        assert!(!record.is_active);
        assert_eq!(record.status, "completed");
        assert!(monitor.registry().list_active(Some("s1")).unwrap().is_empty());
    }

    #[test]
    fn test_mcp_tool_use_records_caller() {
        let monitor = monitor();
        let params = serde_json::json!({"repo": "x", "title": "bug"});
        let call = |session: &str| ToolCallSignal {
            session_id: session.to_string(),
            tool_name: "mcp__github__create_issue".to_string(),
            params: params.clone(),
            cwd: None,
        };

        assert!(monitor.on_mcp_tool_use(call("s2")).is_some());
        let main = monitor
            .store()
            .retrieve_correlation("mcp__github__create_issue", &params, true, monitor.registry().now())
            .unwrap()
            .unwrap();
        assert_eq!(main.session_id, "s2");
        assert!(main.subagent_type.is_none());

        monitor.on_spawn(spawn("s1", "reviewer"));
        assert!(monitor.on_mcp_tool_use(call("s1")).is_some());
        let context = monitor
            .store()
            .retrieve_correlation("mcp__github__create_issue", &params, true, monitor.registry().now())
            .unwrap()
            .unwrap();
        assert_eq!(context.session_id, "s1");
        assert_eq!(context.subagent_type.as_deref(), Some("reviewer"));
        assert_eq!(context.confidence, Some(1.0));
    }

    #[test]
    fn test_stop_with_nothing_tracked() {
        let monitor = monitor();
        let outcome = monitor.on_stop(StopSignal {
            session_id: "s1".to_string(),
            transcript_path: None,
        });
        assert!(outcome.detection.subagent_type.is_none());
        assert!(outcome.status.is_none());
        assert!(!outcome.persisted);
    }
}
