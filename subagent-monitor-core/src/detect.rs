//! Stop disambiguation
//!
//! The "subagent stopped" signal carries no identifier. [`StopDetector`]
//! attributes it by combining the registry's active invocations (primary
//! signal) with hints mined from the tail of the transcript (secondary), and
//! reports how confident the attribution is.

use crate::config::DetectionConfig;
use crate::error::Result;
use crate::reconstruct::ChainReconstructor;
use crate::registry::{choose, ActiveRegistry, RegistryStore, StopHints};
use crate::transcript::Transcript;
use serde::Serialize;
use std::path::Path;

/// Phrases that suggest a subagent wrapped up its work. Matched case-insensitively.
pub const COMPLETION_PHRASES: &[&str] = &[
    "task complete",
    "finished",
    "returning to main",
    "completed successfully",
    "done",
    "task accomplished",
];

pub const METHOD_NO_ACTIVE_TRACKED: &str = "no_active_tracked";
pub const METHOD_NO_MATCH_FOUND: &str = "no_match_found";
pub const METHOD_ACTIVE_TRACKER: &str = "active_tracker";
pub const METHOD_TRANSCRIPT_VALIDATED: &str = "transcript_validated";
pub const METHOD_REGISTRY_UNAVAILABLE: &str = "registry_unavailable";

const MAX_AMBIGUOUS_CONFIDENCE: f64 = 0.95;

/// Outcome of attributing a stop signal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResult {
    pub subagent_type: Option<String>,
    /// In `[0, 1]`
    pub confidence_score: f64,
    /// Signals that contributed, in the order they were applied
    pub method: Vec<String>,
    pub candidate_count: usize,
    pub selected_tracking_id: Option<String>,
    pub hints: StopHints,
}

impl DetectionResult {
    fn unattributed(method: &str, candidate_count: usize, hints: StopHints) -> Self {
        Self {
            subagent_type: None,
            confidence_score: 0.0,
            method: vec![method.to_string()],
            candidate_count,
            selected_tracking_id: None,
            hints,
        }
    }

    pub fn is_attributed(&self) -> bool {
        self.selected_tracking_id.is_some()
    }
}

/// Whether the text contains a completion phrase.
pub fn contains_completion_phrase(text: &str) -> bool {
    let lower = text.to_lowercase();
    COMPLETION_PHRASES.iter().any(|p| lower.contains(p))
}

/// Mine stop hints from the last `tail_lines` lines of a transcript.
///
/// The most recent sidechain entry in that window supplies the approximate
/// position; the reconstructed chain containing it supplies the type.
pub fn mine_hints_from(transcript: &Transcript, tail_lines: usize) -> StopHints {
    let mut hints = StopHints::default();
    let floor = transcript.line_count.saturating_sub(tail_lines);

    let Some(last_sidechain) = transcript
        .entries
        .iter()
        .rev()
        .take_while(|e| e.sequence_index > floor)
        .find(|e| e.is_sidechain)
    else {
        return hints;
    };

    hints.approximate_position = Some(last_sidechain.sequence_index as u64);
    hints.completion_phrase = contains_completion_phrase(last_sidechain.raw_content());

    if let Some(unique_id) = last_sidechain.unique_id.as_deref() {
        let reconstruction = ChainReconstructor::new(transcript).reconstruct();
        hints.detected_type = reconstruction
            .chain_containing(unique_id)
            .map(|c| c.subagent_type.clone());
    }

    hints
}

/// Attributes stop signals to tracked invocations.
pub struct StopDetector<'r, S: RegistryStore> {
    registry: &'r ActiveRegistry<S>,
    config: DetectionConfig,
}

impl<'r, S: RegistryStore> StopDetector<'r, S> {
    pub fn new(registry: &'r ActiveRegistry<S>) -> Self {
        Self {
            registry,
            config: DetectionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: DetectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Hints from the transcript at `path`; a missing or unreadable file
    /// yields empty hints.
    pub fn mine_hints(&self, transcript_path: Option<&Path>) -> StopHints {
        let Some(path) = transcript_path else {
            return StopHints::default();
        };
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Transcript not found, skipping hints");
            return StopHints::default();
        }
        match Transcript::load(path) {
            Ok(transcript) => mine_hints_from(&transcript, self.config.tail_lines),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read transcript for hints");
                StopHints::default()
            }
        }
    }

    /// Attribute a stop, surfacing registry failures.
    pub fn try_detect_stopped(
        &self,
        session_id: &str,
        transcript_path: Option<&Path>,
    ) -> Result<DetectionResult> {
        let candidates = self.registry.list_active(Some(session_id))?;
        if candidates.is_empty() {
            return Ok(DetectionResult::unattributed(
                METHOD_NO_ACTIVE_TRACKED,
                0,
                StopHints::default(),
            ));
        }

        let hints = self.mine_hints(transcript_path);
        let now = self.registry.now();

        let Some(selected) = choose(&candidates, &hints, now, self.registry.policy()) else {
            return Ok(DetectionResult::unattributed(
                METHOD_NO_MATCH_FOUND,
                candidates.len(),
                hints,
            ));
        };

        let confidence = if candidates.len() == 1 {
            1.0
        } else {
            let mut c: f64 = 0.5;
            if hints.detected_type.as_deref() == Some(selected.subagent_type.as_str()) {
                c += 0.3;
            }
            if hints.completion_phrase {
                c += 0.1;
            }
            if selected.age_secs(now) < self.config.confident_age_secs {
                c += 0.1;
            }
            c.min(MAX_AMBIGUOUS_CONFIDENCE)
        };

        let mut method = vec![METHOD_ACTIVE_TRACKER.to_string()];
        if !hints.is_empty() {
            method.push(METHOD_TRANSCRIPT_VALIDATED.to_string());
        }

        self.registry.mark_completing(&selected.tracking_id)?;

        tracing::info!(
            session_id,
            tracking_id = %selected.tracking_id,
            subagent_type = %selected.subagent_type,
            confidence,
            candidates = candidates.len(),
            "Attributed subagent stop"
        );

        Ok(DetectionResult {
            subagent_type: Some(selected.subagent_type.clone()),
            confidence_score: confidence,
            method,
            candidate_count: candidates.len(),
            selected_tracking_id: Some(selected.tracking_id.clone()),
            hints,
        })
    }

    /// Attribute a stop; registry failures degrade to a zero-confidence result.
    pub fn detect_stopped(&self, session_id: &str, transcript_path: Option<&Path>) -> DetectionResult {
        match self.try_detect_stopped(session_id, transcript_path) {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(session_id, error = %e, "Registry unavailable during stop detection");
                DetectionResult::unattributed(METHOD_REGISTRY_UNAVAILABLE, 0, StopHints::default())
            }
        }
    }
}
