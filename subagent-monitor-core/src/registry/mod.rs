//! Active-invocation registry
//!
//! Tracks which subagents are running for each session so that a later,
//! anonymous "an agent finished" signal can be attributed to one of them.
//! State is shared across processes through a [`RegistryStore`]; every
//! mutation runs as one exclusive read-modify-write cycle on that store.
//!
//! ## Lifecycle
//!
//! ```text
//! register_start ──► active ──touch──► active
//!                      │
//!                      ├──mark_completing──► completing ──mark_completed──► completed
//!                      └──────────────mark_completed──────────────────────► completed
//! ```
//!
//! Non-active records whose `last_seen_at` falls outside the retention window
//! are purged whenever a new invocation is registered.

mod lock;
mod store;

pub use lock::{lock_path_for, LockMode, RegistryLock};
pub use store::{FileRegistryStore, MemoryRegistryStore, RegistryStore};

use crate::config::Config;
use crate::error::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Length of a tracking id (hex characters of a v4 UUID).
pub const TRACKING_ID_LEN: usize = 8;

/// Length of the prompt digest (hex characters of SHA-256).
pub const PROMPT_DIGEST_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    #[default]
    Active,
    Completing,
    Completed,
}

impl InvocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationStatus::Active => "active",
            InvocationStatus::Completing => "completing",
            InvocationStatus::Completed => "completed",
        }
    }
}

/// One tracked subagent invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveInvocationRecord {
    pub tracking_id: String,
    pub session_id: String,
    pub subagent_type: String,
    #[serde(default)]
    pub description: String,
    /// First 16 hex chars of SHA-256(prompt); a matching aid only
    #[serde(default)]
    pub prompt_digest: String,
    pub started_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// Transcript line count when the spawn was observed
    #[serde(default)]
    pub source_line_hint: u64,
    #[serde(default)]
    pub status: InvocationStatus,
    /// Persistence-layer row created for this invocation, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<i64>,
}

impl ActiveInvocationRecord {
    pub fn is_active(&self) -> bool {
        self.status == InvocationStatus::Active
    }

    /// Whole seconds since the invocation started.
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.started_at).num_seconds()
    }
}

/// The persisted registry document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryState {
    #[serde(default)]
    pub active_subagents: Vec<ActiveInvocationRecord>,
    /// Unix seconds of the last write
    #[serde(default)]
    pub last_updated: i64,
}

/// Secondary signals mined from the transcript for stop attribution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopHints {
    pub detected_type: Option<String>,
    pub approximate_position: Option<u64>,
    pub completion_phrase: bool,
}

impl StopHints {
    pub fn is_empty(&self) -> bool {
        self.detected_type.is_none() && self.approximate_position.is_none() && !self.completion_phrase
    }
}

/// Thresholds for candidate scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionPolicy {
    /// Candidates started within this many seconds get +1
    pub recent_start_secs: i64,
    /// Candidates whose line hint is closer than this to the mined position get +2
    pub position_window: u64,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            recent_start_secs: 60,
            position_window: 100,
        }
    }
}

/// Score and reasons for one candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateScore {
    pub tracking_id: String,
    pub score: u32,
    pub reasons: Vec<&'static str>,
}

/// Score every candidate against the hints.
///
/// +1 started recently, +3 type matches the mined type, +2 line hint near the
/// mined position, +1 the most recently started candidate.
pub fn score_candidates(
    candidates: &[ActiveInvocationRecord],
    hints: &StopHints,
    now: DateTime<Utc>,
    policy: SelectionPolicy,
) -> Vec<CandidateScore> {
    let newest = most_recent_index(candidates);

    candidates
        .iter()
        .enumerate()
        .map(|(idx, candidate)| {
            let mut score = 0;
            let mut reasons = Vec::new();

            if candidate.age_secs(now) < policy.recent_start_secs {
                score += 1;
                reasons.push("recent_start");
            }
            if hints.detected_type.as_deref() == Some(candidate.subagent_type.as_str()) {
                score += 3;
                reasons.push("type_match");
            }
            if let Some(position) = hints.approximate_position {
                if position.abs_diff(candidate.source_line_hint) < policy.position_window {
                    score += 2;
                    reasons.push("position_match");
                }
            }
            if Some(idx) == newest {
                score += 1;
                reasons.push("most_recent");
            }

            CandidateScore {
                tracking_id: candidate.tracking_id.clone(),
                score,
                reasons,
            }
        })
        .collect()
}

/// Index of the most recently started candidate; later insertion breaks ties.
fn most_recent_index(candidates: &[ActiveInvocationRecord]) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .max_by_key(|(idx, c)| (c.started_at, *idx))
        .map(|(idx, _)| idx)
}

/// Pick the candidate most likely to have stopped.
///
/// Zero candidates yields `None` and one yields that candidate. Otherwise the
/// highest score wins, with ties and an all-zero field going to the most
/// recently started candidate.
pub fn choose<'c>(
    candidates: &'c [ActiveInvocationRecord],
    hints: &StopHints,
    now: DateTime<Utc>,
    policy: SelectionPolicy,
) -> Option<&'c ActiveInvocationRecord> {
    match candidates.len() {
        0 => return None,
        1 => return candidates.first(),
        _ => {}
    }

    let scores = score_candidates(candidates, hints, now, policy);
    let best = scores.iter().map(|s| s.score).max().unwrap_or(0);
    if best == 0 {
        return most_recent_index(candidates).map(|i| &candidates[i]);
    }

    candidates
        .iter()
        .zip(scores.iter())
        .enumerate()
        .filter(|(_, (_, s))| s.score == best)
        .max_by_key(|(idx, (c, _))| (c.started_at, *idx))
        .map(|(_, (c, _))| c)
}

/// Counts per status for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrackingSummary {
    pub active: usize,
    pub completing: usize,
    pub completed: usize,
    pub total: usize,
    pub last_updated: i64,
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Registry operations over an injected store.
pub struct ActiveRegistry<S: RegistryStore> {
    store: S,
    retention: Duration,
    policy: SelectionPolicy,
    clock: Clock,
}

impl<S: RegistryStore> ActiveRegistry<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            retention: Duration::seconds(3600),
            policy: SelectionPolicy::default(),
            clock: Arc::new(Utc::now),
        }
    }

    pub fn from_config(store: S, config: &Config) -> Self {
        Self::new(store)
            .with_retention(Duration::seconds(config.registry.retention_secs))
            .with_policy(SelectionPolicy {
                recent_start_secs: config.detection.recent_start_secs,
                position_window: config.detection.position_window,
            })
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_policy(mut self, policy: SelectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the time source (tests).
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Record a new active invocation and return its tracking id. The
    /// persistence-layer row is attached later with
    /// [`link_record`](Self::link_record).
    pub fn register_start(
        &self,
        session_id: &str,
        subagent_type: &str,
        description: &str,
        prompt_text: &str,
        source_line_hint: u64,
    ) -> Result<String> {
        let now = self.now();
        let record = ActiveInvocationRecord {
            tracking_id: new_tracking_id(),
            session_id: session_id.to_string(),
            subagent_type: subagent_type.to_string(),
            description: description.to_string(),
            prompt_digest: prompt_digest(prompt_text),
            started_at: now,
            last_seen_at: now,
            source_line_hint,
            status: InvocationStatus::Active,
            record_id: None,
        };
        let tracking_id = record.tracking_id.clone();
        let cutoff = now - self.retention;

        let mut pending = Some(record);
        self.store.modify(&mut |state| {
            if let Some(record) = pending.take() {
                state.active_subagents.push(record);
            }
            purge_before(state, cutoff);
            state.last_updated = now.timestamp();
            true
        })?;

        tracing::info!(
            tracking_id = %tracking_id,
            session_id,
            subagent_type,
            source_line_hint,
            "Registered subagent start"
        );
        Ok(tracking_id)
    }

    /// Active records, optionally for one session, in insertion order.
    pub fn list_active(&self, session_id: Option<&str>) -> Result<Vec<ActiveInvocationRecord>> {
        let state = self.store.load()?;
        Ok(state
            .active_subagents
            .into_iter()
            .filter(|r| r.is_active())
            .filter(|r| session_id.map_or(true, |s| r.session_id == s))
            .collect())
    }

    /// Every record regardless of status.
    pub fn list_all(&self) -> Result<Vec<ActiveInvocationRecord>> {
        Ok(self.store.load()?.active_subagents)
    }

    pub fn get(&self, tracking_id: &str) -> Result<Option<ActiveInvocationRecord>> {
        Ok(self
            .store
            .load()?
            .active_subagents
            .into_iter()
            .find(|r| r.tracking_id == tracking_id))
    }

    /// Refresh `last_seen_at`. Returns whether the record exists.
    pub fn touch(&self, tracking_id: &str) -> Result<bool> {
        let now = self.now();
        self.store.modify(&mut |state| {
            match state
                .active_subagents
                .iter_mut()
                .find(|r| r.tracking_id == tracking_id)
            {
                Some(record) => {
                    record.last_seen_at = now;
                    state.last_updated = now.timestamp();
                    true
                }
                None => false,
            }
        })
    }

    /// Attach the persistence-layer row id to a record. Returns whether the
    /// record exists.
    pub fn link_record(&self, tracking_id: &str, record_id: i64) -> Result<bool> {
        self.store.modify(&mut |state| {
            match state
                .active_subagents
                .iter_mut()
                .find(|r| r.tracking_id == tracking_id)
            {
                Some(record) => {
                    record.record_id = Some(record_id);
                    true
                }
                None => false,
            }
        })
    }

    /// Move an active record to `completing`. No-op for any other status or
    /// an unknown id.
    pub fn mark_completing(&self, tracking_id: &str) -> Result<bool> {
        let now = self.now();
        let changed = self.store.modify(&mut |state| {
            match state
                .active_subagents
                .iter_mut()
                .find(|r| r.tracking_id == tracking_id)
            {
                Some(record) if record.status == InvocationStatus::Active => {
                    record.status = InvocationStatus::Completing;
                    record.last_seen_at = now;
                    state.last_updated = now.timestamp();
                    true
                }
                _ => false,
            }
        })?;
        if changed {
            tracing::debug!(tracking_id, "Marked subagent completing");
        }
        Ok(changed)
    }

    /// Finalize a record. Re-marking a completed record changes nothing.
    pub fn mark_completed(&self, tracking_id: &str) -> Result<bool> {
        let now = self.now();
        let changed = self.store.modify(&mut |state| {
            match state
                .active_subagents
                .iter_mut()
                .find(|r| r.tracking_id == tracking_id)
            {
                Some(record) if record.status != InvocationStatus::Completed => {
                    record.status = InvocationStatus::Completed;
                    record.last_seen_at = now;
                    state.last_updated = now.timestamp();
                    true
                }
                _ => false,
            }
        })?;
        if changed {
            tracing::info!(tracking_id, "Marked subagent completed");
        }
        Ok(changed)
    }

    /// Drop non-active records older than the retention window. Returns how
    /// many were removed.
    pub fn purge_expired(&self) -> Result<usize> {
        let now = self.now();
        let cutoff = now - self.retention;
        let mut removed = 0;
        self.store.modify(&mut |state| {
            removed = purge_before(state, cutoff);
            if removed > 0 {
                state.last_updated = now.timestamp();
            }
            removed > 0
        })?;
        Ok(removed)
    }

    /// Most likely stopped invocation for a session, given transcript hints.
    pub fn select_most_likely_stopped(
        &self,
        session_id: &str,
        hints: &StopHints,
    ) -> Result<Option<ActiveInvocationRecord>> {
        let candidates = self.list_active(Some(session_id))?;
        Ok(choose(&candidates, hints, self.now(), self.policy).cloned())
    }

    pub fn summary(&self) -> Result<TrackingSummary> {
        let state = self.store.load()?;
        let mut summary = TrackingSummary {
            total: state.active_subagents.len(),
            last_updated: state.last_updated,
            ..Default::default()
        };
        for record in &state.active_subagents {
            match record.status {
                InvocationStatus::Active => summary.active += 1,
                InvocationStatus::Completing => summary.completing += 1,
                InvocationStatus::Completed => summary.completed += 1,
            }
        }
        Ok(summary)
    }
}

fn purge_before(state: &mut RegistryState, cutoff: DateTime<Utc>) -> usize {
    let before = state.active_subagents.len();
    state
        .active_subagents
        .retain(|r| r.is_active() || r.last_seen_at > cutoff);
    before - state.active_subagents.len()
}

fn new_tracking_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(TRACKING_ID_LEN);
    id
}

/// First 16 hex characters of SHA-256 over the prompt.
pub fn prompt_digest(prompt_text: &str) -> String {
    let mut digest = hex::encode(Sha256::digest(prompt_text.as_bytes()));
    digest.truncate(PROMPT_DIGEST_LEN);
    digest
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex;

    fn fixed_clock(t: DateTime<Utc>) -> impl Fn() -> DateTime<Utc> + Send + Sync + 'static {
        move || t
    }

    fn record(id: &str, subagent_type: &str, started: DateTime<Utc>, hint: u64) -> ActiveInvocationRecord {
        ActiveInvocationRecord {
            tracking_id: id.to_string(),
            session_id: "s1".to_string(),
            subagent_type: subagent_type.to_string(),
            description: String::new(),
            prompt_digest: String::new(),
            started_at: started,
            last_seen_at: started,
            source_line_hint: hint,
            status: InvocationStatus::Active,
            record_id: None,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_register_and_list_active() {
        let registry = ActiveRegistry::new(MemoryRegistryStore::new());
        let a = registry.register_start("s1", "reviewer", "d", "prompt", 10).unwrap();
        let b = registry.register_start("s2", "writer", "d", "prompt", 20).unwrap();

        assert_eq!(a.len(), TRACKING_ID_LEN);
        assert_ne!(a, b);
        assert_eq!(registry.list_active(None).unwrap().len(), 2);
        let s1 = registry.list_active(Some("s1")).unwrap();
        assert_eq!(s1.len(), 1);
        assert_eq!(s1[0].tracking_id, a);
        assert_eq!(s1[0].prompt_digest, prompt_digest("prompt"));
        assert_eq!(s1[0].prompt_digest.len(), PROMPT_DIGEST_LEN);
    }

    #[test]
    fn test_mark_completed_is_idempotent() {
        let now = Arc::new(Mutex::new(t0()));
        let clock = now.clone();
        let registry = ActiveRegistry::new(MemoryRegistryStore::new())
            .with_clock(move || *clock.lock().unwrap());
        let id = registry.register_start("s1", "reviewer", "", "p", 0).unwrap();

        assert!(registry.mark_completed(&id).unwrap());
        let first = registry.store().snapshot();

        *now.lock().unwrap() = t0() + Duration::seconds(30);
        assert!(!registry.mark_completed(&id).unwrap());
        assert_eq!(registry.store().snapshot(), first);
    }

    #[test]
    fn test_mark_completing_only_from_active() {
        let registry = ActiveRegistry::new(MemoryRegistryStore::new());
        let id = registry.register_start("s1", "reviewer", "", "p", 0).unwrap();

        assert!(registry.mark_completing(&id).unwrap());
        assert!(!registry.mark_completing(&id).unwrap());
        assert_eq!(
            registry.get(&id).unwrap().map(|r| r.status),
            Some(InvocationStatus::Completing)
        );
        assert!(registry.list_active(Some("s1")).unwrap().is_empty());
        assert!(registry.mark_completed(&id).unwrap());
    }

    #[test]
    fn test_unknown_id_is_noop() {
        let registry = ActiveRegistry::new(MemoryRegistryStore::new());
        assert!(!registry.mark_completed("deadbeef").unwrap());
        assert!(!registry.mark_completing("deadbeef").unwrap());
        assert!(!registry.touch("deadbeef").unwrap());
        assert!(!registry.link_record("deadbeef", 7).unwrap());
    }

    #[test]
    fn test_link_record_attaches_row_id() {
        let registry = ActiveRegistry::new(MemoryRegistryStore::new());
        let id = registry.register_start("s1", "reviewer", "", "p", 0).unwrap();
        assert_eq!(registry.get(&id).unwrap().unwrap().record_id, None);

        assert!(registry.link_record(&id, 42).unwrap());
        assert_eq!(registry.get(&id).unwrap().unwrap().record_id, Some(42));
    }

    #[test]
    fn test_touch_refreshes_last_seen() {
        let now = Arc::new(Mutex::new(t0()));
        let clock = now.clone();
        let registry = ActiveRegistry::new(MemoryRegistryStore::new())
            .with_clock(move || *clock.lock().unwrap());
        let id = registry.register_start("s1", "reviewer", "", "p", 0).unwrap();

        *now.lock().unwrap() = t0() + Duration::seconds(90);
        assert!(registry.touch(&id).unwrap());
        let record = registry.get(&id).unwrap().unwrap();
        assert_eq!(record.started_at, t0());
        assert_eq!(record.last_seen_at, t0() + Duration::seconds(90));
    }

    #[test]
    fn test_registration_purges_expired_non_active() {
        let mut old_completed = record("old", "reviewer", t0() - Duration::seconds(7200), 0);
        old_completed.status = InvocationStatus::Completed;
        let old_active = record("stale", "writer", t0() - Duration::seconds(7200), 0);
        let store = MemoryRegistryStore::with_state(RegistryState {
            active_subagents: vec![old_completed, old_active],
            last_updated: 0,
        });
        let registry = ActiveRegistry::new(store).with_clock(fixed_clock(t0()));

        registry.register_start("s1", "tester", "", "p", 0).unwrap();

        let ids: Vec<_> = registry
            .list_all()
            .unwrap()
            .into_iter()
            .map(|r| r.tracking_id)
            .collect();
        assert!(!ids.contains(&"old".to_string()));
        assert!(ids.contains(&"stale".to_string()));
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn test_purge_expired_counts() {
        let mut done = record("done", "reviewer", t0() - Duration::seconds(4000), 0);
        done.status = InvocationStatus::Completed;
        let store = MemoryRegistryStore::with_state(RegistryState {
            active_subagents: vec![done],
            last_updated: 0,
        });
        let registry = ActiveRegistry::new(store).with_clock(fixed_clock(t0()));
        assert_eq!(registry.purge_expired().unwrap(), 1);
        assert_eq!(registry.purge_expired().unwrap(), 0);
    }

    #[test]
    fn test_score_candidates() {
        let now = t0();
        let candidates = vec![
            record("a", "reviewer", now - Duration::seconds(120), 10),
            record("b", "writer", now - Duration::seconds(10), 300),
        ];
        let hints = StopHints {
            detected_type: Some("reviewer".to_string()),
            approximate_position: Some(50),
            completion_phrase: false,
        };
        let scores = score_candidates(&candidates, &hints, now, SelectionPolicy::default());

        assert_eq!(scores[0].score, 5);
        assert_eq!(scores[0].reasons, vec!["type_match", "position_match"]);
        assert_eq!(scores[1].score, 2);
        assert_eq!(scores[1].reasons, vec!["recent_start", "most_recent"]);
        assert_eq!(
            choose(&candidates, &hints, now, SelectionPolicy::default()).map(|r| r.tracking_id.as_str()),
            Some("a")
        );
    }

    #[test]
    fn test_choose_ties_go_to_most_recent() {
        let now = t0();
        let candidates = vec![
            record("a", "reviewer", now - Duration::seconds(300), 0),
            record("b", "reviewer", now - Duration::seconds(200), 0),
        ];
        let hints = StopHints {
            detected_type: Some("reviewer".to_string()),
            ..Default::default()
        };
        // a: 3, b: 3 + 1 (most recent)
        let chosen = choose(&candidates, &hints, now, SelectionPolicy::default());
        assert_eq!(chosen.map(|r| r.tracking_id.as_str()), Some("b"));
    }

    #[test]
    fn test_choose_single_and_empty() {
        let now = t0();
        let hints = StopHints::default();
        assert!(choose(&[], &hints, now, SelectionPolicy::default()).is_none());
        let one = vec![record("a", "x", now - Duration::seconds(5000), 0)];
        assert_eq!(
            choose(&one, &hints, now, SelectionPolicy::default()).map(|r| r.tracking_id.as_str()),
            Some("a")
        );
    }

    #[test]
    fn test_summary_counts() {
        let registry = ActiveRegistry::new(MemoryRegistryStore::new());
        let a = registry.register_start("s1", "a", "", "", 0).unwrap();
        registry.register_start("s1", "b", "", "", 0).unwrap();
        registry.mark_completing(&a).unwrap();

        let summary = registry.summary().unwrap();
        assert_eq!(summary.active, 1);
        assert_eq!(summary.completing, 1);
        assert_eq!(summary.total, 2);
        assert!(summary.last_updated > 0);
    }

    #[test]
    fn test_file_store_roundtrip_through_registry() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRegistryStore::new(dir.path().join("active_subagents.json"));
        let registry = ActiveRegistry::new(store);
        let id = registry.register_start("s1", "reviewer", "d", "p", 3).unwrap();

        let reopened = ActiveRegistry::new(FileRegistryStore::new(
            dir.path().join("active_subagents.json"),
        ));
        let records = reopened.list_active(Some("s1")).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tracking_id, id);
        assert_eq!(records[0].source_line_hint, 3);
    }
}
