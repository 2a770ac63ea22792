//! Chain reconstruction
//!
//! Rebuilds subagent conversations from a transcript in which the main
//! conversation is interleaved with any number of sidechains.
//!
//! ## Algorithm
//!
//! ```text
//! entries ──► uuid index ──► sidechain roots ─┐
//!    │                                        ├─► match root ↔ spawn ──► walk children
//!    └──────► Task tool_use in main chain ────┘
//! ```
//!
//! A sidechain root is an entry with `is_sidechain` set and no parent. It is
//! attributed to the latest `Task` spawn that precedes it and whose prompt
//! text overlaps the root's content. The chain is then every sidechain entry
//! reachable from the root through parent links.
//!
//! Anomalies never abort the pass. They are collected as
//! [`ReconstructionWarning`]s and whatever could be assembled is returned.

use crate::transcript::{Transcript, TranscriptEntry};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Tool name the assistant uses to spawn a subagent.
pub const SPAWN_TOOL_NAME: &str = "Task";

/// Subagent type used when a spawn does not name one.
pub const UNKNOWN_SUBAGENT_TYPE: &str = "unknown";

/// A subagent spawn found in the main conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpawnEvent {
    pub subagent_type: String,
    pub prompt_text: String,
    pub description: String,
    pub source_sequence_index: usize,
    pub source_timestamp: Option<DateTime<Utc>>,
    pub tool_use_id: String,
}

impl SpawnEvent {
    fn sort_key(&self) -> (i64, usize) {
        (
            self.source_timestamp
                .map(|t| t.timestamp_millis())
                .unwrap_or(0),
            self.source_sequence_index,
        )
    }
}

/// One reconstructed subagent conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubagentChain {
    pub subagent_type: String,
    pub description: String,
    pub spawn_sequence_index: usize,
    pub root_unique_id: Option<String>,
    pub root_sequence_index: usize,
    /// Root first, the rest earliest first by (timestamp, line)
    pub messages: Vec<TranscriptEntry>,
}

impl SubagentChain {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, unique_id: &str) -> bool {
        self.messages
            .iter()
            .any(|m| m.unique_id.as_deref() == Some(unique_id))
    }
}

/// Anomalies observed while reconstructing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconstructionWarning {
    /// A sidechain entry points at a parent that is not in the transcript
    MissingParent {
        sequence_index: usize,
        parent_id: String,
    },
    /// A parent link points at the entry itself or a later entry
    ForwardReference {
        sequence_index: usize,
        parent_id: String,
    },
    /// A unique id appears more than once; the first occurrence is kept
    DuplicateId {
        unique_id: String,
        sequence_index: usize,
    },
    /// A sidechain root with no matching spawn; excluded from the output
    UnmatchedRoot {
        root_unique_id: Option<String>,
        sequence_index: usize,
    },
    /// Walking parent links revisited an entry
    CycleDetected { unique_id: String },
    /// A sidechain entry carries no unique id and cannot have children
    MissingId { sequence_index: usize },
}

impl std::fmt::Display for ReconstructionWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingParent {
                sequence_index,
                parent_id,
            } => write!(
                f,
                "line {}: parent {} not found",
                sequence_index, parent_id
            ),
            Self::ForwardReference {
                sequence_index,
                parent_id,
            } => write!(
                f,
                "line {}: parent {} does not precede the entry",
                sequence_index, parent_id
            ),
            Self::DuplicateId {
                unique_id,
                sequence_index,
            } => write!(
                f,
                "line {}: duplicate id {}",
                sequence_index, unique_id
            ),
            Self::UnmatchedRoot {
                root_unique_id,
                sequence_index,
            } => write!(
                f,
                "line {}: sidechain root {} has no matching spawn",
                sequence_index,
                root_unique_id.as_deref().unwrap_or("<no id>")
            ),
            Self::CycleDetected { unique_id } => {
                write!(f, "cycle detected at {}", unique_id)
            }
            Self::MissingId { sequence_index } => {
                write!(f, "line {}: sidechain entry has no id", sequence_index)
            }
        }
    }
}

/// Per-type aggregate in a [`ChainSummary`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TypeSummary {
    pub invocations: usize,
    pub total_messages: usize,
    pub chain_lengths: Vec<usize>,
}

/// Aggregate view over all reconstructed chains.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChainSummary {
    pub total_chains: usize,
    pub by_type: BTreeMap<String, TypeSummary>,
    pub min_length: usize,
    pub max_length: usize,
    pub avg_length: f64,
}

/// Output of one reconstruction pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Reconstruction {
    /// Ordered by spawn position, then root position
    pub chains: Vec<SubagentChain>,
    pub spawns: Vec<SpawnEvent>,
    pub warnings: Vec<ReconstructionWarning>,
}

impl Reconstruction {
    /// All chains of one subagent type, in spawn order.
    pub fn chains_of_type<'s, 't>(
        &'s self,
        subagent_type: &'t str,
    ) -> impl Iterator<Item = &'s SubagentChain> + 't
    where
        's: 't,
    {
        self.chains
            .iter()
            .filter(move |c| c.subagent_type == subagent_type)
    }

    /// The `n`th chain of a type, counting from 0.
    pub fn occurrence(&self, subagent_type: &str, n: usize) -> Option<&SubagentChain> {
        self.chains
            .iter()
            .filter(|c| c.subagent_type == subagent_type)
            .nth(n)
    }

    /// The most recently spawned chain of a type.
    pub fn latest(&self, subagent_type: &str) -> Option<&SubagentChain> {
        self.chains
            .iter()
            .filter(|c| c.subagent_type == subagent_type)
            .last()
    }

    pub fn chain_containing(&self, unique_id: &str) -> Option<&SubagentChain> {
        self.chains.iter().find(|c| c.contains(unique_id))
    }

    pub fn summary(&self) -> ChainSummary {
        let mut summary = ChainSummary {
            total_chains: self.chains.len(),
            ..Default::default()
        };
        if self.chains.is_empty() {
            return summary;
        }

        let mut total = 0usize;
        summary.min_length = usize::MAX;
        for chain in &self.chains {
            let len = chain.len();
            total += len;
            summary.min_length = summary.min_length.min(len);
            summary.max_length = summary.max_length.max(len);

            let entry = summary
                .by_type
                .entry(chain.subagent_type.clone())
                .or_default();
            entry.invocations += 1;
            entry.total_messages += len;
            entry.chain_lengths.push(len);
        }
        summary.avg_length = total as f64 / self.chains.len() as f64;
        summary
    }
}

/// Indexes one transcript snapshot and reconstructs its sidechains.
///
/// The index and the child adjacency are built once in [`ChainReconstructor::new`]
/// and shared by every query.
pub struct ChainReconstructor<'a> {
    entries: &'a [TranscriptEntry],
    /// unique_id → position in `entries`, first occurrence wins
    index: HashMap<&'a str, usize>,
    /// parent unique_id → sidechain children, sorted by (timestamp, sequence)
    children: HashMap<&'a str, Vec<usize>>,
    warnings: Vec<ReconstructionWarning>,
}

impl<'a> ChainReconstructor<'a> {
    pub fn new(transcript: &'a Transcript) -> Self {
        let entries = transcript.entries.as_slice();
        let mut warnings = Vec::new();

        let mut index: HashMap<&'a str, usize> = HashMap::with_capacity(entries.len());
        for (pos, entry) in entries.iter().enumerate() {
            match entry.unique_id.as_deref() {
                Some(id) => {
                    if index.contains_key(id) {
                        warnings.push(ReconstructionWarning::DuplicateId {
                            unique_id: id.to_string(),
                            sequence_index: entry.sequence_index,
                        });
                    } else {
                        index.insert(id, pos);
                    }
                }
                None if entry.is_sidechain => {
                    warnings.push(ReconstructionWarning::MissingId {
                        sequence_index: entry.sequence_index,
                    });
                }
                None => {}
            }
        }

        let mut children: HashMap<&'a str, Vec<usize>> = HashMap::new();
        for (pos, entry) in entries.iter().enumerate() {
            let Some(parent_id) = entry.parent_id.as_deref() else {
                continue;
            };
            match index.get(parent_id) {
                Some(&parent_pos)
                    if entries[parent_pos].sequence_index >= entry.sequence_index =>
                {
                    warnings.push(ReconstructionWarning::ForwardReference {
                        sequence_index: entry.sequence_index,
                        parent_id: parent_id.to_string(),
                    });
                    continue;
                }
                Some(_) => {}
                None if entry.is_sidechain => {
                    warnings.push(ReconstructionWarning::MissingParent {
                        sequence_index: entry.sequence_index,
                        parent_id: parent_id.to_string(),
                    });
                    continue;
                }
                None => continue,
            }
            if entry.is_sidechain {
                children.entry(parent_id).or_default().push(pos);
            }
        }
        for kids in children.values_mut() {
            kids.sort_by_key(|&pos| {
                (
                    entries[pos].timestamp_millis(),
                    entries[pos].sequence_index,
                )
            });
        }

        Self {
            entries,
            index,
            children,
            warnings,
        }
    }

    /// Sidechain entries without a parent, in transcript order.
    pub fn sidechain_roots(&self) -> impl Iterator<Item = &'a TranscriptEntry> {
        let entries = self.entries;
        entries
            .iter()
            .filter(|e| e.is_sidechain && e.parent_id.is_none())
    }

    /// `Task` invocations from main-chain assistant entries, in transcript order.
    pub fn spawn_events(&self) -> Vec<SpawnEvent> {
        self.entries
            .iter()
            .filter(|e| !e.is_sidechain && e.is_assistant())
            .flat_map(|entry| {
                entry
                    .tool_invocations()
                    .filter(|tool| tool.name == SPAWN_TOOL_NAME)
                    .map(move |tool| SpawnEvent {
                        subagent_type: tool
                            .str_param("subagent_type")
                            .unwrap_or(UNKNOWN_SUBAGENT_TYPE)
                            .to_string(),
                        prompt_text: tool.str_param("prompt").unwrap_or_default().to_string(),
                        description: tool
                            .str_param("description")
                            .unwrap_or_default()
                            .to_string(),
                        source_sequence_index: entry.sequence_index,
                        source_timestamp: entry.timestamp,
                        tool_use_id: tool.id.clone(),
                    })
            })
            .collect()
    }

    /// Find the spawn that most plausibly produced `root`.
    ///
    /// Candidates strictly precede the root (by timestamp when both sides
    /// carry one, by line otherwise) and share prompt text with it in either
    /// direction. Empty prompts or an empty root body never match. The latest
    /// candidate wins.
    pub fn match_root<'s>(
        &self,
        root: &TranscriptEntry,
        spawns: &'s [SpawnEvent],
    ) -> Option<&'s SpawnEvent> {
        let root_content = root.raw_content();
        if root_content.is_empty() {
            return None;
        }
        // Block-list content is stored as JSON, which escapes quotes and
        // newlines; the joined block text is compared as well.
        let root_text = root.content.text();
        let overlaps = |prompt: &str, body: &str| {
            !body.is_empty() && (body.contains(prompt) || prompt.contains(body))
        };

        spawns
            .iter()
            .filter(|spawn| match (spawn.source_timestamp, root.timestamp) {
                (Some(spawn_ts), Some(root_ts)) => spawn_ts < root_ts,
                _ => spawn.source_sequence_index < root.sequence_index,
            })
            .filter(|spawn| {
                !spawn.prompt_text.is_empty()
                    && (overlaps(&spawn.prompt_text, root_content)
                        || overlaps(&spawn.prompt_text, &root_text))
            })
            .max_by_key(|spawn| spawn.sort_key())
    }

    /// Collect every sidechain entry reachable from `root` over child links,
    /// then order the descendants earliest first.
    fn assemble(&self, root: &'a TranscriptEntry) -> Vec<TranscriptEntry> {
        let mut messages = vec![root.clone()];
        let Some(root_id) = root.unique_id.as_deref() else {
            return messages;
        };

        let mut visited: HashSet<&str> = HashSet::new();
        visited.insert(root_id);
        let mut queue: VecDeque<&str> = VecDeque::from([root_id]);

        while let Some(current) = queue.pop_front() {
            let Some(kids) = self.children.get(current) else {
                continue;
            };
            for &pos in kids {
                let child = &self.entries[pos];
                if let Some(id) = child.unique_id.as_deref() {
                    if !visited.insert(id) {
                        continue;
                    }
                    queue.push_back(id);
                }
                messages.push(child.clone());
            }
        }

        messages[1..].sort_by_key(|m| (m.timestamp_millis(), m.sequence_index));
        messages
    }

    /// Walk parent links from `unique_id` back to its root.
    ///
    /// Returns the path root first. Stops at a missing parent or a revisited
    /// entry, reporting why in the second element.
    pub fn trace_back(
        &self,
        unique_id: &str,
    ) -> (Vec<&'a TranscriptEntry>, Option<ReconstructionWarning>) {
        let mut path = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut current = unique_id;

        loop {
            let Some(&pos) = self.index.get(current) else {
                let warning = path.last().map(|e: &&TranscriptEntry| {
                    ReconstructionWarning::MissingParent {
                        sequence_index: e.sequence_index,
                        parent_id: current.to_string(),
                    }
                });
                path.reverse();
                return (path, warning);
            };
            let entry = &self.entries[pos];
            if !seen.insert(current) {
                path.reverse();
                return (
                    path,
                    Some(ReconstructionWarning::CycleDetected {
                        unique_id: current.to_string(),
                    }),
                );
            }
            path.push(entry);
            match entry.parent_id.as_deref() {
                Some(parent) => current = parent,
                None => {
                    path.reverse();
                    return (path, None);
                }
            }
        }
    }

    /// Run the full pass.
    pub fn reconstruct(self) -> Reconstruction {
        let spawns = self.spawn_events();
        let mut warnings = self.warnings.clone();
        let mut chains = Vec::new();

        for root in self.sidechain_roots() {
            match self.match_root(root, &spawns) {
                Some(spawn) => chains.push(SubagentChain {
                    subagent_type: spawn.subagent_type.clone(),
                    description: spawn.description.clone(),
                    spawn_sequence_index: spawn.source_sequence_index,
                    root_unique_id: root.unique_id.clone(),
                    root_sequence_index: root.sequence_index,
                    messages: self.assemble(root),
                }),
                None => {
                    tracing::debug!(
                        line = root.sequence_index,
                        "Sidechain root has no matching spawn"
                    );
                    warnings.push(ReconstructionWarning::UnmatchedRoot {
                        root_unique_id: root.unique_id.clone(),
                        sequence_index: root.sequence_index,
                    });
                }
            }
        }

        chains.sort_by_key(|c| (c.spawn_sequence_index, c.root_sequence_index));

        if !warnings.is_empty() {
            tracing::debug!(count = warnings.len(), "Reconstruction produced warnings");
        }

        Reconstruction {
            chains,
            spawns,
            warnings,
        }
    }
}

/// Reconstruct every subagent chain in a transcript.
pub fn reconstruct_all(transcript: &Transcript) -> Reconstruction {
    ChainReconstructor::new(transcript).reconstruct()
}
