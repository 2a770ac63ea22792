//! # subagent-monitor-core
//!
//! Core library for subagent-monitor - tracks subagents spawned by an AI
//! coding assistant and reconstructs their conversations from the transcript.
//!
//! This library provides:
//! - Transcript ingestion and sidechain chain reconstruction
//! - A cross-process registry of active subagent invocations
//! - Attribution of anonymous "subagent stopped" signals, with confidence
//! - Conversation statistics and their SQLite persistence
//! - Correlation of MCP tool calls with the session and subagent that made them
//! - Configuration management
//! - Logging infrastructure
//!
//! ## Architecture
//!
//! ```text
//! transcript (JSONL) ──► reconstruct ──┬──► detect ◄── registry (JSON + lock)
//!                                      └──► stats ──► db (SQLite)
//! ```
//!
//! [`Monitor`] drives the two lifecycle signals (spawn and stop) across these
//! components.
//!
//! ## Example
//!
//! ```rust,no_run
//! use subagent_monitor_core::{ActiveRegistry, Config, Database, FileRegistryStore, Monitor, StopSignal};
//!
//! let config = Config::load().expect("failed to load config");
//!
//! let db = Database::open(&config.database_path()).expect("failed to open database");
//! db.migrate().expect("failed to run migrations");
//!
//! let store = FileRegistryStore::from_config(config.registry_path(), &config.registry);
//! let registry = ActiveRegistry::from_config(store, &config);
//! let monitor = Monitor::from_config(registry, db, &config);
//!
//! let outcome = monitor.on_stop(StopSignal {
//!     session_id: "session-1".to_string(),
//!     transcript_path: None,
//! });
//! println!("{:?}", outcome.detection);
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use correlation::{CorrelationContext, CorrelationStore, NewCorrelation};
pub use db::Database;
pub use detect::{DetectionResult, StopDetector};
pub use error::{Error, Result};
pub use monitor::{Monitor, SpawnOutcome, SpawnSignal, StopOutcome, StopSignal, ToolCallSignal};
pub use reconstruct::{reconstruct_all, ChainReconstructor, Reconstruction, SubagentChain};
pub use registry::{
    ActiveInvocationRecord, ActiveRegistry, FileRegistryStore, MemoryRegistryStore,
    RegistryStore, StopHints,
};
pub use stats::{analyze, ConversationStats};
pub use store::{CompletionStatus, InvocationStore};
pub use transcript::{Transcript, TranscriptEntry};

// Public modules
pub mod config;
pub mod context;
pub mod correlation;
pub mod db;
pub mod detect;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod reconstruct;
pub mod registry;
pub mod stats;
pub mod store;
pub mod transcript;
