//! Database layer for subagent-monitor
//!
//! This module provides the storage layer using SQLite with:
//! - Schema migrations
//! - Repository pattern for queries
//! - The [`InvocationStore`](crate::store::InvocationStore) and
//!   [`CorrelationStore`](crate::correlation::CorrelationStore) implementations

mod correlation;
pub mod repo;
pub mod schema;

pub use repo::Database;
