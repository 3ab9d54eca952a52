//! # ACS - Multi-tenant Access Control Service engine
//!
//! An in-memory authorization engine for one tenant: it owns the graph of
//! principals (users, groups, roles) and their permissions, serializes
//! every mutation through a single-threaded command pipeline, and mirrors
//! the authoritative in-memory state into a relational store
//! asynchronously. Permission checks are answered at memory speed on the
//! caller's task.
//!
//! ## Architecture
//!
//! - `graph`: authoritative entity graph with kind rules and cycle checks
//! - `cache`: read-through entity cache with targeted invalidation
//! - `evaluator`: pure permission evaluation with inheritance and conditions
//! - `engine`: command channel, single-writer executor, service API
//! - `persistence`: normalizers, store seam, SQLite and in-memory stores
//! - `audit`: append-only hash-stamped audit records and chain verification
//! - `dlq`: durable dead-letter queue with background re-drive
//! - `retry`: transient-error classification and exponential backoff
//! - `health`: per-operation counters and periodic tenant snapshots
//! - `archive`: archive file format and the audit archiver

#![warn(missing_docs)]
#![warn(clippy::all)]

// Entity graph - authoritative in-memory state
pub mod graph;

// Entity cache
pub mod cache;

// Permission evaluation
pub mod evaluator;

// Command pipeline and service API
pub mod engine;

// Relational mirroring
pub mod persistence;

// Audit log
pub mod audit;

// Dead-letter queue
pub mod dlq;

// Retry and recovery
pub mod retry;

// Health monitoring
pub mod health;

// Archive files
pub mod archive;

// Configuration
pub mod config;

// Error taxonomy
pub mod error;

// Re-export commonly used types
pub use config::AcsConfig;
pub use engine::{AcsEngine, AcsService, Command, CommandOutput, GrantOptions, Page, PageRequest};
pub use error::{AcsError, AcsResult, ErrorClass};
pub use evaluator::{AccessCondition, AccessDecision, AccessOutcome, ConditionContext};
pub use graph::{
    EntityGraph, Permission, PermissionScheme, Principal, PrincipalKind, PrincipalRef, Resource,
    Verb,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
