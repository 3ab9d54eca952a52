//! Relational store abstraction
//!
//! The engine talks to the relational tier through this trait so the
//! executor, the DLQ drainer, and the tests share one seam. Two
//! implementations ship: the sqlx-backed SQLite store and an in-memory
//! store with fault injection for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::error::{AcsError, ErrorClass};
use crate::persistence::rows::{ArchiveLogRow, AuditLogRow, RowOp, StoreSnapshot};

/// Errors surfaced by a relational store
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Operation exceeded its deadline
    #[error("store timeout: {0}")]
    Timeout(String),

    /// Connection lost or unavailable
    #[error("store connection error: {0}")]
    Connection(String),

    /// Unique-constraint race or deadlock; safe to retry
    #[error("store constraint race: {0}")]
    Constraint(String),

    /// A required row is missing
    #[error("store row not found: {0}")]
    NotFound(String),

    /// Payload could not be encoded or decoded
    #[error("store serialization error: {0}")]
    Serialization(String),

    /// Underlying I/O failure
    #[error("store i/o error: {0}")]
    Io(String),
}

impl StoreError {
    /// Retry classification of this failure
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Timeout(_)
            | StoreError::Connection(_)
            | StoreError::Constraint(_)
            | StoreError::Io(_) => ErrorClass::Transient,
            StoreError::NotFound(_) | StoreError::Serialization(_) => ErrorClass::NonRetryable,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => StoreError::Timeout(err.to_string()),
            sqlx::Error::Io(_) | sqlx::Error::PoolClosed => StoreError::Connection(err.to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Constraint(err.to_string())
            }
            sqlx::Error::RowNotFound => StoreError::NotFound(err.to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Serialization(err.to_string())
            }
            _ => StoreError::Connection(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<StoreError> for AcsError {
    fn from(err: StoreError) -> Self {
        match err.class() {
            ErrorClass::Transient => AcsError::Transient(err.to_string()),
            _ => match err {
                StoreError::NotFound(what) => AcsError::NotFound(what),
                other => AcsError::InvalidArgument(other.to_string()),
            },
        }
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Idempotent mirror of the in-memory graph
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Create the schema when missing
    async fn init(&self) -> StoreResult<()>;

    /// Apply a row-op list in one transaction
    async fn apply(&self, ops: &[RowOp]) -> StoreResult<()>;

    /// Whether `candidate` appears in the stored parent chain of `group_id`
    ///
    /// Used by the adapter to repeat the cycle check against stored edges
    /// before inserting a hierarchy row.
    async fn group_has_ancestor(&self, group_id: i64, candidate: i64) -> StoreResult<bool>;

    /// Load everything needed to rebuild the graph
    async fn load_snapshot(&self) -> StoreResult<StoreSnapshot>;

    /// Append one audit row (id pre-assigned by the writer)
    async fn append_audit(&self, row: &AuditLogRow) -> StoreResult<()>;

    /// Audit rows with `id > after_id`, ordered by id, up to `limit`
    async fn audit_after(&self, after_id: i64, limit: u32) -> StoreResult<Vec<AuditLogRow>>;

    /// Highest audit id present, zero when the table is empty
    async fn max_audit_id(&self) -> StoreResult<i64>;

    /// Audit rows older than the cutoff, ordered by id
    async fn audit_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<AuditLogRow>>;

    /// Delete audit rows older than the cutoff, returning the count
    async fn delete_audit_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    /// Record an archive run, returning the assigned archive id
    async fn record_archive(&self, row: &ArchiveLogRow) -> StoreResult<i64>;

    /// Cheap liveness probe
    async fn ping(&self) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(StoreError::Timeout("t".into()).class(), ErrorClass::Transient);
        assert_eq!(
            StoreError::Constraint("race".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            StoreError::NotFound("verb".into()).class(),
            ErrorClass::NonRetryable
        );
    }

    #[test]
    fn test_store_error_maps_into_taxonomy() {
        let err: AcsError = StoreError::Timeout("slow".into()).into();
        assert!(matches!(err, AcsError::Transient(_)));

        let err: AcsError = StoreError::NotFound("verb GET".into()).into();
        assert!(matches!(err, AcsError::NotFound(_)));
    }
}
