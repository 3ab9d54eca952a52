//! Persistence tier
//!
//! Asynchronous, idempotent mirroring of the in-memory graph into a
//! relational store:
//! - `rows`: row model and serializable `RowOp` deltas
//! - `normalizer`: pure command-to-delta translation
//! - `store`: the `RelationalStore` seam with error classification
//! - `sqlite`: sqlx-backed production store
//! - `memory`: in-memory store with fault injection for tests
//! - `adapter`: transaction application plus the stored-edge cycle re-check

pub mod adapter;
pub mod memory;
pub mod normalizer;
pub mod rows;
pub mod sqlite;
pub mod store;

pub use adapter::PersistenceAdapter;
pub use memory::MemoryStore;
pub use rows::{ArchiveLogRow, AuditLogRow, PrincipalRow, RowOp, StoreSnapshot, StoredPermission};
pub use sqlite::SqliteStore;
pub use store::{RelationalStore, StoreError, StoreResult};
