//! Persistence adapter
//!
//! Bridges the executor and the relational store: applies the normalizers'
//! row deltas in one transaction and repeats the group-cycle check against
//! stored edges before any hierarchy insert. The in-memory check already
//! passed by the time the adapter runs, so a cycle found here means the
//! graph and the store have diverged, which is fatal and never retried.

use std::sync::Arc;

use crate::error::{AcsError, AcsResult};
use crate::persistence::rows::RowOp;
use crate::persistence::store::RelationalStore;

/// Adapter over a relational store
#[derive(Clone)]
pub struct PersistenceAdapter {
    store: Arc<dyn RelationalStore>,
}

impl PersistenceAdapter {
    /// Create an adapter over a store
    pub fn new(store: Arc<dyn RelationalStore>) -> Self {
        Self { store }
    }

    /// The underlying store
    pub fn store(&self) -> &Arc<dyn RelationalStore> {
        &self.store
    }

    /// Apply a row delta, re-checking hierarchy acyclicity store-side
    pub async fn apply(&self, ops: &[RowOp]) -> AcsResult<()> {
        for op in ops {
            if let RowOp::InsertGroupHierarchy {
                parent_group_id,
                child_group_id,
            } = op
            {
                let cycle = self
                    .store
                    .group_has_ancestor(*parent_group_id, *child_group_id)
                    .await
                    .map_err(AcsError::from)?;
                if cycle {
                    return Err(AcsError::Integrity(format!(
                        "stored hierarchy already places group {child_group_id} above \
                         group {parent_group_id}; in-memory graph and store have diverged"
                    )));
                }
            }
        }
        self.store.apply(ops).await.map_err(AcsError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::memory::MemoryStore;

    #[tokio::test]
    async fn test_store_side_cycle_check_reports_integrity() {
        let store = Arc::new(MemoryStore::new());
        let adapter = PersistenceAdapter::new(store.clone());

        // Seed the store with an edge the in-memory graph does not know
        // about: group 2 already sits above group 1.
        store
            .apply(&[RowOp::InsertGroupHierarchy {
                parent_group_id: 2,
                child_group_id: 1,
            }])
            .await
            .unwrap();

        let err = adapter
            .apply(&[RowOp::InsertGroupHierarchy {
                parent_group_id: 1,
                child_group_id: 2,
            }])
            .await
            .unwrap_err();
        assert!(matches!(err, AcsError::Integrity(_)));
    }

    #[tokio::test]
    async fn test_transient_store_error_maps_to_transient() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next(crate::persistence::store::StoreError::Timeout("t".into()), 1);
        let adapter = PersistenceAdapter::new(store);

        let err = adapter.apply(&[]).await.unwrap_err();
        assert!(matches!(err, AcsError::Transient(_)));
    }
}
