//! Audit writer
//!
//! Appends one record per command outcome through the relational store.
//! Writer failures are demoted to warnings and never fail the command;
//! the resulting gaps are what the integrity check reports. Outcomes feed
//! the health counters under the "audit" label.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::audit::{AuditRecord, ChangeType};
use crate::health::HealthMonitor;
use crate::persistence::store::RelationalStore;

/// Append-only audit writer with monotonic id allocation
pub struct AuditWriter {
    store: Arc<dyn RelationalStore>,
    health: Arc<HealthMonitor>,
    next_id: AtomicI64,
}

impl AuditWriter {
    /// Create a writer, seeding the id counter from the store
    pub async fn new(store: Arc<dyn RelationalStore>, health: Arc<HealthMonitor>) -> Self {
        let max_id = match store.max_audit_id().await {
            Ok(id) => id,
            Err(err) => {
                tracing::warn!(%err, "could not read max audit id, starting at zero");
                0
            }
        };
        Self {
            store,
            health,
            next_id: AtomicI64::new(max_id + 1),
        }
    }

    /// Append a record; failures are logged and swallowed
    pub async fn record(
        &self,
        entity_type: &str,
        entity_id: i64,
        change_type: ChangeType,
        actor: &str,
        details: serde_json::Value,
    ) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let record = AuditRecord::new(id, entity_type, entity_id, change_type, actor, details);
        let started = Instant::now();
        match self.store.append_audit(&record.to_row()).await {
            Ok(()) => {
                self.health.record("audit", true, started.elapsed());
            }
            Err(err) => {
                self.health.record("audit", false, started.elapsed());
                tracing::warn!(
                    audit_id = id,
                    change_type = %change_type,
                    %err,
                    "audit append failed; continuing without record"
                );
            }
        }
    }

    /// Append a failure record for a command that did not complete
    pub async fn record_error(
        &self,
        entity_type: &str,
        entity_id: i64,
        actor: &str,
        command_kind: &str,
        error: &str,
    ) {
        self.record(
            entity_type,
            entity_id,
            ChangeType::Error,
            actor,
            serde_json::json!({ "command": command_kind, "error": error }),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::memory::MemoryStore;
    use crate::persistence::store::StoreError;

    async fn writer_over(store: Arc<MemoryStore>) -> AuditWriter {
        AuditWriter::new(store, Arc::new(HealthMonitor::new("test"))).await
    }

    #[tokio::test]
    async fn test_ids_are_monotonic_and_seeded() {
        let store = Arc::new(MemoryStore::new());
        let writer = writer_over(store.clone()).await;
        writer
            .record("user", 1, ChangeType::Create, "system", serde_json::json!({}))
            .await;
        writer
            .record("user", 2, ChangeType::Create, "system", serde_json::json!({}))
            .await;

        let rows = store.audit_rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, 1);
        assert_eq!(rows[1].id, 2);

        // A new writer over the same store continues the sequence.
        let writer = writer_over(store.clone()).await;
        writer
            .record("user", 3, ChangeType::Create, "system", serde_json::json!({}))
            .await;
        assert_eq!(store.audit_rows().last().unwrap().id, 3);
    }

    #[tokio::test]
    async fn test_append_failure_is_swallowed() {
        let store = Arc::new(MemoryStore::new());
        store.fail_audit_next(StoreError::Timeout("t".into()), 1);
        let health = Arc::new(HealthMonitor::new("test"));
        let writer = AuditWriter::new(store.clone(), health.clone()).await;

        // Does not panic or error; the record is simply missing.
        writer
            .record("user", 1, ChangeType::Create, "system", serde_json::json!({}))
            .await;
        assert_eq!(store.audit_count(), 0);
        assert_eq!(health.operation_stats("audit").failure, 1);

        // The id the failed append consumed leaves a gap.
        writer
            .record("user", 2, ChangeType::Create, "system", serde_json::json!({}))
            .await;
        assert_eq!(store.audit_rows()[0].id, 2);
    }
}
