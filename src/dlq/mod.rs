//! Dead-letter queue
//!
//! Durable JSONL buffer for commands whose persistence step exhausted its
//! retries. Entries carry the normalized row ops, so a re-drive replays the
//! exact store delta without touching the in-memory graph. The file lives
//! under the tenant data directory, deliberately independent of the
//! relational store whose failure put entries here.
//!
//! A background drainer re-drives pending entries on an interval; each
//! failed re-drive bumps a failure counter and past the configured
//! threshold the entry is marked abandoned for operator review.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::persistence::adapter::PersistenceAdapter;
use crate::persistence::rows::RowOp;

/// Lifecycle state of a DLQ entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqStatus {
    /// Waiting for the next drain pass
    Pending,
    /// Re-drives exhausted; needs an operator
    Abandoned,
}

/// One dead-lettered command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEntry {
    /// Envelope id of the failed command
    pub id: Uuid,
    /// Command kind tag, for operators
    pub command_kind: String,
    /// Actor who submitted the command
    pub actor: String,
    /// Normalized row ops to replay
    pub ops: Vec<RowOp>,
    /// Persistence attempts made before the command went terminal
    pub attempts: u32,
    /// When the command first entered the channel
    pub first_enqueued_at: DateTime<Utc>,
    /// When the entry reached the DLQ
    pub queued_at: DateTime<Utc>,
    /// The terminal error text
    pub last_error: String,
    /// Failed re-drive count
    pub failure_count: u32,
    /// Current state
    pub status: DlqStatus,
}

/// Outcome of one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainOutcome {
    /// Entries successfully re-driven and removed
    pub redriven: usize,
    /// Entries that failed again and stay pending
    pub failed: usize,
    /// Entries that crossed the abandon threshold this pass
    pub abandoned: usize,
}

/// File-backed dead-letter queue
pub struct DeadLetterQueue {
    path: PathBuf,
    entries: RwLock<Vec<DlqEntry>>,
    abandon_threshold: u32,
}

impl DeadLetterQueue {
    /// Open (or create) the queue file and load surviving entries
    pub fn open(path: PathBuf, abandon_threshold: u32) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut entries = Vec::new();
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            for line in content.lines() {
                match serde_json::from_str::<DlqEntry>(line) {
                    Ok(entry) => entries.push(entry),
                    Err(err) => {
                        tracing::warn!(%err, "skipping unreadable dlq line");
                    }
                }
            }
        }
        Ok(Self {
            path,
            entries: RwLock::new(entries),
            abandon_threshold,
        })
    }

    fn save_locked(&self, entries: &[DlqEntry]) -> std::io::Result<()> {
        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            for entry in entries {
                let line = serde_json::to_string(entry)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                writeln!(file, "{line}")?;
            }
            file.flush()?;
        }
        std::fs::rename(&tmp, &self.path)
    }

    /// Enqueue a terminally-failed command
    ///
    /// Fails only when the queue file itself cannot be written; the caller
    /// logs and continues because the graph remains authoritative.
    pub fn enqueue(&self, entry: DlqEntry) -> std::io::Result<()> {
        let mut entries = self.entries.write();
        entries.push(entry);
        self.save_locked(&entries)
    }

    /// Pending entry count
    pub fn pending_count(&self) -> usize {
        self.entries
            .read()
            .iter()
            .filter(|e| e.status == DlqStatus::Pending)
            .count()
    }

    /// Snapshot of all entries
    pub fn entries(&self) -> Vec<DlqEntry> {
        self.entries.read().clone()
    }

    /// Look up one entry by envelope id
    pub fn get(&self, id: Uuid) -> Option<DlqEntry> {
        self.entries.read().iter().find(|e| e.id == id).cloned()
    }

    /// Re-drive every pending entry through the adapter
    ///
    /// Cooperative: yields between entries so a long queue cannot starve
    /// the runtime.
    pub async fn drain(&self, adapter: &PersistenceAdapter) -> DrainOutcome {
        let pending: Vec<DlqEntry> = self
            .entries
            .read()
            .iter()
            .filter(|e| e.status == DlqStatus::Pending)
            .cloned()
            .collect();
        let mut outcome = DrainOutcome::default();

        for entry in pending {
            let result = adapter.apply(&entry.ops).await;
            {
                let mut entries = self.entries.write();
                match result {
                    Ok(()) => {
                        entries.retain(|e| e.id != entry.id);
                        outcome.redriven += 1;
                        tracing::info!(id = %entry.id, kind = %entry.command_kind, "dlq entry re-driven");
                    }
                    Err(err) => {
                        if let Some(stored) = entries.iter_mut().find(|e| e.id == entry.id) {
                            stored.failure_count += 1;
                            stored.last_error = err.to_string();
                            if stored.failure_count >= self.abandon_threshold {
                                stored.status = DlqStatus::Abandoned;
                                outcome.abandoned += 1;
                                tracing::error!(
                                    id = %entry.id,
                                    kind = %entry.command_kind,
                                    failures = stored.failure_count,
                                    "dlq entry abandoned for operator review"
                                );
                            } else {
                                outcome.failed += 1;
                            }
                        }
                    }
                }
                if let Err(err) = self.save_locked(&entries) {
                    tracing::warn!(%err, "could not persist dlq state");
                }
            }
            tokio::task::yield_now().await;
        }
        outcome
    }
}

/// Spawn the periodic drain worker
pub fn spawn_drainer(
    queue: Arc<DeadLetterQueue>,
    adapter: PersistenceAdapter,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if queue.pending_count() > 0 {
                        let outcome = queue.drain(&adapter).await;
                        tracing::debug!(
                            redriven = outcome.redriven,
                            failed = outcome.failed,
                            abandoned = outcome.abandoned,
                            "dlq drain pass"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::memory::MemoryStore;
    use crate::persistence::store::StoreError;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("acs-dlq-{name}-{}.jsonl", Uuid::new_v4()))
    }

    fn entry_with_ops(ops: Vec<RowOp>) -> DlqEntry {
        DlqEntry {
            id: Uuid::new_v4(),
            command_kind: "create_user".into(),
            actor: "system".into(),
            ops,
            attempts: 3,
            first_enqueued_at: Utc::now(),
            queued_at: Utc::now(),
            last_error: "store timeout".into(),
            failure_count: 0,
            status: DlqStatus::Pending,
        }
    }

    #[tokio::test]
    async fn test_enqueue_survives_reopen() {
        let path = temp_path("reopen");
        let queue = DeadLetterQueue::open(path.clone(), 5).unwrap();
        queue
            .enqueue(entry_with_ops(vec![RowOp::UpsertUser { id: 1, name: "alice".into() }]))
            .unwrap();
        assert_eq!(queue.pending_count(), 1);

        let reopened = DeadLetterQueue::open(path.clone(), 5).unwrap();
        assert_eq!(reopened.pending_count(), 1);
        assert_eq!(reopened.entries()[0].attempts, 3);
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_drain_redrives_into_store() {
        let path = temp_path("drain");
        let queue = DeadLetterQueue::open(path.clone(), 5).unwrap();
        let store = Arc::new(MemoryStore::new());
        let adapter = PersistenceAdapter::new(store.clone());

        queue
            .enqueue(entry_with_ops(vec![RowOp::UpsertUser { id: 7, name: "alice".into() }]))
            .unwrap();

        let outcome = queue.drain(&adapter).await;
        assert_eq!(outcome.redriven, 1);
        assert_eq!(queue.pending_count(), 0);
        assert!(store.contains_user(7));
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_repeated_failures_abandon_entry() {
        let path = temp_path("abandon");
        let queue = DeadLetterQueue::open(path.clone(), 2).unwrap();
        let store = Arc::new(MemoryStore::new());
        let adapter = PersistenceAdapter::new(store.clone());

        queue.enqueue(entry_with_ops(vec![])).unwrap();

        store.fail_next(StoreError::Connection("down".into()), 1);
        let outcome = queue.drain(&adapter).await;
        assert_eq!(outcome.failed, 1);

        store.fail_next(StoreError::Connection("down".into()), 1);
        let outcome = queue.drain(&adapter).await;
        assert_eq!(outcome.abandoned, 1);
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(queue.entries()[0].status, DlqStatus::Abandoned);

        // Abandoned entries are not re-driven.
        let outcome = queue.drain(&adapter).await;
        assert_eq!(outcome, DrainOutcome::default());
        std::fs::remove_file(path).ok();
    }
}
