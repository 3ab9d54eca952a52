//! Health monitoring
//!
//! Success/failure/latency counters per operation label ("domain_command",
//! "database", "audit", ...) plus a periodic snapshot with per-tenant
//! throughput and error rate. The optional console dashboard consumes the
//! latest snapshot; nothing here blocks the command path.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct OpCounters {
    success: AtomicU64,
    failure: AtomicU64,
    total_latency_us: AtomicU64,
    max_latency_us: AtomicU64,
}

/// Counter snapshot for one operation label
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationStats {
    /// Successful operations
    pub success: u64,
    /// Failed operations (every failed attempt counts)
    pub failure: u64,
    /// Mean latency in milliseconds
    pub avg_latency_ms: f64,
    /// Worst observed latency in milliseconds
    pub max_latency_ms: f64,
}

/// Periodic per-tenant health snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Tenant this engine serves
    pub tenant_id: String,
    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,
    /// CPU gauge; zero when the platform offers no cheap reading
    pub cpu_percent: f64,
    /// Memory gauge in MB; zero when unavailable
    pub memory_mb: u64,
    /// Operations per second since the previous snapshot
    pub requests_per_second: f64,
    /// Failed fraction of all recorded operations
    pub error_rate: f64,
    /// Mean latency across all labels in milliseconds
    pub avg_latency_ms: f64,
    /// Per-label counters
    pub operations: HashMap<String, OperationStats>,
}

/// Per-tenant health counters
pub struct HealthMonitor {
    tenant_id: String,
    ops: DashMap<String, OpCounters>,
    latest: RwLock<Option<HealthSnapshot>>,
    last_sample: Mutex<(Instant, u64)>,
}

impl HealthMonitor {
    /// Create a monitor for a tenant
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            ops: DashMap::new(),
            latest: RwLock::new(None),
            last_sample: Mutex::new((Instant::now(), 0)),
        }
    }

    /// Record one operation outcome
    pub fn record(&self, label: &str, success: bool, latency: Duration) {
        let counters = self.ops.entry(label.to_string()).or_default();
        if success {
            counters.success.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.failure.fetch_add(1, Ordering::Relaxed);
        }
        let micros = latency.as_micros() as u64;
        counters.total_latency_us.fetch_add(micros, Ordering::Relaxed);
        counters.max_latency_us.fetch_max(micros, Ordering::Relaxed);
    }

    /// Counter snapshot for one label
    pub fn operation_stats(&self, label: &str) -> OperationStats {
        self.ops
            .get(label)
            .map(|c| {
                let success = c.success.load(Ordering::Relaxed);
                let failure = c.failure.load(Ordering::Relaxed);
                let total = success + failure;
                let total_us = c.total_latency_us.load(Ordering::Relaxed);
                OperationStats {
                    success,
                    failure,
                    avg_latency_ms: if total > 0 {
                        total_us as f64 / total as f64 / 1000.0
                    } else {
                        0.0
                    },
                    max_latency_ms: c.max_latency_us.load(Ordering::Relaxed) as f64 / 1000.0,
                }
            })
            .unwrap_or_default()
    }

    /// Take a snapshot, updating the throughput window
    pub fn snapshot(&self) -> HealthSnapshot {
        let mut operations = HashMap::new();
        let mut success_total = 0u64;
        let mut failure_total = 0u64;
        let mut latency_total_us = 0u64;
        for entry in self.ops.iter() {
            let stats = self.operation_stats(entry.key());
            success_total += stats.success;
            failure_total += stats.failure;
            latency_total_us += entry.value().total_latency_us.load(Ordering::Relaxed);
            operations.insert(entry.key().clone(), stats);
        }
        let total = success_total + failure_total;

        let rps = {
            let mut last = self.last_sample.lock();
            let elapsed = last.0.elapsed().as_secs_f64();
            let delta = total.saturating_sub(last.1);
            *last = (Instant::now(), total);
            if elapsed > 0.0 {
                delta as f64 / elapsed
            } else {
                0.0
            }
        };

        let snapshot = HealthSnapshot {
            tenant_id: self.tenant_id.clone(),
            timestamp: Utc::now(),
            cpu_percent: 0.0,
            memory_mb: 0,
            requests_per_second: rps,
            error_rate: if total > 0 {
                failure_total as f64 / total as f64
            } else {
                0.0
            },
            avg_latency_ms: if total > 0 {
                latency_total_us as f64 / total as f64 / 1000.0
            } else {
                0.0
            },
            operations,
        };
        *self.latest.write() = Some(snapshot.clone());
        snapshot
    }

    /// Most recent snapshot taken by the sampler
    pub fn latest(&self) -> Option<HealthSnapshot> {
        self.latest.read().clone()
    }
}

/// Spawn the periodic sampler task
pub fn spawn_sampler(
    monitor: Arc<HealthMonitor>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = monitor.snapshot();
                    tracing::debug!(
                        tenant = %snapshot.tenant_id,
                        rps = snapshot.requests_per_second,
                        error_rate = snapshot.error_rate,
                        avg_latency_ms = snapshot.avg_latency_ms,
                        "health snapshot"
                    );
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

    #[test]
    fn test_counters_accumulate() {
        let monitor = HealthMonitor::new("tenant-a");
        monitor.record("database", true, Duration::from_millis(10));
        monitor.record("database", true, Duration::from_millis(20));
        monitor.record("database", false, Duration::from_millis(30));

        let stats = monitor.operation_stats("database");
        assert_eq!(stats.success, 2);
        assert_eq!(stats.failure, 1);
        assert!((stats.avg_latency_ms - 20.0).abs() < 0.5);
        assert!((stats.max_latency_ms - 30.0).abs() < 0.5);
    }

    #[test]
    fn test_snapshot_error_rate() {
        let monitor = HealthMonitor::new("tenant-a");
        for _ in 0..9 {
            monitor.record("domain_command", true, Duration::from_millis(1));
        }
        monitor.record("domain_command", false, Duration::from_millis(1));

        let snapshot = monitor.snapshot();
        assert!((snapshot.error_rate - 0.1).abs() < f64::EPSILON);
        assert_eq!(snapshot.tenant_id, "tenant-a");
        assert!(monitor.latest().is_some());
    }

    #[test]
    fn test_unknown_label_is_zeroed() {
        let monitor = HealthMonitor::new("tenant-a");
        assert_eq!(monitor.operation_stats("nope"), OperationStats::default());
    }
}
