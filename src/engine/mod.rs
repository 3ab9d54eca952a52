//! Engine assembly and lifecycle
//!
//! `AcsEngine::start` wires one tenant's components in dependency order:
//! store schema, graph load, cache warmup, audit writer, DLQ, executor,
//! then the background workers (DLQ drainer, health sampler). `shutdown`
//! signals the watch channel, lets the executor drain under its deadline,
//! and stops the workers.

pub mod command;
pub mod executor;
pub mod service;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::audit::integrity::{verify_audit_chain, IntegrityReport};
use crate::audit::AuditWriter;
use crate::cache::{CacheConfig, EntityCache};
use crate::config::AcsConfig;
use crate::dlq::{self, DeadLetterQueue, DrainOutcome};
use crate::error::{AcsError, AcsResult};
use crate::evaluator::PermissionEvaluator;
use crate::graph::EntityGraph;
use crate::health::{self, HealthMonitor};
use crate::persistence::adapter::PersistenceAdapter;
use crate::persistence::store::RelationalStore;
use crate::retry::{RetryPolicy, RetryRunner};

pub use command::{Command, CommandEnvelope, CommandOutput};
pub use executor::Executor;
pub use service::{AcsService, GrantOptions, Page, PageRequest};

/// One tenant's running engine
pub struct AcsEngine {
    service: AcsService,
    graph: Arc<EntityGraph>,
    store: Arc<dyn RelationalStore>,
    adapter: PersistenceAdapter,
    health: Arc<HealthMonitor>,
    dlq: Arc<DeadLetterQueue>,
    shutdown_tx: watch::Sender<bool>,
    executor_handle: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
    drain_deadline: Duration,
}

impl AcsEngine {
    /// Boot the engine for one tenant over the given store
    pub async fn start(
        config: AcsConfig,
        store: Arc<dyn RelationalStore>,
    ) -> AcsResult<AcsEngine> {
        config.validate()?;
        store.init().await.map_err(AcsError::from)?;

        let graph = Arc::new(EntityGraph::new());
        graph.load_from_store(store.as_ref()).await?;

        let cache = Arc::new(EntityCache::new(
            graph.clone(),
            CacheConfig {
                capacity: config.cache_capacity,
                ttl: Duration::from_secs(config.cache_ttl_secs),
            },
        ));
        cache.warmup().await;

        let evaluator = Arc::new(PermissionEvaluator::new(graph.clone()));
        let health = Arc::new(HealthMonitor::new(&config.tenant_id));
        let audit = Arc::new(AuditWriter::new(store.clone(), health.clone()).await);
        let dlq = Arc::new(
            DeadLetterQueue::open(config.dlq_path(), config.dlq_abandon_threshold)
                .map_err(|e| AcsError::Transient(format!("cannot open dlq file: {e}")))?,
        );
        let adapter = PersistenceAdapter::new(store.clone());
        let retry = RetryRunner::new(
            RetryPolicy {
                max_attempts: config.retry_max_attempts,
                base_delay: config.retry_base_backoff(),
                op_timeout: config.persistence_timeout(),
            },
            health.clone(),
        );

        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let executor = Executor::new(
            config.tenant_id.clone(),
            graph.clone(),
            cache.clone(),
            adapter.clone(),
            audit.clone(),
            dlq.clone(),
            retry,
            health.clone(),
        );
        let executor_handle =
            tokio::spawn(executor.run(rx, shutdown_rx.clone(), config.drain_deadline()));

        let background = vec![
            dlq::spawn_drainer(
                dlq.clone(),
                adapter.clone(),
                Duration::from_secs(config.dlq_drain_interval_secs),
                shutdown_rx.clone(),
            ),
            health::spawn_sampler(
                health.clone(),
                Duration::from_secs(config.dashboard_refresh_secs),
                shutdown_rx,
            ),
        ];

        let service = AcsService::new(
            tx,
            graph.clone(),
            cache,
            evaluator,
            audit,
            health.clone(),
        );

        tracing::info!(tenant = %config.tenant_id, "engine started");
        Ok(Self {
            service,
            graph,
            store,
            adapter,
            health,
            dlq,
            shutdown_tx,
            executor_handle,
            background,
            drain_deadline: config.drain_deadline(),
        })
    }

    /// A cloneable handle to the command/query surface
    pub fn service(&self) -> AcsService {
        self.service.clone()
    }

    /// The entity graph (read access)
    pub fn graph(&self) -> &Arc<EntityGraph> {
        &self.graph
    }

    /// The relational store
    pub fn store(&self) -> &Arc<dyn RelationalStore> {
        &self.store
    }

    /// Health counters and snapshots
    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// The dead-letter queue
    pub fn dlq(&self) -> &Arc<DeadLetterQueue> {
        &self.dlq
    }

    /// Walk the audit chain and report gaps and hash mismatches
    pub async fn verify_audit(&self) -> AcsResult<IntegrityReport> {
        verify_audit_chain(self.store.as_ref(), 500).await
    }

    /// Run one DLQ drain pass now (the background drainer also runs on its
    /// own interval)
    pub async fn drain_dlq(&self) -> DrainOutcome {
        self.dlq.drain(&self.adapter).await
    }

    /// Stop accepting commands, drain under the deadline, stop workers
    pub async fn shutdown(self) -> AcsResult<()> {
        let _ = self.shutdown_tx.send(true);
        drop(self.service);

        let grace = self.drain_deadline + Duration::from_secs(1);
        if tokio::time::timeout(grace, self.executor_handle).await.is_err() {
            tracing::warn!("executor did not stop inside the drain window");
        }
        for handle in self.background {
            handle.abort();
        }
        tracing::info!("engine shut down");
        Ok(())
    }
}
