//! Entity cache with targeted invalidation
//!
//! Read-through cache in front of the entity graph:
//! - One TTL cache per principal kind, keyed by id
//! - Aggregate caches for a user's groups and roles
//! - Invalidation is targeted: a mutated principal drops its own entry plus
//!   the aggregates whose membership changed, never the whole cache
//!
//! Stale reads are only possible in the window between a mutation and the
//! executor's synchronous invalidation call; a query that starts after the
//! mutation's completion future resolved observes the new state.

use moka::future::Cache as MokaCache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::AcsResult;
use crate::graph::{EntityGraph, Principal, PrincipalKind, PrincipalRef};

/// Cache tuning knobs
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Entries per cache
    pub capacity: u64,
    /// Time-to-live per entry
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl: Duration::from_secs(300),
        }
    }
}

/// Hit/miss counters
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that fell through to the graph
    pub misses: u64,
    /// Invalidation calls processed
    pub invalidations: u64,
}

/// Read-through entity cache
pub struct EntityCache {
    graph: Arc<EntityGraph>,
    users: MokaCache<i64, Arc<Principal>>,
    groups: MokaCache<i64, Arc<Principal>>,
    roles: MokaCache<i64, Arc<Principal>>,
    /// `user id -> groups the user belongs to`
    user_groups: MokaCache<i64, Arc<Vec<Principal>>>,
    /// `user id -> roles assigned to the user (directly)`
    user_roles: MokaCache<i64, Arc<Vec<Principal>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl EntityCache {
    /// Create a cache over a graph
    pub fn new(graph: Arc<EntityGraph>, config: CacheConfig) -> Self {
        let build = || {
            MokaCache::builder()
                .max_capacity(config.capacity)
                .time_to_live(config.ttl)
                .build()
        };
        let build_aggregate = || {
            MokaCache::builder()
                .max_capacity(config.capacity)
                .time_to_live(config.ttl)
                .build()
        };
        Self {
            graph,
            users: build(),
            groups: build(),
            roles: build(),
            user_groups: build_aggregate(),
            user_roles: build_aggregate(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    fn cache_for(&self, kind: PrincipalKind) -> &MokaCache<i64, Arc<Principal>> {
        match kind {
            PrincipalKind::User => &self.users,
            PrincipalKind::Group => &self.groups,
            PrincipalKind::Role => &self.roles,
        }
    }

    /// Read-through lookup by typed reference
    pub async fn get(&self, target: PrincipalRef) -> AcsResult<Arc<Principal>> {
        if let Some(hit) = self.cache_for(target.kind).get(&target.id).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let loaded = Arc::new(self.graph.get(target)?);
        self.cache_for(target.kind)
            .insert(target.id, loaded.clone())
            .await;
        Ok(loaded)
    }

    /// Read-through user lookup
    pub async fn get_user(&self, id: i64) -> AcsResult<Arc<Principal>> {
        self.get(PrincipalRef::user(id)).await
    }

    /// Read-through group lookup
    pub async fn get_group(&self, id: i64) -> AcsResult<Arc<Principal>> {
        self.get(PrincipalRef::group(id)).await
    }

    /// Read-through role lookup
    pub async fn get_role(&self, id: i64) -> AcsResult<Arc<Principal>> {
        self.get(PrincipalRef::role(id)).await
    }

    /// Groups a user belongs to (aggregate, read-through)
    pub async fn user_groups(&self, user_id: i64) -> AcsResult<Arc<Vec<Principal>>> {
        if let Some(hit) = self.user_groups.get(&user_id).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let user = self.graph.get_user(user_id)?;
        let mut groups = Vec::new();
        for parent in user.parents_of_kind(PrincipalKind::Group) {
            groups.push(self.graph.get(parent)?);
        }
        let groups = Arc::new(groups);
        self.user_groups.insert(user_id, groups.clone()).await;
        Ok(groups)
    }

    /// Roles directly assigned to a user (aggregate, read-through)
    pub async fn user_roles(&self, user_id: i64) -> AcsResult<Arc<Vec<Principal>>> {
        if let Some(hit) = self.user_roles.get(&user_id).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let user = self.graph.get_user(user_id)?;
        let mut roles = Vec::new();
        for parent in user.parents_of_kind(PrincipalKind::Role) {
            roles.push(self.graph.get(parent)?);
        }
        let roles = Arc::new(roles);
        self.user_roles.insert(user_id, roles.clone()).await;
        Ok(roles)
    }

    /// Populate an entry directly
    pub async fn set(&self, principal: &Principal) {
        self.cache_for(principal.kind)
            .insert(principal.id, Arc::new(principal.clone()))
            .await;
    }

    /// Drop one principal and, for users, its aggregates
    pub async fn invalidate(&self, target: PrincipalRef) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        self.cache_for(target.kind).invalidate(&target.id).await;
        if target.kind == PrincipalKind::User {
            self.user_groups.invalidate(&target.id).await;
            self.user_roles.invalidate(&target.id).await;
        }
    }

    /// Drop a set of principals and the aggregates of affected users
    ///
    /// The executor passes every principal whose parent/child/permission
    /// sets a command changed; user members of a mutated group or role are
    /// included so their aggregates refresh.
    pub async fn invalidate_all(&self, targets: &[PrincipalRef]) {
        for target in targets {
            self.invalidate(*target).await;
        }
    }

    /// Prime the cache with every live principal
    pub async fn warmup(&self) {
        for user in self.graph.users() {
            self.set(&user).await;
        }
        for group in self.graph.groups() {
            self.set(&group).await;
        }
        for role in self.graph.roles() {
            self.set(&role).await;
        }
        tracing::debug!("entity cache warmed up");
    }

    /// Current hit/miss counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (Arc<EntityGraph>, EntityCache) {
        let graph = Arc::new(EntityGraph::new());
        let cache = EntityCache::new(graph.clone(), CacheConfig::default());
        (graph, cache)
    }

    #[tokio::test]
    async fn test_read_through_and_hit() {
        let (graph, cache) = fixture();
        let user = graph.create(PrincipalKind::User, "alice").unwrap();

        let first = cache.get_user(user.id).await.unwrap();
        assert_eq!(first.name, "alice");
        let second = cache.get_user(user.id).await.unwrap();
        assert_eq!(second.name, "alice");

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_invalidation_refreshes_entry() {
        let (graph, cache) = fixture();
        let user = graph.create(PrincipalKind::User, "alice").unwrap();
        cache.get_user(user.id).await.unwrap();

        graph.rename(user.as_ref(), "alicia").unwrap();
        // Before invalidation the stale entry is still served.
        assert_eq!(cache.get_user(user.id).await.unwrap().name, "alice");

        cache.invalidate(user.as_ref()).await;
        assert_eq!(cache.get_user(user.id).await.unwrap().name, "alicia");
    }

    #[tokio::test]
    async fn test_user_groups_aggregate_invalidation() {
        let (graph, cache) = fixture();
        let user = graph.create(PrincipalKind::User, "alice").unwrap();
        let group = graph.create(PrincipalKind::Group, "ops").unwrap();

        assert!(cache.user_groups(user.id).await.unwrap().is_empty());

        graph.link(group.as_ref(), user.as_ref()).unwrap();
        cache.invalidate(user.as_ref()).await;

        let groups = cache.user_groups(user.id).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "ops");
    }

    #[tokio::test]
    async fn test_missing_principal_is_not_found() {
        let (_graph, cache) = fixture();
        assert!(cache.get_user(99).await.is_err());
    }
}
