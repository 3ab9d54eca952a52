//! In-memory entity graph (authoritative store)
//!
//! This module owns the live principals, their relations, their permissions,
//! and the resource registry for one tenant:
//! - Typed parent/child edges kept as mutual transposes
//! - Kind rules: users are leaves; roles attach under groups or directly to
//!   users and are never parents of groups
//! - Acyclic group hierarchy, enforced before every group-to-group link
//! - Per-kind monotonic id allocation via atomic counters
//!
//! All mutating methods are called from the executor task only. Readers
//! traverse concurrently and receive cloned snapshots.

pub mod loader;
pub mod permission;
pub mod principal;
pub mod resource;

use dashmap::DashMap;
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};

use crate::error::{AcsError, AcsResult};

pub use permission::{Permission, PermissionScheme, Verb};
pub use principal::{Principal, PrincipalKind, PrincipalRef};
pub use resource::{Resource, ResourceRegistry};

/// The (parent kind, child kind) pairs a link may connect
const ALLOWED_EDGES: [(PrincipalKind, PrincipalKind); 4] = [
    (PrincipalKind::Group, PrincipalKind::User),
    (PrincipalKind::Role, PrincipalKind::User),
    (PrincipalKind::Group, PrincipalKind::Group),
    (PrincipalKind::Group, PrincipalKind::Role),
];

/// Authoritative principal/permission graph for one tenant
pub struct EntityGraph {
    users: DashMap<i64, Principal>,
    groups: DashMap<i64, Principal>,
    roles: DashMap<i64, Principal>,
    /// `(kind, lowercased name) -> id`, enforcing per-kind name uniqueness
    names: DashMap<(PrincipalKind, String), i64>,
    /// Protected resources and their template resolution
    pub resources: ResourceRegistry,
    next_user_id: AtomicI64,
    next_group_id: AtomicI64,
    next_role_id: AtomicI64,
    next_permission_id: AtomicI64,
    next_resource_id: AtomicI64,
}

impl EntityGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            groups: DashMap::new(),
            roles: DashMap::new(),
            names: DashMap::new(),
            resources: ResourceRegistry::new(),
            next_user_id: AtomicI64::new(1),
            next_group_id: AtomicI64::new(1),
            next_role_id: AtomicI64::new(1),
            next_permission_id: AtomicI64::new(1),
            next_resource_id: AtomicI64::new(1),
        }
    }

    fn table(&self, kind: PrincipalKind) -> &DashMap<i64, Principal> {
        match kind {
            PrincipalKind::User => &self.users,
            PrincipalKind::Group => &self.groups,
            PrincipalKind::Role => &self.roles,
        }
    }

    /// Allocate the next id for a kind; safe to call from any thread
    pub fn next_id(&self, kind: PrincipalKind) -> i64 {
        let counter = match kind {
            PrincipalKind::User => &self.next_user_id,
            PrincipalKind::Group => &self.next_group_id,
            PrincipalKind::Role => &self.next_role_id,
        };
        counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Allocate the next permission id
    pub fn next_permission_id(&self) -> i64 {
        self.next_permission_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Allocate the next resource id
    pub fn next_resource_id(&self) -> i64 {
        self.next_resource_id.fetch_add(1, Ordering::SeqCst)
    }

    fn name_key(kind: PrincipalKind, name: &str) -> (PrincipalKind, String) {
        (kind, name.trim().to_lowercase())
    }

    /// Validate a display name for create/rename
    pub fn validate_name(name: &str) -> AcsResult<()> {
        if name.trim().is_empty() {
            return Err(AcsError::InvalidArgument("name must not be empty".into()));
        }
        Ok(())
    }

    /// Create a principal with a freshly-allocated id
    pub fn create(&self, kind: PrincipalKind, name: &str) -> AcsResult<Principal> {
        Self::validate_name(name)?;
        let key = Self::name_key(kind, name);
        if self.names.contains_key(&key) {
            return Err(AcsError::conflict(
                format!("{kind} named {name:?} already exists"),
                "choose a different name or update the existing principal",
            ));
        }
        let id = self.next_id(kind);
        let principal = Principal::new(id, name.trim(), kind);
        self.names.insert(key, id);
        self.table(kind).insert(id, principal.clone());
        Ok(principal)
    }

    /// Insert a principal as loaded from the store, preserving its id
    pub fn insert_loaded(&self, principal: Principal) {
        self.names
            .insert(Self::name_key(principal.kind, &principal.name), principal.id);
        self.table(principal.kind).insert(principal.id, principal);
    }

    /// Rename a principal
    pub fn rename(&self, target: PrincipalRef, name: &str) -> AcsResult<Principal> {
        Self::validate_name(name)?;
        let new_key = Self::name_key(target.kind, name);
        if let Some(existing) = self.names.get(&new_key) {
            if *existing != target.id {
                return Err(AcsError::conflict(
                    format!("{} named {name:?} already exists", target.kind),
                    "choose a different name",
                ));
            }
        }
        let mut entry = self
            .table(target.kind)
            .get_mut(&target.id)
            .ok_or_else(|| AcsError::NotFound(target.to_string()))?;
        let old_key = Self::name_key(target.kind, &entry.name);
        entry.name = name.trim().to_string();
        entry.updated_at = chrono::Utc::now();
        let updated = entry.clone();
        drop(entry);
        self.names.remove(&old_key);
        self.names.insert(new_key, target.id);
        Ok(updated)
    }

    /// Fetch a snapshot of a principal by typed reference
    pub fn get(&self, target: PrincipalRef) -> AcsResult<Principal> {
        self.table(target.kind)
            .get(&target.id)
            .map(|p| p.clone())
            .ok_or_else(|| AcsError::NotFound(target.to_string()))
    }

    /// Fetch a user snapshot
    pub fn get_user(&self, id: i64) -> AcsResult<Principal> {
        self.get(PrincipalRef::user(id))
    }

    /// Fetch a group snapshot
    pub fn get_group(&self, id: i64) -> AcsResult<Principal> {
        self.get(PrincipalRef::group(id))
    }

    /// Fetch a role snapshot
    pub fn get_role(&self, id: i64) -> AcsResult<Principal> {
        self.get(PrincipalRef::role(id))
    }

    /// Whether a principal exists
    pub fn contains(&self, target: PrincipalRef) -> bool {
        self.table(target.kind).contains_key(&target.id)
    }

    /// Link `child` under `parent`, updating both edge sets
    ///
    /// Returns `true` when the edge was added, `false` when it already
    /// existed (idempotent re-link). Kind rules and the group-cycle check
    /// run before anything is mutated.
    pub fn link(&self, parent: PrincipalRef, child: PrincipalRef) -> AcsResult<bool> {
        if !ALLOWED_EDGES.contains(&(parent.kind, child.kind)) {
            return Err(AcsError::InvalidArgument(format!(
                "a {} cannot be a parent of a {}",
                parent.kind, child.kind
            )));
        }
        if !self.contains(parent) {
            return Err(AcsError::NotFound(parent.to_string()));
        }
        if !self.contains(child) {
            return Err(AcsError::NotFound(child.to_string()));
        }
        if parent.kind == PrincipalKind::Group && child.kind == PrincipalKind::Group {
            if parent.id == child.id {
                return Err(AcsError::conflict(
                    format!("group {} cannot contain itself", parent.id),
                    "pick a different parent group",
                ));
            }
            // Cycle iff the prospective child already sits above the parent.
            if self.group_ancestors(parent.id).contains(&child.id) {
                return Err(AcsError::conflict(
                    format!(
                        "adding group {} under group {} would create a cycle",
                        child.id, parent.id
                    ),
                    "remove the existing ancestry edge first",
                ));
            }
        }

        // Sequential get_mut calls keep shard locks disjoint.
        let added = {
            let mut child_entry = self
                .table(child.kind)
                .get_mut(&child.id)
                .ok_or_else(|| AcsError::NotFound(child.to_string()))?;
            let added = child_entry.parents.insert(parent);
            if added {
                child_entry.updated_at = chrono::Utc::now();
            }
            added
        };
        if added {
            let mut parent_entry = self
                .table(parent.kind)
                .get_mut(&parent.id)
                .ok_or_else(|| AcsError::NotFound(parent.to_string()))?;
            parent_entry.children.insert(child);
            parent_entry.updated_at = chrono::Utc::now();
        }
        Ok(added)
    }

    /// Remove the edge between `parent` and `child`
    ///
    /// Returns `true` when an edge was removed; removing an absent edge is a
    /// no-op returning `false`.
    pub fn unlink(&self, parent: PrincipalRef, child: PrincipalRef) -> AcsResult<bool> {
        if !self.contains(parent) {
            return Err(AcsError::NotFound(parent.to_string()));
        }
        if !self.contains(child) {
            return Err(AcsError::NotFound(child.to_string()));
        }
        let removed = {
            let mut child_entry = self
                .table(child.kind)
                .get_mut(&child.id)
                .ok_or_else(|| AcsError::NotFound(child.to_string()))?;
            let removed = child_entry.parents.remove(&parent);
            if removed {
                child_entry.updated_at = chrono::Utc::now();
            }
            removed
        };
        if removed {
            let mut parent_entry = self
                .table(parent.kind)
                .get_mut(&parent.id)
                .ok_or_else(|| AcsError::NotFound(parent.to_string()))?;
            parent_entry.children.remove(&child);
            parent_entry.updated_at = chrono::Utc::now();
        }
        Ok(removed)
    }

    /// Delete a principal, detaching it from every neighbor
    ///
    /// Returns the removed principal with the edge sets it held at removal
    /// time, so callers can invalidate caches and cascade store rows.
    pub fn delete(&self, target: PrincipalRef) -> AcsResult<Principal> {
        let removed = self
            .table(target.kind)
            .remove(&target.id)
            .map(|(_, p)| p)
            .ok_or_else(|| AcsError::NotFound(target.to_string()))?;

        for parent in &removed.parents {
            if let Some(mut entry) = self.table(parent.kind).get_mut(&parent.id) {
                entry.children.remove(&target);
                entry.updated_at = chrono::Utc::now();
            }
        }
        for child in &removed.children {
            if let Some(mut entry) = self.table(child.kind).get_mut(&child.id) {
                entry.parents.remove(&target);
                entry.updated_at = chrono::Utc::now();
            }
        }
        self.names
            .remove(&Self::name_key(removed.kind, &removed.name));
        Ok(removed)
    }

    /// Insert or update a permission on its owner
    ///
    /// Returns the stored row and whether it was newly created.
    pub fn upsert_permission(
        &self,
        owner: PrincipalRef,
        permission: Permission,
    ) -> AcsResult<(Permission, bool)> {
        let mut entry = self
            .table(owner.kind)
            .get_mut(&owner.id)
            .ok_or_else(|| AcsError::NotFound(owner.to_string()))?;
        let created = entry.upsert_permission(permission.clone());
        let stored = entry
            .permission(&permission.uri, permission.verb)
            .cloned()
            .expect("row present after upsert");
        Ok((stored, created))
    }

    /// Remove a permission from its owner
    pub fn remove_permission(
        &self,
        owner: PrincipalRef,
        uri: &str,
        verb: Verb,
    ) -> AcsResult<Permission> {
        let mut entry = self
            .table(owner.kind)
            .get_mut(&owner.id)
            .ok_or_else(|| AcsError::NotFound(owner.to_string()))?;
        entry.remove_permission(uri, verb).ok_or_else(|| {
            AcsError::NotFound(format!("permission ({uri}, {verb}) on {owner}"))
        })
    }

    /// Transitive closure of parent groups above a group
    pub fn group_ancestors(&self, group_id: i64) -> BTreeSet<i64> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([group_id]);
        while let Some(current) = queue.pop_front() {
            let Some(group) = self.groups.get(&current) else {
                continue;
            };
            for parent in group.parents_of_kind(PrincipalKind::Group) {
                if seen.insert(parent.id) {
                    queue.push_back(parent.id);
                }
            }
        }
        seen
    }

    /// Snapshot of all users, sorted by id
    pub fn users(&self) -> Vec<Principal> {
        Self::sorted_snapshot(&self.users)
    }

    /// Snapshot of all groups, sorted by id
    pub fn groups(&self) -> Vec<Principal> {
        Self::sorted_snapshot(&self.groups)
    }

    /// Snapshot of all roles, sorted by id
    pub fn roles(&self) -> Vec<Principal> {
        Self::sorted_snapshot(&self.roles)
    }

    fn sorted_snapshot(table: &DashMap<i64, Principal>) -> Vec<Principal> {
        let mut all: Vec<_> = table.iter().map(|p| p.clone()).collect();
        all.sort_by_key(|p| p.id);
        all
    }

    /// Count of principals of a kind
    pub fn count(&self, kind: PrincipalKind) -> usize {
        self.table(kind).len()
    }

    /// Seed the id counters from the highest ids present
    ///
    /// Called once after a load so freshly-allocated ids continue the
    /// stored sequences.
    pub fn seed_counters(&self) {
        let max = |table: &DashMap<i64, Principal>| {
            table.iter().map(|p| p.id).max().unwrap_or(0)
        };
        self.next_user_id.store(max(&self.users) + 1, Ordering::SeqCst);
        self.next_group_id.store(max(&self.groups) + 1, Ordering::SeqCst);
        self.next_role_id.store(max(&self.roles) + 1, Ordering::SeqCst);

        let max_permission = self
            .users
            .iter()
            .chain(self.groups.iter())
            .chain(self.roles.iter())
            .flat_map(|p| p.permissions.iter().map(|perm| perm.id).collect::<Vec<_>>())
            .max()
            .unwrap_or(0);
        self.next_permission_id
            .store(max_permission + 1, Ordering::SeqCst);
        self.next_resource_id
            .store(self.resources.max_id() + 1, Ordering::SeqCst);
    }
}

impl Default for EntityGraph {
    fn default() -> Self {
        Self::new()
    }
}
