//! In-memory relational store
//!
//! Table-per-field mirror of the relational schema used by tests and
//! local development. Supports fault injection: queued errors are returned
//! from `apply` before any mutation happens, which is how the retry, DLQ,
//! and recovery paths are exercised.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::graph::{PrincipalKind, PrincipalRef, Resource};
use crate::persistence::rows::{
    ArchiveLogRow, AuditLogRow, EntityRow, PrincipalRow, RowOp, StoreSnapshot, StoredPermission,
};
use crate::persistence::store::{RelationalStore, StoreError, StoreResult};

#[derive(Debug, Default)]
struct Tables {
    next_entity_id: i64,
    entities: BTreeMap<i64, EntityRow>,
    users: BTreeMap<i64, PrincipalRow>,
    groups: BTreeMap<i64, PrincipalRow>,
    roles: BTreeMap<i64, PrincipalRow>,
    user_groups: BTreeSet<(i64, i64)>,
    user_roles: BTreeSet<(i64, i64)>,
    group_roles: BTreeSet<(i64, i64)>,
    group_hierarchies: BTreeSet<(i64, i64)>,
    verb_types: BTreeSet<String>,
    scheme_types: BTreeSet<String>,
    permissions: Vec<StoredPermission>,
    resources: BTreeMap<i64, Resource>,
    audit: BTreeMap<i64, AuditLogRow>,
    archives: Vec<ArchiveLogRow>,
}

impl Tables {
    fn principal_table(&mut self, kind: PrincipalKind) -> &mut BTreeMap<i64, PrincipalRow> {
        match kind {
            PrincipalKind::User => &mut self.users,
            PrincipalKind::Group => &mut self.groups,
            PrincipalKind::Role => &mut self.roles,
        }
    }

    fn upsert_principal(&mut self, kind: PrincipalKind, id: i64, name: &str) {
        if let Some(existing) = self.principal_table(kind).get_mut(&id) {
            existing.name = name.to_string();
            return;
        }
        // Prerequisite entities row, created in the same transaction.
        let entity_id = self.next_entity_id + 1;
        self.next_entity_id = entity_id;
        let now = Utc::now();
        self.entities.insert(
            entity_id,
            EntityRow {
                id: entity_id,
                entity_type: kind.as_str().to_string(),
                created_at: now,
                updated_at: now,
            },
        );
        self.principal_table(kind).insert(
            id,
            PrincipalRow {
                id,
                entity_id,
                name: name.to_string(),
            },
        );
    }

    fn delete_principal(&mut self, kind: PrincipalKind, id: i64) {
        let removed = self.principal_table(kind).remove(&id);
        if let Some(row) = removed {
            self.entities.remove(&row.entity_id);
        }
        let target = PrincipalRef { kind, id };
        // Cascade join rows and owned permission rows.
        match kind {
            PrincipalKind::User => {
                self.user_groups.retain(|(u, _)| *u != id);
                self.user_roles.retain(|(u, _)| *u != id);
            }
            PrincipalKind::Group => {
                self.user_groups.retain(|(_, g)| *g != id);
                self.group_roles.retain(|(g, _)| *g != id);
                self.group_hierarchies
                    .retain(|(p, c)| *p != id && *c != id);
            }
            PrincipalKind::Role => {
                self.user_roles.retain(|(_, r)| *r != id);
                self.group_roles.retain(|(_, r)| *r != id);
            }
        }
        self.permissions.retain(|p| p.owner != target);
    }
}

/// In-memory store with fault injection
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    injected: Mutex<VecDeque<StoreError>>,
    injected_audit: Mutex<VecDeque<StoreError>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `times` copies of an error to be returned by upcoming `apply`
    /// calls before any mutation
    pub fn fail_next(&self, error: StoreError, times: u32) {
        let mut injected = self.injected.lock();
        for _ in 0..times {
            injected.push_back(error.clone());
        }
    }

    /// Queue an error for upcoming `append_audit` calls
    pub fn fail_audit_next(&self, error: StoreError, times: u32) {
        let mut injected = self.injected_audit.lock();
        for _ in 0..times {
            injected.push_back(error.clone());
        }
    }

    /// Number of user rows (test accessor)
    pub fn user_count(&self) -> usize {
        self.tables.read().users.len()
    }

    /// Whether a user row exists (test accessor)
    pub fn contains_user(&self, id: i64) -> bool {
        self.tables.read().users.contains_key(&id)
    }

    /// Stored hierarchy pairs (test accessor)
    pub fn hierarchy_pairs(&self) -> Vec<(i64, i64)> {
        self.tables.read().group_hierarchies.iter().copied().collect()
    }

    /// Permission rows owned by a principal (test accessor)
    pub fn permissions_for(&self, owner: PrincipalRef) -> Vec<StoredPermission> {
        self.tables
            .read()
            .permissions
            .iter()
            .filter(|p| p.owner == owner)
            .cloned()
            .collect()
    }

    /// Number of audit rows (test accessor)
    pub fn audit_count(&self) -> usize {
        self.tables.read().audit.len()
    }

    /// All audit rows ordered by id (test accessor)
    pub fn audit_rows(&self) -> Vec<AuditLogRow> {
        self.tables.read().audit.values().cloned().collect()
    }

    /// Remove one audit row, simulating tampering (test accessor)
    pub fn remove_audit_row(&self, id: i64) {
        self.tables.write().audit.remove(&id);
    }

    /// Overwrite one audit row, simulating tampering (test accessor)
    pub fn tamper_audit_row(&self, id: i64, details: &str) {
        if let Some(row) = self.tables.write().audit.get_mut(&id) {
            row.change_details = details.to_string();
        }
    }

    fn apply_op(tables: &mut Tables, op: &RowOp) -> StoreResult<()> {
        match op {
            RowOp::UpsertUser { id, name } => {
                tables.upsert_principal(PrincipalKind::User, *id, name)
            }
            RowOp::UpsertGroup { id, name } => {
                tables.upsert_principal(PrincipalKind::Group, *id, name)
            }
            RowOp::UpsertRole { id, name } => {
                tables.upsert_principal(PrincipalKind::Role, *id, name)
            }
            RowOp::DeleteUser { id } => tables.delete_principal(PrincipalKind::User, *id),
            RowOp::DeleteGroup { id } => tables.delete_principal(PrincipalKind::Group, *id),
            RowOp::DeleteRole { id } => tables.delete_principal(PrincipalKind::Role, *id),
            RowOp::InsertUserGroup { user_id, group_id } => {
                tables.user_groups.insert((*user_id, *group_id));
            }
            RowOp::DeleteUserGroup { user_id, group_id } => {
                tables.user_groups.remove(&(*user_id, *group_id));
            }
            RowOp::InsertUserRole { user_id, role_id } => {
                tables.user_roles.insert((*user_id, *role_id));
            }
            RowOp::DeleteUserRole { user_id, role_id } => {
                tables.user_roles.remove(&(*user_id, *role_id));
            }
            RowOp::InsertGroupRole { group_id, role_id } => {
                tables.group_roles.insert((*group_id, *role_id));
            }
            RowOp::DeleteGroupRole { group_id, role_id } => {
                tables.group_roles.remove(&(*group_id, *role_id));
            }
            RowOp::InsertGroupHierarchy {
                parent_group_id,
                child_group_id,
            } => {
                tables
                    .group_hierarchies
                    .insert((*parent_group_id, *child_group_id));
            }
            RowOp::DeleteGroupHierarchy {
                parent_group_id,
                child_group_id,
            } => {
                tables
                    .group_hierarchies
                    .remove(&(*parent_group_id, *child_group_id));
            }
            RowOp::EnsureVerbType { verb } => {
                tables.verb_types.insert(verb.as_str().to_string());
            }
            RowOp::EnsureSchemeType { scheme } => {
                tables.scheme_types.insert(scheme.clone());
            }
            RowOp::UpsertPermission { owner, permission } => {
                if let Some(existing) = tables.permissions.iter_mut().find(|p| {
                    p.owner == *owner
                        && p.permission.uri == permission.uri
                        && p.permission.verb == permission.verb
                }) {
                    existing.permission = permission.clone();
                } else {
                    tables.permissions.push(StoredPermission {
                        owner: *owner,
                        permission: permission.clone(),
                    });
                }
            }
            RowOp::DeletePermission { owner, uri, verb } => {
                tables.permissions.retain(|p| {
                    !(p.owner == *owner && p.permission.uri == *uri && p.permission.verb == *verb)
                });
            }
            RowOp::UpsertResource { resource } => {
                tables.resources.insert(resource.id, resource.clone());
            }
            RowOp::DeactivateResource { id } => {
                if let Some(resource) = tables.resources.get_mut(id) {
                    resource.is_active = false;
                    resource.updated_at = Utc::now();
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RelationalStore for MemoryStore {
    async fn init(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn apply(&self, ops: &[RowOp]) -> StoreResult<()> {
        if let Some(error) = self.injected.lock().pop_front() {
            return Err(error);
        }
        let mut tables = self.tables.write();
        for op in ops {
            Self::apply_op(&mut tables, op)?;
        }
        Ok(())
    }

    async fn group_has_ancestor(&self, group_id: i64, candidate: i64) -> StoreResult<bool> {
        let tables = self.tables.read();
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([group_id]);
        while let Some(current) = queue.pop_front() {
            for (parent, child) in &tables.group_hierarchies {
                if *child == current && seen.insert(*parent) {
                    if *parent == candidate {
                        return Ok(true);
                    }
                    queue.push_back(*parent);
                }
            }
        }
        Ok(false)
    }

    async fn load_snapshot(&self) -> StoreResult<StoreSnapshot> {
        let tables = self.tables.read();
        Ok(StoreSnapshot {
            users: tables.users.values().cloned().collect(),
            groups: tables.groups.values().cloned().collect(),
            roles: tables.roles.values().cloned().collect(),
            user_groups: tables.user_groups.iter().copied().collect(),
            user_roles: tables.user_roles.iter().copied().collect(),
            group_roles: tables.group_roles.iter().copied().collect(),
            group_hierarchies: tables.group_hierarchies.iter().copied().collect(),
            permissions: tables.permissions.clone(),
            resources: tables.resources.values().cloned().collect(),
        })
    }

    async fn append_audit(&self, row: &AuditLogRow) -> StoreResult<()> {
        if let Some(error) = self.injected_audit.lock().pop_front() {
            return Err(error);
        }
        let mut tables = self.tables.write();
        if tables.audit.contains_key(&row.id) {
            return Err(StoreError::Constraint(format!(
                "audit id {} already present",
                row.id
            )));
        }
        tables.audit.insert(row.id, row.clone());
        Ok(())
    }

    async fn audit_after(&self, after_id: i64, limit: u32) -> StoreResult<Vec<AuditLogRow>> {
        let tables = self.tables.read();
        Ok(tables
            .audit
            .range(after_id + 1..)
            .take(limit as usize)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn max_audit_id(&self) -> StoreResult<i64> {
        let tables = self.tables.read();
        Ok(tables.audit.keys().next_back().copied().unwrap_or(0))
    }

    async fn audit_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<AuditLogRow>> {
        let tables = self.tables.read();
        Ok(tables
            .audit
            .values()
            .filter(|row| row.change_date < cutoff)
            .cloned()
            .collect())
    }

    async fn delete_audit_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut tables = self.tables.write();
        let before = tables.audit.len();
        tables.audit.retain(|_, row| row.change_date >= cutoff);
        Ok((before - tables.audit.len()) as u64)
    }

    async fn record_archive(&self, row: &ArchiveLogRow) -> StoreResult<i64> {
        let mut tables = self.tables.write();
        let id = tables.archives.len() as i64 + 1;
        let mut stored = row.clone();
        stored.archive_id = id;
        tables.archives.push(stored);
        Ok(id)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Permission, Verb};

    #[tokio::test]
    async fn test_upsert_and_delete_cascade() {
        let store = MemoryStore::new();
        store
            .apply(&[
                RowOp::UpsertUser { id: 1, name: "alice".into() },
                RowOp::UpsertGroup { id: 1, name: "ops".into() },
                RowOp::InsertUserGroup { user_id: 1, group_id: 1 },
                RowOp::UpsertPermission {
                    owner: PrincipalRef::user(1),
                    permission: Permission::new(1, 1, "/a", Verb::Get, false),
                },
            ])
            .await
            .unwrap();
        assert_eq!(store.user_count(), 1);

        store.apply(&[RowOp::DeleteUser { id: 1 }]).await.unwrap();
        assert_eq!(store.user_count(), 0);
        assert!(store.permissions_for(PrincipalRef::user(1)).is_empty());
        let snapshot = store.load_snapshot().await.unwrap();
        assert!(snapshot.user_groups.is_empty());
    }

    #[tokio::test]
    async fn test_permission_upsert_updates_in_place() {
        let store = MemoryStore::new();
        let owner = PrincipalRef::group(1);
        store
            .apply(&[RowOp::UpsertPermission {
                owner,
                permission: Permission::new(1, 1, "/a", Verb::Get, false),
            }])
            .await
            .unwrap();
        store
            .apply(&[RowOp::UpsertPermission {
                owner,
                permission: Permission::new(2, 1, "/a", Verb::Get, true),
            }])
            .await
            .unwrap();

        let rows = store.permissions_for(owner);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].permission.deny);
    }

    #[tokio::test]
    async fn test_fault_injection_order() {
        let store = MemoryStore::new();
        store.fail_next(StoreError::Timeout("t".into()), 2);

        assert!(store.apply(&[]).await.is_err());
        assert!(store.apply(&[]).await.is_err());
        assert!(store.apply(&[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_group_has_ancestor_walks_chain() {
        let store = MemoryStore::new();
        store
            .apply(&[
                RowOp::InsertGroupHierarchy { parent_group_id: 1, child_group_id: 2 },
                RowOp::InsertGroupHierarchy { parent_group_id: 2, child_group_id: 3 },
            ])
            .await
            .unwrap();

        assert!(store.group_has_ancestor(3, 1).await.unwrap());
        assert!(store.group_has_ancestor(2, 1).await.unwrap());
        assert!(!store.group_has_ancestor(1, 3).await.unwrap());
    }
}
