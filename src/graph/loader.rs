//! Graph rebuild from the relational store
//!
//! Runs once at boot, before the executor starts draining: principals
//! first, then edges, then permissions and resources, finally the id
//! counters are seeded from the highest ids seen. Edges referencing rows
//! that no longer exist are skipped with a warning rather than failing the
//! boot.

use crate::error::AcsResult;
use crate::graph::{EntityGraph, Principal, PrincipalKind, PrincipalRef};
use crate::persistence::rows::StoreSnapshot;
use crate::persistence::store::RelationalStore;

impl EntityGraph {
    /// Rebuild the graph from a snapshot
    pub fn load_snapshot(&self, snapshot: StoreSnapshot) {
        for row in &snapshot.users {
            self.insert_loaded(Principal::new(row.id, &row.name, PrincipalKind::User));
        }
        for row in &snapshot.groups {
            self.insert_loaded(Principal::new(row.id, &row.name, PrincipalKind::Group));
        }
        for row in &snapshot.roles {
            self.insert_loaded(Principal::new(row.id, &row.name, PrincipalKind::Role));
        }

        let edges = [
            (PrincipalKind::Group, PrincipalKind::User, &snapshot.user_groups),
            (PrincipalKind::Role, PrincipalKind::User, &snapshot.user_roles),
            (PrincipalKind::Group, PrincipalKind::Role, &snapshot.group_roles),
            (PrincipalKind::Group, PrincipalKind::Group, &snapshot.group_hierarchies),
        ];
        for (parent_kind, child_kind, pairs) in edges {
            for (first, second) in pairs.iter() {
                // Membership tables store (child_id, parent_id); group_roles
                // and group_hierarchies store (parent_id, child_id).
                // Normalize to (parent, child) refs here.
                let (parent_id, child_id) = match (parent_kind, child_kind) {
                    (PrincipalKind::Group, PrincipalKind::Group)
                    | (PrincipalKind::Group, PrincipalKind::Role) => (*first, *second),
                    _ => (*second, *first),
                };
                let parent = PrincipalRef {
                    kind: parent_kind,
                    id: parent_id,
                };
                let child = PrincipalRef {
                    kind: child_kind,
                    id: child_id,
                };
                if let Err(err) = self.link(parent, child) {
                    tracing::warn!(%parent, %child, %err, "skipping stored edge");
                }
            }
        }

        for stored in snapshot.permissions {
            if let Err(err) = self.upsert_permission(stored.owner, stored.permission) {
                tracing::warn!(owner = %stored.owner, %err, "skipping stored permission");
            }
        }

        for resource in snapshot.resources {
            self.resources.insert_loaded(resource);
        }

        self.seed_counters();
    }

    /// Load the graph from the relational store at startup
    pub async fn load_from_store(&self, store: &dyn RelationalStore) -> AcsResult<()> {
        let snapshot = store.load_snapshot().await?;
        let counts = (
            snapshot.users.len(),
            snapshot.groups.len(),
            snapshot.roles.len(),
            snapshot.permissions.len(),
        );
        self.load_snapshot(snapshot);
        tracing::info!(
            users = counts.0,
            groups = counts.1,
            roles = counts.2,
            permissions = counts.3,
            "entity graph loaded from store"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Permission, Verb};
    use crate::persistence::rows::{PrincipalRow, StoredPermission};

    fn principal_row(id: i64, name: &str) -> PrincipalRow {
        PrincipalRow {
            id,
            entity_id: id,
            name: name.to_string(),
        }
    }

    #[test]
    fn test_load_rebuilds_edges_and_counters() {
        let snapshot = StoreSnapshot {
            users: vec![principal_row(1, "alice")],
            groups: vec![principal_row(1, "ops"), principal_row(5, "eng")],
            roles: vec![principal_row(2, "admin")],
            user_groups: vec![(1, 1)],
            user_roles: vec![(1, 2)],
            group_roles: vec![(5, 2)],
            group_hierarchies: vec![(5, 1)],
            permissions: vec![StoredPermission {
                owner: PrincipalRef::group(1),
                permission: Permission::new(9, 1, "/orders/*", Verb::Get, false),
            }],
            resources: Vec::new(),
        };

        let graph = EntityGraph::new();
        graph.load_snapshot(snapshot);

        let alice = graph.get_user(1).unwrap();
        assert!(alice.parents.contains(&PrincipalRef::group(1)));
        assert!(alice.parents.contains(&PrincipalRef::role(2)));

        let eng = graph.get_group(5).unwrap();
        assert!(eng.children.contains(&PrincipalRef::group(1)));
        assert!(eng.children.contains(&PrincipalRef::role(2)));

        let ops = graph.get_group(1).unwrap();
        assert_eq!(ops.permissions.len(), 1);

        // Counters continue after the highest loaded ids.
        assert_eq!(graph.next_id(PrincipalKind::Group), 6);
        assert_eq!(graph.next_id(PrincipalKind::User), 2);
        assert_eq!(graph.next_permission_id(), 10);
    }

    #[test]
    fn test_dangling_edge_is_skipped() {
        let snapshot = StoreSnapshot {
            users: vec![principal_row(1, "alice")],
            user_groups: vec![(1, 99)], // group 99 does not exist
            ..Default::default()
        };
        let graph = EntityGraph::new();
        graph.load_snapshot(snapshot);
        assert!(graph.get_user(1).unwrap().parents.is_empty());
    }
}
