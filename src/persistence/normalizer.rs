//! Normalizers: domain intent to row-level changes
//!
//! One pure function per command kind. Each takes the command payload plus
//! the ids the executor allocated and returns the minimal `RowOp` delta,
//! prerequisite ensures included. Normalizers never read the graph, which
//! is what makes a serialized op list replayable from the dead-letter
//! queue without re-running the in-memory mutation.

use crate::error::{AcsError, AcsResult};
use crate::graph::{Permission, Principal, PrincipalKind, PrincipalRef, Resource, Verb};
use crate::persistence::rows::RowOp;

fn upsert_for(kind: PrincipalKind, id: i64, name: &str) -> RowOp {
    match kind {
        PrincipalKind::User => RowOp::UpsertUser {
            id,
            name: name.to_string(),
        },
        PrincipalKind::Group => RowOp::UpsertGroup {
            id,
            name: name.to_string(),
        },
        PrincipalKind::Role => RowOp::UpsertRole {
            id,
            name: name.to_string(),
        },
    }
}

/// Rows for a freshly-created principal, join row included when a parent
/// group was requested (same transaction, per the create-with-parent rule)
pub fn create_principal(principal: &Principal, parent_group: Option<i64>) -> AcsResult<Vec<RowOp>> {
    let mut ops = vec![upsert_for(principal.kind, principal.id, &principal.name)];
    if let Some(group_id) = parent_group {
        ops.extend(add_membership(
            PrincipalRef::group(group_id),
            principal.as_ref(),
        )?);
    }
    Ok(ops)
}

/// Rows for a rename
pub fn rename_principal(target: PrincipalRef, name: &str) -> Vec<RowOp> {
    vec![upsert_for(target.kind, target.id, name)]
}

/// Rows for a principal delete (stores cascade joins and owned permissions)
pub fn delete_principal(target: PrincipalRef) -> Vec<RowOp> {
    vec![match target.kind {
        PrincipalKind::User => RowOp::DeleteUser { id: target.id },
        PrincipalKind::Group => RowOp::DeleteGroup { id: target.id },
        PrincipalKind::Role => RowOp::DeleteRole { id: target.id },
    }]
}

/// Join-table insert for a `(parent, child)` link
pub fn add_membership(parent: PrincipalRef, child: PrincipalRef) -> AcsResult<Vec<RowOp>> {
    let op = match (parent.kind, child.kind) {
        (PrincipalKind::Group, PrincipalKind::User) => RowOp::InsertUserGroup {
            user_id: child.id,
            group_id: parent.id,
        },
        (PrincipalKind::Role, PrincipalKind::User) => RowOp::InsertUserRole {
            user_id: child.id,
            role_id: parent.id,
        },
        (PrincipalKind::Group, PrincipalKind::Role) => RowOp::InsertGroupRole {
            group_id: parent.id,
            role_id: child.id,
        },
        (PrincipalKind::Group, PrincipalKind::Group) => RowOp::InsertGroupHierarchy {
            parent_group_id: parent.id,
            child_group_id: child.id,
        },
        (parent_kind, child_kind) => {
            return Err(AcsError::Unsupported(format!(
                "no join table links a {child_kind} under a {parent_kind}"
            )))
        }
    };
    Ok(vec![op])
}

/// Join-table delete for a `(parent, child)` unlink
pub fn remove_membership(parent: PrincipalRef, child: PrincipalRef) -> AcsResult<Vec<RowOp>> {
    let op = match (parent.kind, child.kind) {
        (PrincipalKind::Group, PrincipalKind::User) => RowOp::DeleteUserGroup {
            user_id: child.id,
            group_id: parent.id,
        },
        (PrincipalKind::Role, PrincipalKind::User) => RowOp::DeleteUserRole {
            user_id: child.id,
            role_id: parent.id,
        },
        (PrincipalKind::Group, PrincipalKind::Role) => RowOp::DeleteGroupRole {
            group_id: parent.id,
            role_id: child.id,
        },
        (PrincipalKind::Group, PrincipalKind::Group) => RowOp::DeleteGroupHierarchy {
            parent_group_id: parent.id,
            child_group_id: child.id,
        },
        (parent_kind, child_kind) => {
            return Err(AcsError::Unsupported(format!(
                "no join table links a {child_kind} under a {parent_kind}"
            )))
        }
    };
    Ok(vec![op])
}

/// Rows for a grant/deny: verb and scheme prerequisites, then the upsert
pub fn grant_permission(owner: PrincipalRef, permission: &Permission) -> Vec<RowOp> {
    vec![
        RowOp::EnsureVerbType {
            verb: permission.verb,
        },
        RowOp::EnsureSchemeType {
            scheme: permission.scheme.name().to_string(),
        },
        RowOp::UpsertPermission {
            owner,
            permission: permission.clone(),
        },
    ]
}

/// Row delete for a revoke
pub fn revoke_permission(owner: PrincipalRef, uri: &str, verb: Verb) -> Vec<RowOp> {
    vec![RowOp::DeletePermission {
        owner,
        uri: uri.to_string(),
        verb,
    }]
}

/// Rows for a resource registration, prior active versions deactivated in
/// the same transaction
pub fn register_resource(resource: &Resource, deactivated: &[i64]) -> Vec<RowOp> {
    let mut ops: Vec<RowOp> = deactivated
        .iter()
        .map(|id| RowOp::DeactivateResource { id: *id })
        .collect();
    ops.push(RowOp::UpsertResource {
        resource: resource.clone(),
    });
    ops
}

/// Row update for a resource deactivation
pub fn deactivate_resource(id: i64) -> Vec<RowOp> {
    vec![RowOp::DeactivateResource { id }]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_with_parent_emits_join_in_same_delta() {
        let user = Principal::new(7, "alice", PrincipalKind::User);
        let ops = create_principal(&user, Some(3)).unwrap();
        assert_eq!(ops.len(), 2);
        assert!(matches!(ops[0], RowOp::UpsertUser { id: 7, .. }));
        assert!(matches!(
            ops[1],
            RowOp::InsertUserGroup {
                user_id: 7,
                group_id: 3
            }
        ));
    }

    #[test]
    fn test_membership_maps_to_the_right_join_table() {
        let ops = add_membership(PrincipalRef::group(1), PrincipalRef::group(2)).unwrap();
        assert!(matches!(
            ops[0],
            RowOp::InsertGroupHierarchy {
                parent_group_id: 1,
                child_group_id: 2
            }
        ));

        // Users can never be parents.
        assert!(add_membership(PrincipalRef::user(1), PrincipalRef::group(2)).is_err());
    }

    #[test]
    fn test_grant_emits_prerequisites_first() {
        let permission = Permission::new(5, 1, "/orders/*", Verb::Get, false);
        let ops = grant_permission(PrincipalRef::group(1), &permission);
        assert!(matches!(ops[0], RowOp::EnsureVerbType { verb: Verb::Get }));
        assert!(matches!(ops[1], RowOp::EnsureSchemeType { .. }));
        assert!(matches!(ops[2], RowOp::UpsertPermission { .. }));
    }
}
