//! Principal variants and typed graph edges
//!
//! Users, groups, and roles share one capability set: id, name, parent and
//! child edges, and a set of directly-owned permissions. Edges are typed
//! `(kind, id)` references because each kind allocates ids from its own
//! sequence, mirroring the relational schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::graph::permission::{Permission, Verb};

/// Principal kind tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    /// Human or service account; always a leaf
    User,
    /// Membership container; may nest under other groups
    Group,
    /// Named permission bundle; terminal in the hierarchy
    Role,
}

impl PrincipalKind {
    /// Entity type name as stored in the `entities` table
    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalKind::User => "user",
            PrincipalKind::Group => "group",
            PrincipalKind::Role => "role",
        }
    }
}

impl std::fmt::Display for PrincipalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed reference to a principal
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PrincipalRef {
    /// Kind of the referenced principal
    pub kind: PrincipalKind,
    /// Id within that kind's sequence
    pub id: i64,
}

impl PrincipalRef {
    /// Reference a user
    pub fn user(id: i64) -> Self {
        Self {
            kind: PrincipalKind::User,
            id,
        }
    }

    /// Reference a group
    pub fn group(id: i64) -> Self {
        Self {
            kind: PrincipalKind::Group,
            id,
        }
    }

    /// Reference a role
    pub fn role(id: i64) -> Self {
        Self {
            kind: PrincipalKind::Role,
            id,
        }
    }
}

impl std::fmt::Display for PrincipalRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// A user, group, or role with its edges and owned permissions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    /// Id within this principal's kind sequence
    pub id: i64,

    /// Display name, unique within the kind (case-insensitive)
    pub name: String,

    /// Kind tag
    pub kind: PrincipalKind,

    /// Parents: principals this one inherits from
    pub parents: BTreeSet<PrincipalRef>,

    /// Children: the transpose of `parents`
    pub children: BTreeSet<PrincipalRef>,

    /// Directly-owned permissions
    pub permissions: Vec<Permission>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last mutation timestamp
    pub updated_at: DateTime<Utc>,
}

impl Principal {
    /// Create a fresh principal with no edges or permissions
    pub fn new(id: i64, name: impl Into<String>, kind: PrincipalKind) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            kind,
            parents: BTreeSet::new(),
            children: BTreeSet::new(),
            permissions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Typed reference to this principal
    pub fn as_ref(&self) -> PrincipalRef {
        PrincipalRef {
            kind: self.kind,
            id: self.id,
        }
    }

    /// Parent refs of a given kind
    pub fn parents_of_kind(&self, kind: PrincipalKind) -> impl Iterator<Item = PrincipalRef> + '_ {
        self.parents.iter().copied().filter(move |r| r.kind == kind)
    }

    /// Child refs of a given kind
    pub fn children_of_kind(&self, kind: PrincipalKind) -> impl Iterator<Item = PrincipalRef> + '_ {
        self.children.iter().copied().filter(move |r| r.kind == kind)
    }

    /// Find a directly-owned permission by its upsert key
    pub fn permission(&self, uri: &str, verb: Verb) -> Option<&Permission> {
        self.permissions
            .iter()
            .find(|p| p.uri == uri && p.verb == verb)
    }

    /// Insert or update a permission row in place
    ///
    /// Returns `true` when a new row was created, `false` when an existing
    /// `(uri, verb)` row had its flags updated.
    pub fn upsert_permission(&mut self, permission: Permission) -> bool {
        self.updated_at = Utc::now();
        if let Some(existing) = self
            .permissions
            .iter_mut()
            .find(|p| p.uri == permission.uri && p.verb == permission.verb)
        {
            existing.grant = permission.grant;
            existing.deny = permission.deny;
            existing.scheme = permission.scheme;
            existing.resource_id = permission.resource_id;
            existing.conditions = permission.conditions;
            existing.granted_at = permission.granted_at;
            false
        } else {
            self.permissions.push(permission);
            true
        }
    }

    /// Remove a permission by its upsert key, returning the removed row
    pub fn remove_permission(&mut self, uri: &str, verb: Verb) -> Option<Permission> {
        let idx = self
            .permissions
            .iter()
            .position(|p| p.uri == uri && p.verb == verb)?;
        self.updated_at = Utc::now();
        Some(self.permissions.remove(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_updates_in_place() {
        let mut user = Principal::new(1, "alice", PrincipalKind::User);

        let created = user.upsert_permission(Permission::new(1, 1, "/orders/*", Verb::Get, false));
        assert!(created);
        assert_eq!(user.permissions.len(), 1);
        assert!(user.permission("/orders/*", Verb::Get).unwrap().grant);

        // Same (uri, verb) with the deny flag flips the row, no new row
        let created = user.upsert_permission(Permission::new(2, 1, "/orders/*", Verb::Get, true));
        assert!(!created);
        assert_eq!(user.permissions.len(), 1);
        assert!(user.permission("/orders/*", Verb::Get).unwrap().deny);
    }

    #[test]
    fn test_remove_permission() {
        let mut group = Principal::new(1, "ops", PrincipalKind::Group);
        group.upsert_permission(Permission::new(1, 1, "/a", Verb::Get, false));

        assert!(group.remove_permission("/a", Verb::Get).is_some());
        assert!(group.remove_permission("/a", Verb::Get).is_none());
        assert!(group.permissions.is_empty());
    }

    #[test]
    fn test_kind_filters() {
        let mut user = Principal::new(1, "alice", PrincipalKind::User);
        user.parents.insert(PrincipalRef::group(10));
        user.parents.insert(PrincipalRef::role(20));

        let groups: Vec<_> = user.parents_of_kind(PrincipalKind::Group).collect();
        assert_eq!(groups, vec![PrincipalRef::group(10)]);
    }
}
