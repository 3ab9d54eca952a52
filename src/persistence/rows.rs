//! Relational row model and row-level change operations
//!
//! `RowOp` is the unit of work the normalizers emit and the stores apply:
//! a minimal, serializable delta against the relational schema. Serialized
//! op lists are what the dead-letter queue re-drives, so every op must be
//! idempotent and self-contained.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::graph::{Permission, PrincipalRef, Resource, Verb};

/// One row of the `entities` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct EntityRow {
    /// Store-assigned entity id
    pub id: i64,
    /// Principal kind tag
    pub entity_type: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

/// One row of the `users` table (`groups`/`roles` share the shape)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PrincipalRow {
    /// Principal id within its kind sequence
    pub id: i64,
    /// Backing `entities` row
    pub entity_id: i64,
    /// Display name
    pub name: String,
}

/// A permission row joined back to its owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPermission {
    /// Owning principal
    pub owner: PrincipalRef,
    /// The reconstructed permission
    pub permission: Permission,
}

/// One row of the `audit_logs` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditLogRow {
    /// Monotonic audit id
    pub id: i64,
    /// Entity type the change touched
    pub entity_type: String,
    /// Entity id the change touched
    pub entity_id: i64,
    /// Change type tag
    pub change_type: String,
    /// Actor who submitted the command
    pub changed_by: String,
    /// UTC timestamp of the change
    pub change_date: DateTime<Utc>,
    /// JSON details payload
    pub change_details: String,
    /// Hex-encoded SHA-256 content hash
    pub content_hash: String,
}

/// One row of the `data_archive_log` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ArchiveLogRow {
    /// Archive id (store-assigned; zero before insert)
    pub archive_id: i64,
    /// What was archived, e.g. `audit_logs`
    pub archive_type: String,
    /// When the archive was taken
    pub archive_date: DateTime<Utc>,
    /// Rows written to the archive file
    pub records_archived: i64,
    /// Archive file size in bytes
    pub archive_size: i64,
    /// Path of the archive file
    pub archive_path: String,
    /// `completed` or `failed`
    pub status: String,
    /// Who triggered the archive
    pub created_by: String,
    /// JSON metadata
    pub metadata: String,
}

/// Snapshot of the relational state needed to rebuild the graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// All user rows
    pub users: Vec<PrincipalRow>,
    /// All group rows
    pub groups: Vec<PrincipalRow>,
    /// All role rows
    pub roles: Vec<PrincipalRow>,
    /// `(user_id, group_id)` memberships
    pub user_groups: Vec<(i64, i64)>,
    /// `(user_id, role_id)` assignments
    pub user_roles: Vec<(i64, i64)>,
    /// `(group_id, role_id)` attachments
    pub group_roles: Vec<(i64, i64)>,
    /// `(parent_group_id, child_group_id)` hierarchy edges
    pub group_hierarchies: Vec<(i64, i64)>,
    /// Permission rows with owners
    pub permissions: Vec<StoredPermission>,
    /// Registered resources
    pub resources: Vec<Resource>,
}

/// A row-level change computed by a normalizer
///
/// Prerequisite rows with a natural key (`verb_types` by name,
/// `scheme_types` by name, pattern-backed `resources` by URI) have explicit
/// ensure ops; the backing `entities` row has no natural key in the schema
/// and is created inside the principal upsert handlers instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RowOp {
    /// Insert or rename a user (creates the `entities` row when new)
    UpsertUser {
        /// User id
        id: i64,
        /// Display name
        name: String,
    },
    /// Insert or rename a group
    UpsertGroup {
        /// Group id
        id: i64,
        /// Display name
        name: String,
    },
    /// Insert or rename a role
    UpsertRole {
        /// Role id
        id: i64,
        /// Display name
        name: String,
    },
    /// Delete a user, its join rows, and its owned permission rows
    DeleteUser {
        /// User id
        id: i64,
    },
    /// Delete a group, its join rows, and its owned permission rows
    DeleteGroup {
        /// Group id
        id: i64,
    },
    /// Delete a role, its join rows, and its owned permission rows
    DeleteRole {
        /// Role id
        id: i64,
    },
    /// Add a `(user, group)` membership (no-op when present)
    InsertUserGroup {
        /// User id
        user_id: i64,
        /// Group id
        group_id: i64,
    },
    /// Remove a `(user, group)` membership
    DeleteUserGroup {
        /// User id
        user_id: i64,
        /// Group id
        group_id: i64,
    },
    /// Add a `(user, role)` assignment
    InsertUserRole {
        /// User id
        user_id: i64,
        /// Role id
        role_id: i64,
    },
    /// Remove a `(user, role)` assignment
    DeleteUserRole {
        /// User id
        user_id: i64,
        /// Role id
        role_id: i64,
    },
    /// Attach a role under a group
    InsertGroupRole {
        /// Group id
        group_id: i64,
        /// Role id
        role_id: i64,
    },
    /// Detach a role from a group
    DeleteGroupRole {
        /// Group id
        group_id: i64,
        /// Role id
        role_id: i64,
    },
    /// Add a group hierarchy edge; the store re-checks acyclicity
    InsertGroupHierarchy {
        /// Parent group id
        parent_group_id: i64,
        /// Child group id
        child_group_id: i64,
    },
    /// Remove a group hierarchy edge
    DeleteGroupHierarchy {
        /// Parent group id
        parent_group_id: i64,
        /// Child group id
        child_group_id: i64,
    },
    /// Ensure a `verb_types` row exists for the verb name
    EnsureVerbType {
        /// The verb
        verb: Verb,
    },
    /// Ensure a `scheme_types` row exists for the scheme name
    EnsureSchemeType {
        /// Scheme name
        scheme: String,
    },
    /// Upsert a permission row chain for its owner
    ///
    /// Covers the `resources` (pattern-backed), `permission_schemes`, and
    /// `uri_accesses` rows; the upsert key is `(owner, uri, verb)`.
    UpsertPermission {
        /// Owning principal
        owner: PrincipalRef,
        /// The permission row
        permission: Permission,
    },
    /// Delete a permission row chain by its upsert key
    DeletePermission {
        /// Owning principal
        owner: PrincipalRef,
        /// URI pattern
        uri: String,
        /// Verb
        verb: Verb,
    },
    /// Register or update a resource version
    UpsertResource {
        /// The resource row
        resource: Resource,
    },
    /// Deactivate a resource version
    DeactivateResource {
        /// Resource id
        id: i64,
    },
}

impl RowOp {
    /// Short tag for logs and spans
    pub fn tag(&self) -> &'static str {
        match self {
            RowOp::UpsertUser { .. } => "upsert_user",
            RowOp::UpsertGroup { .. } => "upsert_group",
            RowOp::UpsertRole { .. } => "upsert_role",
            RowOp::DeleteUser { .. } => "delete_user",
            RowOp::DeleteGroup { .. } => "delete_group",
            RowOp::DeleteRole { .. } => "delete_role",
            RowOp::InsertUserGroup { .. } => "insert_user_group",
            RowOp::DeleteUserGroup { .. } => "delete_user_group",
            RowOp::InsertUserRole { .. } => "insert_user_role",
            RowOp::DeleteUserRole { .. } => "delete_user_role",
            RowOp::InsertGroupRole { .. } => "insert_group_role",
            RowOp::DeleteGroupRole { .. } => "delete_group_role",
            RowOp::InsertGroupHierarchy { .. } => "insert_group_hierarchy",
            RowOp::DeleteGroupHierarchy { .. } => "delete_group_hierarchy",
            RowOp::EnsureVerbType { .. } => "ensure_verb_type",
            RowOp::EnsureSchemeType { .. } => "ensure_scheme_type",
            RowOp::UpsertPermission { .. } => "upsert_permission",
            RowOp::DeletePermission { .. } => "delete_permission",
            RowOp::UpsertResource { .. } => "upsert_resource",
            RowOp::DeactivateResource { .. } => "deactivate_resource",
        }
    }
}
