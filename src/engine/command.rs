//! Command model
//!
//! Typed command payloads, the envelope that carries them through the
//! channel, and the output delivered through each command's completion
//! future. Payloads are serializable; the dead-letter queue stores the
//! normalized row ops, the envelope itself never leaves the process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::AcsResult;
use crate::evaluator::conditions::AccessCondition;
use crate::graph::{Permission, PermissionScheme, Principal, PrincipalRef, Resource, Verb};

/// A mutation accepted by the domain service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    /// Create a user, optionally under an existing group
    CreateUser {
        /// Display name
        name: String,
        /// Parent group id, validated before any id is allocated
        parent_group: Option<i64>,
    },
    /// Rename a user
    UpdateUser {
        /// User id
        id: i64,
        /// New display name
        name: String,
    },
    /// Delete a user and its edges
    DeleteUser {
        /// User id
        id: i64,
    },
    /// Create a group, optionally under an existing group
    CreateGroup {
        /// Display name
        name: String,
        /// Parent group id
        parent_group: Option<i64>,
    },
    /// Rename a group
    UpdateGroup {
        /// Group id
        id: i64,
        /// New display name
        name: String,
    },
    /// Delete a group and its edges
    DeleteGroup {
        /// Group id
        id: i64,
    },
    /// Create a role
    CreateRole {
        /// Display name
        name: String,
    },
    /// Rename a role
    UpdateRole {
        /// Role id
        id: i64,
        /// New display name
        name: String,
    },
    /// Delete a role and its edges
    DeleteRole {
        /// Role id
        id: i64,
    },
    /// Add a user to a group
    AddUserToGroup {
        /// User id
        user_id: i64,
        /// Group id
        group_id: i64,
    },
    /// Remove a user from a group
    RemoveUserFromGroup {
        /// User id
        user_id: i64,
        /// Group id
        group_id: i64,
    },
    /// Assign a role directly to a user
    AssignRoleToUser {
        /// User id
        user_id: i64,
        /// Role id
        role_id: i64,
    },
    /// Remove a role from a user
    RemoveRoleFromUser {
        /// User id
        user_id: i64,
        /// Role id
        role_id: i64,
    },
    /// Attach a role under a group
    AttachRoleToGroup {
        /// Group id
        group_id: i64,
        /// Role id
        role_id: i64,
    },
    /// Detach a role from a group
    DetachRoleFromGroup {
        /// Group id
        group_id: i64,
        /// Role id
        role_id: i64,
    },
    /// Nest a group under another group (cycle-checked)
    AddGroupToGroup {
        /// Parent group id
        parent_group_id: i64,
        /// Child group id
        child_group_id: i64,
    },
    /// Remove a group nesting edge
    RemoveGroupFromGroup {
        /// Parent group id
        parent_group_id: i64,
        /// Child group id
        child_group_id: i64,
    },
    /// Grant (or deny) a permission on a principal
    GrantPermission {
        /// Owning principal
        principal: PrincipalRef,
        /// URI pattern
        uri: String,
        /// Guarded verb
        verb: Verb,
        /// Deny instead of grant
        deny: bool,
        /// Permission scheme
        scheme: PermissionScheme,
        /// Optional resource pin
        resource_id: Option<i64>,
        /// Conditions that must hold after a grant resolves
        conditions: Vec<AccessCondition>,
    },
    /// Revoke a permission by its `(principal, uri, verb)` key
    RevokePermission {
        /// Owning principal
        principal: PrincipalRef,
        /// URI pattern
        uri: String,
        /// Guarded verb
        verb: Verb,
    },
    /// Register a resource version
    RegisterResource {
        /// URI template
        uri: String,
        /// Free-form description
        description: String,
        /// Resource type tag
        resource_type: String,
        /// Optional parent resource
        parent_resource_id: Option<i64>,
    },
    /// Deactivate a resource version
    DeactivateResource {
        /// Resource id
        id: i64,
    },
}

impl Command {
    /// Stable kind tag for spans, audit records, and the DLQ
    pub fn kind(&self) -> &'static str {
        match self {
            Command::CreateUser { .. } => "create_user",
            Command::UpdateUser { .. } => "update_user",
            Command::DeleteUser { .. } => "delete_user",
            Command::CreateGroup { .. } => "create_group",
            Command::UpdateGroup { .. } => "update_group",
            Command::DeleteGroup { .. } => "delete_group",
            Command::CreateRole { .. } => "create_role",
            Command::UpdateRole { .. } => "update_role",
            Command::DeleteRole { .. } => "delete_role",
            Command::AddUserToGroup { .. } => "add_user_to_group",
            Command::RemoveUserFromGroup { .. } => "remove_user_from_group",
            Command::AssignRoleToUser { .. } => "assign_role_to_user",
            Command::RemoveRoleFromUser { .. } => "remove_role_from_user",
            Command::AttachRoleToGroup { .. } => "attach_role_to_group",
            Command::DetachRoleFromGroup { .. } => "detach_role_from_group",
            Command::AddGroupToGroup { .. } => "add_group_to_group",
            Command::RemoveGroupFromGroup { .. } => "remove_group_from_group",
            Command::GrantPermission { .. } => "grant_permission",
            Command::RevokePermission { .. } => "revoke_permission",
            Command::RegisterResource { .. } => "register_resource",
            Command::DeactivateResource { .. } => "deactivate_resource",
        }
    }
}

/// Value a completed command resolves to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandOutput {
    /// The created/updated/deleted principal
    Principal(Principal),
    /// The granted or revoked permission row
    Permission(Permission),
    /// The registered or deactivated resource
    Resource(Resource),
    /// Membership change acknowledgement
    Membership {
        /// Parent side of the edge
        parent: PrincipalRef,
        /// Child side of the edge
        child: PrincipalRef,
        /// Whether the edge set actually changed (false on idempotent re-apply)
        changed: bool,
    },
}

/// A command travelling through the channel
#[derive(Debug)]
pub struct CommandEnvelope {
    /// Envelope id, stable across retries and the DLQ
    pub id: Uuid,
    /// The command payload
    pub command: Command,
    /// Actor identity for audit records
    pub actor: String,
    /// When the submitter enqueued the command
    pub enqueued_at: DateTime<Utc>,
    reply: oneshot::Sender<AcsResult<CommandOutput>>,
}

impl CommandEnvelope {
    /// Wrap a command, returning the envelope and its completion future
    pub fn new(
        command: Command,
        actor: impl Into<String>,
    ) -> (Self, oneshot::Receiver<AcsResult<CommandOutput>>) {
        let (reply, rx) = oneshot::channel();
        (
            Self {
                id: Uuid::new_v4(),
                command,
                actor: actor.into(),
                enqueued_at: Utc::now(),
                reply,
            },
            rx,
        )
    }

    /// Whether the submitter dropped the completion future
    ///
    /// The executor skips cancelled envelopes before starting; once
    /// processing begins the command runs to completion.
    pub fn is_cancelled(&self) -> bool {
        self.reply.is_closed()
    }

    /// Resolve the completion future
    pub fn complete(self, result: AcsResult<CommandOutput>) {
        // A submitter that went away mid-flight is not an error.
        let _ = self.reply.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_serde_roundtrip() {
        let command = Command::GrantPermission {
            principal: PrincipalRef::group(1),
            uri: "/orders/*".into(),
            verb: Verb::Get,
            deny: false,
            scheme: PermissionScheme::ApiUriAuthorization,
            resource_id: None,
            conditions: Vec::new(),
        };
        let json = serde_json::to_string(&command).unwrap();
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(back, command);
        assert_eq!(back.kind(), "grant_permission");
    }

    #[tokio::test]
    async fn test_envelope_cancellation_is_visible() {
        let (envelope, rx) = CommandEnvelope::new(
            Command::CreateRole { name: "admin".into() },
            "system",
        );
        assert!(!envelope.is_cancelled());
        drop(rx);
        assert!(envelope.is_cancelled());
    }
}
