//! Domain service API
//!
//! Public surface over the engine: mutations are wrapped into command
//! envelopes and submitted to the channel (the `send().await` is the
//! backpressure point); queries go straight to the cache and evaluator on
//! the caller's task. Every mutating call resolves to the affected domain
//! object or a terminal error kind.

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::audit::{AuditWriter, ChangeType};
use crate::cache::EntityCache;
use crate::engine::command::{Command, CommandEnvelope, CommandOutput};
use crate::error::{AcsError, AcsResult};
use crate::evaluator::{AccessDecision, ConditionContext, PermissionEvaluator};
use crate::graph::{
    EntityGraph, Permission, PermissionScheme, Principal, PrincipalRef, Resource, Verb,
};
use crate::health::HealthMonitor;

/// Page request for list queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// Items to skip
    pub offset: usize,
    /// Maximum items to return
    pub limit: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

/// One page of results
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    /// Items in this page
    pub items: Vec<T>,
    /// Total items across all pages
    pub total: usize,
    /// Offset this page started at
    pub offset: usize,
    /// Limit the page was cut to
    pub limit: usize,
}

fn paginate<T>(mut items: Vec<T>, page: PageRequest) -> Page<T> {
    let total = items.len();
    let items = if page.offset >= total {
        Vec::new()
    } else {
        items.drain(page.offset..).take(page.limit).collect()
    };
    Page {
        items,
        total,
        offset: page.offset,
        limit: page.limit,
    }
}

/// Grant parameters beyond the `(principal, uri, verb)` key
#[derive(Debug, Clone, Default)]
pub struct GrantOptions {
    /// Deny instead of grant
    pub deny: bool,
    /// Scheme; defaults to API URI authorization
    pub scheme: PermissionScheme,
    /// Pin to a registered resource
    pub resource_id: Option<i64>,
    /// Conditions that must hold after the grant resolves
    pub conditions: Vec<crate::evaluator::AccessCondition>,
}

/// Command dispatch and query surface for one tenant engine
#[derive(Clone)]
pub struct AcsService {
    tx: mpsc::Sender<CommandEnvelope>,
    graph: Arc<EntityGraph>,
    cache: Arc<EntityCache>,
    evaluator: Arc<PermissionEvaluator>,
    audit: Arc<AuditWriter>,
    health: Arc<HealthMonitor>,
}

impl AcsService {
    pub(crate) fn new(
        tx: mpsc::Sender<CommandEnvelope>,
        graph: Arc<EntityGraph>,
        cache: Arc<EntityCache>,
        evaluator: Arc<PermissionEvaluator>,
        audit: Arc<AuditWriter>,
        health: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            tx,
            graph,
            cache,
            evaluator,
            audit,
            health,
        }
    }

    /// Submit a raw command and await its completion future
    pub async fn submit(&self, actor: &str, command: Command) -> AcsResult<CommandOutput> {
        let (envelope, rx) = CommandEnvelope::new(command, actor);
        self.tx
            .send(envelope)
            .await
            .map_err(|_| AcsError::Cancelled("engine is shutting down".into()))?;
        rx.await
            .map_err(|_| AcsError::Cancelled("command dropped before completion".into()))?
    }

    async fn submit_principal(&self, actor: &str, command: Command) -> AcsResult<Principal> {
        match self.submit(actor, command).await? {
            CommandOutput::Principal(principal) => Ok(principal),
            other => Err(AcsError::Unsupported(format!(
                "unexpected output {other:?}"
            ))),
        }
    }

    async fn submit_permission(&self, actor: &str, command: Command) -> AcsResult<Permission> {
        match self.submit(actor, command).await? {
            CommandOutput::Permission(permission) => Ok(permission),
            other => Err(AcsError::Unsupported(format!(
                "unexpected output {other:?}"
            ))),
        }
    }

    // --- principal commands -------------------------------------------------

    /// Create a user, optionally inside an existing group
    pub async fn create_user(
        &self,
        actor: &str,
        name: &str,
        parent_group: Option<i64>,
    ) -> AcsResult<Principal> {
        self.submit_principal(
            actor,
            Command::CreateUser {
                name: name.to_string(),
                parent_group,
            },
        )
        .await
    }

    /// Rename a user
    pub async fn update_user(&self, actor: &str, id: i64, name: &str) -> AcsResult<Principal> {
        self.submit_principal(
            actor,
            Command::UpdateUser {
                id,
                name: name.to_string(),
            },
        )
        .await
    }

    /// Delete a user
    pub async fn delete_user(&self, actor: &str, id: i64) -> AcsResult<Principal> {
        self.submit_principal(actor, Command::DeleteUser { id }).await
    }

    /// Create a group, optionally inside an existing group
    pub async fn create_group(
        &self,
        actor: &str,
        name: &str,
        parent_group: Option<i64>,
    ) -> AcsResult<Principal> {
        self.submit_principal(
            actor,
            Command::CreateGroup {
                name: name.to_string(),
                parent_group,
            },
        )
        .await
    }

    /// Rename a group
    pub async fn update_group(&self, actor: &str, id: i64, name: &str) -> AcsResult<Principal> {
        self.submit_principal(
            actor,
            Command::UpdateGroup {
                id,
                name: name.to_string(),
            },
        )
        .await
    }

    /// Delete a group
    pub async fn delete_group(&self, actor: &str, id: i64) -> AcsResult<Principal> {
        self.submit_principal(actor, Command::DeleteGroup { id }).await
    }

    /// Create a role
    pub async fn create_role(&self, actor: &str, name: &str) -> AcsResult<Principal> {
        self.submit_principal(
            actor,
            Command::CreateRole {
                name: name.to_string(),
            },
        )
        .await
    }

    /// Rename a role
    pub async fn update_role(&self, actor: &str, id: i64, name: &str) -> AcsResult<Principal> {
        self.submit_principal(
            actor,
            Command::UpdateRole {
                id,
                name: name.to_string(),
            },
        )
        .await
    }

    /// Delete a role
    pub async fn delete_role(&self, actor: &str, id: i64) -> AcsResult<Principal> {
        self.submit_principal(actor, Command::DeleteRole { id }).await
    }

    // --- membership commands ------------------------------------------------

    /// Add a user to a group (idempotent)
    pub async fn add_user_to_group(
        &self,
        actor: &str,
        user_id: i64,
        group_id: i64,
    ) -> AcsResult<CommandOutput> {
        self.submit(actor, Command::AddUserToGroup { user_id, group_id })
            .await
    }

    /// Remove a user from a group
    pub async fn remove_user_from_group(
        &self,
        actor: &str,
        user_id: i64,
        group_id: i64,
    ) -> AcsResult<CommandOutput> {
        self.submit(actor, Command::RemoveUserFromGroup { user_id, group_id })
            .await
    }

    /// Assign a role directly to a user
    pub async fn assign_role_to_user(
        &self,
        actor: &str,
        user_id: i64,
        role_id: i64,
    ) -> AcsResult<CommandOutput> {
        self.submit(actor, Command::AssignRoleToUser { user_id, role_id })
            .await
    }

    /// Remove a role from a user
    pub async fn remove_role_from_user(
        &self,
        actor: &str,
        user_id: i64,
        role_id: i64,
    ) -> AcsResult<CommandOutput> {
        self.submit(actor, Command::RemoveRoleFromUser { user_id, role_id })
            .await
    }

    /// Attach a role under a group
    pub async fn attach_role_to_group(
        &self,
        actor: &str,
        group_id: i64,
        role_id: i64,
    ) -> AcsResult<CommandOutput> {
        self.submit(actor, Command::AttachRoleToGroup { group_id, role_id })
            .await
    }

    /// Detach a role from a group
    pub async fn detach_role_from_group(
        &self,
        actor: &str,
        group_id: i64,
        role_id: i64,
    ) -> AcsResult<CommandOutput> {
        self.submit(actor, Command::DetachRoleFromGroup { group_id, role_id })
            .await
    }

    /// Nest a group under another group; rejected with Conflict on a cycle
    pub async fn add_group_to_group(
        &self,
        actor: &str,
        parent_group_id: i64,
        child_group_id: i64,
    ) -> AcsResult<CommandOutput> {
        self.submit(
            actor,
            Command::AddGroupToGroup {
                parent_group_id,
                child_group_id,
            },
        )
        .await
    }

    /// Remove a group nesting edge
    pub async fn remove_group_from_group(
        &self,
        actor: &str,
        parent_group_id: i64,
        child_group_id: i64,
    ) -> AcsResult<CommandOutput> {
        self.submit(
            actor,
            Command::RemoveGroupFromGroup {
                parent_group_id,
                child_group_id,
            },
        )
        .await
    }

    // --- permission commands ------------------------------------------------

    /// Grant (or deny) a permission on a principal
    pub async fn grant_permission(
        &self,
        actor: &str,
        principal: PrincipalRef,
        uri: &str,
        verb: Verb,
        options: GrantOptions,
    ) -> AcsResult<Permission> {
        self.submit_permission(
            actor,
            Command::GrantPermission {
                principal,
                uri: uri.to_string(),
                verb,
                deny: options.deny,
                scheme: options.scheme,
                resource_id: options.resource_id,
                conditions: options.conditions,
            },
        )
        .await
    }

    /// Revoke a permission by its `(principal, uri, verb)` key
    pub async fn revoke_permission(
        &self,
        actor: &str,
        principal: PrincipalRef,
        uri: &str,
        verb: Verb,
    ) -> AcsResult<Permission> {
        self.submit_permission(
            actor,
            Command::RevokePermission {
                principal,
                uri: uri.to_string(),
                verb,
            },
        )
        .await
    }

    /// Register a resource version
    pub async fn register_resource(
        &self,
        actor: &str,
        uri: &str,
        description: &str,
        resource_type: &str,
    ) -> AcsResult<Resource> {
        match self
            .submit(
                actor,
                Command::RegisterResource {
                    uri: uri.to_string(),
                    description: description.to_string(),
                    resource_type: resource_type.to_string(),
                    parent_resource_id: None,
                },
            )
            .await?
        {
            CommandOutput::Resource(resource) => Ok(resource),
            other => Err(AcsError::Unsupported(format!(
                "unexpected output {other:?}"
            ))),
        }
    }

    // --- queries (bypass the channel) ---------------------------------------

    /// Fetch a user through the cache
    pub async fn get_user(&self, id: i64) -> AcsResult<Arc<Principal>> {
        self.cache.get_user(id).await
    }

    /// Fetch a group through the cache
    pub async fn get_group(&self, id: i64) -> AcsResult<Arc<Principal>> {
        self.cache.get_group(id).await
    }

    /// Fetch a role through the cache
    pub async fn get_role(&self, id: i64) -> AcsResult<Arc<Principal>> {
        self.cache.get_role(id).await
    }

    /// Base permission check
    pub fn check_access(
        &self,
        principal: PrincipalRef,
        uri: &str,
        verb: Verb,
    ) -> AcsResult<AccessDecision> {
        let started = std::time::Instant::now();
        let decision = self.evaluator.check(principal, uri, verb);
        self.health
            .record("permission_check", decision.is_ok(), started.elapsed());
        decision
    }

    /// Permission check with an audit record of the decision
    pub async fn check_access_detailed(
        &self,
        actor: &str,
        principal: PrincipalRef,
        uri: &str,
        verb: Verb,
    ) -> AcsResult<AccessDecision> {
        let decision = self.check_access(principal, uri, verb)?;
        self.audit
            .record(
                principal.kind.as_str(),
                principal.id,
                ChangeType::Check,
                actor,
                serde_json::json!({
                    "uri": uri,
                    "verb": verb.as_str(),
                    "outcome": decision.outcome,
                    "reason": decision.reason.clone(),
                }),
            )
            .await;
        Ok(decision)
    }

    /// Base check against a registered resource
    pub fn check_access_by_resource(
        &self,
        principal: PrincipalRef,
        resource_id: i64,
        verb: Verb,
    ) -> AcsResult<AccessDecision> {
        self.evaluator.check_resource(principal, resource_id, verb)
    }

    /// Complex evaluation with condition predicates
    pub async fn evaluate(
        &self,
        actor: &str,
        principal: PrincipalRef,
        uri: &str,
        verb: Verb,
        ctx: &ConditionContext,
    ) -> AcsResult<AccessDecision> {
        let started = std::time::Instant::now();
        let decision = self.evaluator.evaluate(principal, uri, verb, ctx);
        self.health
            .record("permission_check", decision.is_ok(), started.elapsed());
        if let Ok(decision) = &decision {
            self.audit
                .record(
                    principal.kind.as_str(),
                    principal.id,
                    ChangeType::Check,
                    actor,
                    serde_json::json!({
                        "uri": uri,
                        "verb": verb.as_str(),
                        "outcome": decision.outcome,
                        "has_permission": decision.has_permission,
                        "has_access": decision.has_access,
                    }),
                )
                .await;
        }
        decision
    }

    /// Resolve a concrete URI to its most specific active resource
    pub fn resolve_resource(&self, uri: &str) -> Option<Resource> {
        self.graph.resources.resolve(uri)
    }

    /// Paginated user listing
    pub fn list_users(&self, page: PageRequest) -> Page<Principal> {
        paginate(self.graph.users(), page)
    }

    /// Paginated group listing
    pub fn list_groups(&self, page: PageRequest) -> Page<Principal> {
        paginate(self.graph.groups(), page)
    }

    /// Paginated role listing
    pub fn list_roles(&self, page: PageRequest) -> Page<Principal> {
        paginate(self.graph.roles(), page)
    }

    /// Paginated listing of one principal's direct permissions
    pub fn list_entity_permissions(
        &self,
        principal: PrincipalRef,
        page: PageRequest,
    ) -> AcsResult<Page<Permission>> {
        let owner = self.graph.get(principal)?;
        Ok(paginate(owner.permissions, page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paginate_bounds() {
        let items: Vec<i64> = (1..=10).collect();
        let page = paginate(items.clone(), PageRequest { offset: 0, limit: 3 });
        assert_eq!(page.items, vec![1, 2, 3]);
        assert_eq!(page.total, 10);

        let page = paginate(items.clone(), PageRequest { offset: 8, limit: 5 });
        assert_eq!(page.items, vec![9, 10]);

        let page = paginate(items, PageRequest { offset: 50, limit: 5 });
        assert!(page.items.is_empty());
        assert_eq!(page.total, 10);
    }
}
