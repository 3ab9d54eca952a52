//! Single-writer command executor
//!
//! Exactly one executor task drains the bounded command channel. Per
//! command: span, validate, mutate the graph, invalidate the touched cache
//! entries, persist the normalized row delta under the retry policy, audit
//! the outcome, complete the future. Terminal persistence failures route
//! the row delta to the DLQ; the graph keeps the mutation and stays
//! authoritative.
//!
//! Shutdown: the watch signal closes the channel; the executor keeps
//! draining what was already accepted until the drain deadline, then stops.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::Instrument;

use crate::audit::{AuditWriter, ChangeType};
use crate::cache::EntityCache;
use crate::dlq::{DeadLetterQueue, DlqEntry, DlqStatus};
use crate::engine::command::{Command, CommandEnvelope, CommandOutput};
use crate::error::{AcsError, AcsResult, ErrorClass};
use crate::evaluator::matcher::UriPattern;
use crate::graph::{EntityGraph, Permission, PrincipalKind, PrincipalRef, Resource};
use crate::health::HealthMonitor;
use crate::persistence::adapter::PersistenceAdapter;
use crate::persistence::normalizer;
use crate::persistence::rows::RowOp;
use crate::retry::RetryRunner;

/// Commands slower than this are flagged in the log
const SLOW_COMMAND: Duration = Duration::from_secs(1);

/// A validated, graph-applied command awaiting persistence
struct Prepared {
    output: CommandOutput,
    ops: Vec<RowOp>,
    /// Principals whose cached entries must drop
    touched: Vec<PrincipalRef>,
    entity_type: &'static str,
    entity_id: i64,
    change: ChangeType,
    details: serde_json::Value,
}

/// The single-writer executor
pub struct Executor {
    tenant_id: String,
    graph: Arc<EntityGraph>,
    cache: Arc<EntityCache>,
    adapter: PersistenceAdapter,
    audit: Arc<AuditWriter>,
    dlq: Arc<DeadLetterQueue>,
    retry: RetryRunner,
    health: Arc<HealthMonitor>,
}

impl Executor {
    /// Wire an executor over its collaborators
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: String,
        graph: Arc<EntityGraph>,
        cache: Arc<EntityCache>,
        adapter: PersistenceAdapter,
        audit: Arc<AuditWriter>,
        dlq: Arc<DeadLetterQueue>,
        retry: RetryRunner,
        health: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            tenant_id,
            graph,
            cache,
            adapter,
            audit,
            dlq,
            retry,
            health,
        }
    }

    /// Drain the channel until it closes or the drain deadline passes
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<CommandEnvelope>,
        mut shutdown: watch::Receiver<bool>,
        drain_window: Duration,
    ) {
        let mut deadline: Option<Instant> = None;
        loop {
            let envelope = if let Some(at) = deadline {
                match tokio::time::timeout_at(tokio::time::Instant::from_std(at), rx.recv()).await {
                    Ok(Some(envelope)) => envelope,
                    Ok(None) => break,
                    Err(_) => {
                        let dropped = rx.len();
                        if dropped > 0 {
                            tracing::warn!(dropped, "drain deadline passed with commands still queued");
                        }
                        break;
                    }
                }
            } else {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(envelope) => envelope,
                        None => break,
                    },
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            deadline = Some(Instant::now() + drain_window);
                            // Stop accepting; already-queued envelopes drain.
                            rx.close();
                        }
                        continue;
                    }
                }
            };
            self.process(envelope, deadline).await;
        }
        tracing::info!(tenant = %self.tenant_id, "executor stopped");
    }

    async fn process(&self, envelope: CommandEnvelope, deadline: Option<Instant>) {
        if envelope.is_cancelled() {
            tracing::debug!(id = %envelope.id, kind = envelope.command.kind(), "skipping cancelled command");
            return;
        }
        let span = tracing::info_span!(
            "command",
            tenant = %self.tenant_id,
            kind = envelope.command.kind(),
            id = %envelope.id
        );
        let started = Instant::now();
        let succeeded = self.process_inner(envelope, deadline).instrument(span).await;
        let elapsed = started.elapsed();
        self.health.record("domain_command", succeeded, elapsed);
        if elapsed > SLOW_COMMAND {
            tracing::warn!(elapsed_ms = elapsed.as_millis() as u64, "slow command");
        }
    }

    async fn process_inner(&self, envelope: CommandEnvelope, deadline: Option<Instant>) -> bool {
        let kind = envelope.command.kind();
        let actor = envelope.actor.clone();

        let prepared = match self.apply_command(&envelope.command) {
            Ok(prepared) => prepared,
            Err(err) => {
                // Validation failed before any mutation: no success record,
                // best-effort failure record only.
                self.audit
                    .record_error("command", 0, &actor, kind, &err.to_string())
                    .await;
                envelope.complete(Err(err));
                return false;
            }
        };

        self.cache.invalidate_all(&prepared.touched).await;

        let ops = prepared.ops.clone();
        let persisted = self
            .retry
            .run("database", deadline, || self.adapter.apply(&ops))
            .await;

        match persisted {
            Ok(()) => {
                self.audit
                    .record(
                        prepared.entity_type,
                        prepared.entity_id,
                        prepared.change,
                        &actor,
                        prepared.details,
                    )
                    .await;
                envelope.complete(Ok(prepared.output));
                true
            }
            Err(err) => {
                self.audit
                    .record_error(
                        prepared.entity_type,
                        prepared.entity_id,
                        &actor,
                        kind,
                        &err.to_string(),
                    )
                    .await;
                if err.class() == ErrorClass::Terminal {
                    let attempts = match &err {
                        AcsError::Terminal { attempts, .. } => *attempts,
                        _ => 0,
                    };
                    let entry = DlqEntry {
                        id: envelope.id,
                        command_kind: kind.to_string(),
                        actor: actor.clone(),
                        ops: prepared.ops,
                        attempts,
                        first_enqueued_at: envelope.enqueued_at,
                        queued_at: Utc::now(),
                        last_error: err.to_string(),
                        failure_count: 0,
                        status: DlqStatus::Pending,
                    };
                    if let Err(io_err) = self.dlq.enqueue(entry) {
                        // The graph is still authoritative; log and move on.
                        tracing::error!(%io_err, "dlq enqueue failed; dropping terminal command delta");
                    }
                } else {
                    tracing::error!(%err, kind, "persistence failed without retry");
                }
                envelope.complete(Err(err));
                false
            }
        }
    }

    /// Validate and apply one command to the graph, producing the row delta
    fn apply_command(&self, command: &Command) -> AcsResult<Prepared> {
        match command {
            Command::CreateUser { name, parent_group } => {
                self.create_principal(PrincipalKind::User, name, *parent_group)
            }
            Command::CreateGroup { name, parent_group } => {
                self.create_principal(PrincipalKind::Group, name, *parent_group)
            }
            Command::CreateRole { name } => self.create_principal(PrincipalKind::Role, name, None),
            Command::UpdateUser { id, name } => self.rename(PrincipalRef::user(*id), name),
            Command::UpdateGroup { id, name } => self.rename(PrincipalRef::group(*id), name),
            Command::UpdateRole { id, name } => self.rename(PrincipalRef::role(*id), name),
            Command::DeleteUser { id } => self.delete(PrincipalRef::user(*id)),
            Command::DeleteGroup { id } => self.delete(PrincipalRef::group(*id)),
            Command::DeleteRole { id } => self.delete(PrincipalRef::role(*id)),
            Command::AddUserToGroup { user_id, group_id } => self.link(
                PrincipalRef::group(*group_id),
                PrincipalRef::user(*user_id),
            ),
            Command::RemoveUserFromGroup { user_id, group_id } => self.unlink(
                PrincipalRef::group(*group_id),
                PrincipalRef::user(*user_id),
            ),
            Command::AssignRoleToUser { user_id, role_id } => {
                self.link(PrincipalRef::role(*role_id), PrincipalRef::user(*user_id))
            }
            Command::RemoveRoleFromUser { user_id, role_id } => {
                self.unlink(PrincipalRef::role(*role_id), PrincipalRef::user(*user_id))
            }
            Command::AttachRoleToGroup { group_id, role_id } => {
                self.link(PrincipalRef::group(*group_id), PrincipalRef::role(*role_id))
            }
            Command::DetachRoleFromGroup { group_id, role_id } => {
                self.unlink(PrincipalRef::group(*group_id), PrincipalRef::role(*role_id))
            }
            Command::AddGroupToGroup {
                parent_group_id,
                child_group_id,
            } => self.link(
                PrincipalRef::group(*parent_group_id),
                PrincipalRef::group(*child_group_id),
            ),
            Command::RemoveGroupFromGroup {
                parent_group_id,
                child_group_id,
            } => self.unlink(
                PrincipalRef::group(*parent_group_id),
                PrincipalRef::group(*child_group_id),
            ),
            Command::GrantPermission {
                principal,
                uri,
                verb,
                deny,
                scheme,
                resource_id,
                conditions,
            } => self.grant(*principal, uri, *verb, *deny, scheme.clone(), *resource_id, conditions),
            Command::RevokePermission {
                principal,
                uri,
                verb,
            } => self.revoke(*principal, uri, *verb),
            Command::RegisterResource {
                uri,
                description,
                resource_type,
                parent_resource_id,
            } => self.register_resource(uri, description, resource_type, *parent_resource_id),
            Command::DeactivateResource { id } => self.deactivate_resource(*id),
        }
    }

    fn require_positive(id: i64, what: &str) -> AcsResult<()> {
        if id <= 0 {
            return Err(AcsError::InvalidArgument(format!(
                "{what} id must be positive, got {id}"
            )));
        }
        Ok(())
    }

    /// The principal plus the member users holding cached aggregates of it
    ///
    /// Mutating a group or role invalidates the `user_groups`/`user_roles`
    /// aggregate of every direct member, not the whole cache.
    fn touched_with_members(&self, target: PrincipalRef) -> Vec<PrincipalRef> {
        let mut touched = vec![target];
        if target.kind != PrincipalKind::User {
            if let Ok(principal) = self.graph.get(target) {
                touched.extend(principal.children_of_kind(PrincipalKind::User));
            }
        }
        touched
    }

    fn create_principal(
        &self,
        kind: PrincipalKind,
        name: &str,
        parent_group: Option<i64>,
    ) -> AcsResult<Prepared> {
        EntityGraph::validate_name(name)?;
        // The parent must exist before any id is allocated, so a failed
        // create leaves no hole in the sequence for this case.
        if let Some(group_id) = parent_group {
            Self::require_positive(group_id, "group")?;
            if !self.graph.contains(PrincipalRef::group(group_id)) {
                return Err(AcsError::NotFound(format!("group:{group_id}")));
            }
        }
        let principal = self.graph.create(kind, name)?;
        let mut touched = vec![principal.as_ref()];
        if let Some(group_id) = parent_group {
            self.graph
                .link(PrincipalRef::group(group_id), principal.as_ref())?;
            touched.push(PrincipalRef::group(group_id));
        }
        let ops = normalizer::create_principal(&principal, parent_group)?;
        let details = serde_json::json!({
            "name": principal.name.clone(),
            "parent_group": parent_group,
        });
        // Re-read so the output carries the parent edge.
        let principal = self.graph.get(principal.as_ref())?;
        Ok(Prepared {
            entity_type: kind.as_str(),
            entity_id: principal.id,
            change: ChangeType::Create,
            details,
            ops,
            touched,
            output: CommandOutput::Principal(principal),
        })
    }

    fn rename(&self, target: PrincipalRef, name: &str) -> AcsResult<Prepared> {
        Self::require_positive(target.id, target.kind.as_str())?;
        let before = self.graph.get(target)?;
        let updated = self.graph.rename(target, name)?;
        Ok(Prepared {
            entity_type: target.kind.as_str(),
            entity_id: target.id,
            change: ChangeType::Update,
            details: serde_json::json!({ "before": before.name, "after": updated.name.clone() }),
            ops: normalizer::rename_principal(target, &updated.name),
            touched: self.touched_with_members(target),
            output: CommandOutput::Principal(updated),
        })
    }

    fn delete(&self, target: PrincipalRef) -> AcsResult<Prepared> {
        Self::require_positive(target.id, target.kind.as_str())?;
        let removed = self.graph.delete(target)?;
        // Every former neighbor lost an edge; their cached entries and the
        // user aggregates go stale together.
        let mut touched = vec![target];
        touched.extend(removed.parents.iter().copied());
        touched.extend(removed.children.iter().copied());
        Ok(Prepared {
            entity_type: target.kind.as_str(),
            entity_id: target.id,
            change: ChangeType::Delete,
            details: serde_json::json!({
                "name": removed.name.clone(),
                "parents": removed.parents.len(),
                "children": removed.children.len(),
                "permissions": removed.permissions.len(),
            }),
            ops: normalizer::delete_principal(target),
            touched,
            output: CommandOutput::Principal(removed),
        })
    }

    fn link(&self, parent: PrincipalRef, child: PrincipalRef) -> AcsResult<Prepared> {
        Self::require_positive(parent.id, parent.kind.as_str())?;
        Self::require_positive(child.id, child.kind.as_str())?;
        let changed = self.graph.link(parent, child)?;
        Ok(Prepared {
            entity_type: child.kind.as_str(),
            entity_id: child.id,
            change: ChangeType::Add,
            details: serde_json::json!({
                "parent": parent.to_string(),
                "child": child.to_string(),
                "changed": changed,
            }),
            ops: normalizer::add_membership(parent, child)?,
            touched: vec![parent, child],
            output: CommandOutput::Membership {
                parent,
                child,
                changed,
            },
        })
    }

    fn unlink(&self, parent: PrincipalRef, child: PrincipalRef) -> AcsResult<Prepared> {
        Self::require_positive(parent.id, parent.kind.as_str())?;
        Self::require_positive(child.id, child.kind.as_str())?;
        let changed = self.graph.unlink(parent, child)?;
        Ok(Prepared {
            entity_type: child.kind.as_str(),
            entity_id: child.id,
            change: ChangeType::Remove,
            details: serde_json::json!({
                "parent": parent.to_string(),
                "child": child.to_string(),
                "changed": changed,
            }),
            ops: normalizer::remove_membership(parent, child)?,
            touched: vec![parent, child],
            output: CommandOutput::Membership {
                parent,
                child,
                changed,
            },
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn grant(
        &self,
        owner: PrincipalRef,
        uri: &str,
        verb: crate::graph::Verb,
        deny: bool,
        scheme: crate::graph::PermissionScheme,
        resource_id: Option<i64>,
        conditions: &[crate::evaluator::conditions::AccessCondition],
    ) -> AcsResult<Prepared> {
        Self::require_positive(owner.id, owner.kind.as_str())?;
        if !self.graph.contains(owner) {
            return Err(AcsError::NotFound(owner.to_string()));
        }
        // A pattern that cannot compile would poison evaluation later.
        UriPattern::compile(uri)?;
        if let Some(resource_id) = resource_id {
            self.graph.resources.get(resource_id)?;
        }
        let mut permission =
            Permission::new(self.graph.next_permission_id(), owner.id, uri, verb, deny)
                .with_scheme(scheme)
                .with_conditions(conditions.to_vec());
        permission.resource_id = resource_id;

        let (stored, created) = self.graph.upsert_permission(owner, permission)?;
        Ok(Prepared {
            entity_type: owner.kind.as_str(),
            entity_id: owner.id,
            change: ChangeType::Grant,
            details: serde_json::json!({
                "uri": stored.uri.clone(),
                "verb": stored.verb.as_str(),
                "deny": stored.deny,
                "created": created,
            }),
            ops: normalizer::grant_permission(owner, &stored),
            touched: self.touched_with_members(owner),
            output: CommandOutput::Permission(stored),
        })
    }

    fn revoke(
        &self,
        owner: PrincipalRef,
        uri: &str,
        verb: crate::graph::Verb,
    ) -> AcsResult<Prepared> {
        Self::require_positive(owner.id, owner.kind.as_str())?;
        let removed = self.graph.remove_permission(owner, uri, verb)?;
        Ok(Prepared {
            entity_type: owner.kind.as_str(),
            entity_id: owner.id,
            change: ChangeType::Revoke,
            details: serde_json::json!({
                "uri": removed.uri.clone(),
                "verb": removed.verb.as_str(),
                "was_deny": removed.deny,
            }),
            ops: normalizer::revoke_permission(owner, uri, verb),
            touched: self.touched_with_members(owner),
            output: CommandOutput::Permission(removed),
        })
    }

    fn register_resource(
        &self,
        uri: &str,
        description: &str,
        resource_type: &str,
        parent_resource_id: Option<i64>,
    ) -> AcsResult<Prepared> {
        UriPattern::compile(uri)?;
        if let Some(parent) = parent_resource_id {
            self.graph.resources.get(parent)?;
        }
        let mut resource = Resource::new(self.graph.next_resource_id(), uri, resource_type);
        resource.description = description.to_string();
        resource.parent_resource_id = parent_resource_id;
        let (stored, deactivated) = self.graph.resources.register(resource)?;
        Ok(Prepared {
            entity_type: "resource",
            entity_id: stored.id,
            change: ChangeType::Create,
            details: serde_json::json!({
                "uri": stored.uri.clone(),
                "version": stored.version,
                "deactivated": deactivated.clone(),
            }),
            ops: normalizer::register_resource(&stored, &deactivated),
            touched: Vec::new(),
            output: CommandOutput::Resource(stored),
        })
    }

    fn deactivate_resource(&self, id: i64) -> AcsResult<Prepared> {
        Self::require_positive(id, "resource")?;
        let resource = self.graph.resources.deactivate(id)?;
        Ok(Prepared {
            entity_type: "resource",
            entity_id: id,
            change: ChangeType::Update,
            details: serde_json::json!({ "uri": resource.uri.clone(), "deactivated": true }),
            ops: normalizer::deactivate_resource(id),
            touched: Vec::new(),
            output: CommandOutput::Resource(resource),
        })
    }
}
