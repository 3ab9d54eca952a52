//! Permission evaluation (pure, lock-free reads)
//!
//! Resolution order over the evaluation set `{principal} ∪ ancestors`:
//! matching rows are collected first, then any deny dominates any grant no
//! matter which member owns it; otherwise the most specific grant wins;
//! otherwise the result is not-granted. Complex evaluation additionally
//! requires every condition on the winning grant to hold, demoting the
//! result to denied when one fails.
//!
//! Ancestor expansion by kind:
//! - User: parent groups and roles, then everything those groups reach
//! - Group: parent groups (transitively) and roles attached to the group
//! - Role: terminal

pub mod conditions;
pub mod decision;
pub mod matcher;

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use crate::error::AcsResult;
use crate::graph::{EntityGraph, Permission, PrincipalKind, PrincipalRef, Verb};

pub use conditions::{AccessCondition, ConditionContext, ConditionOp, ConditionResult};
pub use decision::{AccessDecision, AccessOutcome, EvaluationStep};
pub use matcher::UriPattern;

/// A member of the evaluation set with the path that reached it
#[derive(Debug, Clone)]
struct SetMember {
    principal: PrincipalRef,
    name: String,
    /// Path from the checked principal to this member, inclusive
    path: Vec<PrincipalRef>,
}

/// A permission row that matched the request
#[derive(Debug, Clone)]
struct MatchedRow {
    owner: PrincipalRef,
    owner_name: String,
    path: Vec<PrincipalRef>,
    permission: Permission,
    specificity: matcher::Specificity,
}

/// Pure permission evaluator over the entity graph
pub struct PermissionEvaluator {
    graph: Arc<EntityGraph>,
    /// Compiled pattern cache keyed by pattern source
    patterns: DashMap<String, UriPattern>,
}

impl PermissionEvaluator {
    /// Create an evaluator over a graph
    pub fn new(graph: Arc<EntityGraph>) -> Self {
        Self {
            graph,
            patterns: DashMap::new(),
        }
    }

    /// Base permission check: grant/deny resolution without conditions
    pub fn check(&self, principal: PrincipalRef, uri: &str, verb: Verb) -> AcsResult<AccessDecision> {
        let started = Instant::now();
        let mut decision = self.resolve(principal, uri, verb)?;
        decision.elapsed = started.elapsed();
        Ok(decision)
    }

    /// Base check against a registered resource
    ///
    /// Rows pinned to the resource id match directly; unpinned rows match
    /// by pattern against the resource URI template.
    pub fn check_resource(
        &self,
        principal: PrincipalRef,
        resource_id: i64,
        verb: Verb,
    ) -> AcsResult<AccessDecision> {
        let resource = self.graph.resources.get(resource_id)?;
        let started = Instant::now();
        let mut decision = self.resolve(principal, &resource.uri, verb)?;
        decision
            .steps
            .insert(0, EvaluationStep::note(format!(
                "resource {} resolved to uri {}",
                resource_id, resource.uri
            )));
        decision.elapsed = started.elapsed();
        Ok(decision)
    }

    /// Complex evaluation: base resolution plus condition predicates
    pub fn evaluate(
        &self,
        principal: PrincipalRef,
        uri: &str,
        verb: Verb,
        ctx: &ConditionContext,
    ) -> AcsResult<AccessDecision> {
        let started = Instant::now();
        let mut decision = self.resolve(principal, uri, verb)?;

        if decision.is_granted() {
            let conditions: Vec<AccessCondition> = decision
                .granting
                .iter()
                .flat_map(|p| p.conditions.iter().cloned())
                .collect();
            for condition in &conditions {
                let result = condition.evaluate(ctx);
                decision.steps.push(EvaluationStep::note(format!(
                    "condition {:?}: {}",
                    result.condition,
                    if result.passed { "passed" } else { "failed" }
                )));
                decision.condition_results.push(result);
            }
            if let Some(failed) = decision.condition_results.iter().find(|r| !r.passed) {
                decision.outcome = AccessOutcome::Denied;
                decision.has_access = false;
                // has_permission stays true: the base grant resolved.
                decision.reason = format!(
                    "granted but condition failed: {} ({})",
                    failed.condition, failed.explanation
                );
            }
        }

        decision.elapsed = started.elapsed();
        Ok(decision)
    }

    /// Collect the evaluation set with inheritance paths (breadth-first)
    fn evaluation_set(&self, origin: PrincipalRef) -> AcsResult<Vec<SetMember>> {
        let mut members = Vec::new();
        let mut visited: BTreeSet<PrincipalRef> = BTreeSet::new();
        visited.insert(origin);
        let mut queue = std::collections::VecDeque::from([(origin, vec![origin])]);

        while let Some((current, path)) = queue.pop_front() {
            let principal = self.graph.get(current)?;
            members.push(SetMember {
                principal: current,
                name: principal.name.clone(),
                path: path.clone(),
            });

            let next: Vec<PrincipalRef> = match current.kind {
                PrincipalKind::User => principal.parents.iter().copied().collect(),
                PrincipalKind::Group => principal
                    .parents_of_kind(PrincipalKind::Group)
                    .chain(principal.children_of_kind(PrincipalKind::Role))
                    .collect(),
                PrincipalKind::Role => Vec::new(),
            };
            for reference in next {
                if visited.insert(reference) {
                    let mut extended = path.clone();
                    extended.push(reference);
                    queue.push_back((reference, extended));
                }
            }
        }
        Ok(members)
    }

    fn compiled(&self, pattern: &str) -> Option<UriPattern> {
        if let Some(hit) = self.patterns.get(pattern) {
            return Some(hit.clone());
        }
        match UriPattern::compile(pattern) {
            Ok(compiled) => {
                self.patterns.insert(pattern.to_string(), compiled.clone());
                Some(compiled)
            }
            Err(err) => {
                tracing::warn!(pattern, %err, "skipping permission with invalid uri pattern");
                None
            }
        }
    }

    /// Grant/deny resolution across the evaluation set
    fn resolve(&self, origin: PrincipalRef, uri: &str, verb: Verb) -> AcsResult<AccessDecision> {
        let members = self.evaluation_set(origin)?;
        let mut steps = vec![EvaluationStep::on(
            origin,
            format!(
                "evaluation set of {} member(s) for {} {}",
                members.len(),
                verb,
                uri
            ),
        )];

        let mut matches: Vec<MatchedRow> = Vec::new();
        for member in &members {
            let principal = self.graph.get(member.principal)?;
            for permission in &principal.permissions {
                if !permission.verb.matches(verb) {
                    continue;
                }
                let Some(pattern) = self.compiled(&permission.uri) else {
                    continue;
                };
                if !pattern.matches(uri) {
                    continue;
                }
                steps.push(EvaluationStep::on(
                    member.principal,
                    format!(
                        "{} matched pattern {} ({})",
                        member.name,
                        permission.uri,
                        if permission.deny { "deny" } else { "grant" }
                    ),
                ));
                matches.push(MatchedRow {
                    owner: member.principal,
                    owner_name: member.name.clone(),
                    path: member.path.clone(),
                    permission: permission.clone(),
                    specificity: pattern.specificity(),
                });
            }
        }

        // Deny dominates regardless of where the grant sits (a direct grant
        // does not outrank an ancestor deny).
        if let Some(denied) = matches.iter().find(|m| m.permission.deny) {
            let mut decision = AccessDecision::empty(
                AccessOutcome::Denied,
                format!(
                    "denied by {} {:?} on pattern {}",
                    denied.owner.kind, denied.owner_name, denied.permission.uri
                ),
            );
            decision.inheritance_chain = denied.path.clone();
            decision.steps = steps;
            return Ok(decision);
        }

        let mut grants: Vec<&MatchedRow> = matches.iter().filter(|m| m.permission.grant).collect();
        // Most specific pattern first; the shorter inheritance path breaks
        // ties so a direct grant beats an equally-specific inherited one.
        grants.sort_by(|a, b| {
            b.specificity
                .cmp(&a.specificity)
                .then(a.path.len().cmp(&b.path.len()))
        });

        if let Some(winner) = grants.first() {
            let mut decision = AccessDecision::empty(
                AccessOutcome::Granted,
                format!(
                    "granted by {} {:?} on pattern {}",
                    winner.owner.kind, winner.owner_name, winner.permission.uri
                ),
            );
            decision.granting = vec![winner.permission.clone()];
            decision.inheritance_chain = winner.path.clone();
            decision.steps = steps;
            return Ok(decision);
        }

        let mut decision = AccessDecision::empty(
            AccessOutcome::NotGranted,
            format!("no permission matches {verb} {uri}"),
        );
        decision.inheritance_chain = vec![origin];
        decision.steps = steps;
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Permission;

    fn fixture() -> (Arc<EntityGraph>, PermissionEvaluator) {
        let graph = Arc::new(EntityGraph::new());
        let evaluator = PermissionEvaluator::new(graph.clone());
        (graph, evaluator)
    }

    #[test]
    fn test_grant_through_group() {
        let (graph, evaluator) = fixture();
        let g1 = graph.create(PrincipalKind::Group, "g1").unwrap();
        let u1 = graph.create(PrincipalKind::User, "u1").unwrap();
        graph.link(g1.as_ref(), u1.as_ref()).unwrap();
        graph
            .upsert_permission(
                g1.as_ref(),
                Permission::new(1, g1.id, "/orders/*", Verb::Get, false),
            )
            .unwrap();

        let decision = evaluator.check(u1.as_ref(), "/orders/123", Verb::Get).unwrap();
        assert!(decision.is_granted());
        assert_eq!(decision.inheritance_chain, vec![u1.as_ref(), g1.as_ref()]);

        let decision = evaluator.check(u1.as_ref(), "/orders/123", Verb::Post).unwrap();
        assert_eq!(decision.outcome, AccessOutcome::NotGranted);
    }

    #[test]
    fn test_ancestor_deny_dominates_direct_grant() {
        let (graph, evaluator) = fixture();
        let g1 = graph.create(PrincipalKind::Group, "g1").unwrap();
        let g2 = graph.create(PrincipalKind::Group, "g2").unwrap();
        let u1 = graph.create(PrincipalKind::User, "u1").unwrap();
        graph.link(g1.as_ref(), u1.as_ref()).unwrap();
        graph.link(g2.as_ref(), g1.as_ref()).unwrap();
        graph
            .upsert_permission(
                u1.as_ref(),
                Permission::new(1, u1.id, "/orders/*", Verb::Get, false),
            )
            .unwrap();
        graph
            .upsert_permission(
                g2.as_ref(),
                Permission::new(2, g2.id, "/orders/*", Verb::Get, true),
            )
            .unwrap();

        let decision = evaluator.check(u1.as_ref(), "/orders/1", Verb::Get).unwrap();
        assert!(decision.is_denied());
        assert!(decision.reason.contains("g2"));
    }

    #[test]
    fn test_roles_reached_through_groups() {
        let (graph, evaluator) = fixture();
        let group = graph.create(PrincipalKind::Group, "ops").unwrap();
        let role = graph.create(PrincipalKind::Role, "admin").unwrap();
        let user = graph.create(PrincipalKind::User, "alice").unwrap();
        graph.link(group.as_ref(), user.as_ref()).unwrap();
        graph.link(group.as_ref(), role.as_ref()).unwrap();
        graph
            .upsert_permission(
                role.as_ref(),
                Permission::new(1, role.id, "/admin/*", Verb::All, false),
            )
            .unwrap();

        let decision = evaluator.check(user.as_ref(), "/admin/settings", Verb::Delete).unwrap();
        assert!(decision.is_granted());
        assert_eq!(
            decision.inheritance_chain,
            vec![user.as_ref(), group.as_ref(), role.as_ref()]
        );
    }

    #[test]
    fn test_specificity_prefers_exact_over_wildcard() {
        let (graph, evaluator) = fixture();
        let user = graph.create(PrincipalKind::User, "alice").unwrap();
        graph
            .upsert_permission(
                user.as_ref(),
                Permission::new(1, user.id, "/a/*", Verb::Get, false),
            )
            .unwrap();
        graph
            .upsert_permission(
                user.as_ref(),
                Permission::new(2, user.id, "/a/b/{x}", Verb::Get, false),
            )
            .unwrap();

        let decision = evaluator.check(user.as_ref(), "/a/b/42", Verb::Get).unwrap();
        assert_eq!(decision.granting[0].uri, "/a/b/{x}");

        let decision = evaluator.check(user.as_ref(), "/a/c", Verb::Get).unwrap();
        assert_eq!(decision.granting[0].uri, "/a/*");
    }

    #[test]
    fn test_failed_condition_demotes_to_denied() {
        let (graph, evaluator) = fixture();
        let user = graph.create(PrincipalKind::User, "alice").unwrap();
        let permission = Permission::new(1, user.id, "/reports", Verb::Get, false)
            .with_conditions(vec![AccessCondition::TimeOfDay {
                start_hour: 8,
                end_hour: 18,
            }]);
        graph.upsert_permission(user.as_ref(), permission).unwrap();

        let three_am = ConditionContext::at(
            chrono::TimeZone::with_ymd_and_hms(&chrono::Utc, 2026, 3, 2, 3, 0, 0).unwrap(),
        );
        let decision = evaluator
            .evaluate(user.as_ref(), "/reports", Verb::Get, &three_am)
            .unwrap();
        assert!(decision.has_permission);
        assert!(!decision.has_access);
        assert!(decision.is_denied());
        assert!(decision.reason.contains("hour"));

        let noon = ConditionContext::at(
            chrono::TimeZone::with_ymd_and_hms(&chrono::Utc, 2026, 3, 2, 12, 0, 0).unwrap(),
        );
        let decision = evaluator
            .evaluate(user.as_ref(), "/reports", Verb::Get, &noon)
            .unwrap();
        assert!(decision.has_access);
    }
}
