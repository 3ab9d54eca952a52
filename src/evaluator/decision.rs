//! Access decision records
//!
//! Every evaluation returns a structured record: the outcome, the
//! controlling permissions, the inheritance chain that reached them, the
//! condition verdicts, and a step-by-step trace of how the evaluator got
//! there.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::evaluator::conditions::ConditionResult;
use crate::graph::{Permission, PrincipalRef};

/// Final outcome of a permission check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessOutcome {
    /// A matching grant was found and no deny dominates
    Granted,
    /// A matching deny dominates, or a condition failed
    Denied,
    /// No matching permission anywhere in the evaluation set
    NotGranted,
}

/// One entry of the evaluation trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationStep {
    /// Principal the step concerns, when applicable
    pub principal: Option<PrincipalRef>,
    /// What the evaluator observed
    pub detail: String,
}

impl EvaluationStep {
    /// Step tied to a principal
    pub fn on(principal: PrincipalRef, detail: impl Into<String>) -> Self {
        Self {
            principal: Some(principal),
            detail: detail.into(),
        }
    }

    /// Step not tied to a principal
    pub fn note(detail: impl Into<String>) -> Self {
        Self {
            principal: None,
            detail: detail.into(),
        }
    }
}

/// Result record for a permission check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessDecision {
    /// Final outcome
    pub outcome: AccessOutcome,

    /// Whether access is ultimately allowed
    pub has_access: bool,

    /// Whether a base grant resolved, before conditions
    pub has_permission: bool,

    /// Human-readable explanation of the outcome
    pub reason: String,

    /// The granting permission rows (empty unless granted at base)
    pub granting: Vec<Permission>,

    /// Path from the checked principal to the controlling ancestor
    pub inheritance_chain: Vec<PrincipalRef>,

    /// Verdicts of the conditions attached to the granting permission
    pub condition_results: Vec<ConditionResult>,

    /// Trace of evaluation steps, in order
    pub steps: Vec<EvaluationStep>,

    /// Wall-clock time the evaluation took
    pub elapsed: Duration,
}

impl AccessDecision {
    /// Decision with every collection empty, used as a builder base
    pub fn empty(outcome: AccessOutcome, reason: impl Into<String>) -> Self {
        Self {
            outcome,
            has_access: outcome == AccessOutcome::Granted,
            has_permission: outcome == AccessOutcome::Granted,
            reason: reason.into(),
            granting: Vec::new(),
            inheritance_chain: Vec::new(),
            condition_results: Vec::new(),
            steps: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    /// Whether the outcome is granted
    pub fn is_granted(&self) -> bool {
        self.outcome == AccessOutcome::Granted
    }

    /// Whether the outcome is denied
    pub fn is_denied(&self) -> bool {
        self.outcome == AccessOutcome::Denied
    }
}
