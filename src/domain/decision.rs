//! Decisions produced by the resolution policy engine.

use crate::domain::proposal::ProposedAction;
use crate::domain::types::{
    AgentId, ControlVariable, DecisionId, ProposalId, RequestId, TimestampUtc,
};
use serde::{Deserialize, Serialize};

/// Outcome category of a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Approved,
    Rejected,
    Modified,
    Deferred,
    /// No proposals arrived; nothing to decide.
    NoneRequired,
}

/// An action carried into a decision, attributed to its source proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecidedAction {
    pub proposal_id: ProposalId,
    pub action: ProposedAction,
}

/// A value adjustment the policy (or oracle) applied to a proposed action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionModification {
    pub proposal_id: ProposalId,
    pub control_variable: ControlVariable,
    pub original_value: f64,
    pub modified_value: f64,
    pub reason: String,
}

/// Verdict recorded when a human reviews a paused decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HumanVerdict {
    Approved,
    Rejected,
}

/// The persisted record of a human approval or rejection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanApproval {
    pub verdict: HumanVerdict,
    pub rationale: String,
    pub decided_at: TimestampUtc,
}

/// The single authoritative decision for a workflow request.
///
/// Immutable once the workflow reaches a terminal state. A deferred decision
/// may later be superseded only by a new `Decision` whose `supersedes` field
/// references this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub decision_id: DecisionId,
    pub request_id: RequestId,
    pub kind: DecisionKind,
    pub approved_actions: Vec<DecidedAction>,
    pub rejected_actions: Vec<DecidedAction>,
    pub modifications: Vec<ActionModification>,
    pub rationale: String,
    /// Confidence in [0, 1].
    pub confidence: f64,
    pub constitutional_compliance: bool,
    pub human_approval_required: bool,
    #[serde(default)]
    pub human_approval: Option<HumanApproval>,
    /// Prior decision this one replaces, if any.
    #[serde(default)]
    pub supersedes: Option<DecisionId>,
    pub decided_at: TimestampUtc,
}

impl Decision {
    /// Builds the `none_required` decision for a request that attracted no
    /// proposals.
    pub fn none_required(request_id: RequestId) -> Self {
        Self {
            decision_id: DecisionId::new(),
            request_id,
            kind: DecisionKind::NoneRequired,
            approved_actions: Vec::new(),
            rejected_actions: Vec::new(),
            modifications: Vec::new(),
            rationale: "no proposals were submitted for this request".to_string(),
            confidence: 1.0,
            constitutional_compliance: true,
            human_approval_required: false,
            human_approval: None,
            supersedes: None,
            decided_at: TimestampUtc::now(),
        }
    }

    /// Builds the terminal `rejected` decision that supersedes a decision a
    /// human operator rejected.
    pub fn rejected_by_human(prior: &Decision, rationale: String) -> Self {
        Self {
            decision_id: DecisionId::new(),
            request_id: prior.request_id,
            kind: DecisionKind::Rejected,
            approved_actions: Vec::new(),
            rejected_actions: prior.approved_actions.clone(),
            modifications: Vec::new(),
            rationale: rationale.clone(),
            confidence: 1.0,
            constitutional_compliance: true,
            human_approval_required: false,
            human_approval: Some(HumanApproval {
                verdict: HumanVerdict::Rejected,
                rationale,
                decided_at: TimestampUtc::now(),
            }),
            supersedes: Some(prior.decision_id),
            decided_at: TimestampUtc::now(),
        }
    }
}

/// Outcome of one dispatched command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub decision_id: DecisionId,
    pub executor_id: AgentId,
    pub control_variable: ControlVariable,
    pub requested_value: f64,
    pub success: bool,
    /// Value the executor reports it actually applied.
    pub executed_value: Option<f64>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub completed_at: TimestampUtc,
}
