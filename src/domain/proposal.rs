//! Workflow requests and proposals.

use crate::domain::types::{
    AgentId, ControlVariable, ConversationId, PriorityClass, ProposalId, RequestId, TimestampUtc,
    TriggerKind, Urgency,
};
use serde::{Deserialize, Serialize};

/// An external trigger asking the engine to produce one decision.
///
/// Immutable: created once on the first external trigger and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRequest {
    pub request_id: RequestId,
    pub conversation_id: ConversationId,
    pub trigger: TriggerKind,
    /// Opaque structured payload forwarded to proposers verbatim.
    pub context: serde_json::Value,
    pub created_at: TimestampUtc,
}

impl WorkflowRequest {
    /// Creates a new request with fresh identifiers.
    pub fn new(trigger: TriggerKind, context: serde_json::Value) -> Self {
        Self {
            request_id: RequestId::new(),
            conversation_id: ConversationId::new(),
            trigger,
            context,
            created_at: TimestampUtc::now(),
        }
    }
}

/// A single control-variable adjustment proposed by a specialist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedAction {
    pub control_variable: ControlVariable,
    pub current_value: f64,
    pub proposed_value: f64,
}

impl ProposedAction {
    /// Signed delta this action would apply to its control variable.
    pub fn delta(&self) -> f64 {
        self.proposed_value - self.current_value
    }
}

/// One specialist's recommendation for a workflow request.
///
/// Immutable once stored. Several proposals per request are expected,
/// at most one per proposer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub proposal_id: ProposalId,
    pub request_id: RequestId,
    pub proposer_id: AgentId,
    /// Constitutional class this proposal is adjudicated under. The
    /// collector overwrites it with the proposer's registered class so a
    /// proposer cannot claim a higher class than it was granted.
    pub priority_class: PriorityClass,
    pub urgency: Urgency,
    /// Ordered list of adjustments; order is meaningful to the executor.
    pub actions: Vec<ProposedAction>,
    pub expected_outcome: String,
    /// Confidence in [0, 1].
    pub confidence: f64,
    /// Control variables this proposal declares a dependency on without
    /// adjusting them itself. Used for indirect-conflict detection.
    #[serde(default)]
    pub constraints: Vec<ControlVariable>,
}

impl Proposal {
    /// Returns true if any action of this proposal targets `variable`.
    pub fn targets(&self, variable: &ControlVariable) -> bool {
        self.actions.iter().any(|a| &a.control_variable == variable)
    }

    /// The action targeting `variable`, if any.
    pub fn action_for(&self, variable: &ControlVariable) -> Option<&ProposedAction> {
        self.actions.iter().find(|a| &a.control_variable == variable)
    }
}

/// Why a proposer contributed nothing to a collection round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposerError {
    pub proposer_id: AgentId,
    pub reason: String,
}
