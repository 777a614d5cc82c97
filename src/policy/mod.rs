//! Conflict resolution under the fixed constitution.
//!
//! Resolution order: Safety > Quality > Emissions > Cost. A conflicted
//! proposal set is first offered to the reasoning oracle; if the oracle is
//! unreachable, times out, or returns a decision that violates the
//! constitution, the deterministic fallback resolves instead. Resolution
//! therefore always terminates with a decision.

pub mod oracle;

pub use oracle::{ChannelOracle, ReasoningOracle};

use crate::domain::types::{ConversationId, PriorityClass, ProposalId, RequestId};
use crate::domain::{
    Conflict, DecidedAction, Decision, DecisionId, DecisionKind, EngineError, Proposal,
    TimestampUtc,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

/// Everything the oracle needs to rank one conflicted proposal set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringRequest {
    pub request_id: RequestId,
    pub conversation_id: ConversationId,
    pub proposals: Vec<Proposal>,
    pub conflicts: Vec<Conflict>,
    /// The constitution, highest priority first. Sent so the oracle never has
    /// to hardcode it.
    pub constitution: Vec<PriorityClass>,
}

impl ScoringRequest {
    pub fn new(
        request_id: RequestId,
        conversation_id: ConversationId,
        proposals: Vec<Proposal>,
        conflicts: Vec<Conflict>,
    ) -> Self {
        Self {
            request_id,
            conversation_id,
            proposals,
            conflicts,
            constitution: PriorityClass::CONSTITUTION.to_vec(),
        }
    }
}

/// Produces the decision for one proposal set. Infallible: oracle trouble
/// degrades to the deterministic fallback, never to an error.
pub async fn resolve(
    oracle: &dyn ReasoningOracle,
    request: &ScoringRequest,
    oracle_timeout: Duration,
) -> Decision {
    if request.proposals.is_empty() {
        return Decision::none_required(request.request_id);
    }
    if request.conflicts.is_empty() {
        return approve_all(request);
    }

    match tokio::time::timeout(oracle_timeout, oracle.score(request)).await {
        Ok(Ok(decision)) => match check_compliance(&decision, request) {
            Ok(()) => {
                tracing::info!(
                    request_id = %request.request_id,
                    decision_id = %decision.decision_id,
                    kind = ?decision.kind,
                    "oracle decision accepted"
                );
                decision
            }
            Err(err) => {
                tracing::warn!(
                    request_id = %request.request_id,
                    error = %err,
                    "oracle decision rejected, using deterministic fallback"
                );
                fallback(request)
            }
        },
        Ok(Err(err)) => {
            tracing::warn!(
                request_id = %request.request_id,
                error = %err,
                "oracle unavailable, using deterministic fallback"
            );
            fallback(request)
        }
        Err(_) => {
            tracing::warn!(
                request_id = %request.request_id,
                "oracle timed out, using deterministic fallback"
            );
            fallback(request)
        }
    }
}

/// Constitutional check applied to every oracle decision before it is
/// trusted: on any one control variable, no approved action may come from a
/// lower class than a rejected action.
pub fn check_compliance(
    decision: &Decision,
    request: &ScoringRequest,
) -> Result<(), EngineError> {
    if decision.request_id != request.request_id {
        return Err(EngineError::PolicyInvariantViolation {
            message: format!(
                "decision answers request {} but {} was scored",
                decision.request_id, request.request_id
            ),
        });
    }
    if !(0.0..=1.0).contains(&decision.confidence) {
        return Err(EngineError::PolicyInvariantViolation {
            message: format!("decision confidence {} outside [0, 1]", decision.confidence),
        });
    }

    let classes: HashMap<ProposalId, PriorityClass> = request
        .proposals
        .iter()
        .map(|p| (p.proposal_id, p.priority_class))
        .collect();

    for decided in decision
        .approved_actions
        .iter()
        .chain(decision.rejected_actions.iter())
    {
        if !classes.contains_key(&decided.proposal_id) {
            return Err(EngineError::PolicyInvariantViolation {
                message: format!(
                    "decision references unknown proposal {}",
                    decided.proposal_id
                ),
            });
        }
    }

    let mut weakest_approved: BTreeMap<&str, PriorityClass> = BTreeMap::new();
    for decided in &decision.approved_actions {
        let class = classes[&decided.proposal_id];
        let entry = weakest_approved
            .entry(decided.action.control_variable.as_str())
            .or_insert(class);
        *entry = (*entry).min(class);
    }
    for decided in &decision.rejected_actions {
        let class = classes[&decided.proposal_id];
        if let Some(approved) = weakest_approved.get(decided.action.control_variable.as_str()) {
            if class > *approved {
                return Err(EngineError::PolicyInvariantViolation {
                    message: format!(
                        "{} approved for class {} while rejecting class {}",
                        decided.action.control_variable, approved, class
                    ),
                });
            }
        }
    }
    Ok(())
}

fn approve_all(request: &ScoringRequest) -> Decision {
    let approved = decided_actions(request.proposals.iter());
    let confidence = min_confidence(request.proposals.iter());
    Decision {
        decision_id: DecisionId::new(),
        request_id: request.request_id,
        kind: DecisionKind::Approved,
        approved_actions: approved,
        rejected_actions: Vec::new(),
        modifications: Vec::new(),
        rationale: "no conflicts detected; all proposals approved as submitted".to_string(),
        confidence,
        constitutional_compliance: true,
        human_approval_required: false,
        human_approval: None,
        supersedes: None,
        decided_at: TimestampUtc::now(),
    }
}

/// Deterministic resolution used whenever the oracle cannot be trusted.
///
/// Among conflicted proposals the highest constitutional class wins, with
/// urgency as the tiebreak inside that class. If the survivors of both rules
/// still conflict with each other, the decision is deferred to a human.
/// Proposals untouched by any conflict are approved alongside the winners.
fn fallback(request: &ScoringRequest) -> Decision {
    let conflicted: BTreeSet<ProposalId> = request
        .conflicts
        .iter()
        .flat_map(|c| c.involved.iter().copied())
        .collect();

    let top_class = request
        .proposals
        .iter()
        .filter(|p| conflicted.contains(&p.proposal_id))
        .map(|p| p.priority_class)
        .max()
        .unwrap_or(PriorityClass::Cost);
    let candidates: Vec<&Proposal> = request
        .proposals
        .iter()
        .filter(|p| conflicted.contains(&p.proposal_id) && p.priority_class == top_class)
        .collect();
    let top_urgency = candidates
        .iter()
        .map(|p| p.urgency)
        .max()
        .unwrap_or_default();
    let winners: BTreeSet<ProposalId> = candidates
        .iter()
        .filter(|p| p.urgency == top_urgency)
        .map(|p| p.proposal_id)
        .collect();

    let winners_still_conflict = request.conflicts.iter().any(|c| {
        c.involved
            .iter()
            .filter(|id| winners.contains(*id))
            .count()
            > 1
    });
    if winners.len() > 1 && winners_still_conflict {
        return Decision {
            decision_id: DecisionId::new(),
            request_id: request.request_id,
            kind: DecisionKind::Deferred,
            approved_actions: Vec::new(),
            rejected_actions: Vec::new(),
            modifications: Vec::new(),
            rationale: format!(
                "conflicting {} proposals with equal urgency cannot be ranked \
                 deterministically; deferring to a human operator",
                top_class
            ),
            confidence: 1.0,
            constitutional_compliance: true,
            human_approval_required: true,
            human_approval: None,
            supersedes: None,
            decided_at: TimestampUtc::now(),
        };
    }

    let approved_proposals: Vec<&Proposal> = request
        .proposals
        .iter()
        .filter(|p| winners.contains(&p.proposal_id) || !conflicted.contains(&p.proposal_id))
        .collect();
    let rejected_proposals: Vec<&Proposal> = request
        .proposals
        .iter()
        .filter(|p| conflicted.contains(&p.proposal_id) && !winners.contains(&p.proposal_id))
        .collect();

    let confidence = min_confidence(approved_proposals.iter().copied());
    Decision {
        decision_id: DecisionId::new(),
        request_id: request.request_id,
        kind: DecisionKind::Approved,
        approved_actions: decided_actions(approved_proposals.into_iter()),
        rejected_actions: decided_actions(rejected_proposals.into_iter()),
        modifications: Vec::new(),
        rationale: format!(
            "deterministic resolution: {} proposals outrank the rest under the \
             constitution, urgency breaking ties within the class",
            top_class
        ),
        confidence,
        constitutional_compliance: true,
        human_approval_required: false,
        human_approval: None,
        supersedes: None,
        decided_at: TimestampUtc::now(),
    }
}

fn decided_actions<'a>(proposals: impl Iterator<Item = &'a Proposal>) -> Vec<DecidedAction> {
    proposals
        .flat_map(|p| {
            p.actions.iter().map(|a| DecidedAction {
                proposal_id: p.proposal_id,
                action: a.clone(),
            })
        })
        .collect()
}

fn min_confidence<'a>(proposals: impl Iterator<Item = &'a Proposal>) -> f64 {
    proposals.map(|p| p.confidence).fold(1.0, f64::min)
}
