//! Concurrent proposal collection with per-proposer timeouts.
//!
//! One `request_proposal` envelope goes out per registered proposer. A
//! proposer that fails, times out, or replies with garbage is recorded as a
//! `ProposerError` and excluded; the workflow proceeds with whatever arrived.

use crate::domain::types::{AgentId, PriorityClass};
use crate::domain::{EngineError, Proposal, ProposerError, WorkflowRequest};
use crate::protocol::{
    AgentMessage, EngineIdentity, MessageChannel, MessageKind, MessagePriority,
};
use futures::future::join_all;
use std::time::Duration;

/// A registered proposer, resolved by the caller from configuration.
///
/// Carries the constitutional class the operator granted this proposer; the
/// class on the wire is ignored so a proposer cannot promote itself.
#[derive(Debug, Clone)]
pub struct ProposerRef {
    pub id: AgentId,
    pub priority_class: PriorityClass,
}

/// Requests one proposal from every proposer concurrently.
///
/// Never fails as a whole: the result partitions proposers into proposals
/// and errors. Re-running a collection is safe; the workflow treats it as
/// idempotent.
pub async fn collect(
    channel: &dyn MessageChannel,
    identity: &EngineIdentity,
    request: &WorkflowRequest,
    proposers: &[ProposerRef],
    timeout: Duration,
) -> (Vec<Proposal>, Vec<ProposerError>) {
    let rounds = proposers.iter().map(|proposer| {
        let envelope = request_envelope(identity, request, proposer);
        async move {
            let outcome =
                tokio::time::timeout(timeout, channel.send(envelope)).await;
            (proposer, outcome)
        }
    });

    let mut proposals = Vec::new();
    let mut errors = Vec::new();

    for (proposer, outcome) in join_all(rounds).await {
        match outcome {
            Ok(Ok(reply)) => match parse_proposal(&reply, request, proposer) {
                Ok(proposal) => proposals.push(proposal),
                Err(err) => errors.push(ProposerError {
                    proposer_id: proposer.id.clone(),
                    reason: err.to_string(),
                }),
            },
            Ok(Err(err)) => errors.push(ProposerError {
                proposer_id: proposer.id.clone(),
                reason: err.to_string(),
            }),
            Err(_) => errors.push(ProposerError {
                proposer_id: proposer.id.clone(),
                reason: "timeout".to_string(),
            }),
        }
    }

    // Canonical order keeps downstream detection independent of reply
    // arrival order.
    proposals.sort_by_key(|p| p.proposal_id);
    errors.sort_by(|a, b| a.proposer_id.cmp(&b.proposer_id));

    tracing::info!(
        request_id = %request.request_id,
        collected = proposals.len(),
        failed = errors.len(),
        "proposal collection finished"
    );

    (proposals, errors)
}

fn request_envelope(
    identity: &EngineIdentity,
    request: &WorkflowRequest,
    proposer: &ProposerRef,
) -> AgentMessage {
    AgentMessage::outbound(
        request.conversation_id,
        request.request_id,
        identity.agent_id.clone(),
        proposer.id.clone(),
        MessageKind::RequestProposal,
        MessagePriority::High,
        serde_json::json!({
            "request_id": request.request_id,
            "trigger": request.trigger,
            "context": request.context,
        }),
        identity.credential.clone(),
    )
}

fn parse_proposal(
    reply: &AgentMessage,
    request: &WorkflowRequest,
    proposer: &ProposerRef,
) -> Result<Proposal, EngineError> {
    if reply.kind != MessageKind::Proposal {
        return Err(EngineError::Protocol {
            message: format!("expected proposal envelope, got {}", reply.kind),
        });
    }
    let mut proposal: Proposal =
        serde_json::from_value(reply.payload.clone()).map_err(|e| EngineError::Protocol {
            message: format!("invalid proposal payload: {}", e),
        })?;
    if proposal.request_id != request.request_id {
        return Err(EngineError::Protocol {
            message: format!(
                "proposal answers request {} but {} was asked",
                proposal.request_id, request.request_id
            ),
        });
    }
    if !(0.0..=1.0).contains(&proposal.confidence) {
        return Err(EngineError::Protocol {
            message: format!("confidence {} outside [0, 1]", proposal.confidence),
        });
    }
    // The operator's registration is authoritative for both identity and
    // constitutional class.
    proposal.proposer_id = proposer.id.clone();
    proposal.priority_class = proposer.priority_class;
    Ok(proposal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{ProposalId, TriggerKind, Urgency};
    use crate::domain::proposal::ProposedAction;
    use crate::protocol::BearerToken;
    use async_trait::async_trait;
    use std::collections::HashMap;

    enum Script {
        Reply(Proposal),
        Hang,
        Fail,
        Garbage,
    }

    struct ScriptedProposers {
        scripts: HashMap<AgentId, Script>,
    }

    #[async_trait]
    impl MessageChannel for ScriptedProposers {
        async fn send(&self, message: AgentMessage) -> Result<AgentMessage, EngineError> {
            match self.scripts.get(&message.recipient_id) {
                Some(Script::Reply(proposal)) => Ok(AgentMessage::outbound(
                    message.conversation_id,
                    message.correlation_id,
                    message.recipient_id,
                    message.sender_id,
                    MessageKind::Proposal,
                    MessagePriority::Normal,
                    serde_json::to_value(proposal).unwrap(),
                    BearerToken::new("proposer-token"),
                )),
                Some(Script::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!("collection timeout fires first")
                }
                Some(Script::Fail) => Err(EngineError::DeliveryFailed {
                    recipient: message.recipient_id.to_string(),
                    attempts: 3,
                    message: "proposer crashed".to_string(),
                }),
                Some(Script::Garbage) => Ok(AgentMessage::outbound(
                    message.conversation_id,
                    message.correlation_id,
                    message.recipient_id,
                    message.sender_id,
                    MessageKind::Proposal,
                    MessagePriority::Normal,
                    serde_json::json!({"not": "a proposal"}),
                    BearerToken::new("proposer-token"),
                )),
                None => panic!("unscripted recipient {}", message.recipient_id),
            }
        }
    }

    fn identity() -> EngineIdentity {
        EngineIdentity {
            agent_id: "conductor".into(),
            credential: BearerToken::new("engine-token"),
        }
    }

    fn request() -> WorkflowRequest {
        WorkflowRequest::new(TriggerKind::QualityDeviation, serde_json::json!({}))
    }

    fn proposal_for(request: &WorkflowRequest) -> Proposal {
        Proposal {
            proposal_id: ProposalId::new(),
            request_id: request.request_id,
            proposer_id: "placeholder".into(),
            priority_class: PriorityClass::Safety, // wire value, must be overridden
            urgency: Urgency::High,
            actions: vec![ProposedAction {
                control_variable: "kiln_speed".into(),
                current_value: 3.2,
                proposed_value: 3.35,
            }],
            expected_outcome: "free lime back in band".to_string(),
            confidence: 0.85,
            constraints: vec![],
        }
    }

    #[tokio::test]
    async fn timeout_of_one_proposer_does_not_abort_collection() {
        let request = request();
        let mut scripts = HashMap::new();
        scripts.insert(
            AgentId::from("kiln-quality"),
            Script::Reply(proposal_for(&request)),
        );
        scripts.insert(AgentId::from("slowpoke"), Script::Hang);
        let channel = ScriptedProposers { scripts };

        let proposers = vec![
            ProposerRef {
                id: "kiln-quality".into(),
                priority_class: PriorityClass::Quality,
            },
            ProposerRef {
                id: "slowpoke".into(),
                priority_class: PriorityClass::Cost,
            },
        ];

        let (proposals, errors) = collect(
            &channel,
            &identity(),
            &request,
            &proposers,
            Duration::from_millis(50),
        )
        .await;

        assert_eq!(proposals.len(), 1);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].proposer_id, AgentId::from("slowpoke"));
        assert_eq!(errors[0].reason, "timeout");
    }

    #[tokio::test]
    async fn registered_class_overrides_wire_class() {
        let request = request();
        let mut scripts = HashMap::new();
        scripts.insert(
            AgentId::from("market"),
            Script::Reply(proposal_for(&request)),
        );
        let channel = ScriptedProposers { scripts };

        let proposers = vec![ProposerRef {
            id: "market".into(),
            priority_class: PriorityClass::Cost,
        }];

        let (proposals, errors) = collect(
            &channel,
            &identity(),
            &request,
            &proposers,
            Duration::from_millis(200),
        )
        .await;

        assert!(errors.is_empty());
        // The proposer claimed Safety on the wire; registration wins.
        assert_eq!(proposals[0].priority_class, PriorityClass::Cost);
        assert_eq!(proposals[0].proposer_id, AgentId::from("market"));
    }

    #[tokio::test]
    async fn garbage_and_failures_become_proposer_errors() {
        let request = request();
        let mut scripts = HashMap::new();
        scripts.insert(AgentId::from("broken"), Script::Garbage);
        scripts.insert(AgentId::from("crashed"), Script::Fail);
        let channel = ScriptedProposers { scripts };

        let proposers = vec![
            ProposerRef {
                id: "broken".into(),
                priority_class: PriorityClass::Quality,
            },
            ProposerRef {
                id: "crashed".into(),
                priority_class: PriorityClass::Emissions,
            },
        ];

        let (proposals, errors) = collect(
            &channel,
            &identity(),
            &request,
            &proposers,
            Duration::from_millis(200),
        )
        .await;

        assert!(proposals.is_empty());
        assert_eq!(errors.len(), 2);
    }

    #[tokio::test]
    async fn no_proposers_yields_empty_result() {
        let channel = ScriptedProposers {
            scripts: HashMap::new(),
        };
        let (proposals, errors) = collect(
            &channel,
            &identity(),
            &request(),
            &[],
            Duration::from_millis(50),
        )
        .await;
        assert!(proposals.is_empty());
        assert!(errors.is_empty());
    }
}
