//! Dispatch of approved actions to the command executor.
//!
//! One `command` envelope per approved action, sent sequentially because
//! action order within a decision is meaningful to the executor. A failed
//! delivery or a refused command becomes a failed `CommandResult`; dispatch
//! itself never aborts the batch.

use crate::domain::types::{AgentId, ConversationId, MessageId, RequestId, TimestampUtc};
use crate::domain::{CommandResult, DecidedAction, Decision};
use crate::protocol::{
    AgentMessage, EngineIdentity, MessageChannel, MessageKind, MessagePriority,
};
use serde::Deserialize;
use std::time::Duration;
use uuid::Uuid;

/// What the executor reports back for one command.
#[derive(Debug, Deserialize)]
struct ExecutorReport {
    success: bool,
    #[serde(default)]
    executed_value: Option<f64>,
    #[serde(default)]
    failure_reason: Option<String>,
}

/// Sends every approved action of `decision` to the executor and collects
/// one result per action, in action order.
pub async fn dispatch(
    channel: &dyn MessageChannel,
    identity: &EngineIdentity,
    executor_id: &AgentId,
    conversation_id: ConversationId,
    request_id: RequestId,
    decision: &Decision,
    command_timeout: Duration,
) -> Vec<CommandResult> {
    let mut results = Vec::with_capacity(decision.approved_actions.len());
    for (index, decided) in decision.approved_actions.iter().enumerate() {
        let envelope = command_envelope(
            identity,
            executor_id,
            conversation_id,
            request_id,
            decision,
            decided,
        )
        .with_message_id(command_message_id(decision, index));
        let outcome = tokio::time::timeout(command_timeout, channel.send(envelope)).await;
        let result = match outcome {
            Ok(Ok(reply)) => interpret_reply(&reply, executor_id, decision, decided),
            Ok(Err(err)) => failed(executor_id, decision, decided, err.to_string()),
            Err(_) => failed(executor_id, decision, decided, "timeout".to_string()),
        };
        if !result.success {
            tracing::warn!(
                decision_id = %decision.decision_id,
                control_variable = %result.control_variable,
                reason = result.failure_reason.as_deref().unwrap_or("unknown"),
                "command failed"
            );
        }
        results.push(result);
    }
    results
}

/// Summarizes a partially failed batch for the workflow record. `None` when
/// every command succeeded.
pub fn execution_note(results: &[CommandResult]) -> Option<String> {
    let failed: Vec<&CommandResult> = results.iter().filter(|r| !r.success).collect();
    if failed.is_empty() {
        return None;
    }
    let variables: Vec<&str> = failed
        .iter()
        .map(|r| r.control_variable.as_str())
        .collect();
    Some(format!(
        "{} of {} commands failed: {}",
        failed.len(),
        results.len(),
        variables.join(", ")
    ))
}

/// Command idempotency keys are derived from the decision and the action's
/// position, so a workflow resumed at `executing` re-sends each command under
/// the id the interrupted run used and receivers can deduplicate.
fn command_message_id(decision: &Decision, index: usize) -> MessageId {
    MessageId(Uuid::new_v5(
        &decision.decision_id.0,
        format!("command-{}", index).as_bytes(),
    ))
}

fn command_envelope(
    identity: &EngineIdentity,
    executor_id: &AgentId,
    conversation_id: ConversationId,
    request_id: RequestId,
    decision: &Decision,
    decided: &DecidedAction,
) -> AgentMessage {
    AgentMessage::outbound(
        conversation_id,
        request_id,
        identity.agent_id.clone(),
        executor_id.clone(),
        MessageKind::Command,
        MessagePriority::Critical,
        serde_json::json!({
            "decision_id": decision.decision_id,
            "proposal_id": decided.proposal_id,
            "control_variable": decided.action.control_variable,
            "current_value": decided.action.current_value,
            "target_value": decided.action.proposed_value,
        }),
        identity.credential.clone(),
    )
}

fn interpret_reply(
    reply: &AgentMessage,
    executor_id: &AgentId,
    decision: &Decision,
    decided: &DecidedAction,
) -> CommandResult {
    if reply.kind != MessageKind::Data {
        return failed(
            executor_id,
            decision,
            decided,
            format!("executor answered with {} envelope", reply.kind),
        );
    }
    match serde_json::from_value::<ExecutorReport>(reply.payload.clone()) {
        Ok(report) => CommandResult {
            decision_id: decision.decision_id,
            executor_id: executor_id.clone(),
            control_variable: decided.action.control_variable.clone(),
            requested_value: decided.action.proposed_value,
            success: report.success,
            executed_value: report.executed_value,
            failure_reason: report.failure_reason,
            completed_at: TimestampUtc::now(),
        },
        Err(e) => failed(
            executor_id,
            decision,
            decided,
            format!("unreadable executor report: {}", e),
        ),
    }
}

fn failed(
    executor_id: &AgentId,
    decision: &Decision,
    decided: &DecidedAction,
    reason: String,
) -> CommandResult {
    CommandResult {
        decision_id: decision.decision_id,
        executor_id: executor_id.clone(),
        control_variable: decided.action.control_variable.clone(),
        requested_value: decided.action.proposed_value,
        success: false,
        executed_value: None,
        failure_reason: Some(reason),
        completed_at: TimestampUtc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{DecisionId, ProposalId};
    use crate::domain::proposal::ProposedAction;
    use crate::domain::{DecisionKind, EngineError};
    use crate::protocol::BearerToken;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedExecutor {
        // One payload (or None for a delivery failure) per expected command.
        replies: Mutex<Vec<Option<serde_json::Value>>>,
        seen_ids: Mutex<Vec<MessageId>>,
    }

    impl ScriptedExecutor {
        fn new(replies: Vec<Option<serde_json::Value>>) -> Self {
            Self {
                replies: Mutex::new(replies),
                seen_ids: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MessageChannel for ScriptedExecutor {
        async fn send(&self, message: AgentMessage) -> Result<AgentMessage, EngineError> {
            self.seen_ids.lock().unwrap().push(message.message_id);
            let next = self
                .replies
                .lock()
                .unwrap()
                .remove(0);
            match next {
                Some(payload) => Ok(AgentMessage::outbound(
                    message.conversation_id,
                    message.correlation_id,
                    message.recipient_id,
                    message.sender_id,
                    MessageKind::Data,
                    MessagePriority::Normal,
                    payload,
                    BearerToken::new("executor-token"),
                )),
                None => Err(EngineError::DeliveryFailed {
                    recipient: message.recipient_id.to_string(),
                    attempts: 3,
                    message: "executor offline".to_string(),
                }),
            }
        }
    }

    fn decision_with_actions(variables: &[&str]) -> Decision {
        let approved = variables
            .iter()
            .map(|v| DecidedAction {
                proposal_id: ProposalId::new(),
                action: ProposedAction {
                    control_variable: (*v).into(),
                    current_value: 1.0,
                    proposed_value: 2.0,
                },
            })
            .collect();
        Decision {
            decision_id: DecisionId::new(),
            request_id: RequestId::new(),
            kind: DecisionKind::Approved,
            approved_actions: approved,
            rejected_actions: Vec::new(),
            modifications: Vec::new(),
            rationale: "approved".to_string(),
            confidence: 0.9,
            constitutional_compliance: true,
            human_approval_required: false,
            human_approval: None,
            supersedes: None,
            decided_at: TimestampUtc::now(),
        }
    }

    fn identity() -> EngineIdentity {
        EngineIdentity {
            agent_id: "conductor".into(),
            credential: BearerToken::new("engine-token"),
        }
    }

    #[tokio::test]
    async fn each_approved_action_yields_one_result() {
        let decision = decision_with_actions(&["kiln_speed", "fuel_flow"]);
        let channel = ScriptedExecutor::new(vec![
            Some(serde_json::json!({"success": true, "executed_value": 2.0})),
            Some(serde_json::json!({"success": true, "executed_value": 2.0})),
        ]);

        let results = dispatch(
            &channel,
            &identity(),
            &"plant-executor".into(),
            ConversationId::new(),
            decision.request_id,
            &decision,
            Duration::from_millis(200),
        )
        .await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.success));
        assert_eq!(results[0].control_variable.as_str(), "kiln_speed");
        assert_eq!(results[1].control_variable.as_str(), "fuel_flow");
        assert!(execution_note(&results).is_none());
    }

    #[tokio::test]
    async fn delivery_failure_becomes_a_failed_result() {
        let decision = decision_with_actions(&["kiln_speed", "fuel_flow"]);
        let channel = ScriptedExecutor::new(vec![
            Some(serde_json::json!({"success": true, "executed_value": 2.0})),
            None,
        ]);

        let results = dispatch(
            &channel,
            &identity(),
            &"plant-executor".into(),
            ConversationId::new(),
            decision.request_id,
            &decision,
            Duration::from_millis(200),
        )
        .await;

        assert_eq!(results.len(), 2);
        assert!(results[0].success);
        assert!(!results[1].success);
        let note = execution_note(&results).expect("partial failure noted");
        assert!(note.contains("1 of 2"));
        assert!(note.contains("fuel_flow"));
    }

    #[tokio::test]
    async fn executor_refusal_carries_its_reason() {
        let decision = decision_with_actions(&["kiln_speed"]);
        let channel = ScriptedExecutor::new(vec![Some(serde_json::json!({
            "success": false,
            "failure_reason": "interlock engaged",
        }))]);

        let results = dispatch(
            &channel,
            &identity(),
            &"plant-executor".into(),
            ConversationId::new(),
            decision.request_id,
            &decision,
            Duration::from_millis(200),
        )
        .await;

        assert!(!results[0].success);
        assert_eq!(
            results[0].failure_reason.as_deref(),
            Some("interlock engaged")
        );
    }

    #[tokio::test]
    async fn redispatch_reuses_the_command_message_ids() {
        let decision = decision_with_actions(&["kiln_speed", "fuel_flow"]);
        let ok = serde_json::json!({"success": true});
        let channel = ScriptedExecutor::new(vec![
            Some(ok.clone()),
            Some(ok.clone()),
            Some(ok.clone()),
            Some(ok),
        ]);

        // Same decision dispatched twice, as a resume after a crash at
        // executing would do.
        for _ in 0..2 {
            let results = dispatch(
                &channel,
                &identity(),
                &"plant-executor".into(),
                ConversationId::new(),
                decision.request_id,
                &decision,
                Duration::from_millis(200),
            )
            .await;
            assert!(results.iter().all(|r| r.success));
        }

        let seen = channel.seen_ids.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0], seen[2]);
        assert_eq!(seen[1], seen[3]);
        assert_ne!(seen[0], seen[1]);
    }

    #[tokio::test]
    async fn unreadable_report_fails_the_command() {
        let decision = decision_with_actions(&["kiln_speed"]);
        let channel =
            ScriptedExecutor::new(vec![Some(serde_json::json!({"status": "whatever"}))]);

        let results = dispatch(
            &channel,
            &identity(),
            &"plant-executor".into(),
            ConversationId::new(),
            decision.request_id,
            &decision,
            Duration::from_millis(200),
        )
        .await;

        assert!(!results[0].success);
    }
}
