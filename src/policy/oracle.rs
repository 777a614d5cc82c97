//! Reasoning-oracle port and its message-channel adapter.

use crate::domain::types::AgentId;
use crate::domain::{Decision, EngineError};
use crate::policy::ScoringRequest;
use crate::protocol::{
    AgentMessage, EngineIdentity, MessageChannel, MessageKind, MessagePriority,
};
use async_trait::async_trait;
use std::sync::Arc;

/// External reasoner that turns a conflicted proposal set into a decision.
///
/// The oracle is advisory. Callers must treat any error as "oracle
/// unavailable" and fall back to deterministic resolution; the workflow never
/// blocks on it.
#[async_trait]
pub trait ReasoningOracle: Send + Sync {
    async fn score(&self, request: &ScoringRequest) -> Result<Decision, EngineError>;
}

/// Oracle adapter over the message protocol: one `score_request` envelope
/// out, one `decision` envelope back.
pub struct ChannelOracle {
    channel: Arc<dyn MessageChannel>,
    oracle_id: AgentId,
    identity: EngineIdentity,
}

impl ChannelOracle {
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        oracle_id: AgentId,
        identity: EngineIdentity,
    ) -> Self {
        Self {
            channel,
            oracle_id,
            identity,
        }
    }
}

#[async_trait]
impl ReasoningOracle for ChannelOracle {
    async fn score(&self, request: &ScoringRequest) -> Result<Decision, EngineError> {
        let payload =
            serde_json::to_value(request).map_err(|e| EngineError::OracleUnavailable {
                message: format!("scoring request not serializable: {}", e),
            })?;
        let envelope = AgentMessage::outbound(
            request.conversation_id,
            request.request_id,
            self.identity.agent_id.clone(),
            self.oracle_id.clone(),
            MessageKind::ScoreRequest,
            MessagePriority::High,
            payload,
            self.identity.credential.clone(),
        );

        let reply =
            self.channel
                .send(envelope)
                .await
                .map_err(|e| EngineError::OracleUnavailable {
                    message: e.to_string(),
                })?;
        if reply.kind != MessageKind::Decision {
            return Err(EngineError::OracleUnavailable {
                message: format!("oracle answered with {} envelope", reply.kind),
            });
        }
        serde_json::from_value(reply.payload).map_err(|e| EngineError::OracleUnavailable {
            message: format!("oracle decision not parseable: {}", e),
        })
    }
}
