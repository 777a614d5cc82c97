//! Authenticated, versioned message envelope shared by every cross-component
//! call.
//!
//! Validation happens once, at this boundary: a message that reaches any
//! internal component has already passed `validate`, so downstream code works
//! with trusted, typed values.

pub mod auth;
pub mod channel;
pub mod process;

pub use auth::BearerToken;
pub use channel::{MessageChannel, ProtocolConfig, RecordingChannel, RetryingChannel};
pub use process::{AgentEndpoint, ProcessChannel};

use crate::domain::types::{AgentId, ConversationId, MessageId, RequestId, TimestampUtc};
use crate::domain::EngineError;
use serde::{Deserialize, Serialize};

/// Wire protocol version carried by every envelope.
pub const PROTOCOL_VERSION: &str = "1.0";

/// What an envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    RequestProposal,
    Proposal,
    ScoreRequest,
    Decision,
    Status,
    Data,
    Command,
    Approval,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageKind::RequestProposal => "request_proposal",
            MessageKind::Proposal => "proposal",
            MessageKind::ScoreRequest => "score_request",
            MessageKind::Decision => "decision",
            MessageKind::Status => "status",
            MessageKind::Data => "data",
            MessageKind::Command => "command",
            MessageKind::Approval => "approval",
        };
        write!(f, "{}", s)
    }
}

/// Delivery priority hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Identity the engine presents on every outbound envelope.
#[derive(Debug, Clone)]
pub struct EngineIdentity {
    pub agent_id: AgentId,
    pub credential: BearerToken,
}

/// The wire unit of the message protocol.
///
/// Write-once: a retried send reuses the same `message_id`, which receivers
/// treat as the idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    /// Workflow request this message belongs to.
    pub correlation_id: RequestId,
    pub sender_id: AgentId,
    pub recipient_id: AgentId,
    pub kind: MessageKind,
    pub payload: serde_json::Value,
    pub protocol_version: String,
    pub priority: MessagePriority,
    /// Bearer credential proving the sender's identity.
    pub credential: BearerToken,
    pub issued_at: TimestampUtc,
}

impl AgentMessage {
    /// Builds an outbound envelope with a fresh message ID.
    #[allow(clippy::too_many_arguments)]
    pub fn outbound(
        conversation_id: ConversationId,
        correlation_id: RequestId,
        sender_id: AgentId,
        recipient_id: AgentId,
        kind: MessageKind,
        priority: MessagePriority,
        payload: serde_json::Value,
        credential: BearerToken,
    ) -> Self {
        Self {
            message_id: MessageId::new(),
            conversation_id,
            correlation_id,
            sender_id,
            recipient_id,
            kind,
            payload,
            protocol_version: PROTOCOL_VERSION.to_string(),
            priority,
            credential,
            issued_at: TimestampUtc::now(),
        }
    }

    /// Replaces the generated message ID with a caller-derived one, for
    /// envelopes whose idempotency key must survive a crash and resume.
    pub fn with_message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = message_id;
        self
    }
}

/// Boundary validation applied to every envelope, inbound and outbound.
pub fn validate(message: &AgentMessage) -> Result<(), EngineError> {
    if message.protocol_version != PROTOCOL_VERSION {
        return Err(EngineError::Protocol {
            message: format!(
                "unsupported protocol version {:?} (expected {:?})",
                message.protocol_version, PROTOCOL_VERSION
            ),
        });
    }
    if message.sender_id.as_str().is_empty() {
        return Err(EngineError::Protocol {
            message: "sender_id is empty".to_string(),
        });
    }
    if message.recipient_id.as_str().is_empty() {
        return Err(EngineError::Protocol {
            message: "recipient_id is empty".to_string(),
        });
    }
    if message.credential.is_empty() {
        return Err(EngineError::Authentication {
            message: format!("message {} carries no credential", message.message_id),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AgentMessage {
        AgentMessage::outbound(
            ConversationId::new(),
            RequestId::new(),
            "conductor".into(),
            "kiln-optimizer".into(),
            MessageKind::RequestProposal,
            MessagePriority::High,
            serde_json::json!({"trigger": "quality_deviation"}),
            BearerToken::new("secret"),
        )
    }

    #[test]
    fn valid_envelope_passes() {
        assert!(validate(&sample()).is_ok());
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let mut msg = sample();
        msg.protocol_version = "0.9".to_string();
        let err = validate(&msg).unwrap_err();
        assert!(matches!(err, EngineError::Protocol { .. }));
    }

    #[test]
    fn missing_credential_is_an_authentication_error() {
        let mut msg = sample();
        msg.credential = BearerToken::new("");
        let err = validate(&msg).unwrap_err();
        assert!(matches!(err, EngineError::Authentication { .. }));
    }

    #[test]
    fn envelope_round_trips_with_snake_case_kind() {
        let msg = sample();
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["kind"], "request_proposal");
        let back: AgentMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }
}
