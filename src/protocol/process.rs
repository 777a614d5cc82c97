//! Subprocess transport for external agents.
//!
//! Each proposer, the reasoning oracle, and the command executor is an
//! operator-configured command line. A send spawns the process, writes one
//! JSON envelope to its stdin, and reads one JSON envelope back from stdout.
//! Lines that do not parse as envelopes are ignored, so agents may emit
//! diagnostics on stdout without breaking the protocol.

use crate::domain::types::AgentId;
use crate::domain::EngineError;
use crate::protocol::{AgentMessage, MessageChannel};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

/// Where and how to reach one external agent.
#[derive(Debug, Clone)]
pub struct AgentEndpoint {
    pub command: String,
    pub args: Vec<String>,
}

/// Transport that speaks JSON-over-stdio to configured agent commands.
pub struct ProcessChannel {
    endpoints: HashMap<AgentId, AgentEndpoint>,
}

impl ProcessChannel {
    pub fn new(endpoints: HashMap<AgentId, AgentEndpoint>) -> Self {
        Self { endpoints }
    }

    fn delivery_error(recipient: &AgentId, message: impl std::fmt::Display) -> EngineError {
        EngineError::DeliveryFailed {
            recipient: recipient.to_string(),
            attempts: 1,
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl MessageChannel for ProcessChannel {
    async fn send(&self, message: AgentMessage) -> Result<AgentMessage, EngineError> {
        let recipient = message.recipient_id.clone();
        let endpoint = self
            .endpoints
            .get(&recipient)
            .ok_or_else(|| EngineError::Protocol {
                message: format!("no endpoint configured for agent {}", recipient),
            })?;

        let mut child = Command::new(&endpoint.command)
            .args(&endpoint.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            // The retry layer enforces the deadline by dropping this future;
            // the child must not outlive it.
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Self::delivery_error(&recipient, format!("spawn failed: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Self::delivery_error(&recipient, "stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Self::delivery_error(&recipient, "stdout unavailable"))?;

        let mut wire = serde_json::to_vec(&message)
            .map_err(|e| Self::delivery_error(&recipient, format!("serialize failed: {}", e)))?;
        wire.push(b'\n');
        stdin
            .write_all(&wire)
            .await
            .map_err(|e| Self::delivery_error(&recipient, format!("write failed: {}", e)))?;
        drop(stdin);

        let mut lines = BufReader::new(stdout).lines();
        let mut reply: Option<AgentMessage> = None;
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| Self::delivery_error(&recipient, format!("read failed: {}", e)))?
        {
            match serde_json::from_str::<AgentMessage>(&line) {
                Ok(parsed) => {
                    reply = Some(parsed);
                    break;
                }
                Err(_) => {
                    tracing::trace!(agent = %recipient, "skipping non-envelope output line");
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| Self::delivery_error(&recipient, format!("wait failed: {}", e)))?;

        match reply {
            Some(envelope) => Ok(envelope),
            None => Err(Self::delivery_error(
                &recipient,
                format!("no envelope in agent output (exit status {})", status),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{ConversationId, RequestId};
    use crate::protocol::{BearerToken, MessageKind, MessagePriority};

    fn envelope(recipient: &str) -> AgentMessage {
        AgentMessage::outbound(
            ConversationId::new(),
            RequestId::new(),
            "conductor".into(),
            recipient.into(),
            MessageKind::Status,
            MessagePriority::Normal,
            serde_json::json!({}),
            BearerToken::new("engine-token"),
        )
    }

    #[tokio::test]
    async fn unknown_recipient_is_a_protocol_error() {
        let channel = ProcessChannel::new(HashMap::new());
        let err = channel.send(envelope("nobody")).await.unwrap_err();
        assert!(matches!(err, EngineError::Protocol { .. }));
    }

    #[tokio::test]
    async fn echo_agent_round_trips_an_envelope() {
        // `cat` echoes the request envelope back verbatim, which is a valid
        // envelope, so the transport should return it.
        let mut endpoints = HashMap::new();
        endpoints.insert(
            AgentId::from("echo"),
            AgentEndpoint {
                command: "cat".to_string(),
                args: vec![],
            },
        );
        let channel = ProcessChannel::new(endpoints);
        let sent = envelope("echo");
        let reply = channel.send(sent.clone()).await.expect("cat echoes");
        assert_eq!(reply.message_id, sent.message_id);
    }

    #[tokio::test]
    async fn silent_agent_yields_delivery_failure() {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            AgentId::from("mute"),
            AgentEndpoint {
                command: "true".to_string(),
                args: vec![],
            },
        );
        let channel = ProcessChannel::new(endpoints);
        let err = channel.send(envelope("mute")).await.unwrap_err();
        assert!(matches!(err, EngineError::DeliveryFailed { .. }));
    }
}
