//! Message delivery: the channel trait plus retry and audit wrappers.

use crate::checkpoint::{CheckpointStore, CommunicationEntry, Direction};
use crate::domain::types::AgentId;
use crate::domain::EngineError;
use crate::protocol::auth::BearerToken;
use crate::protocol::{validate, AgentMessage};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Synchronous request/response delivery of one envelope.
///
/// Implementations transport the message; retry, timeout, authentication of
/// the reply, and audit logging live in the wrappers below.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    async fn send(&self, message: AgentMessage) -> Result<AgentMessage, EngineError>;
}

/// Timeout and retry policy for the protocol layer.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Per-attempt deadline.
    pub attempt_timeout: Duration,
    /// Total number of attempts, including the first.
    pub retry_attempts: u32,
    /// Base delay for exponential backoff between attempts.
    pub retry_base: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(30),
            retry_attempts: 3,
            retry_base: Duration::from_millis(500),
        }
    }
}

/// Wraps a transport with per-attempt timeouts, bounded exponential backoff,
/// and reply authentication.
///
/// The same envelope (same `message_id`) is re-sent on every attempt, so
/// receivers can deduplicate physical duplicates.
pub struct RetryingChannel<C> {
    inner: C,
    config: ProtocolConfig,
    /// Expected reply credential per remote agent.
    expected_credentials: HashMap<AgentId, BearerToken>,
}

impl<C: MessageChannel> RetryingChannel<C> {
    pub fn new(
        inner: C,
        config: ProtocolConfig,
        expected_credentials: HashMap<AgentId, BearerToken>,
    ) -> Self {
        Self {
            inner,
            config,
            expected_credentials,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.retry_base;
        let exp = base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let jitter_cap = (base.as_millis() / 2).max(1) as u64;
        let jitter = rand::thread_rng().gen_range(0..jitter_cap);
        exp + Duration::from_millis(jitter)
    }

    fn authenticate_reply(&self, reply: &AgentMessage) -> Result<(), EngineError> {
        let expected = self
            .expected_credentials
            .get(&reply.sender_id)
            .ok_or_else(|| EngineError::Authentication {
                message: format!("no credential registered for agent {}", reply.sender_id),
            })?;
        if !expected.verify(&reply.credential) {
            return Err(EngineError::Authentication {
                message: format!(
                    "reply {} from {} carries an invalid credential",
                    reply.message_id, reply.sender_id
                ),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl<C: MessageChannel> MessageChannel for RetryingChannel<C> {
    async fn send(&self, message: AgentMessage) -> Result<AgentMessage, EngineError> {
        validate(&message)?;

        let recipient = message.recipient_id.clone();
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=self.config.retry_attempts {
            let outcome = tokio::time::timeout(
                self.config.attempt_timeout,
                self.inner.send(message.clone()),
            )
            .await;

            match outcome {
                Ok(Ok(reply)) => {
                    validate(&reply)?;
                    self.authenticate_reply(&reply)?;
                    return Ok(reply);
                }
                // Authentication and protocol violations will not improve on
                // retry; surface them immediately.
                Ok(Err(err @ EngineError::Authentication { .. }))
                | Ok(Err(err @ EngineError::Protocol { .. })) => return Err(err),
                Ok(Err(err)) => {
                    last_error = err.to_string();
                    tracing::warn!(
                        recipient = %recipient,
                        attempt,
                        error = %last_error,
                        "message delivery attempt failed"
                    );
                }
                Err(_) => {
                    last_error = format!(
                        "attempt timed out after {:?}",
                        self.config.attempt_timeout
                    );
                    tracing::warn!(recipient = %recipient, attempt, "message delivery attempt timed out");
                }
            }

            if attempt < self.config.retry_attempts {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }

        Err(EngineError::DeliveryFailed {
            recipient: recipient.to_string(),
            attempts: self.config.retry_attempts,
            message: last_error,
        })
    }
}

/// Records every send and reply in the checkpoint store's append-only
/// communication log. The log is keyed by `message_id`, which makes it double
/// as the receiver-side dedup table: appending an already-seen message is a
/// no-op with one persisted effect.
pub struct RecordingChannel<C> {
    inner: C,
    store: Arc<dyn CheckpointStore>,
}

impl<C: MessageChannel> RecordingChannel<C> {
    pub fn new(inner: C, store: Arc<dyn CheckpointStore>) -> Self {
        Self { inner, store }
    }
}

#[async_trait]
impl<C: MessageChannel> MessageChannel for RecordingChannel<C> {
    async fn send(&self, message: AgentMessage) -> Result<AgentMessage, EngineError> {
        let sent_entry = CommunicationEntry::from_message(&message, Direction::Sent);
        self.store.append_communication(sent_entry).await?;

        let reply = self.inner.send(message).await?;

        let received_entry = CommunicationEntry::from_message(&reply, Direction::Received);
        let fresh = self.store.append_communication(received_entry).await?;
        if !fresh {
            tracing::debug!(
                message_id = %reply.message_id,
                "duplicate reply deduplicated by message_id"
            );
        }
        Ok(reply)
    }
}
