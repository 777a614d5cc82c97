//! Durable checkpointing of workflow state, decision history, and the
//! inter-agent communication log.
//!
//! The store is the only shared mutable resource in the system. Every
//! workflow transition is persisted here before the engine advances, so a
//! crashed instance resumes exactly where it left off.

pub mod file_store;

pub use file_store::FileCheckpointStore;

use crate::domain::types::{
    AgentId, ConversationId, MessageId, RequestId, TimestampUtc, WorkflowStatus,
};
use crate::domain::{Decision, EngineError, WorkflowState};
use crate::protocol::{AgentMessage, MessageKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Whether a communication-log entry records a send or a receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Sent,
    Received,
}

/// One append-only audit record of a message crossing the protocol boundary.
///
/// Keyed by `message_id`: appending the same ID twice persists nothing new,
/// which is the receiver-side idempotency guarantee of the protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunicationEntry {
    /// Store-assigned monotonic sequence number (0 until persisted).
    pub seq: u64,
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub correlation_id: RequestId,
    pub sender_id: AgentId,
    pub recipient_id: AgentId,
    pub kind: MessageKind,
    pub direction: Direction,
    /// Digest of the bearer credential; the secret itself is never stored.
    pub credential_fingerprint: String,
    pub recorded_at: TimestampUtc,
}

impl CommunicationEntry {
    pub fn from_message(message: &AgentMessage, direction: Direction) -> Self {
        Self {
            seq: 0,
            message_id: message.message_id,
            conversation_id: message.conversation_id,
            correlation_id: message.correlation_id,
            sender_id: message.sender_id.clone(),
            recipient_id: message.recipient_id.clone(),
            kind: message.kind,
            direction,
            credential_fingerprint: message.credential.fingerprint(),
            recorded_at: TimestampUtc::now(),
        }
    }
}

/// Summary row for operator-facing workflow listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub request_id: RequestId,
    pub conversation_id: ConversationId,
    pub status: WorkflowStatus,
    pub version: u64,
    pub updated_at: TimestampUtc,
}

impl From<&WorkflowState> for WorkflowSummary {
    fn from(state: &WorkflowState) -> Self {
        Self {
            request_id: state.request_id(),
            conversation_id: state.request.conversation_id,
            status: state.status,
            version: state.version,
            updated_at: state.updated_at,
        }
    }
}

/// Persistence port for the workflow engine.
///
/// `save_state` is a versioned upsert: the caller presents a state whose
/// `version` must be exactly one greater than the persisted version (or 1 for
/// a new request). A mismatch is a `ConcurrencyConflict`; the losing writer
/// must abort its transition and reload.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save_state(&self, state: &WorkflowState) -> Result<(), EngineError>;

    async fn load_state(&self, request_id: RequestId) -> Result<Option<WorkflowState>, EngineError>;

    /// All checkpointed workflows, newest first.
    async fn list_workflows(&self) -> Result<Vec<WorkflowSummary>, EngineError>;

    /// Requests whose persisted status is non-terminal, eligible for resume.
    async fn list_resumable(&self) -> Result<Vec<RequestId>, EngineError>;

    async fn save_decision(&self, decision: &Decision) -> Result<(), EngineError>;

    /// Decision history for a request, in recorded order.
    async fn decisions_for(&self, request_id: RequestId) -> Result<Vec<Decision>, EngineError>;

    /// Appends to the communication log. Returns `true` if the entry was
    /// fresh, `false` if its `message_id` had already been recorded.
    async fn append_communication(&self, entry: CommunicationEntry) -> Result<bool, EngineError>;
}
