//! Error taxonomy for the orchestration engine.

use crate::domain::types::RequestId;
use std::fmt::{Display, Formatter};

/// Errors surfaced by the engine's components.
///
/// Transient external failures (proposer timeouts, oracle outages) are
/// recovered locally with defined fallbacks and never appear here; only
/// conditions a caller must act on do.
#[derive(Debug, Clone)]
pub enum EngineError {
    /// Message credential missing or wrong; the message was not processed.
    Authentication { message: String },
    /// Delivery retries exhausted for an envelope.
    DeliveryFailed {
        recipient: String,
        attempts: u32,
        message: String,
    },
    /// Envelope failed boundary validation.
    Protocol { message: String },
    /// Checkpoint store unreachable; fatal to the current transition.
    StoreUnavailable { message: String },
    /// Optimistic lock failure on a workflow state upsert.
    ConcurrencyConflict { message: String },
    /// Reasoning oracle failed or timed out.
    OracleUnavailable { message: String },
    /// Oracle output violated the fixed priority constitution.
    PolicyInvariantViolation { message: String },
    /// Transition attempted from an incompatible status.
    InvalidTransition { message: String },
    /// Workflow was cancelled by an explicit abort.
    Cancelled,
    /// No workflow exists for the given request ID.
    UnknownRequest { request_id: RequestId },
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Authentication { message } => write!(f, "authentication failed: {}", message),
            Self::DeliveryFailed {
                recipient,
                attempts,
                message,
            } => write!(
                f,
                "delivery to {} failed after {} attempts: {}",
                recipient, attempts, message
            ),
            Self::Protocol { message } => write!(f, "protocol violation: {}", message),
            Self::StoreUnavailable { message } => write!(f, "checkpoint store: {}", message),
            Self::ConcurrencyConflict { message } => {
                write!(f, "concurrency conflict: {}", message)
            }
            Self::OracleUnavailable { message } => write!(f, "oracle unavailable: {}", message),
            Self::PolicyInvariantViolation { message } => {
                write!(f, "policy invariant violated: {}", message)
            }
            Self::InvalidTransition { message } => write!(f, "invalid transition: {}", message),
            Self::Cancelled => write!(f, "cancelled"),
            Self::UnknownRequest { request_id } => {
                write!(f, "no workflow for request {}", request_id)
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    /// Shorthand for store failures wrapping an IO error.
    pub fn store(err: impl Display) -> Self {
        Self::StoreUnavailable {
            message: err.to_string(),
        }
    }
}
