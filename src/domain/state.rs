//! The mutable workflow envelope persisted at every transition.

use crate::domain::conflict::Conflict;
use crate::domain::decision::{CommandResult, Decision};
use crate::domain::proposal::{Proposal, ProposerError, WorkflowRequest};
use crate::domain::types::{RequestId, TimestampUtc, WorkflowStatus};
use serde::{Deserialize, Serialize};

/// The live state of one workflow, keyed by request ID.
///
/// Exactly one of these exists per request. It is upserted and never deleted,
/// preserving the audit history. Only the workflow engine mutates it; every
/// other component receives and returns values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub request: WorkflowRequest,
    pub status: WorkflowStatus,
    pub proposals: Vec<Proposal>,
    /// Proposers that failed or timed out during collection; kept for audit.
    pub proposer_errors: Vec<ProposerError>,
    pub conflicts: Vec<Conflict>,
    pub decision: Option<Decision>,
    pub command_results: Vec<CommandResult>,
    /// Partial-failure annotation recorded after execution.
    #[serde(default)]
    pub execution_note: Option<String>,
    /// Human-readable failure cause when `status` is `error`.
    #[serde(default)]
    pub error: Option<String>,
    /// Monotonic version used by the checkpoint store's compare-and-swap.
    pub version: u64,
    pub updated_at: TimestampUtc,
}

impl WorkflowState {
    /// Fresh state for a newly triggered request, ready for its first save
    /// at version 1.
    pub fn new(request: WorkflowRequest) -> Self {
        Self {
            request,
            status: WorkflowStatus::Initializing,
            proposals: Vec::new(),
            proposer_errors: Vec::new(),
            conflicts: Vec::new(),
            decision: None,
            command_results: Vec::new(),
            execution_note: None,
            error: None,
            version: 1,
            updated_at: TimestampUtc::now(),
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request.request_id
    }

    /// Returns true once the workflow can no longer move.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
