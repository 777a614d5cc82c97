//! Domain model for the decision-orchestration engine.
//!
//! Everything here is a plain value type. Mutation of workflow state happens
//! only inside the engine (`crate::engine`); all other components receive and
//! return these types.

pub mod conflict;
pub mod decision;
pub mod errors;
pub mod proposal;
pub mod state;
pub mod types;

pub use conflict::{Conflict, ConflictKind, ConflictSeverity};
pub use decision::{
    CommandResult, DecidedAction, Decision, DecisionKind, HumanApproval, HumanVerdict,
};
pub use errors::EngineError;
pub use proposal::{Proposal, ProposerError, WorkflowRequest};
pub use state::WorkflowState;
pub use types::{ControlVariable, DecisionId, TimestampUtc, Urgency};
