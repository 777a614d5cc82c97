//! Conflicts derived from a proposal set.
//!
//! Conflicts are never persisted on their own; they live inside the workflow
//! snapshot and are recomputed deterministically from the proposals.

use crate::domain::types::ProposalId;
use serde::{Deserialize, Serialize};

/// Classification of a detected conflict.
///
/// Variant order is the canonical sort order of detector output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Same control variable, opposite-sign deltas beyond epsilon.
    Direct,
    /// Same control variable, same-sign deltas exceeding the adjustment
    /// ceiling when combined.
    Resource,
    /// Different urgency levels inside the same subsystem grouping.
    Priority,
    /// One proposal's declared constraints name a variable the other adjusts.
    Indirect,
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConflictKind::Direct => "direct",
            ConflictKind::Resource => "resource",
            ConflictKind::Priority => "priority",
            ConflictKind::Indirect => "indirect",
        };
        write!(f, "{}", s)
    }
}

/// How serious a conflict is for resolution purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
}

/// A pairwise conflict between two proposals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub severity: ConflictSeverity,
    /// Always sorted ascending, so equal conflicts compare equal.
    pub involved: Vec<ProposalId>,
    pub description: String,
}

impl Conflict {
    /// Builds a conflict with its involved IDs in canonical order.
    pub fn pairwise(
        kind: ConflictKind,
        severity: ConflictSeverity,
        a: ProposalId,
        b: ProposalId,
        description: String,
    ) -> Self {
        let mut involved = vec![a, b];
        involved.sort();
        Self {
            kind,
            severity,
            involved,
            description,
        }
    }
}
