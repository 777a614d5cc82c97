//! Conflict detection over a proposal set.
//!
//! `detect` is a pure function: same proposals in, same conflicts out, in a
//! canonical order, regardless of input permutation. Rules are applied in a
//! fixed order per proposal pair:
//!
//! 1. direct: same variable, opposite-sign deltas beyond epsilon
//! 2. resource: same variable, same-sign deltas past the adjustment ceiling
//! 3. priority: different urgencies inside one subsystem grouping
//! 4. indirect: a declared constraint names a variable the other adjusts

use crate::domain::{
    Conflict, ConflictKind, ConflictSeverity, ControlVariable, Proposal, Urgency,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Plant-specific detection parameters, supplied by operator config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRules {
    /// Deltas at or below this magnitude (in the variable's native unit) are
    /// negligible and never conflict.
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    /// Per-variable ceiling on the combined magnitude of same-direction
    /// adjustments.
    #[serde(default)]
    pub ceilings: BTreeMap<ControlVariable, f64>,
    /// Subsystem grouping per variable (e.g. kiln_speed -> "kiln") used for
    /// priority-conflict detection.
    #[serde(default)]
    pub subsystems: BTreeMap<ControlVariable, String>,
}

fn default_epsilon() -> f64 {
    0.01
}

impl Default for ConflictRules {
    fn default() -> Self {
        Self {
            epsilon: default_epsilon(),
            ceilings: BTreeMap::new(),
            subsystems: BTreeMap::new(),
        }
    }
}

impl ConflictRules {
    fn subsystem_of(&self, variable: &ControlVariable) -> Option<&str> {
        self.subsystems.get(variable).map(String::as_str)
    }
}

/// Classifies all conflicts within a proposal set.
pub fn detect(proposals: &[Proposal], rules: &ConflictRules) -> Vec<Conflict> {
    // Canonical ordering first: pair iteration must not depend on the
    // caller's proposal order.
    let mut ordered: Vec<&Proposal> = proposals.iter().collect();
    ordered.sort_by_key(|p| p.proposal_id);

    let mut conflicts = Vec::new();
    for (i, a) in ordered.iter().enumerate() {
        for b in ordered.iter().skip(i + 1) {
            detect_pair(a, b, rules, &mut conflicts);
        }
    }

    conflicts.sort_by(|x, y| {
        x.kind
            .cmp(&y.kind)
            .then_with(|| x.involved.cmp(&y.involved))
            .then_with(|| x.description.cmp(&y.description))
    });
    conflicts
}

fn detect_pair(a: &Proposal, b: &Proposal, rules: &ConflictRules, out: &mut Vec<Conflict>) {
    let mut shared_variable_conflict = false;

    // Rules 1 and 2: per shared control variable.
    for action_a in &a.actions {
        let Some(action_b) = b.action_for(&action_a.control_variable) else {
            continue;
        };
        let da = action_a.delta();
        let db = action_b.delta();

        if da * db < 0.0 && da.abs() > rules.epsilon && db.abs() > rules.epsilon {
            out.push(Conflict::pairwise(
                ConflictKind::Direct,
                // Opposing pushes on one physical variable are always serious.
                ConflictSeverity::High,
                a.proposal_id,
                b.proposal_id,
                format!(
                    "{} and {} push {} in opposite directions ({:+.3} vs {:+.3})",
                    a.proposer_id, b.proposer_id, action_a.control_variable, da, db
                ),
            ));
            shared_variable_conflict = true;
            continue;
        }

        if da * db > 0.0 {
            if let Some(ceiling) = rules.ceilings.get(&action_a.control_variable) {
                let combined = da.abs() + db.abs();
                if combined > *ceiling {
                    out.push(Conflict::pairwise(
                        ConflictKind::Resource,
                        ConflictSeverity::Medium,
                        a.proposal_id,
                        b.proposal_id,
                        format!(
                            "combined adjustment of {} ({:.3}) exceeds ceiling {:.3}",
                            action_a.control_variable, combined, ceiling
                        ),
                    ));
                    shared_variable_conflict = true;
                }
            }
        }
    }

    // Rule 3: differing urgencies inside one subsystem grouping.
    if a.urgency != b.urgency {
        if let Some(subsystem) = shared_subsystem(a, b, rules) {
            out.push(Conflict::pairwise(
                ConflictKind::Priority,
                priority_severity(a, b),
                a.proposal_id,
                b.proposal_id,
                format!(
                    "{} ({}) and {} ({}) disagree on urgency for subsystem {}",
                    a.proposer_id, a.urgency_label(), b.proposer_id, b.urgency_label(), subsystem
                ),
            ));
        }
    }

    // Rule 4: declared dependency on a variable the other adjusts. Skipped
    // when the pair already conflicts on a shared variable, which subsumes
    // the dependency.
    if !shared_variable_conflict {
        for (from, to) in [(a, b), (b, a)] {
            let mut named: Vec<&ControlVariable> = from
                .constraints
                .iter()
                .filter(|variable| to.targets(variable))
                .collect();
            named.sort();
            if let Some(variable) = named.first() {
                out.push(Conflict::pairwise(
                    ConflictKind::Indirect,
                    ConflictSeverity::Low,
                    from.proposal_id,
                    to.proposal_id,
                    format!(
                        "{} depends on {} which {} proposes to change",
                        from.proposer_id, variable, to.proposer_id
                    ),
                ));
            }
        }
    }
}

fn priority_severity(a: &Proposal, b: &Proposal) -> ConflictSeverity {
    if a.urgency == Urgency::Critical || b.urgency == Urgency::Critical {
        ConflictSeverity::High
    } else {
        ConflictSeverity::Medium
    }
}

fn shared_subsystem<'r>(a: &Proposal, b: &Proposal, rules: &'r ConflictRules) -> Option<&'r str> {
    for action_a in &a.actions {
        let Some(sub_a) = rules.subsystem_of(&action_a.control_variable) else {
            continue;
        };
        for action_b in &b.actions {
            if rules.subsystem_of(&action_b.control_variable) == Some(sub_a) {
                return Some(sub_a);
            }
        }
    }
    None
}

impl Proposal {
    fn urgency_label(&self) -> &'static str {
        match self.urgency {
            Urgency::Low => "low",
            Urgency::Medium => "medium",
            Urgency::High => "high",
            Urgency::Critical => "critical",
        }
    }
}
