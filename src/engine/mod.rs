//! The workflow engine: one state machine instance per request.
//!
//! Every transition is checkpointed before the engine acts on it, so a crash
//! between any two steps resumes at the last persisted status. The version
//! compare-and-swap in the store makes concurrent engines for the same
//! request impossible: the loser of the race gets a `ConcurrencyConflict` and
//! stops.


use crate::checkpoint::CheckpointStore;
use crate::collector::{self, ProposerRef};
use crate::conflicts::{self, ConflictRules};
use crate::dispatcher;
use crate::domain::types::{AgentId, DecisionId, RequestId, TimestampUtc, WorkflowStatus};
use crate::domain::{
    Decision, DecisionKind, EngineError, HumanApproval, HumanVerdict, WorkflowRequest,
    WorkflowState,
};
use crate::policy::{self, ReasoningOracle, ScoringRequest};
use crate::protocol::{EngineIdentity, MessageChannel};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Static wiring shared by every engine instance.
pub struct EngineConfig {
    pub identity: EngineIdentity,
    pub proposers: Vec<ProposerRef>,
    pub executor_id: AgentId,
    pub rules: ConflictRules,
    pub collect_timeout: Duration,
    pub oracle_timeout: Duration,
    pub command_timeout: Duration,
}

/// Shared dependencies handed to each engine.
#[derive(Clone)]
pub struct EngineDeps {
    pub store: Arc<dyn CheckpointStore>,
    pub channel: Arc<dyn MessageChannel>,
    pub oracle: Arc<dyn ReasoningOracle>,
    pub config: Arc<EngineConfig>,
}

/// Creates the abort flag pair for one engine. The sender side belongs to
/// whoever supervises the engine.
pub fn abort_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

pub struct WorkflowEngine {
    deps: EngineDeps,
    state: WorkflowState,
    snapshot_tx: watch::Sender<WorkflowState>,
    abort_rx: watch::Receiver<bool>,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine").finish_non_exhaustive()
    }
}

impl WorkflowEngine {
    /// Starts a brand-new workflow by persisting its initial checkpoint.
    ///
    /// The initial save doubles as the duplicate-trigger guard: a second
    /// trigger for the same request loses the version race and fails with
    /// `ConcurrencyConflict`.
    pub async fn start(
        deps: EngineDeps,
        request: WorkflowRequest,
        abort_rx: watch::Receiver<bool>,
    ) -> Result<Self, EngineError> {
        let state = WorkflowState::new(request);
        deps.store.save_state(&state).await?;
        tracing::info!(
            request_id = %state.request_id(),
            trigger = %state.request.trigger,
            "workflow started"
        );
        Ok(Self::with_state(deps, state, abort_rx))
    }

    /// Rehydrates an engine from the last persisted checkpoint.
    pub async fn resume(
        deps: EngineDeps,
        request_id: RequestId,
        abort_rx: watch::Receiver<bool>,
    ) -> Result<Self, EngineError> {
        let state = deps
            .store
            .load_state(request_id)
            .await?
            .ok_or(EngineError::UnknownRequest { request_id })?;
        tracing::info!(
            request_id = %request_id,
            status = %state.status,
            version = state.version,
            "workflow resumed"
        );
        Ok(Self::with_state(deps, state, abort_rx))
    }

    fn with_state(
        deps: EngineDeps,
        state: WorkflowState,
        abort_rx: watch::Receiver<bool>,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(state.clone());
        Self {
            deps,
            state,
            snapshot_tx,
            abort_rx,
        }
    }

    /// Live view of the state as of its latest checkpoint.
    pub fn snapshot(&self) -> watch::Receiver<WorkflowState> {
        self.snapshot_tx.subscribe()
    }

    /// Drives the workflow until it completes, fails, or pauses for a human.
    ///
    /// Internal step failures are converted into a persisted `Error` status;
    /// only cancellation and checkpoint-store trouble surface as `Err`.
    pub async fn run(&mut self) -> Result<WorkflowState, EngineError> {
        while !self.state.is_terminal() && self.state.status != WorkflowStatus::PausedForHuman {
            if let Err(err) = self.step().await {
                match err {
                    EngineError::Cancelled
                    | EngineError::ConcurrencyConflict { .. }
                    | EngineError::StoreUnavailable { .. } => return Err(err),
                    other => {
                        self.fail(other.to_string()).await?;
                        break;
                    }
                }
            }
        }
        Ok(self.state.clone())
    }

    /// Applies a human verdict to a workflow paused for approval, then
    /// continues it.
    pub async fn apply_approval(
        &mut self,
        verdict: HumanVerdict,
        rationale: String,
    ) -> Result<WorkflowState, EngineError> {
        if self.state.status != WorkflowStatus::PausedForHuman {
            return Err(EngineError::InvalidTransition {
                message: format!(
                    "approval for workflow {} in status {}",
                    self.state.request_id(),
                    self.state.status
                ),
            });
        }
        let Some(prior) = self.state.decision.clone() else {
            return Err(EngineError::InvalidTransition {
                message: format!(
                    "workflow {} is paused without a decision",
                    self.state.request_id()
                ),
            });
        };

        match verdict {
            HumanVerdict::Approved => {
                let mut decision = prior;
                decision.human_approval = Some(HumanApproval {
                    verdict: HumanVerdict::Approved,
                    rationale,
                    decided_at: TimestampUtc::now(),
                });
                self.deps.store.save_decision(&decision).await?;
                let next = if decision.approved_actions.is_empty() {
                    WorkflowStatus::Completed
                } else {
                    WorkflowStatus::Executing
                };
                self.state.decision = Some(decision);
                self.advance(next).await?;
                self.run().await
            }
            HumanVerdict::Rejected => {
                // The prior decision stays in history; a superseding rejected
                // decision becomes the authoritative one.
                let superseding = Decision::rejected_by_human(&prior, rationale);
                self.deps.store.save_decision(&superseding).await?;
                self.state.decision = Some(superseding);
                self.advance(WorkflowStatus::Completed).await?;
                Ok(self.state.clone())
            }
        }
    }

    async fn step(&mut self) -> Result<(), EngineError> {
        match self.state.status {
            WorkflowStatus::Initializing => self.advance(WorkflowStatus::Collecting).await,
            WorkflowStatus::Collecting => self.collect().await,
            WorkflowStatus::Analyzing => self.analyze().await,
            WorkflowStatus::Resolving => self.resolve().await,
            WorkflowStatus::Deciding => self.decide().await,
            WorkflowStatus::Executing => self.execute().await,
            WorkflowStatus::PausedForHuman
            | WorkflowStatus::Completed
            | WorkflowStatus::Error => Ok(()),
        }
    }

    async fn collect(&mut self) -> Result<(), EngineError> {
        let config = &self.deps.config;
        let (proposals, errors) = collector::collect(
            self.deps.channel.as_ref(),
            &config.identity,
            &self.state.request,
            &config.proposers,
            config.collect_timeout,
        )
        .await;
        self.state.proposals = proposals;
        self.state.proposer_errors = errors;
        self.advance(WorkflowStatus::Analyzing).await
    }

    async fn analyze(&mut self) -> Result<(), EngineError> {
        self.state.conflicts =
            conflicts::detect(&self.state.proposals, &self.deps.config.rules);
        tracing::info!(
            request_id = %self.state.request_id(),
            conflicts = self.state.conflicts.len(),
            "conflict analysis finished"
        );
        self.advance(WorkflowStatus::Resolving).await
    }

    async fn resolve(&mut self) -> Result<(), EngineError> {
        // A crash between the history append and the deciding checkpoint
        // leaves the status at resolving. The appended decision is reused on
        // resume instead of recomputed under a fresh id, keeping the history
        // at one live decision per request.
        let decision = match self.live_decision().await? {
            Some(existing) => {
                tracing::info!(
                    request_id = %self.state.request_id(),
                    decision_id = %existing.decision_id,
                    "reusing the decision already in the history"
                );
                existing
            }
            None => {
                let scoring = ScoringRequest::new(
                    self.state.request_id(),
                    self.state.request.conversation_id,
                    self.state.proposals.clone(),
                    self.state.conflicts.clone(),
                );
                let decision = policy::resolve(
                    self.deps.oracle.as_ref(),
                    &scoring,
                    self.deps.config.oracle_timeout,
                )
                .await;
                self.deps.store.save_decision(&decision).await?;
                decision
            }
        };
        self.state.decision = Some(decision);
        self.advance(WorkflowStatus::Deciding).await
    }

    /// Latest recorded decision for this request that no later decision
    /// supersedes.
    async fn live_decision(&self) -> Result<Option<Decision>, EngineError> {
        let history = self
            .deps
            .store
            .decisions_for(self.state.request_id())
            .await?;
        let superseded: HashSet<DecisionId> =
            history.iter().filter_map(|d| d.supersedes).collect();
        Ok(history
            .into_iter()
            .rev()
            .find(|d| !superseded.contains(&d.decision_id)))
    }

    async fn decide(&mut self) -> Result<(), EngineError> {
        let Some(decision) = &self.state.decision else {
            return Err(EngineError::InvalidTransition {
                message: format!(
                    "workflow {} reached deciding without a decision",
                    self.state.request_id()
                ),
            });
        };
        let next = if decision.human_approval_required && decision.human_approval.is_none() {
            WorkflowStatus::PausedForHuman
        } else if decision.kind == DecisionKind::NoneRequired
            || decision.approved_actions.is_empty()
        {
            WorkflowStatus::Completed
        } else {
            WorkflowStatus::Executing
        };
        self.advance(next).await
    }

    async fn execute(&mut self) -> Result<(), EngineError> {
        let Some(decision) = self.state.decision.clone() else {
            return Err(EngineError::InvalidTransition {
                message: format!(
                    "workflow {} reached executing without a decision",
                    self.state.request_id()
                ),
            });
        };
        let config = &self.deps.config;
        let results = dispatcher::dispatch(
            self.deps.channel.as_ref(),
            &config.identity,
            &config.executor_id,
            self.state.request.conversation_id,
            self.state.request_id(),
            &decision,
            config.command_timeout,
        )
        .await;

        let any_success = results.iter().any(|r| r.success);
        self.state.execution_note = dispatcher::execution_note(&results);
        self.state.command_results = results;
        if any_success {
            self.advance(WorkflowStatus::Completed).await
        } else {
            self.state.error = Some("every dispatched command failed".to_string());
            self.advance(WorkflowStatus::Error).await
        }
    }

    async fn fail(&mut self, cause: String) -> Result<(), EngineError> {
        tracing::error!(
            request_id = %self.state.request_id(),
            cause = %cause,
            "workflow failed"
        );
        self.state.error = Some(cause);
        self.advance(WorkflowStatus::Error).await
    }

    /// The single transition point: checkpoint first, then let the new
    /// status take effect. An abort observed here discards the in-memory
    /// work of the current step and checkpoints the cancellation instead.
    async fn advance(&mut self, next: WorkflowStatus) -> Result<(), EngineError> {
        if *self.abort_rx.borrow() {
            tracing::warn!(
                request_id = %self.state.request_id(),
                "abort requested, discarding uncommitted step"
            );
            self.cancel().await?;
            return Err(EngineError::Cancelled);
        }
        let previous = self.state.status;
        self.state.status = next;
        self.state.version += 1;
        self.state.updated_at = TimestampUtc::now();
        self.deps.store.save_state(&self.state).await?;
        let _ = self.snapshot_tx.send(self.state.clone());
        tracing::debug!(
            request_id = %self.state.request_id(),
            from = %previous,
            to = %next,
            version = self.state.version,
            "transition checkpointed"
        );
        Ok(())
    }

    /// Marks the last committed checkpoint as cancelled, dropping whatever
    /// the interrupted step had accumulated in memory.
    async fn cancel(&mut self) -> Result<(), EngineError> {
        let request_id = self.state.request_id();
        let mut state = self
            .deps
            .store
            .load_state(request_id)
            .await?
            .ok_or(EngineError::UnknownRequest { request_id })?;
        state.status = WorkflowStatus::Error;
        state.error = Some("cancelled by operator".to_string());
        state.version += 1;
        state.updated_at = TimestampUtc::now();
        self.deps.store.save_state(&state).await?;
        self.state = state;
        let _ = self.snapshot_tx.send(self.state.clone());
        Ok(())
    }
}
