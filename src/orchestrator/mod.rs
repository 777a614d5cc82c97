//! Top-level orchestration: one supervised actor per in-flight workflow.

pub mod actor;
pub mod supervisor;

pub use actor::{ConductorActorArgs, ConductorMsg, Launch};
pub use supervisor::{ConductorSupervisor, SupervisorMsg};

use crate::checkpoint::WorkflowSummary;
use crate::domain::types::{RequestId, TimestampUtc, TriggerKind, WorkflowStatus};
use crate::domain::{EngineError, HumanVerdict, WorkflowRequest, WorkflowState};
use crate::engine::{abort_channel, EngineDeps};
use anyhow::{anyhow, bail, Context, Result};
use ractor::{Actor, ActorRef};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, watch, Mutex};

struct ActiveWorkflow {
    actor: ActorRef<ConductorMsg>,
    abort_tx: watch::Sender<bool>,
    /// Tracks the latest committed checkpoint without touching the mailbox,
    /// so status reads never queue behind a running step.
    snapshot: watch::Receiver<WorkflowState>,
}

/// Entry point for everything the operator can do to workflows.
///
/// Live workflows run inside supervised actors; anything not live is served
/// straight from the checkpoint store.
pub struct Orchestrator {
    deps: EngineDeps,
    supervisor: ActorRef<SupervisorMsg>,
    active: Arc<Mutex<HashMap<RequestId, ActiveWorkflow>>>,
}

impl Orchestrator {
    pub async fn new(deps: EngineDeps) -> Result<Self> {
        let (supervisor, _handle) = ConductorSupervisor::spawn(None, ConductorSupervisor, ())
            .await
            .map_err(|e| anyhow!("failed to spawn supervisor: {}", e))?;
        Ok(Self {
            deps,
            supervisor,
            active: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Starts a new workflow for an external trigger. Returns the request id
    /// as soon as the initial checkpoint is written; the workflow itself
    /// runs in its actor. `status` and `wait_for_stable` observe progress.
    pub async fn trigger(
        &self,
        trigger: TriggerKind,
        context: serde_json::Value,
    ) -> Result<RequestId> {
        let request = WorkflowRequest::new(trigger, context);
        let request_id = request.request_id;
        let actor = self.spawn_workflow(Launch::New(request)).await?;
        self.launch_run(request_id, &actor);
        Ok(request_id)
    }

    /// Blocks until the workflow reaches a terminal status or pauses for a
    /// human verdict, then returns that state.
    pub async fn wait_for_stable(&self, request_id: RequestId) -> Result<WorkflowState> {
        let mut rx = match self.active.lock().await.get(&request_id) {
            Some(live) => live.snapshot.clone(),
            None => return self.status(request_id).await,
        };
        loop {
            let state = rx.borrow().clone();
            if state.is_terminal() || state.status == WorkflowStatus::PausedForHuman {
                return Ok(state);
            }
            if rx.changed().await.is_err() {
                // Actor gone; the checkpoint has the final word.
                return self.status(request_id).await;
            }
        }
    }

    /// Resumes one checkpointed workflow.
    pub async fn resume(&self, request_id: RequestId) -> Result<WorkflowState> {
        let actor = self.spawn_workflow(Launch::Resume(request_id)).await?;
        self.drive(request_id, &actor).await
    }

    /// Resumes every non-terminal workflow found in the store. Failures are
    /// logged and skipped so one bad checkpoint cannot block the rest.
    pub async fn resume_all(&self) -> Result<Vec<WorkflowState>> {
        let pending = self
            .deps
            .store
            .list_resumable()
            .await
            .context("listing resumable workflows")?;
        let mut resumed = Vec::new();
        for request_id in pending {
            match self.resume(request_id).await {
                Ok(state) => resumed.push(state),
                Err(err) => {
                    tracing::warn!(
                        request_id = %request_id,
                        error = %err,
                        "resume failed, skipping workflow"
                    );
                }
            }
        }
        Ok(resumed)
    }

    /// Records a human verdict on a paused workflow and continues it.
    pub async fn approve(
        &self,
        request_id: RequestId,
        verdict: HumanVerdict,
        rationale: String,
    ) -> Result<WorkflowState> {
        let (actor, spawned) = match self.lookup(request_id).await {
            Some(actor) => (actor, false),
            None => (
                self.spawn_workflow(Launch::Resume(request_id)).await?,
                true,
            ),
        };
        let (tx, rx) = oneshot::channel();
        actor
            .send_message(ConductorMsg::Approval {
                verdict,
                rationale,
                reply: tx,
            })
            .map_err(|_| anyhow!("workflow actor mailbox closed"))?;
        let state = match rx.await {
            Ok(Ok(state)) => state,
            Ok(Err(err)) => {
                // An actor spawned just for this verdict must not linger
                // when the verdict is refused.
                if spawned {
                    self.retire(request_id).await;
                }
                return Err(err.into());
            }
            Err(_) => {
                self.retire(request_id).await;
                bail!("workflow actor dropped the reply");
            }
        };
        self.settle(&state).await;
        Ok(state)
    }

    /// Aborts a workflow. A live one is flagged and discards its uncommitted
    /// step; a checkpointed one is errored in the store, which also makes any
    /// engine elsewhere lose its next compare-and-swap.
    pub async fn abort(&self, request_id: RequestId) -> Result<()> {
        if let Some(live) = self.active.lock().await.get(&request_id) {
            live.abort_tx
                .send(true)
                .map_err(|_| anyhow!("workflow already shut down"))?;
            return Ok(());
        }

        let mut state = self
            .deps
            .store
            .load_state(request_id)
            .await?
            .ok_or(EngineError::UnknownRequest { request_id })?;
        if state.is_terminal() {
            bail!("workflow {} is already {}", request_id, state.status);
        }
        state.status = WorkflowStatus::Error;
        state.error = Some("cancelled by operator".to_string());
        state.version += 1;
        state.updated_at = TimestampUtc::now();
        self.deps
            .store
            .save_state(&state)
            .await
            .context("persisting abort")?;
        Ok(())
    }

    /// Current state: live actor if there is one, otherwise the checkpoint.
    pub async fn status(&self, request_id: RequestId) -> Result<WorkflowState> {
        if let Some(live) = self.active.lock().await.get(&request_id) {
            return Ok(live.snapshot.borrow().clone());
        }
        Ok(self
            .deps
            .store
            .load_state(request_id)
            .await?
            .ok_or(EngineError::UnknownRequest { request_id })?)
    }

    pub async fn list(&self) -> Result<Vec<WorkflowSummary>> {
        Ok(self.deps.store.list_workflows().await?)
    }

    pub async fn shutdown(self) {
        for (_, live) in self.active.lock().await.drain() {
            live.actor.stop(None);
        }
        self.supervisor.stop(None);
    }

    async fn spawn_workflow(&self, launch: Launch) -> Result<ActorRef<ConductorMsg>> {
        let request_id = launch.request_id();
        let (abort_tx, abort_rx) = abort_channel();
        let args = ConductorActorArgs {
            deps: self.deps.clone(),
            launch,
            abort_rx,
        };
        let (tx, rx) = oneshot::channel();
        self.supervisor
            .send_message(SupervisorMsg::Spawn(args, tx))
            .map_err(|_| anyhow!("supervisor mailbox closed"))?;
        let actor = rx
            .await
            .map_err(|_| anyhow!("supervisor dropped the reply"))?
            .map_err(|e| anyhow!("failed to launch workflow {}: {}", request_id, e))?;
        let (tx, rx) = oneshot::channel();
        actor
            .send_message(ConductorMsg::Subscribe(tx))
            .map_err(|_| anyhow!("workflow actor mailbox closed"))?;
        let snapshot = rx
            .await
            .map_err(|_| anyhow!("workflow actor dropped the reply"))?;
        self.active.lock().await.insert(
            request_id,
            ActiveWorkflow {
                actor: actor.clone(),
                abort_tx,
                snapshot,
            },
        );
        Ok(actor)
    }

    /// Fire-and-forget drive. The reply side lives in a background task
    /// whose only job is retiring the actor once the workflow can no longer
    /// move.
    fn launch_run(&self, request_id: RequestId, actor: &ActorRef<ConductorMsg>) {
        let (tx, rx) = oneshot::channel();
        if actor.send_message(ConductorMsg::Run(tx)).is_err() {
            tracing::warn!(
                request_id = %request_id,
                "workflow actor mailbox closed before run"
            );
            return;
        }
        let active = Arc::clone(&self.active);
        tokio::spawn(async move {
            let retire = match rx.await {
                Ok(Ok(state)) => state.is_terminal(),
                Ok(Err(err)) => {
                    tracing::warn!(
                        request_id = %request_id,
                        error = %err,
                        "workflow run failed"
                    );
                    true
                }
                Err(_) => true,
            };
            if retire {
                if let Some(live) = active.lock().await.remove(&request_id) {
                    live.actor.stop(None);
                }
            }
        });
    }

    async fn drive(
        &self,
        request_id: RequestId,
        actor: &ActorRef<ConductorMsg>,
    ) -> Result<WorkflowState> {
        let (tx, rx) = oneshot::channel();
        actor
            .send_message(ConductorMsg::Run(tx))
            .map_err(|_| anyhow!("workflow actor mailbox closed"))?;
        let result = match rx.await {
            Ok(result) => result,
            Err(_) => {
                self.retire(request_id).await;
                bail!("workflow actor dropped the reply");
            }
        };
        match result {
            Ok(state) => {
                self.settle(&state).await;
                Ok(state)
            }
            Err(err) => {
                self.retire(request_id).await;
                Err(err.into())
            }
        }
    }

    async fn lookup(&self, request_id: RequestId) -> Option<ActorRef<ConductorMsg>> {
        self.active
            .lock()
            .await
            .get(&request_id)
            .map(|live| live.actor.clone())
    }

    /// Retires the actor once its workflow can no longer move.
    async fn settle(&self, state: &WorkflowState) {
        if state.is_terminal() {
            self.retire(state.request_id()).await;
        }
    }

    async fn retire(&self, request_id: RequestId) {
        if let Some(live) = self.active.lock().await.remove(&request_id) {
            live.actor.stop(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::FileCheckpointStore;
    use crate::collector::ProposerRef;
    use crate::conflicts::ConflictRules;
    use crate::domain::types::{AgentId, PriorityClass, ProposalId, Urgency};
    use crate::domain::proposal::ProposedAction;
    use crate::domain::{DecisionKind, Proposal};
    use crate::engine::EngineConfig;
    use crate::policy::{ReasoningOracle, ScoringRequest};
    use crate::protocol::{
        AgentMessage, BearerToken, EngineIdentity, MessageChannel, MessageKind, MessagePriority,
    };
    use crate::domain::Decision;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    struct StubPlant {
        proposals: HashMap<AgentId, Proposal>,
    }

    #[async_trait]
    impl MessageChannel for StubPlant {
        async fn send(&self, message: AgentMessage) -> Result<AgentMessage, EngineError> {
            let payload = match message.kind {
                MessageKind::RequestProposal => match self.proposals.get(&message.recipient_id) {
                    Some(p) => serde_json::to_value(p).unwrap(),
                    None => {
                        return Err(EngineError::DeliveryFailed {
                            recipient: message.recipient_id.to_string(),
                            attempts: 1,
                            message: "offline".to_string(),
                        })
                    }
                },
                MessageKind::Command => serde_json::json!({"success": true}),
                other => panic!("unexpected {} envelope", other),
            };
            let kind = if message.kind == MessageKind::Command {
                MessageKind::Data
            } else {
                MessageKind::Proposal
            };
            Ok(AgentMessage::outbound(
                message.conversation_id,
                message.correlation_id,
                message.recipient_id,
                message.sender_id,
                kind,
                MessagePriority::Normal,
                payload,
                BearerToken::new("agent-token"),
            ))
        }
    }

    struct DownOracle;

    #[async_trait]
    impl ReasoningOracle for DownOracle {
        async fn score(&self, _request: &ScoringRequest) -> Result<Decision, EngineError> {
            Err(EngineError::OracleUnavailable {
                message: "down".to_string(),
            })
        }
    }

    struct Harness {
        deps: EngineDeps,
        _data_dir: TempDir,
    }

    fn harness(
        proposals: HashMap<AgentId, Proposal>,
        classes: &[(&str, PriorityClass)],
    ) -> Harness {
        let data_dir = tempdir().unwrap();
        let store = Arc::new(FileCheckpointStore::new(data_dir.path()).unwrap());
        let config = Arc::new(EngineConfig {
            identity: EngineIdentity {
                agent_id: "conductor".into(),
                credential: BearerToken::new("engine-token"),
            },
            proposers: classes
                .iter()
                .map(|(id, class)| ProposerRef {
                    id: (*id).into(),
                    priority_class: *class,
                })
                .collect(),
            executor_id: "plant-executor".into(),
            rules: ConflictRules::default(),
            collect_timeout: Duration::from_millis(500),
            oracle_timeout: Duration::from_millis(100),
            command_timeout: Duration::from_millis(500),
        });
        Harness {
            deps: EngineDeps {
                store,
                channel: Arc::new(StubPlant { proposals }),
                oracle: Arc::new(DownOracle),
                config,
            },
            _data_dir: data_dir,
        }
    }

    fn deadlock_proposal(request_id: RequestId, to: f64) -> Proposal {
        Proposal {
            proposal_id: ProposalId::new(),
            request_id,
            proposer_id: "ignored".into(),
            priority_class: PriorityClass::Safety,
            urgency: Urgency::High,
            actions: vec![ProposedAction {
                control_variable: "kiln_speed".into(),
                current_value: 3.2,
                proposed_value: to,
            }],
            expected_outcome: "stabilize".to_string(),
            confidence: 0.8,
            constraints: vec![],
        }
    }

    #[tokio::test]
    async fn trigger_runs_a_workflow_to_completion() {
        let h = harness(HashMap::new(), &[]);
        let orchestrator = Orchestrator::new(h.deps.clone()).await.unwrap();

        let request_id = orchestrator
            .trigger(TriggerKind::Scheduled, serde_json::json!({}))
            .await
            .unwrap();
        let state = orchestrator.wait_for_stable(request_id).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Completed);
        assert_eq!(
            state.decision.as_ref().map(|d| d.kind),
            Some(DecisionKind::NoneRequired)
        );

        // Completed workflows are served from the store, not a live actor.
        let listed = orchestrator.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        let status = orchestrator.status(state.request_id()).await.unwrap();
        assert_eq!(status, state);

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn paused_workflow_stays_live_until_its_verdict() {
        // Build the deadlock lazily: proposals must carry the request_id the
        // trigger generates, so the stub fabricates them per request instead.
        struct DeadlockPlant;

        #[async_trait]
        impl MessageChannel for DeadlockPlant {
            async fn send(&self, message: AgentMessage) -> Result<AgentMessage, EngineError> {
                let to = if message.recipient_id == AgentId::from("safety-a") {
                    3.4
                } else {
                    3.0
                };
                Ok(AgentMessage::outbound(
                    message.conversation_id,
                    message.correlation_id,
                    message.recipient_id,
                    message.sender_id,
                    MessageKind::Proposal,
                    MessagePriority::Normal,
                    serde_json::to_value(deadlock_proposal(message.correlation_id, to)).unwrap(),
                    BearerToken::new("agent-token"),
                ))
            }
        }

        let h = harness(HashMap::new(), &[]);
        let deps = EngineDeps {
            channel: Arc::new(DeadlockPlant),
            config: Arc::new(EngineConfig {
                identity: EngineIdentity {
                    agent_id: "conductor".into(),
                    credential: BearerToken::new("engine-token"),
                },
                proposers: vec![
                    ProposerRef {
                        id: "safety-a".into(),
                        priority_class: PriorityClass::Safety,
                    },
                    ProposerRef {
                        id: "safety-b".into(),
                        priority_class: PriorityClass::Safety,
                    },
                ],
                executor_id: "plant-executor".into(),
                rules: ConflictRules::default(),
                collect_timeout: Duration::from_millis(500),
                oracle_timeout: Duration::from_millis(100),
                command_timeout: Duration::from_millis(500),
            }),
            ..h.deps.clone()
        };
        let orchestrator = Orchestrator::new(deps).await.unwrap();

        let request_id = orchestrator
            .trigger(TriggerKind::Emergency, serde_json::json!({}))
            .await
            .unwrap();
        let paused = orchestrator.wait_for_stable(request_id).await.unwrap();
        assert_eq!(paused.status, WorkflowStatus::PausedForHuman);

        let finished = orchestrator
            .approve(
                paused.request_id(),
                HumanVerdict::Rejected,
                "both proposals out of band".to_string(),
            )
            .await
            .unwrap();
        assert_eq!(finished.status, WorkflowStatus::Completed);
        assert_eq!(
            finished.decision.as_ref().map(|d| d.kind),
            Some(DecisionKind::Rejected)
        );

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn trigger_returns_while_the_workflow_is_still_running() {
        // Proposers blocked behind a gate the test opens later.
        struct GatedPlant {
            gate: Arc<tokio::sync::Semaphore>,
        }

        #[async_trait]
        impl MessageChannel for GatedPlant {
            async fn send(&self, message: AgentMessage) -> Result<AgentMessage, EngineError> {
                let _permit = self.gate.acquire().await;
                Err(EngineError::DeliveryFailed {
                    recipient: message.recipient_id.to_string(),
                    attempts: 1,
                    message: "offline".to_string(),
                })
            }
        }

        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let h = harness(HashMap::new(), &[]);
        let deps = EngineDeps {
            channel: Arc::new(GatedPlant {
                gate: Arc::clone(&gate),
            }),
            config: Arc::new(EngineConfig {
                identity: EngineIdentity {
                    agent_id: "conductor".into(),
                    credential: BearerToken::new("engine-token"),
                },
                proposers: vec![ProposerRef {
                    id: "quality".into(),
                    priority_class: PriorityClass::Quality,
                }],
                executor_id: "plant-executor".into(),
                rules: ConflictRules::default(),
                collect_timeout: Duration::from_secs(10),
                oracle_timeout: Duration::from_millis(100),
                command_timeout: Duration::from_millis(500),
            }),
            ..h.deps.clone()
        };
        let orchestrator = Orchestrator::new(deps).await.unwrap();

        let request_id = orchestrator
            .trigger(TriggerKind::Scheduled, serde_json::json!({}))
            .await
            .unwrap();

        // The proposer has not answered yet, so the workflow cannot have
        // settled when the trigger call comes back.
        let running = orchestrator.status(request_id).await.unwrap();
        assert!(!running.is_terminal());

        gate.add_permits(1);
        let finished = orchestrator.wait_for_stable(request_id).await.unwrap();
        assert_eq!(finished.status, WorkflowStatus::Completed);

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn failed_approval_does_not_leave_a_live_actor() {
        let h = harness(HashMap::new(), &[]);
        let orchestrator = Orchestrator::new(h.deps.clone()).await.unwrap();

        let mut done = WorkflowState::new(WorkflowRequest::new(
            TriggerKind::Scheduled,
            serde_json::json!({}),
        ));
        h.deps.store.save_state(&done).await.unwrap();
        done.status = WorkflowStatus::Completed;
        done.version = 2;
        h.deps.store.save_state(&done).await.unwrap();

        let err = orchestrator
            .approve(
                done.request_id(),
                HumanVerdict::Approved,
                "late".to_string(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid transition"));

        // A lingering live actor would accept the abort flag; the
        // checkpointed path refuses because the workflow is terminal.
        assert!(orchestrator.abort(done.request_id()).await.is_err());

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn abort_of_a_checkpointed_workflow_errors_it() {
        let h = harness(HashMap::new(), &[]);
        let orchestrator = Orchestrator::new(h.deps.clone()).await.unwrap();

        // A workflow another process checkpointed and left behind.
        let stranded = WorkflowState::new(WorkflowRequest::new(
            TriggerKind::MarketChange,
            serde_json::json!({}),
        ));
        h.deps.store.save_state(&stranded).await.unwrap();

        orchestrator.abort(stranded.request_id()).await.unwrap();
        let state = orchestrator.status(stranded.request_id()).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Error);
        assert_eq!(state.error.as_deref(), Some("cancelled by operator"));

        // Aborting again is refused.
        assert!(orchestrator.abort(stranded.request_id()).await.is_err());
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn resume_all_finishes_stranded_workflows() {
        let h = harness(HashMap::new(), &[]);
        let orchestrator = Orchestrator::new(h.deps.clone()).await.unwrap();

        let stranded = WorkflowState::new(WorkflowRequest::new(
            TriggerKind::Scheduled,
            serde_json::json!({}),
        ));
        h.deps.store.save_state(&stranded).await.unwrap();

        let resumed = orchestrator.resume_all().await.unwrap();
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0].status, WorkflowStatus::Completed);
        assert!(h.deps.store.list_resumable().await.unwrap().is_empty());

        orchestrator.shutdown().await;
    }
}
