//! Actor wrapper around one workflow engine.
//!
//! The actor owns the engine, so all mutation of one workflow's state is
//! serialized through its mailbox. Long-running drives block the mailbox on
//! purpose: an approval cannot race a step, and aborts go through the watch
//! flag instead of a message.

use crate::domain::types::RequestId;
use crate::domain::{EngineError, HumanVerdict, WorkflowRequest, WorkflowState};
use crate::engine::{EngineDeps, WorkflowEngine};
use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::{oneshot, watch};

/// How the actor obtains its engine on start.
#[derive(Clone)]
pub enum Launch {
    New(WorkflowRequest),
    Resume(RequestId),
}

impl Launch {
    pub fn request_id(&self) -> RequestId {
        match self {
            Launch::New(request) => request.request_id,
            Launch::Resume(request_id) => *request_id,
        }
    }
}

#[derive(Clone)]
pub struct ConductorActorArgs {
    pub deps: EngineDeps,
    pub launch: Launch,
    pub abort_rx: watch::Receiver<bool>,
}

pub enum ConductorMsg {
    /// Drive the workflow until it completes, fails, or pauses.
    Run(oneshot::Sender<Result<WorkflowState, EngineError>>),
    /// Apply a human verdict to a paused workflow and continue it.
    Approval {
        verdict: HumanVerdict,
        rationale: String,
        reply: oneshot::Sender<Result<WorkflowState, EngineError>>,
    },
    /// Watch receiver tracking every committed transition.
    Subscribe(oneshot::Sender<watch::Receiver<WorkflowState>>),
}

pub struct ConductorActor;

#[async_trait]
impl Actor for ConductorActor {
    type Msg = ConductorMsg;
    type State = WorkflowEngine;
    type Arguments = ConductorActorArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let engine = match args.launch {
            Launch::New(request) => {
                WorkflowEngine::start(args.deps, request, args.abort_rx).await?
            }
            Launch::Resume(request_id) => {
                WorkflowEngine::resume(args.deps, request_id, args.abort_rx).await?
            }
        };
        Ok(engine)
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        engine: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ConductorMsg::Run(reply) => {
                let result = engine.run().await;
                if reply.send(result).is_err() {
                    tracing::debug!("run reply channel closed");
                }
            }
            ConductorMsg::Approval {
                verdict,
                rationale,
                reply,
            } => {
                let result = engine.apply_approval(verdict, rationale).await;
                if reply.send(result).is_err() {
                    tracing::debug!("approval reply channel closed");
                }
            }
            ConductorMsg::Subscribe(reply) => {
                if reply.send(engine.snapshot()).is_err() {
                    tracing::debug!("subscribe reply channel closed");
                }
            }
        }
        Ok(())
    }
}
