//! Supervisor for workflow actors.
//!
//! A failed actor is respawned in resume mode, so it re-reads the last
//! checkpoint and picks up where the crash left it. A normally terminated
//! actor is forgotten.

use crate::orchestrator::actor::{ConductorActor, ConductorActorArgs, ConductorMsg, Launch};
use async_trait::async_trait;
use ractor::{Actor, ActorId, ActorProcessingErr, ActorRef, SpawnErr, SupervisionEvent};
use std::collections::HashMap;
use tokio::sync::oneshot;

pub enum SupervisorMsg {
    Spawn(
        ConductorActorArgs,
        oneshot::Sender<Result<ActorRef<ConductorMsg>, SpawnErr>>,
    ),
}

pub struct ConductorSupervisor;

#[async_trait]
impl Actor for ConductorSupervisor {
    type Msg = SupervisorMsg;
    type State = HashMap<ActorId, ConductorActorArgs>;
    type Arguments = ();

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        _args: (),
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(HashMap::new())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        msg: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match msg {
            SupervisorMsg::Spawn(args, reply) => {
                let spawned = ConductorActor::spawn_linked(
                    None,
                    ConductorActor,
                    args.clone(),
                    myself.get_cell(),
                )
                .await;
                let result = match spawned {
                    Ok((actor, _handle)) => {
                        state.insert(actor.get_id(), args);
                        Ok(actor)
                    }
                    Err(err) => Err(err),
                };
                if reply.send(result).is_err() {
                    tracing::debug!("spawn reply channel closed");
                }
            }
        }
        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        evt: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match evt {
            SupervisionEvent::ActorFailed(cell, error) => {
                let Some(mut args) = state.remove(&cell.get_id()) else {
                    return Ok(());
                };
                let request_id = args.launch.request_id();
                tracing::warn!(
                    request_id = %request_id,
                    error = %error,
                    "workflow actor failed, restarting from its checkpoint"
                );
                args.launch = Launch::Resume(request_id);
                let (actor, _handle) = ConductorActor::spawn_linked(
                    None,
                    ConductorActor,
                    args.clone(),
                    myself.get_cell(),
                )
                .await?;
                state.insert(actor.get_id(), args);
                // Fire-and-forget: the restarted workflow drives itself to
                // its next stable point.
                let (tx, _rx) = oneshot::channel();
                let _ = actor.send_message(ConductorMsg::Run(tx));
            }
            SupervisionEvent::ActorTerminated(cell, _, _) => {
                state.remove(&cell.get_id());
            }
            _ => {}
        }
        Ok(())
    }
}
