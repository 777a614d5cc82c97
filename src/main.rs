mod checkpoint;
mod collector;
mod config;
mod conflicts;
mod dispatcher;
mod domain;
mod engine;
mod orchestrator;
mod policy;
mod protocol;

use crate::checkpoint::{CheckpointStore, FileCheckpointStore, WorkflowSummary};
use crate::config::ConductorConfig;
use crate::domain::types::{RequestId, TriggerKind};
use crate::domain::{HumanVerdict, WorkflowState};
use crate::engine::EngineDeps;
use crate::orchestrator::Orchestrator;
use crate::policy::{ChannelOracle, ReasoningOracle};
use crate::protocol::{MessageChannel, ProcessChannel, RecordingChannel, RetryingChannel};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "Decision orchestration engine for autonomous plant operation")]
#[command(version)]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "conductor.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Trigger a new decision workflow and drive it to its next stable point
    Trigger {
        #[arg(value_enum)]
        trigger: TriggerArg,
        /// Inline JSON context forwarded to proposers verbatim
        #[arg(long, default_value = "{}")]
        context: String,
    },
    /// Show the full state of one workflow
    Status { request_id: String },
    /// List all checkpointed workflows, newest first
    List,
    /// Record a human verdict on a workflow paused for approval
    Approve {
        request_id: String,
        /// Reject instead of approving
        #[arg(long)]
        reject: bool,
        #[arg(long, default_value = "recorded via CLI")]
        rationale: String,
    },
    /// Abort a workflow
    Abort { request_id: String },
    /// Resume checkpointed workflows (all non-terminal ones by default)
    Resume { request_id: Option<String> },
}

#[derive(Clone, Copy, ValueEnum)]
enum TriggerArg {
    QualityDeviation,
    MarketChange,
    Scheduled,
    Emergency,
}

impl From<TriggerArg> for TriggerKind {
    fn from(arg: TriggerArg) -> Self {
        match arg {
            TriggerArg::QualityDeviation => TriggerKind::QualityDeviation,
            TriggerArg::MarketChange => TriggerKind::MarketChange,
            TriggerArg::Scheduled => TriggerKind::Scheduled,
            TriggerArg::Emergency => TriggerKind::Emergency,
        }
    }
}

fn build_deps(config: &ConductorConfig) -> Result<EngineDeps> {
    let store = Arc::new(FileCheckpointStore::new(&config.data_dir()?)?);
    let transport = ProcessChannel::new(config.endpoints());
    let retrying = RetryingChannel::new(
        transport,
        config.protocol_config(),
        config.expected_credentials(),
    );
    let channel: Arc<dyn MessageChannel> = Arc::new(RecordingChannel::new(
        retrying,
        store.clone() as Arc<dyn CheckpointStore>,
    ));
    let engine_config = Arc::new(config.engine_config());
    let oracle: Arc<dyn ReasoningOracle> = Arc::new(ChannelOracle::new(
        channel.clone(),
        config.oracle_id(),
        engine_config.identity.clone(),
    ));
    Ok(EngineDeps {
        store,
        channel,
        oracle,
        config: engine_config,
    })
}

fn parse_request_id(s: &str) -> Result<RequestId> {
    RequestId::parse(s).with_context(|| format!("'{}' is not a valid request id", s))
}

fn print_state(state: &WorkflowState) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(state)?);
    Ok(())
}

fn print_outcome(state: &WorkflowState) {
    println!("workflow {}: {}", state.request_id(), state.status);
    if let Some(decision) = &state.decision {
        println!(
            "  decision: {:?} ({} approved, {} rejected) - {}",
            decision.kind,
            decision.approved_actions.len(),
            decision.rejected_actions.len(),
            decision.rationale
        );
    }
    if let Some(note) = &state.execution_note {
        println!("  note: {}", note);
    }
    if let Some(error) = &state.error {
        println!("  error: {}", error);
    }
}

fn print_summaries(summaries: &[WorkflowSummary]) {
    if summaries.is_empty() {
        println!("no workflows checkpointed");
        return;
    }
    for summary in summaries {
        println!(
            "{}  {:<16} v{:<4} {}",
            summary.request_id,
            summary.status.to_string(),
            summary.version,
            summary.updated_at.to_rfc3339()
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConductorConfig::load(&cli.config)?;
    let deps = build_deps(&config)?;
    let orchestrator = Orchestrator::new(deps).await?;

    let result = run_command(&orchestrator, cli.command).await;
    orchestrator.shutdown().await;
    result
}

async fn run_command(orchestrator: &Orchestrator, command: Command) -> Result<()> {
    match command {
        Command::Trigger { trigger, context } => {
            let context: serde_json::Value =
                serde_json::from_str(&context).context("context is not valid JSON")?;
            let request_id = orchestrator.trigger(trigger.into(), context).await?;
            println!("workflow {} started", request_id);
            let state = orchestrator.wait_for_stable(request_id).await?;
            print_outcome(&state);
        }
        Command::Status { request_id } => {
            let state = orchestrator.status(parse_request_id(&request_id)?).await?;
            print_state(&state)?;
        }
        Command::List => {
            let summaries = orchestrator.list().await?;
            print_summaries(&summaries);
        }
        Command::Approve {
            request_id,
            reject,
            rationale,
        } => {
            let verdict = if reject {
                HumanVerdict::Rejected
            } else {
                HumanVerdict::Approved
            };
            let state = orchestrator
                .approve(parse_request_id(&request_id)?, verdict, rationale)
                .await?;
            print_outcome(&state);
        }
        Command::Abort { request_id } => {
            let request_id = parse_request_id(&request_id)?;
            orchestrator.abort(request_id).await?;
            println!("workflow {} aborted", request_id);
        }
        Command::Resume { request_id } => match request_id {
            Some(id) => {
                let state = orchestrator.resume(parse_request_id(&id)?).await?;
                print_outcome(&state);
            }
            None => {
                let resumed = orchestrator.resume_all().await?;
                if resumed.is_empty() {
                    println!("nothing to resume");
                }
                for state in &resumed {
                    print_outcome(state);
                }
            }
        },
    }
    Ok(())
}
