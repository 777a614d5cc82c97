//! YAML configuration for the conductor.

use crate::collector::ProposerRef;
use crate::conflicts::ConflictRules;
use crate::domain::types::{AgentId, PriorityClass};
use crate::engine::EngineConfig;
use crate::protocol::{AgentEndpoint, BearerToken, EngineIdentity, ProtocolConfig};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConductorConfig {
    /// Where checkpoints live. Defaults to the platform data directory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    pub engine: EngineSection,
    /// Every external agent the conductor may talk to, keyed by agent ID.
    pub agents: HashMap<String, AgentSection>,
    pub proposers: Vec<ProposerSection>,
    pub oracle: OracleSection,
    pub executor: ExecutorSection,
    #[serde(default)]
    pub protocol: ProtocolSection,
    /// Per-proposer collection deadline in seconds.
    #[serde(default = "default_collect_timeout_secs")]
    pub collect_timeout_secs: u64,
    #[serde(default)]
    pub conflict_rules: ConflictRules,
}

/// Identity the conductor presents on the wire.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineSection {
    pub id: String,
    pub token: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentSection {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Credential this agent's replies must carry.
    pub token: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProposerSection {
    pub agent: String,
    /// Constitutional class granted by the operator. A proposal can never
    /// claim a higher class than its proposer was registered with.
    pub priority_class: PriorityClass,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OracleSection {
    pub agent: String,
    #[serde(default = "default_oracle_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutorSection {
    pub agent: String,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProtocolSection {
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

impl Default for ProtocolSection {
    fn default() -> Self {
        Self {
            attempt_timeout_secs: default_attempt_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            retry_base_ms: default_retry_base_ms(),
        }
    }
}

fn default_collect_timeout_secs() -> u64 {
    60
}

fn default_oracle_timeout_secs() -> u64 {
    45
}

fn default_command_timeout_secs() -> u64 {
    60
}

fn default_attempt_timeout_secs() -> u64 {
    30
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    500
}

impl ConductorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file as YAML: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.engine.id.trim().is_empty() {
            anyhow::bail!("engine.id must not be empty");
        }
        if self.engine.token.trim().is_empty() {
            anyhow::bail!("engine.token must not be empty");
        }
        for (id, agent) in &self.agents {
            if agent.token.trim().is_empty() {
                anyhow::bail!("agent '{}' has an empty token", id);
            }
        }
        for proposer in &self.proposers {
            if !self.agents.contains_key(&proposer.agent) {
                anyhow::bail!(
                    "proposer '{}' not found in agents configuration",
                    proposer.agent
                );
            }
        }
        if !self.agents.contains_key(&self.oracle.agent) {
            anyhow::bail!(
                "oracle agent '{}' not found in agents configuration",
                self.oracle.agent
            );
        }
        if !self.agents.contains_key(&self.executor.agent) {
            anyhow::bail!(
                "executor agent '{}' not found in agents configuration",
                self.executor.agent
            );
        }
        Ok(())
    }

    /// Resolved checkpoint directory.
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        dirs::data_dir()
            .map(|d| d.join("plant-conductor"))
            .context("no data directory available; set data_dir in the config")
    }

    /// Subprocess endpoint table for the transport layer.
    pub fn endpoints(&self) -> HashMap<AgentId, AgentEndpoint> {
        self.agents
            .iter()
            .map(|(id, agent)| {
                (
                    AgentId::from(id.clone()),
                    AgentEndpoint {
                        command: agent.command.clone(),
                        args: agent.args.clone(),
                    },
                )
            })
            .collect()
    }

    /// Expected reply credential per agent, for reply authentication.
    pub fn expected_credentials(&self) -> HashMap<AgentId, BearerToken> {
        self.agents
            .iter()
            .map(|(id, agent)| (AgentId::from(id.clone()), BearerToken::new(&agent.token)))
            .collect()
    }

    pub fn protocol_config(&self) -> ProtocolConfig {
        ProtocolConfig {
            attempt_timeout: Duration::from_secs(self.protocol.attempt_timeout_secs),
            retry_attempts: self.protocol.retry_attempts,
            retry_base: Duration::from_millis(self.protocol.retry_base_ms),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            identity: EngineIdentity {
                agent_id: AgentId::from(self.engine.id.clone()),
                credential: BearerToken::new(&self.engine.token),
            },
            proposers: self
                .proposers
                .iter()
                .map(|p| ProposerRef {
                    id: AgentId::from(p.agent.clone()),
                    priority_class: p.priority_class,
                })
                .collect(),
            executor_id: AgentId::from(self.executor.agent.clone()),
            rules: self.conflict_rules.clone(),
            collect_timeout: Duration::from_secs(self.collect_timeout_secs),
            oracle_timeout: Duration::from_secs(self.oracle.timeout_secs),
            command_timeout: Duration::from_secs(self.executor.command_timeout_secs),
        }
    }

    pub fn oracle_id(&self) -> AgentId {
        AgentId::from(self.oracle.agent.clone())
    }
}
