use anyhow::{Context, Result};
use serde::Deserialize;

use common::netutil;

/// Conventional location of the agent configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/stapply/agent.ini";

/// `[agent]` section of the INI configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AgentConfig {
    /// Identity used as the last component of every subscribed subject.
    /// Falls back to the host's hostname when empty.
    #[serde(default)]
    pub agent_id: String,
    /// Broker address; resolution order is config, then
    /// `STAPPLY_DEFAULT_NATS`, then `localhost`.
    #[serde(default)]
    pub nats_url: String,
    /// Optional NATS credentials file.
    #[serde(default)]
    pub nats_creds: String,
}

#[derive(Debug, Deserialize, Default)]
struct RootConfig {
    #[serde(default)]
    agent: AgentConfig,
}

pub fn load(path: &str) -> Result<AgentConfig> {
    let cfg = config::Config::builder()
        .add_source(config::File::new(path, config::FileFormat::Ini).required(false))
        .build()
        .with_context(|| format!("failed to load agent config from {path}"))?;

    let root: RootConfig = cfg
        .try_deserialize()
        .with_context(|| format!("invalid agent config in {path}"))?;
    Ok(root.agent)
}

pub fn resolve_agent_id(cfg: &AgentConfig) -> Result<String> {
    if !cfg.agent_id.is_empty() {
        return Ok(cfg.agent_id.clone());
    }
    sysinfo::System::host_name()
        .context("agent_id is missing and the hostname could not be determined")
}

pub fn resolve_broker(cfg: &AgentConfig) -> Result<String> {
    if !cfg.nats_url.is_empty() {
        return Ok(cfg.nats_url.clone());
    }
    if let Some(value) = netutil::default_nats_from_env()? {
        return Ok(value);
    }
    Ok("localhost".to_string())
}
