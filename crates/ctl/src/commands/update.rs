use std::process::ExitCode;

use anyhow::Result;

use common::version;

use crate::args::GlobalArgs;
use crate::bus::{AgentBus, BusError};

use super::build_bus;

pub async fn handle(globals: &GlobalArgs, agent_id: &str, binary_url: &str) -> Result<ExitCode> {
    let bus = build_bus(globals, Some(agent_id)).await?;

    println!("Updating agent {agent_id} to version {}", version::VERSION);

    match bus.update(agent_id, version::VERSION, binary_url).await {
        Ok(reply) if reply.success => {
            println!("{}", reply.message);
            Ok(ExitCode::SUCCESS)
        }
        Ok(reply) => {
            eprintln!("✗ Update failed: {}", reply.error);
            Ok(ExitCode::FAILURE)
        }
        Err(BusError::Timeout(window)) => {
            eprintln!(
                "✗ Agent {agent_id}: timeout (no response within {})",
                humantime::format_duration(window)
            );
            Ok(ExitCode::FAILURE)
        }
        Err(err) => Err(err.into()),
    }
}
