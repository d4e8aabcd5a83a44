use std::process::ExitCode;
use std::time::Instant;

use anyhow::Result;

use crate::args::GlobalArgs;
use crate::bus::{AgentBus, BusError};

use super::build_bus;

pub async fn handle(globals: &GlobalArgs, agent_id: &str) -> Result<ExitCode> {
    let bus = build_bus(globals, Some(agent_id)).await?;

    let start = Instant::now();
    match bus.ping(agent_id).await {
        Ok(reply) => {
            let rtt = start.elapsed();
            println!(
                "Agent {}: version={} uptime={}s cpu={:.1}% mem={:.1}% rtt={}ms",
                reply.agent_id,
                reply.version,
                reply.uptime_seconds,
                reply.cpu_usage,
                reply.memory_usage,
                rtt.as_millis()
            );
            Ok(ExitCode::SUCCESS)
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
