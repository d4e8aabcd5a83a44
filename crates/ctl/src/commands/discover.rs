use std::process::ExitCode;

use anyhow::Result;

use crate::args::GlobalArgs;
use crate::bus::{AgentBus, BusError};
use crate::view;

use super::build_bus;

pub async fn handle(globals: &GlobalArgs, agent_id: &str) -> Result<ExitCode> {
    let bus = build_bus(globals, Some(agent_id)).await?;

    let reply = match bus.discover(agent_id).await {
        Ok(reply) => reply,
        Err(BusError::Timeout(window)) => {
            eprintln!(
                "✗ Agent {agent_id}: timeout (no response within {})",
                humantime::format_duration(window)
            );
            return Ok(ExitCode::FAILURE);
        }
        Err(err) => return Err(err.into()),
    };

    println!("Discovery results for {}", reply.agent_id);
    println!("{}", view::SEPARATOR);
    println!("Hostname:    {}", reply.hostname);
    println!("OS/Arch:     {}/{}", reply.os, reply.arch);
    println!("CPU count:   {}", reply.cpu_count);
    println!(
        "Memory:      {} MB (free: {} MB)",
        reply.memory_total / 1024 / 1024,
        reply.memory_free / 1024 / 1024
    );
    println!("Root disk:   {}% used", reply.disk_usage_root);
    println!("IP addrs:    {}", reply.ip_addresses.join(", "));
    println!();

    Ok(ExitCode::SUCCESS)
}
