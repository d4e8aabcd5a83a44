use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::args::GlobalArgs;
use crate::bus::AgentBus;
use crate::executor;
use crate::plan;
use crate::view;

use super::build_bus;

pub async fn handle(globals: &GlobalArgs, config: &Path, env_name: &str) -> Result<ExitCode> {
    let plan = Arc::new(plan::load(config)?);
    let env = plan
        .environments
        .get(env_name)
        .with_context(|| format!("environment not found: {env_name}"))?;

    let bus: Arc<dyn AgentBus> = Arc::new(build_bus(globals, None).await?);

    println!("Executing environment: {env_name}");
    println!("  hosts: {}", env.hosts.join(", "));
    println!("  apps: {}", env.apps.join(", "));
    println!();

    let tally = executor::execute_environment(bus, plan, env_name, false).await?;
    view::print_summary(&tally);

    Ok(if tally.failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
