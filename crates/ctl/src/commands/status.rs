use std::path::Path;
use std::process::ExitCode;

use anyhow::Result;

use crate::plan;

pub fn handle(config: &Path) -> Result<ExitCode> {
    let plan = plan::load(config)?;

    println!("Configuration summary");
    println!();

    println!("Environments ({}):", plan.environments.len());
    let mut env_names: Vec<_> = plan.environments.keys().collect();
    env_names.sort();
    for name in env_names {
        let env = &plan.environments[name];
        println!("  {name}");
        println!("    hosts: {}", env.hosts.join(", "));
        println!("    apps: {}", env.apps.join(", "));
        if env.concurrency > 0 {
            println!("    concurrency: {}", env.concurrency);
        }
    }
    println!();

    println!("Hosts ({}):", plan.hosts.len());
    let mut host_ids: Vec<_> = plan.hosts.keys().collect();
    host_ids.sort();
    for id in host_ids {
        let host = &plan.hosts[id];
        println!("  {id} (agent_id={})", host.agent_id());
        if !host.tags.is_empty() {
            println!("    tags: {}", host.tags.join(", "));
        }
    }
    println!();

    println!("Apps ({}):", plan.apps.len());
    let mut app_names: Vec<_> = plan.apps.keys().collect();
    app_names.sort();
    for name in app_names {
        println!("  {name} ({} steps)", plan.apps[name].step_count());
    }

    Ok(ExitCode::SUCCESS)
}
