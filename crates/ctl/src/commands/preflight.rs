use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::args::GlobalArgs;
use crate::bus::AgentBus;
use crate::executor::{self, HostTarget};
use crate::plan;

use super::build_bus;

const LOW_MEMORY_MB: u64 = 256;
const HIGH_DISK_PERCENT: u32 = 90;

/// Health checks every host via discovery, then dry-runs the whole
/// environment so change detection reports what a real run would do.
pub async fn handle(globals: &GlobalArgs, config: &Path, env_name: &str) -> Result<ExitCode> {
    let plan = Arc::new(plan::load(config)?);
    let env = plan
        .environments
        .get(env_name)
        .with_context(|| format!("environment not found: {env_name}"))?
        .clone();

    let bus: Arc<dyn AgentBus> = Arc::new(build_bus(globals, None).await?);

    println!("Preflight check: {env_name}");
    println!();
    println!("1. System health checks");
    println!("───────────────────────");

    let mut checks = Vec::new();
    for host_id in &env.hosts {
        let bus = bus.clone();
        let target = executor::resolve_target(&plan, host_id);
        checks.push(tokio::spawn(async move { check_host(bus, target).await }));
    }
    for check in checks {
        let _ = check.await;
    }
    println!();

    println!("2. Dry run execution");
    println!("────────────────────");
    let tally = executor::execute_environment(bus, plan, env_name, true).await?;

    println!();
    println!(
        "Config check: ok={} changed={} failed={}",
        tally.ok, tally.changed, tally.failed
    );
    if tally.failed > 0 {
        println!("✗ Preflight check FAILED");
        Ok(ExitCode::FAILURE)
    } else {
        println!("Preflight check PASSED");
        Ok(ExitCode::SUCCESS)
    }
}

async fn check_host(bus: Arc<dyn AgentBus>, target: HostTarget) {
    let (host_id, agent_id) = match target {
        HostTarget::Missing(host_id) => {
            eprintln!("  ✗ Host not found: {host_id}");
            return;
        }
        HostTarget::Agent { host_id, agent_id } => (host_id, agent_id),
    };

    let reply = match bus.discover(&agent_id).await {
        Ok(reply) => reply,
        Err(err) => {
            println!("  ✗ [{host_id}] discovery failed: {err}");
            return;
        }
    };

    let free_mb = reply.memory_free / 1024 / 1024;
    let mut healthy = true;
    if free_mb < LOW_MEMORY_MB {
        println!("  ⚠ [{host_id}] low memory: {free_mb} MB free (warning < {LOW_MEMORY_MB} MB)");
        healthy = false;
    }
    if reply.disk_usage_root > HIGH_DISK_PERCENT {
        println!(
            "  ⚠ [{host_id}] high disk usage: {}% used (warning > {HIGH_DISK_PERCENT}%)",
            reply.disk_usage_root
        );
        healthy = false;
    }

    if healthy {
        println!(
            "  [{host_id}] system healthy (os: {}, mem: {free_mb} MB free, disk: {}% used)",
            reply.os, reply.disk_usage_root
        );
    } else {
        println!("  ⚠ [{host_id}] system checks completed with warnings");
    }
}
