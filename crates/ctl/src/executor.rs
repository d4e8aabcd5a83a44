//! Parallel plan executor.
//!
//! One worker task per host, gated by a counted semaphore sized to the
//! environment's concurrency ceiling (zero means every host at once).
//! Within a worker, apps run in listed order and steps strictly in
//! ascending step-number order; a failed step is tallied and the remaining
//! steps continue. Workers report their tallies over a channel that the
//! caller drains after fan-out.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, Semaphore};

use common::proto::{RunReply, Status};

use crate::artifact;
use crate::bus::AgentBus;
use crate::plan::{Environment, Plan, Step};
use crate::view;

/// Marker rerouting a `cmd` step into the artifact sub-protocol.
pub const ARTIFACT_MARKER: &str = "STAPPLY_ACTION: deploy_artifact";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    pub ok: usize,
    pub changed: usize,
    pub failed: usize,
}

impl Tally {
    pub fn absorb(&mut self, other: Tally) {
        self.ok += other.ok;
        self.changed += other.changed;
        self.failed += other.failed;
    }

    pub fn record(&mut self, reply: &RunReply) {
        match reply.status {
            Status::Ok if reply.changed => self.changed += 1,
            Status::Ok => self.ok += 1,
            _ => self.failed += 1,
        }
    }
}

/// Executes every `(host, app, step)` of one environment and returns the
/// combined tally.
pub async fn execute_environment(
    bus: Arc<dyn AgentBus>,
    plan: Arc<Plan>,
    env_name: &str,
    dry_run: bool,
) -> Result<Tally> {
    let env = plan
        .environments
        .get(env_name)
        .with_context(|| format!("environment not found: {env_name}"))?
        .clone();

    let targets: Vec<HostTarget> = env
        .hosts
        .iter()
        .map(|host_id| resolve_target(&plan, host_id))
        .collect();

    fan_out(bus, plan, Arc::new(env), targets, dry_run).await
}

/// Executes a single action across explicit targets (the `adhoc` path).
pub async fn execute_adhoc(
    bus: Arc<dyn AgentBus>,
    targets: Vec<HostTarget>,
    action: String,
    args: HashMap<String, String>,
    ceiling: usize,
) -> Tally {
    let width = effective_width(ceiling, targets.len());
    let semaphore = Arc::new(Semaphore::new(width));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let color = view::color_enabled();
    let action = Arc::new(action);
    let args = Arc::new(args);

    for target in targets {
        let bus = bus.clone();
        let semaphore = semaphore.clone();
        let tx = tx.clone();
        let action = action.clone();
        let args = args.clone();
        tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                let _ = tx.send(Tally { failed: 1, ..Tally::default() });
                return;
            };
            let mut tally = Tally::default();
            match target {
                HostTarget::Missing(host_id) => {
                    eprintln!("✗ Host not found: {host_id}");
                    tally.failed += 1;
                }
                HostTarget::Agent { host_id, agent_id } => {
                    println!("Host: {host_id} (agent_id={agent_id})");
                    let reply = bus
                        .run_action(&agent_id, &action, (*args).clone(), false)
                        .await;
                    tally.record(&reply);
                    view::print_step_outcome("  ", &reply, color);
                    if !reply.stdout.trim().is_empty() {
                        println!("  {}", reply.stdout.trim());
                    }
                }
            }
            let _ = tx.send(tally);
        });
    }
    drop(tx);

    let mut total = Tally::default();
    while let Some(tally) = rx.recv().await {
        total.absorb(tally);
    }
    total
}

/// A host reference resolved against the plan's host table.
#[derive(Debug, Clone)]
pub enum HostTarget {
    Agent { host_id: String, agent_id: String },
    Missing(String),
}

pub fn resolve_target(plan: &Plan, host_id: &str) -> HostTarget {
    match plan.hosts.get(host_id) {
        Some(host) => HostTarget::Agent {
            host_id: host_id.to_string(),
            agent_id: host.agent_id().to_string(),
        },
        None => HostTarget::Missing(host_id.to_string()),
    }
}

fn effective_width(ceiling: usize, host_count: usize) -> usize {
    if ceiling == 0 {
        host_count.max(1)
    } else {
        ceiling
    }
}

async fn fan_out(
    bus: Arc<dyn AgentBus>,
    plan: Arc<Plan>,
    env: Arc<Environment>,
    targets: Vec<HostTarget>,
    dry_run: bool,
) -> Result<Tally> {
    let width = effective_width(env.concurrency, targets.len());
    let semaphore = Arc::new(Semaphore::new(width));
    let (tx, mut rx) = mpsc::unbounded_channel();

    for target in targets {
        let bus = bus.clone();
        let plan = plan.clone();
        let env = env.clone();
        let semaphore = semaphore.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                let _ = tx.send(Tally { failed: 1, ..Tally::default() });
                return;
            };
            let tally = run_host(bus.as_ref(), &plan, &env, target, dry_run).await;
            let _ = tx.send(tally);
        });
    }
    drop(tx);

    let mut total = Tally::default();
    while let Some(tally) = rx.recv().await {
        total.absorb(tally);
    }
    Ok(total)
}

async fn run_host(
    bus: &dyn AgentBus,
    plan: &Plan,
    env: &Environment,
    target: HostTarget,
    dry_run: bool,
) -> Tally {
    let mut tally = Tally::default();
    let color = view::color_enabled();

    let (host_id, agent_id) = match target {
        HostTarget::Missing(host_id) => {
            eprintln!("✗ Host not found: {host_id}");
            tally.failed += 1;
            return tally;
        }
        HostTarget::Agent { host_id, agent_id } => (host_id, agent_id),
    };

    println!("Host: {host_id} (agent_id={agent_id})");

    for app_name in &env.apps {
        let Some(app) = plan.apps.get(app_name) else {
            println!("  ✗ App not found: {app_name}");
            tally.failed += 1;
            continue;
        };
        println!("  App: {app_name}");

        for (step_no, step) in app.ordered_steps() {
            println!("    Step {step_no}: {}", step.action);

            if !dry_run {
                if let Some(kv) = artifact_step(step) {
                    run_artifact_step(bus, &agent_id, kv, &mut tally).await;
                    continue;
                }
            }

            let reply = bus
                .run_action(&agent_id, &step.action, step.args.clone(), dry_run)
                .await;
            tally.record(&reply);
            view::print_step_outcome("      ", &reply, color);
        }
    }
    println!();

    tally
}

/// Detects the `STAPPLY_ACTION: deploy_artifact` marker and tokenises the
/// trailing `key=value` pairs.
fn artifact_step(step: &Step) -> Option<HashMap<String, String>> {
    if step.action != "cmd" {
        return None;
    }
    let command = step.args.get("command")?;
    let rest = command.strip_prefix(ARTIFACT_MARKER)?;
    Some(parse_kv(rest))
}

fn parse_kv(input: &str) -> HashMap<String, String> {
    input
        .split_whitespace()
        .filter_map(|token| token.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

async fn run_artifact_step(
    bus: &dyn AgentBus,
    agent_id: &str,
    kv: HashMap<String, String>,
    tally: &mut Tally,
) {
    let (Some(src), Some(dest)) = (kv.get("src"), kv.get("dest")) else {
        println!("      ✗ Error: deploy_artifact requires src= and dest=");
        tally.failed += 1;
        return;
    };

    println!("      Deploying artifact: {src} -> {dest}");
    match artifact::push_artifact(bus, agent_id, src, dest).await {
        Ok(()) => {
            println!("      Artifact deployed");
            tally.changed += 1;
        }
        Err(err) => {
            println!("      ✗ Artifact deployment failed: {err:#}");
            tally.failed += 1;
        }
    }
}
