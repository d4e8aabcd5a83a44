use std::collections::HashMap;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::args::GlobalArgs;
use crate::bus::AgentBus;
use crate::executor::{self, HostTarget};
use crate::plan;
use crate::view;

use super::build_bus;

/// Runs a single action against an environment's hosts (config mode) or
/// one agent addressed directly (`-e <agent_id>` without `--config`).
pub async fn handle(
    globals: &GlobalArgs,
    config: Option<&Path>,
    target: &str,
    action: &str,
    raw_args: &[String],
) -> Result<ExitCode> {
    let joined = raw_args.join(" ");
    let step_args = shape_args(action, &joined);

    let (targets, ceiling, fallback) = match config {
        Some(path) => {
            let plan = plan::load(path)?;
            let env = plan
                .environments
                .get(target)
                .with_context(|| format!("environment not found: {target}"))?;
            let targets = env
                .hosts
                .iter()
                .map(|host_id| executor::resolve_target(&plan, host_id))
                .collect();
            (targets, env.concurrency, None)
        }
        None => {
            let targets = vec![HostTarget::Agent {
                host_id: target.to_string(),
                agent_id: target.to_string(),
            }];
            (targets, 0, Some(target))
        }
    };

    let bus: Arc<dyn AgentBus> = Arc::new(build_bus(globals, fallback).await?);

    println!("Ad-hoc: {action} {joined}");
    if config.is_some() {
        println!("  environment: {target}");
    } else {
        println!("  agent: {target}");
    }
    println!();

    let tally =
        executor::execute_adhoc(bus, targets, action.to_string(), step_args, ceiling).await;

    println!();
    view::print_summary(&tally);

    Ok(if tally.failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Shapes the free-form argument string into the action's argument map,
/// mirroring how plan steps are parsed.
fn shape_args(action: &str, joined: &str) -> HashMap<String, String> {
    let mut args = HashMap::new();
    match action {
        "cmd" => {
            args.insert("command".to_string(), joined.to_string());
        }
        "systemd" => {
            let mut fields = joined.split_whitespace();
            if let Some(sub_action) = fields.next() {
                args.insert("action".to_string(), sub_action.to_string());
            }
            if let Some(unit) = fields.next() {
                args.insert("unit".to_string(), unit.to_string());
            }
        }
        _ => {
            args.insert("args".to_string(), joined.to_string());
        }
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmd_keeps_the_whole_string() {
        let args = shape_args("cmd", "systemctl status nginx | head -1");
        assert_eq!(args["command"], "systemctl status nginx | head -1");
    }

    #[test]
    fn systemd_splits_action_and_unit() {
        let args = shape_args("systemd", "restart nginx");
        assert_eq!(args["action"], "restart");
        assert_eq!(args["unit"], "nginx");
    }

    #[test]
    fn other_verbs_get_the_raw_string() {
        let args = shape_args("write_file", "/etc/motd content=hi");
        assert_eq!(args["args"], "/etc/motd content=hi");
    }
}
