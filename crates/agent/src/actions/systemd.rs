use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;

use common::proto::RunReply;

use super::{elapsed_ms, missing_arg, Action};

const VALID_ACTIONS: &[&str] = &[
    "enable",
    "disable",
    "start",
    "stop",
    "restart",
    "daemon-reload",
];

/// Controls systemd units with pre-state change detection.
///
/// `is-enabled`/`is-active` are queried before acting so `changed`
/// reflects whether the pre-state already satisfied the post-state.
pub struct SystemdAction;

#[async_trait]
impl Action for SystemdAction {
    async fn execute(
        &self,
        request_id: &str,
        args: &HashMap<String, String>,
        dry_run: bool,
    ) -> RunReply {
        let start = Instant::now();

        let Some(action) = args.get("action").filter(|a| !a.is_empty()) else {
            return RunReply::error(request_id, missing_arg("systemd", "action"), 0);
        };
        if !VALID_ACTIONS.contains(&action.as_str()) {
            return RunReply::error(
                request_id,
                format!("invalid systemd action: {action}"),
                elapsed_ms(start),
            );
        }

        let unit = match args.get("unit").filter(|u| !u.is_empty()) {
            Some(unit) => unit.as_str(),
            None if action == "daemon-reload" => "",
            None => return RunReply::error(request_id, missing_arg("systemd", "unit"), 0),
        };

        let changed = predict_change(action, unit).await;

        if dry_run {
            let target = if unit.is_empty() {
                format!("systemctl {action}")
            } else {
                format!("systemctl {action} {unit}")
            };
            return RunReply::completed(
                request_id,
                changed,
                0,
                format!("Dry run: would run {target}"),
                "",
                elapsed_ms(start),
            );
        }

        let mut command = Command::new("systemctl");
        command.arg(action);
        if !unit.is_empty() {
            command.arg(unit);
        }

        let output = match command.output().await {
            Ok(output) => output,
            Err(err) => {
                return RunReply::error(
                    request_id,
                    format!("failed to run systemctl: {err}"),
                    elapsed_ms(start),
                )
            }
        };

        RunReply::completed(
            request_id,
            changed,
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
            elapsed_ms(start),
        )
    }
}

async fn predict_change(action: &str, unit: &str) -> bool {
    match action {
        "enable" => !is_enabled(unit).await,
        "disable" => is_enabled(unit).await,
        "start" => !is_active(unit).await,
        "stop" => is_active(unit).await,
        // restart only transitions observable state when the unit runs
        "restart" => is_active(unit).await,
        // daemon-reload has no observable pre-state
        _ => true,
    }
}

async fn is_enabled(unit: &str) -> bool {
    unit_state("is-enabled", unit, "enabled").await
}

async fn is_active(unit: &str) -> bool {
    unit_state("is-active", unit, "active").await
}

async fn unit_state(query: &str, unit: &str, expected: &str) -> bool {
    match Command::new("systemctl").arg(query).arg(unit).output().await {
        Ok(output) => String::from_utf8_lossy(&output.stdout).trim() == expected,
        Err(_) => false,
    }
}
