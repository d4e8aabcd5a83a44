use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;

use common::proto::RunReply;

use super::{elapsed_ms, missing_arg, Action};

/// Executes shell commands via `sh -c`.
///
/// The optional `creates` argument is an idempotency guard: when the named
/// path already exists the command is skipped and the reply is unchanged.
pub struct CmdAction;

#[async_trait]
impl Action for CmdAction {
    async fn execute(
        &self,
        request_id: &str,
        args: &HashMap<String, String>,
        dry_run: bool,
    ) -> RunReply {
        let start = Instant::now();

        let Some(command) = args.get("command").filter(|c| !c.is_empty()) else {
            return RunReply::error(request_id, missing_arg("cmd", "command"), 0);
        };

        if dry_run {
            return dry_run_reply(request_id, command, start);
        }

        if let Some(creates) = args.get("creates").filter(|c| !c.is_empty()) {
            if Path::new(creates).exists() {
                return RunReply::completed(request_id, false, 0, "", "", elapsed_ms(start));
            }
        }

        let output = match Command::new("sh").arg("-c").arg(command).output().await {
            Ok(output) => output,
            Err(err) => {
                return RunReply::error(
                    request_id,
                    format!("failed to spawn shell: {err}"),
                    elapsed_ms(start),
                )
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        RunReply::completed(
            request_id,
            true,
            exit_code,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
            elapsed_ms(start),
        )
    }
}

/// Resolves the first token against PATH and reports what would run,
/// without ever forking. Pipelines and shell builtins make the lookup a
/// heuristic, so an unresolved token is reported rather than failed.
fn dry_run_reply(request_id: &str, command: &str, start: Instant) -> RunReply {
    let first = command.split_whitespace().next().unwrap_or_default();
    if !first.is_empty() && lookup_path(first).is_none() {
        return RunReply::completed(
            request_id,
            false,
            0,
            format!("Dry run: command '{first}' not found in PATH"),
            "",
            elapsed_ms(start),
        );
    }

    RunReply::completed(
        request_id,
        true,
        0,
        format!("Dry run: would execute command: {command}"),
        "",
        elapsed_ms(start),
    )
}

fn lookup_path(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if program.contains('/') {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|path| is_executable(path))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::proto::Status;

    #[tokio::test]
    async fn captures_stdout_and_reports_changed() {
        let action = CmdAction;
        let mut args = HashMap::new();
        args.insert("command".to_string(), "echo hello".to_string());

        let reply = action.execute("r1", &args, false).await;
        assert_eq!(reply.status, Status::Ok);
        assert!(reply.changed);
        assert_eq!(reply.stdout, "hello\n");
        assert_eq!(reply.exit_code, 0);
    }

    #[tokio::test]
    async fn nonzero_exit_maps_to_failed() {
        let action = CmdAction;
        let mut args = HashMap::new();
        args.insert("command".to_string(), "exit 3".to_string());

        let reply = action.execute("r1", &args, false).await;
        assert_eq!(reply.status, Status::Failed);
        assert_eq!(reply.exit_code, 3);
    }

    #[tokio::test]
    async fn creates_guard_skips_execution() {
        let dir = tempfile::tempdir().expect("tempdir");
        let guard = dir.path().join("present");
        std::fs::write(&guard, b"x").expect("write guard");
        let witness = dir.path().join("witness");

        let action = CmdAction;
        let mut args = HashMap::new();
        args.insert("command".to_string(), format!("touch {}", witness.display()));
        args.insert("creates".to_string(), guard.display().to_string());

        let reply = action.execute("r1", &args, false).await;
        assert_eq!(reply.status, Status::Ok);
        assert!(!reply.changed, "guard fired; nothing changed");
        assert!(!witness.exists(), "command must not have run");
    }

    #[tokio::test]
    async fn missing_command_is_an_error() {
        let action = CmdAction;
        let reply = action.execute("r1", &HashMap::new(), false).await;
        assert_eq!(reply.status, Status::Error);
        assert!(reply.error.contains("missing required argument: command"));
    }

    #[tokio::test]
    async fn dry_run_never_forks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let witness = dir.path().join("witness");

        let action = CmdAction;
        let mut args = HashMap::new();
        args.insert("command".to_string(), format!("touch {}", witness.display()));

        let reply = action.execute("r1", &args, true).await;
        assert_eq!(reply.status, Status::Ok);
        assert!(reply.changed, "dry run assumes a change would occur");
        assert!(reply.stdout.contains("would execute command"));
        assert!(!witness.exists(), "dry run must not execute");
    }

    #[tokio::test]
    async fn dry_run_reports_unresolvable_binaries() {
        let action = CmdAction;
        let mut args = HashMap::new();
        args.insert(
            "command".to_string(),
            "definitely-not-a-real-binary-a1b2 --flag".to_string(),
        );

        let reply = action.execute("r1", &args, true).await;
        assert_eq!(reply.status, Status::Ok);
        assert!(!reply.changed);
        assert!(reply.stdout.contains("not found in PATH"));
    }
}
