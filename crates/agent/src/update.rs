//! Live self-update.
//!
//! The new binary is staged next to the current executable so the final
//! rename stays on one filesystem and therefore atomic. The success reply
//! is sent before the process restarts so the controller observes it.
//! Every failure before that point is recoverable: the staging file is
//! unlinked and the agent keeps running on the old binary.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_nats::Subject;
use tracing::{error, info, warn};

use common::proto::UpdateReply;
use common::version;

use crate::handlers::AgentContext;

pub async fn handle(
    ctx: &AgentContext,
    reply_to: Option<Subject>,
    request_id: String,
    target_version: &str,
    binary_url: &str,
) {
    info!(
        current = version::VERSION,
        target = target_version,
        "update requested"
    );

    if target_version == version::VERSION {
        let reply = UpdateReply {
            request_id,
            success: true,
            error: String::new(),
            message: "already at target version".to_string(),
        };
        ctx.send_reply(reply_to, &reply).await;
        return;
    }

    match stage_new_binary(binary_url).await {
        Ok(executable) => {
            let reply = UpdateReply {
                request_id,
                success: true,
                error: String::new(),
                message: format!("updated to {target_version}, restarting"),
            };
            ctx.send_reply(reply_to, &reply).await;
            if let Err(err) = ctx.client.flush().await {
                warn!(%err, "failed to flush broker connection before restart");
            }
            info!("binary replaced; restarting");
            restart(&executable);
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "update failed; keeping current binary");
            let reply = UpdateReply {
                request_id,
                success: false,
                error: format!("{err:#}"),
                message: String::new(),
            };
            ctx.send_reply(reply_to, &reply).await;
        }
    }
}

/// Downloads, marks executable, and atomically renames over the current
/// binary. Returns the path of the (now replaced) executable.
async fn stage_new_binary(binary_url: &str) -> Result<PathBuf> {
    let executable = current_executable()?;
    let staging = staging_path(&executable);

    if let Err(err) = download(binary_url, &staging).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(err.context("download failed"));
    }

    let permissions = {
        use std::os::unix::fs::PermissionsExt;
        std::fs::Permissions::from_mode(0o755)
    };
    if let Err(err) = tokio::fs::set_permissions(&staging, permissions).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(anyhow::Error::from(err).context("chmod failed"));
    }

    if let Err(err) = tokio::fs::rename(&staging, &executable).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(anyhow::Error::from(err).context("replace failed"));
    }

    Ok(executable)
}

fn current_executable() -> Result<PathBuf> {
    let executable = std::env::current_exe().context("failed to resolve executable path")?;
    // resolve symlinks so the rename lands on the real file
    Ok(std::fs::canonicalize(&executable).unwrap_or(executable))
}

fn staging_path(executable: &Path) -> PathBuf {
    let mut os = executable.as_os_str().to_owned();
    os.push(".new");
    PathBuf::from(os)
}

async fn download(url: &str, dest: &Path) -> Result<()> {
    let response = reqwest::get(url)
        .await
        .with_context(|| format!("request to {url} failed"))?;
    if !response.status().is_success() {
        bail!("bad status: {}", response.status());
    }
    let body = response.bytes().await.context("reading response body")?;
    tokio::fs::write(dest, &body)
        .await
        .with_context(|| format!("writing {}", dest.display()))?;
    Ok(())
}

/// Whether a service manager will restart us after exit.
pub fn service_managed() -> bool {
    if std::env::var_os("INVOCATION_ID").is_some() {
        return true;
    }
    std::os::unix::process::parent_id() == 1
}

fn restart(executable: &Path) -> ! {
    use std::os::unix::process::CommandExt;

    if service_managed() {
        info!("running under a service manager; exiting for restart");
        std::process::exit(0);
    }

    info!("not service managed; restarting in place");
    let err = std::process::Command::new(executable)
        .args(std::env::args_os().skip(1))
        .exec();
    error!(%err, "failed to exec replacement binary");
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_path_stays_in_the_same_directory() {
        let staged = staging_path(Path::new("/usr/local/bin/stapply-agent"));
        assert_eq!(staged, Path::new("/usr/local/bin/stapply-agent.new"));
        assert_eq!(
            staged.parent(),
            Path::new("/usr/local/bin/stapply-agent").parent(),
            "staging file must share the executable's filesystem"
        );
    }
}
