use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

use common::proto::RunReply;

use super::{elapsed_ms, missing_arg, sha256_hex, Action};

/// Writes file content with hash-based change detection.
///
/// The file is only written when the SHA-256 of the new content differs
/// from what is on disk. Optional `mode` (octal) and `owner` (`user:group`)
/// are applied afterwards and count towards `changed` only when the
/// observed state actually transitioned.
pub struct WriteFileAction;

#[async_trait]
impl Action for WriteFileAction {
    async fn execute(
        &self,
        request_id: &str,
        args: &HashMap<String, String>,
        dry_run: bool,
    ) -> RunReply {
        let start = Instant::now();

        let Some(path) = args.get("path").filter(|p| !p.is_empty()) else {
            return RunReply::error(request_id, missing_arg("write_file", "path"), 0);
        };
        let Some(content) = args.get("content") else {
            return RunReply::error(request_id, missing_arg("write_file", "content"), 0);
        };

        if dry_run {
            return dry_run_reply(request_id, path, content.as_bytes(), start).await;
        }

        let mut changed = match write_if_changed(path, content.as_bytes()).await {
            Ok(wrote) => wrote,
            Err(err) => {
                return RunReply::error(
                    request_id,
                    format!("failed to write {path}: {err}"),
                    elapsed_ms(start),
                )
            }
        };

        if let Some(mode) = args.get("mode").filter(|m| !m.is_empty()) {
            match apply_mode(path, mode).await {
                Ok(mode_changed) => changed |= mode_changed,
                Err(err) => {
                    return RunReply::error(request_id, format!("{err:#}"), elapsed_ms(start))
                }
            }
        }

        if let Some(owner) = args.get("owner").filter(|o| !o.is_empty()) {
            match apply_owner(path, owner).await {
                Ok(owner_changed) => changed |= owner_changed,
                Err(err) => {
                    return RunReply::error(request_id, format!("{err:#}"), elapsed_ms(start))
                }
            }
        }

        RunReply::completed(request_id, changed, 0, "", "", elapsed_ms(start))
    }
}

/// Dry run performs the same hash comparison as a real run but never
/// touches the filesystem.
pub(crate) async fn dry_run_reply(
    request_id: &str,
    path: &str,
    content: &[u8],
    start: Instant,
) -> RunReply {
    if let Some(dir) = Path::new(path).parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            return RunReply::error(
                request_id,
                format!("dry run: directory {} does not exist", dir.display()),
                elapsed_ms(start),
            );
        }
    }

    let changed = content_differs(path, content).await;
    let message = if changed {
        "Dry run: would update file content"
    } else {
        "Dry run: content matches"
    };
    RunReply::completed(request_id, changed, 0, message, "", elapsed_ms(start))
}

pub(crate) async fn content_differs(path: &str, content: &[u8]) -> bool {
    match tokio::fs::read(path).await {
        Ok(existing) => sha256_hex(&existing) != sha256_hex(content),
        Err(_) => true,
    }
}

pub(crate) async fn write_if_changed(path: &str, content: &[u8]) -> std::io::Result<bool> {
    if !content_differs(path, content).await {
        return Ok(false);
    }
    tokio::fs::write(path, content).await?;
    Ok(true)
}

pub(crate) async fn apply_mode(path: &str, mode_str: &str) -> Result<bool> {
    use std::os::unix::fs::PermissionsExt;

    let mode = u32::from_str_radix(mode_str, 8)
        .with_context(|| format!("invalid mode {mode_str:?}"))?;
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("failed to stat {path}"))?;

    let current = metadata.permissions().mode() & 0o7777;
    if current == mode {
        return Ok(false);
    }

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .with_context(|| format!("chmod failed on {path}"))?;
    Ok(true)
}

async fn apply_owner(path: &str, owner: &str) -> Result<bool> {
    if !owner.contains(':') {
        bail!("invalid owner format {owner:?} (expected user:group)");
    }

    let before = file_ids(path).await?;
    let output = Command::new("chown")
        .arg(owner)
        .arg(path)
        .output()
        .await
        .context("chown failed")?;
    if !output.status.success() {
        bail!(
            "chown failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let after = file_ids(path).await?;
    Ok(before != after)
}

async fn file_ids(path: &str) -> Result<(u32, u32)> {
    use std::os::unix::fs::MetadataExt;
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("failed to stat {path}"))?;
    Ok((metadata.uid(), metadata.gid()))
}
