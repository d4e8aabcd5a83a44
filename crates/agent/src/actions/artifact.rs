use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use common::proto::RunReply;

use super::{elapsed_ms, missing_arg, Action};

/// Receives chunked artifact transfers.
///
/// Transfers to the same destination serialise on a per-path mutex;
/// different destinations proceed in parallel. Chunk 0 truncates the
/// destination (creating parent directories), later chunks append, and the
/// final chunk verifies the whole-file SHA-256 against the declared
/// checksum. A failed transfer leaves a partial destination behind; the
/// next transfer's chunk 0 truncates it again.
pub struct DeployArtifactAction {
    locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DeployArtifactAction {
    pub fn new() -> Self {
        DeployArtifactAction {
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, dest: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(dest.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drops the per-destination entry so the map stays bounded.
    fn release(&self, dest: &str) {
        self.locks.lock().remove(dest);
    }
}

impl Default for DeployArtifactAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for DeployArtifactAction {
    async fn execute(
        &self,
        request_id: &str,
        args: &HashMap<String, String>,
        dry_run: bool,
    ) -> RunReply {
        let start = Instant::now();

        let Some(dest) = args.get("dest").filter(|d| !d.is_empty()) else {
            return RunReply::error(request_id, missing_arg("deploy_artifact", "dest"), 0);
        };
        let Some(chunk_data) = args.get("chunk_data").filter(|d| !d.is_empty()) else {
            return RunReply::error(request_id, missing_arg("deploy_artifact", "chunk_data"), 0);
        };

        let chunk_index: usize = match args.get("chunk_index").map(String::as_str) {
            Some(raw) => match raw.parse() {
                Ok(index) => index,
                Err(err) => {
                    return RunReply::error(request_id, format!("invalid 'chunk_index': {err}"), 0)
                }
            },
            None => {
                return RunReply::error(request_id, missing_arg("deploy_artifact", "chunk_index"), 0)
            }
        };
        let total_chunks: usize = match args.get("total_chunks").map(String::as_str) {
            Some(raw) => match raw.parse() {
                Ok(total) => total,
                Err(err) => {
                    return RunReply::error(request_id, format!("invalid 'total_chunks': {err}"), 0)
                }
            },
            None => {
                return RunReply::error(
                    request_id,
                    missing_arg("deploy_artifact", "total_chunks"),
                    0,
                )
            }
        };

        let checksum = args.get("checksum").cloned().unwrap_or_default();
        let mode = args
            .get("mode")
            .and_then(|raw| u32::from_str_radix(raw, 8).ok())
            .unwrap_or(0o644);

        if dry_run {
            return RunReply::completed(
                request_id,
                false,
                0,
                format!(
                    "Dry run: would write chunk {}/{} to {}",
                    chunk_index + 1,
                    total_chunks,
                    dest
                ),
                "",
                elapsed_ms(start),
            );
        }

        let lock = self.lock_for(dest);
        let _guard = lock.lock().await;

        let data = match BASE64.decode(chunk_data) {
            Ok(data) => data,
            Err(err) => {
                return RunReply::error(
                    request_id,
                    format!("base64 decode failed: {err}"),
                    elapsed_ms(start),
                )
            }
        };

        if let Err(err) = write_chunk(dest, &data, chunk_index, mode).await {
            return RunReply::error(request_id, err, elapsed_ms(start));
        }

        let mut message = format!(
            "Received chunk {}/{} ({} bytes)",
            chunk_index + 1,
            total_chunks,
            data.len()
        );

        if chunk_index + 1 == total_chunks {
            if !checksum.is_empty() {
                let actual = match sha256_file(dest).await {
                    Ok(digest) => digest,
                    Err(err) => {
                        self.release(dest);
                        return RunReply::error(
                            request_id,
                            format!("failed to calculate checksum: {err}"),
                            elapsed_ms(start),
                        );
                    }
                };
                if actual != checksum {
                    self.release(dest);
                    return RunReply::error(
                        request_id,
                        format!("checksum mismatch: expected {checksum}, got {actual}"),
                        elapsed_ms(start),
                    );
                }
                message.push_str(" - checksum verified");
            }
            self.release(dest);
        }

        RunReply::completed(request_id, true, 0, message, "", elapsed_ms(start))
    }
}

async fn write_chunk(dest: &str, data: &[u8], chunk_index: usize, mode: u32) -> Result<(), String> {
    let mut options = tokio::fs::OpenOptions::new();
    options.create(true).write(true).mode(mode);
    if chunk_index == 0 {
        if let Some(parent) = Path::new(dest).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|err| format!("failed to create directory: {err}"))?;
            }
        }
        options.truncate(true);
    } else {
        options.append(true);
    }

    let mut file = options
        .open(dest)
        .await
        .map_err(|err| format!("failed to open file: {err}"))?;
    file.write_all(data)
        .await
        .map_err(|err| format!("failed to write chunk: {err}"))?;
    file.flush()
        .await
        .map_err(|err| format!("failed to flush chunk: {err}"))?;
    Ok(())
}

pub(crate) async fn sha256_file(path: &str) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::proto::Status;

    fn chunk_args(
        dest: &str,
        payload: &[u8],
        index: usize,
        total: usize,
        checksum: &str,
    ) -> HashMap<String, String> {
        let mut args = HashMap::new();
        args.insert("dest".to_string(), dest.to_string());
        args.insert("chunk_data".to_string(), BASE64.encode(payload));
        args.insert("chunk_index".to_string(), index.to_string());
        args.insert("total_chunks".to_string(), total.to_string());
        args.insert("checksum".to_string(), checksum.to_string());
        args.insert("mode".to_string(), "0644".to_string());
        args
    }

    fn sha256_hex_of(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    #[tokio::test]
    async fn reassembles_chunks_and_verifies_checksum() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("artifact.bin");
        let dest = dest.to_str().unwrap();

        let source: Vec<u8> = (0..10_000u32).flat_map(|i| i.to_le_bytes()).collect();
        let chunks: Vec<&[u8]> = source.chunks(16 * 1024).collect();
        let checksum = sha256_hex_of(&source);

        let action = DeployArtifactAction::new();
        for (index, chunk) in chunks.iter().enumerate() {
            let args = chunk_args(dest, chunk, index, chunks.len(), &checksum);
            let reply = action.execute("r", &args, false).await;
            assert_eq!(reply.status, Status::Ok, "chunk {index}: {}", reply.error);
            assert!(reply.changed);
            assert!(reply
                .stdout
                .contains(&format!("chunk {}/{}", index + 1, chunks.len())));
        }

        let written = std::fs::read(dest).expect("read assembled file");
        assert_eq!(written, source, "assembled file must match byte-for-byte");
    }

    #[tokio::test]
    async fn checksum_mismatch_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("artifact.bin");
        let dest = dest.to_str().unwrap();

        let action = DeployArtifactAction::new();
        let args = chunk_args(dest, b"payload", 0, 1, &sha256_hex_of(b"different"));
        let reply = action.execute("r", &args, false).await;

        assert_eq!(reply.status, Status::Error);
        assert!(reply.error.contains("checksum mismatch"), "{}", reply.error);
    }

    #[tokio::test]
    async fn first_chunk_truncates_stale_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("artifact.bin");
        std::fs::write(&dest, b"stale leftover from an aborted transfer").expect("seed");
        let dest = dest.to_str().unwrap();

        let action = DeployArtifactAction::new();
        let args = chunk_args(dest, b"fresh", 0, 1, &sha256_hex_of(b"fresh"));
        let reply = action.execute("r", &args, false).await;

        assert_eq!(reply.status, Status::Ok, "{}", reply.error);
        assert_eq!(std::fs::read(dest).expect("read"), b"fresh");
    }

    #[tokio::test]
    async fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("nested/deeper/artifact.bin");
        let dest = dest.to_str().unwrap();

        let action = DeployArtifactAction::new();
        let args = chunk_args(dest, b"data", 0, 1, &sha256_hex_of(b"data"));
        let reply = action.execute("r", &args, false).await;

        assert_eq!(reply.status, Status::Ok, "{}", reply.error);
        assert_eq!(std::fs::read(dest).expect("read"), b"data");
    }

    #[tokio::test]
    async fn missing_and_malformed_args_are_errors() {
        let action = DeployArtifactAction::new();

        let reply = action.execute("r", &HashMap::new(), false).await;
        assert_eq!(reply.status, Status::Error);
        assert!(reply.error.contains("dest"));

        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("x");
        let mut args = chunk_args(dest.to_str().unwrap(), b"data", 0, 1, "");
        args.insert("chunk_index".to_string(), "not-a-number".to_string());
        let reply = action.execute("r", &args, false).await;
        assert_eq!(reply.status, Status::Error);
        assert!(reply.error.contains("invalid 'chunk_index'"));
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("artifact.bin");

        let action = DeployArtifactAction::new();
        let args = chunk_args(dest.to_str().unwrap(), b"data", 0, 3, "");
        let reply = action.execute("r", &args, true).await;

        assert_eq!(reply.status, Status::Ok);
        assert!(!reply.changed);
        assert!(reply.stdout.contains("would write chunk 1/3"));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn lock_map_is_bounded_after_final_chunk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("artifact.bin");
        let dest = dest.to_str().unwrap();

        let action = DeployArtifactAction::new();
        let args = chunk_args(dest, b"data", 0, 1, &sha256_hex_of(b"data"));
        let reply = action.execute("r", &args, false).await;
        assert_eq!(reply.status, Status::Ok, "{}", reply.error);

        assert!(
            action.locks.lock().is_empty(),
            "per-destination lock must be dropped after the final chunk"
        );
    }
}
