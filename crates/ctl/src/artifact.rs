//! Controller side of the chunked artifact sub-protocol.
//!
//! The whole-file SHA-256 is computed once up front, then the file is sent
//! as base64-encoded slices of at most 10 MiB, strictly sequentially. The
//! first non-ok reply aborts the transfer; there is no per-chunk retry.

use std::collections::HashMap;
use std::io::SeekFrom;

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use common::proto::Status;

use crate::bus::AgentBus;

/// Maximum bytes per chunk before base64 expansion.
pub const CHUNK_SIZE: usize = 10 * 1024 * 1024;

/// Mode applied to the assembled file; artifacts are typically binaries.
const DEFAULT_MODE: &str = "0755";

pub async fn push_artifact(
    bus: &dyn AgentBus,
    agent_id: &str,
    src: &str,
    dest: &str,
) -> Result<()> {
    let mut file = tokio::fs::File::open(src)
        .await
        .with_context(|| format!("failed to open artifact source {src}"))?;
    let total_size = file
        .metadata()
        .await
        .with_context(|| format!("failed to stat {src}"))?
        .len();

    let checksum = {
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let read = file.read(&mut buf).await.context("hashing artifact")?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        hex::encode(hasher.finalize())
    };
    file.seek(SeekFrom::Start(0))
        .await
        .context("rewinding artifact source")?;

    let total_chunks = total_size.div_ceil(CHUNK_SIZE as u64) as usize;
    let mut buf = vec![0u8; CHUNK_SIZE];

    for index in 0..total_chunks {
        let remaining = total_size - (index as u64 * CHUNK_SIZE as u64);
        let expected = remaining.min(CHUNK_SIZE as u64) as usize;
        file.read_exact(&mut buf[..expected])
            .await
            .with_context(|| format!("failed to read chunk {index}"))?;

        let mut args = HashMap::new();
        args.insert("dest".to_string(), dest.to_string());
        args.insert("chunk_index".to_string(), index.to_string());
        args.insert("total_chunks".to_string(), total_chunks.to_string());
        args.insert("total_size".to_string(), total_size.to_string());
        args.insert("checksum".to_string(), checksum.clone());
        args.insert("chunk_data".to_string(), BASE64.encode(&buf[..expected]));
        args.insert("mode".to_string(), DEFAULT_MODE.to_string());

        let reply = bus.run_action(agent_id, "deploy_artifact", args, false).await;
        if reply.status != Status::Ok {
            let cause = match reply.status {
                Status::Timeout => "timeout".to_string(),
                _ if !reply.error.is_empty() => reply.error,
                _ => reply.stderr,
            };
            bail!("chunk {index} failed: {cause}");
        }

        println!("Sent chunk {}/{} ({} bytes)", index + 1, total_chunks, expected);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusError;
    use async_trait::async_trait;
    use common::proto::{DiscoverReply, PingReply, RunReply, UpdateReply};
    use parking_lot::Mutex;

    /// Receives chunks the way the agent does: chunk 0 truncates, later
    /// chunks append, the final chunk verifies the declared checksum.
    #[derive(Default)]
    struct SinkBus {
        state: Mutex<SinkState>,
        fail_at: Option<usize>,
    }

    #[derive(Default)]
    struct SinkState {
        bytes: Vec<u8>,
        seen_indices: Vec<usize>,
        declared_total_size: u64,
        declared_checksum: String,
        verified: bool,
    }

    #[async_trait]
    impl AgentBus for SinkBus {
        async fn run_action(
            &self,
            _agent_id: &str,
            action: &str,
            args: HashMap<String, String>,
            _dry_run: bool,
        ) -> RunReply {
            assert_eq!(action, "deploy_artifact");
            let index: usize = args["chunk_index"].parse().expect("chunk_index");
            let total: usize = args["total_chunks"].parse().expect("total_chunks");

            if self.fail_at == Some(index) {
                return RunReply::error("r", "disk full", 1);
            }

            let data = BASE64.decode(&args["chunk_data"]).expect("base64");
            let mut state = self.state.lock();
            if index == 0 {
                state.bytes.clear();
            }
            state.bytes.extend_from_slice(&data);
            state.seen_indices.push(index);
            state.declared_total_size = args["total_size"].parse().expect("total_size");
            state.declared_checksum = args["checksum"].clone();

            if index + 1 == total {
                let actual = hex::encode(Sha256::digest(&state.bytes));
                if actual != state.declared_checksum {
                    return RunReply::error("r", "checksum mismatch", 1);
                }
                state.verified = true;
            }
            RunReply::completed("r", true, 0, "", "", 1)
        }

        async fn ping(&self, _agent_id: &str) -> Result<PingReply, BusError> {
            Err(BusError::Transport("unused".into()))
        }

        async fn discover(&self, _agent_id: &str) -> Result<DiscoverReply, BusError> {
            Err(BusError::Transport("unused".into()))
        }

        async fn update(
            &self,
            _agent_id: &str,
            _target_version: &str,
            _binary_url: &str,
        ) -> Result<UpdateReply, BusError> {
            Err(BusError::Transport("unused".into()))
        }
    }

    fn patterned_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i.wrapping_mul(31).wrapping_add(7) & 0xff) as u8).collect()
    }

    #[tokio::test]
    async fn a_25_mib_artifact_travels_as_three_sequential_chunks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("artifact.bin");
        let source = patterned_bytes(26_214_400);
        std::fs::write(&src, &source).expect("write source");

        let bus = SinkBus::default();
        push_artifact(&bus, "web1", src.to_str().unwrap(), "/opt/app/bin")
            .await
            .expect("push");

        let state = bus.state.lock();
        assert_eq!(state.seen_indices, vec![0, 1, 2], "strictly sequential");
        assert_eq!(state.declared_total_size, 26_214_400);
        assert_eq!(state.bytes.len(), source.len());
        assert_eq!(state.bytes, source, "byte-for-byte equality");
        assert!(state.verified, "final chunk must verify the checksum");
    }

    #[tokio::test]
    async fn small_files_fit_one_chunk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("small.bin");
        std::fs::write(&src, b"tiny payload").expect("write source");

        let bus = SinkBus::default();
        push_artifact(&bus, "web1", src.to_str().unwrap(), "/opt/x")
            .await
            .expect("push");

        assert_eq!(bus.state.lock().seen_indices, vec![0]);
        assert!(bus.state.lock().verified);
    }

    #[tokio::test]
    async fn first_failed_chunk_aborts_the_transfer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("artifact.bin");
        std::fs::write(&src, patterned_bytes(CHUNK_SIZE * 2 + 10)).expect("write source");

        let bus = SinkBus {
            fail_at: Some(1),
            ..SinkBus::default()
        };
        let err = push_artifact(&bus, "web1", src.to_str().unwrap(), "/opt/x")
            .await
            .unwrap_err();

        assert!(err.to_string().contains("chunk 1 failed"), "{err}");
        let state = bus.state.lock();
        assert_eq!(state.seen_indices, vec![0], "no chunk after the failure");
    }

    #[tokio::test]
    async fn missing_source_is_an_error() {
        let bus = SinkBus::default();
        let err = push_artifact(&bus, "web1", "/no/such/file", "/opt/x")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to open artifact source"));
    }
}
