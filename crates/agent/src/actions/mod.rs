//! Verb-keyed registry of idempotent action executors.
//!
//! The registry is built once at agent boot and never mutated afterwards,
//! so handler tasks read it without locking. Each executor owns its own
//! change detection and dry-run behaviour; replies always carry the
//! request id they answer.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use common::proto::RunReply;

mod artifact;
mod cmd;
mod file;
mod systemd;
mod template;

pub use artifact::DeployArtifactAction;
pub use cmd::CmdAction;
pub use file::WriteFileAction;
pub use systemd::SystemdAction;
pub use template::TemplateFileAction;

#[async_trait]
pub trait Action: Send + Sync {
    async fn execute(
        &self,
        request_id: &str,
        args: &HashMap<String, String>,
        dry_run: bool,
    ) -> RunReply;
}

pub struct Registry {
    actions: HashMap<&'static str, Box<dyn Action>>,
}

impl Registry {
    pub fn new() -> Self {
        let mut actions: HashMap<&'static str, Box<dyn Action>> = HashMap::new();
        actions.insert("cmd", Box::new(CmdAction));
        actions.insert("write_file", Box::new(WriteFileAction));
        actions.insert("template_file", Box::new(TemplateFileAction));
        actions.insert("systemd", Box::new(SystemdAction));
        actions.insert("deploy_artifact", Box::new(DeployArtifactAction::new()));
        Registry { actions }
    }

    pub async fn execute(
        &self,
        request_id: &str,
        verb: &str,
        args: &HashMap<String, String>,
        dry_run: bool,
    ) -> RunReply {
        match self.actions.get(verb) {
            Some(action) => action.execute(request_id, args, dry_run).await,
            None => RunReply::error(request_id, format!("action {verb}: unknown action type"), 0),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn missing_arg(action: &str, arg: &str) -> String {
    format!("action {action}: missing required argument: {arg}")
}

pub(crate) fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
