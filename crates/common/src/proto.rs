//! Request/reply message shapes for the broker protocol.
//!
//! Every payload is a UTF-8 JSON object. Requests are a tagged sum keyed by
//! the `type` field; replies are per-verb structs correlated with their
//! request through `request_id`. Unknown fields are ignored on decode so
//! mixed controller/agent versions keep interoperating.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subject prefix shared by every deployment unless rebranded.
pub const SUBJECT_PREFIX: &str = "stapply";

pub mod verbs {
    pub const PING: &str = "ping";
    pub const RUN: &str = "run";
    pub const DISCOVER: &str = "discover";
    pub const UPDATE: &str = "update";
}

/// Broker subject for a verb addressed to one agent.
pub fn subject(verb: &str, agent_id: &str) -> String {
    format!("{SUBJECT_PREFIX}.{verb}.{agent_id}")
}

fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Request sent by the controller to an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Health check; carries the controller's version so the agent can warn
    /// about a stale binary.
    Ping {
        request_id: String,
        #[serde(default)]
        controller_version: String,
    },

    /// Execute one action from the agent's registry.
    Run {
        request_id: String,
        #[serde(default)]
        timeout_ms: u64,
        action: String,
        #[serde(default)]
        args: HashMap<String, String>,
        #[serde(default)]
        dry_run: bool,
    },

    /// Gather system facts.
    Discover { request_id: String },

    /// Swap the agent binary and restart.
    Update {
        request_id: String,
        target_version: String,
        binary_url: String,
    },
}

impl Request {
    pub fn ping(controller_version: impl Into<String>) -> Self {
        Request::Ping {
            request_id: new_request_id(),
            controller_version: controller_version.into(),
        }
    }

    pub fn run(
        action: impl Into<String>,
        args: HashMap<String, String>,
        timeout_ms: u64,
        dry_run: bool,
    ) -> Self {
        Request::Run {
            request_id: new_request_id(),
            timeout_ms,
            action: action.into(),
            args,
            dry_run,
        }
    }

    pub fn discover() -> Self {
        Request::Discover {
            request_id: new_request_id(),
        }
    }

    pub fn update(target_version: impl Into<String>, binary_url: impl Into<String>) -> Self {
        Request::Update {
            request_id: new_request_id(),
            target_version: target_version.into(),
            binary_url: binary_url.into(),
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            Request::Ping { request_id, .. }
            | Request::Run { request_id, .. }
            | Request::Discover { request_id }
            | Request::Update { request_id, .. } => request_id,
        }
    }
}

/// Outcome of an action execution (wire format uses lowercase values).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Action completed with exit code zero.
    Ok,
    /// Action ran but reported a non-zero exit code.
    Failed,
    /// No reply arrived in time (recorded controller-side).
    Timeout,
    /// The request could not be executed at all.
    Error,
}

impl Status {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::Failed => "failed",
            Status::Timeout => "timeout",
            Status::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PingReply {
    pub request_id: String,
    pub agent_id: String,
    pub version: String,
    pub uptime_seconds: u64,
    #[serde(default)]
    pub cpu_usage: f64,
    #[serde(default)]
    pub memory_usage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunReply {
    pub request_id: String,
    pub status: Status,
    #[serde(default)]
    pub changed: bool,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default)]
    pub duration_ms: u64,
}

impl RunReply {
    /// Reply for an action that ran to completion; status derives from the
    /// exit code.
    pub fn completed(
        request_id: impl Into<String>,
        changed: bool,
        exit_code: i32,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        let status = if exit_code == 0 {
            Status::Ok
        } else {
            Status::Failed
        };
        RunReply {
            request_id: request_id.into(),
            status,
            changed,
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            error: String::new(),
            duration_ms,
        }
    }

    /// Reply for a request that could not be executed.
    pub fn error(request_id: impl Into<String>, error: impl Into<String>, duration_ms: u64) -> Self {
        RunReply {
            request_id: request_id.into(),
            status: Status::Error,
            changed: false,
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            error: error.into(),
            duration_ms,
        }
    }

    /// Synthesised controller-side when no reply arrived within the
    /// per-request timeout.
    pub fn timeout(request_id: impl Into<String>) -> Self {
        RunReply {
            request_id: request_id.into(),
            status: Status::Timeout,
            changed: false,
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            error: String::new(),
            duration_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoverReply {
    pub request_id: String,
    pub agent_id: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub cpu_count: usize,
    pub memory_total: u64,
    pub memory_free: u64,
    pub disk_usage_root: u32,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateReply {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}
