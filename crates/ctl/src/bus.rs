//! Broker transport for controller requests.
//!
//! [`AgentBus`] is the seam between the executor and the wire: the
//! production implementation wraps a shared `async_nats::Client` (safe for
//! concurrent request/reply), encrypts when a secret is in effect, bounds
//! every exchange with the per-request timeout, and verifies that the
//! reply echoes the request id. A reply with a foreign id is discarded,
//! which surfaces as a timeout-class failure for that step.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::warn;

use common::crypto::{self, CryptoError};
use common::proto::{
    subject, verbs, DiscoverReply, PingReply, Request, RunReply, UpdateReply,
};
use common::version;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("timeout (no response within {0:?})")]
    Timeout(Duration),
    #[error("encrypt error: {0}")]
    Encrypt(CryptoError),
    #[error("decrypt error: {0}")]
    Decrypt(CryptoError),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("response parse error: {0}")]
    Decode(String),
    #[error("reply does not correlate with the request id")]
    CorrelationMismatch,
}

/// Request/reply interface the executor depends on.
#[async_trait]
pub trait AgentBus: Send + Sync {
    /// Runs one action; transport failures fold into the reply's status so
    /// callers tally rather than propagate.
    async fn run_action(
        &self,
        agent_id: &str,
        action: &str,
        args: HashMap<String, String>,
        dry_run: bool,
    ) -> RunReply;

    async fn ping(&self, agent_id: &str) -> Result<PingReply, BusError>;

    async fn discover(&self, agent_id: &str) -> Result<DiscoverReply, BusError>;

    async fn update(
        &self,
        agent_id: &str,
        target_version: &str,
        binary_url: &str,
    ) -> Result<UpdateReply, BusError>;
}

pub async fn connect(url: &str) -> anyhow::Result<async_nats::Client> {
    use anyhow::Context;
    async_nats::ConnectOptions::new()
        .name("stapply-ctl")
        // the per-request timeout below governs, not the client default
        .request_timeout(None)
        .connect(url)
        .await
        .with_context(|| format!("failed to connect to broker at {url}"))
}

pub struct NatsBus {
    client: async_nats::Client,
    secret: Option<String>,
    timeout: Duration,
}

impl NatsBus {
    pub fn new(client: async_nats::Client, secret: Option<String>, timeout: Duration) -> Self {
        NatsBus {
            client,
            secret: secret.filter(|value| !value.is_empty()),
            timeout,
        }
    }

    fn seal(&self, payload: Vec<u8>) -> Result<Vec<u8>, BusError> {
        match &self.secret {
            Some(secret) => crypto::encrypt(&payload, secret).map_err(BusError::Encrypt),
            None => Ok(payload),
        }
    }

    fn open(&self, payload: &[u8]) -> Result<Vec<u8>, BusError> {
        match &self.secret {
            Some(secret) => crypto::decrypt(payload, secret).map_err(BusError::Decrypt),
            None => Ok(payload.to_vec()),
        }
    }

    async fn exchange(&self, subject: String, request: &Request) -> Result<Vec<u8>, BusError> {
        let body = serde_json::to_vec(request).map_err(|err| BusError::Decode(err.to_string()))?;
        let body = self.seal(body)?;

        let response = tokio::time::timeout(self.timeout, self.client.request(subject, body.into()))
            .await
            .map_err(|_| BusError::Timeout(self.timeout))?
            .map_err(|err| match err.kind() {
                async_nats::RequestErrorKind::TimedOut => BusError::Timeout(self.timeout),
                _ => BusError::Transport(err.to_string()),
            })?;

        self.open(&response.payload)
    }

    async fn exchange_correlated<T>(
        &self,
        verb: &str,
        agent_id: &str,
        request: Request,
        reply_id: fn(&T) -> &str,
    ) -> Result<T, BusError>
    where
        T: DeserializeOwned,
    {
        let request_id = request.request_id().to_string();
        let payload = self.exchange(subject(verb, agent_id), &request).await?;
        let reply: T =
            serde_json::from_slice(&payload).map_err(|err| BusError::Decode(err.to_string()))?;
        if reply_id(&reply) != request_id {
            warn!(
                expected = %request_id,
                got = reply_id(&reply),
                "discarding reply with mismatched request id"
            );
            return Err(BusError::CorrelationMismatch);
        }
        Ok(reply)
    }
}

#[async_trait]
impl AgentBus for NatsBus {
    async fn run_action(
        &self,
        agent_id: &str,
        action: &str,
        args: HashMap<String, String>,
        dry_run: bool,
    ) -> RunReply {
        let request = Request::run(action, args, self.timeout.as_millis() as u64, dry_run);
        let request_id = request.request_id().to_string();

        match self
            .exchange_correlated::<RunReply>(verbs::RUN, agent_id, request, |reply| {
                &reply.request_id
            })
            .await
        {
            Ok(reply) => reply,
            Err(BusError::Timeout(_)) | Err(BusError::CorrelationMismatch) => {
                RunReply::timeout(request_id)
            }
            Err(err) => RunReply::error(request_id, err.to_string(), 0),
        }
    }

    async fn ping(&self, agent_id: &str) -> Result<PingReply, BusError> {
        self.exchange_correlated(verbs::PING, agent_id, Request::ping(version::VERSION), |reply: &PingReply| {
            &reply.request_id
        })
        .await
    }

    async fn discover(&self, agent_id: &str) -> Result<DiscoverReply, BusError> {
        self.exchange_correlated(verbs::DISCOVER, agent_id, Request::discover(), |reply: &DiscoverReply| {
            &reply.request_id
        })
        .await
    }

    async fn update(
        &self,
        agent_id: &str,
        target_version: &str,
        binary_url: &str,
    ) -> Result<UpdateReply, BusError> {
        self.exchange_correlated(
            verbs::UPDATE,
            agent_id,
            Request::update(target_version, binary_url),
            |reply: &UpdateReply| &reply.request_id,
        )
        .await
    }
}
