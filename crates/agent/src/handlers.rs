//! Per-subject request handlers.
//!
//! Each subscription loop hands every inbound message to its own task, so
//! handlers for different requests run concurrently. The handler contract
//! is: decrypt (or drop), parse (or drop), execute, reply to the message's
//! reply inbox. A request that arrives on the wrong verb subject is
//! malformed and dropped without a reply.

use std::sync::Arc;
use std::time::Instant;

use async_nats::{Message, Subject, Subscriber};
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use common::crypto;
use common::proto::{verbs, PingReply, Request};
use common::version;

use crate::actions::Registry;
use crate::sampler::CpuGauge;
use crate::{facts, update};

pub struct AgentContext {
    pub client: async_nats::Client,
    pub agent_id: String,
    pub secret: Option<String>,
    pub registry: Registry,
    pub cpu: Arc<CpuGauge>,
    pub started_at: Instant,
}

impl AgentContext {
    fn open(&self, payload: &[u8]) -> Option<Vec<u8>> {
        match &self.secret {
            Some(secret) => match crypto::decrypt(payload, secret) {
                Ok(plain) => Some(plain),
                Err(err) => {
                    warn!(%err, "dropping request that failed decryption");
                    None
                }
            },
            None => Some(payload.to_vec()),
        }
    }

    fn seal(&self, payload: Vec<u8>) -> Option<Vec<u8>> {
        match &self.secret {
            Some(secret) => match crypto::encrypt(&payload, secret) {
                Ok(sealed) => Some(sealed),
                Err(err) => {
                    warn!(%err, "failed to encrypt reply; dropping");
                    None
                }
            },
            None => Some(payload),
        }
    }

    pub async fn send_reply<T: Serialize>(&self, reply_to: Option<Subject>, reply: &T) {
        let Some(reply_to) = reply_to else {
            warn!("request carried no reply inbox; dropping reply");
            return;
        };
        let payload = match serde_json::to_vec(reply) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%err, "failed to serialise reply");
                return;
            }
        };
        let Some(payload) = self.seal(payload) else {
            return;
        };
        if let Err(err) = self.client.publish(reply_to, payload.into()).await {
            warn!(%err, "failed to publish reply");
        }
    }
}

/// Serves one verb subject until shutdown; every message gets its own task.
pub async fn listen(
    ctx: Arc<AgentContext>,
    verb: &'static str,
    mut sub: Subscriber,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if let Err(err) = sub.unsubscribe().await {
                    warn!(%err, verb, "failed to unsubscribe during drain");
                }
                break;
            }
            maybe = sub.next() => {
                let Some(msg) = maybe else { break };
                let ctx = ctx.clone();
                tokio::spawn(async move { dispatch(ctx, verb, msg).await });
            }
        }
    }
}

async fn dispatch(ctx: Arc<AgentContext>, verb: &'static str, msg: Message) {
    let Some(plain) = ctx.open(&msg.payload) else {
        return;
    };

    let request: Request = match serde_json::from_slice(&plain) {
        Ok(request) => request,
        Err(err) => {
            warn!(%err, subject = %msg.subject, "dropping malformed request");
            return;
        }
    };

    match (verb, request) {
        (
            verbs::PING,
            Request::Ping {
                request_id,
                controller_version,
            },
        ) => handle_ping(&ctx, msg.reply, request_id, &controller_version).await,
        (
            verbs::RUN,
            Request::Run {
                request_id,
                action,
                args,
                dry_run,
                ..
            },
        ) => {
            info!(%action, %request_id, dry_run, "executing action");
            let reply = ctx.registry.execute(&request_id, &action, &args, dry_run).await;
            info!(
                %action,
                status = reply.status.as_str(),
                changed = reply.changed,
                duration_ms = reply.duration_ms,
                "action completed"
            );
            ctx.send_reply(msg.reply, &reply).await;
        }
        (verbs::DISCOVER, Request::Discover { request_id }) => {
            info!(%request_id, "discovery request received");
            let reply = facts::gather(&ctx.agent_id, request_id);
            ctx.send_reply(msg.reply, &reply).await;
        }
        (
            verbs::UPDATE,
            Request::Update {
                request_id,
                target_version,
                binary_url,
            },
        ) => update::handle(&ctx, msg.reply, request_id, &target_version, &binary_url).await,
        (_, other) => {
            warn!(
                subject = %msg.subject,
                request_id = %other.request_id(),
                "request type does not match subject; dropping"
            );
        }
    }
}

async fn handle_ping(
    ctx: &AgentContext,
    reply_to: Option<Subject>,
    request_id: String,
    controller_version: &str,
) {
    if !controller_version.is_empty() && controller_version != version::VERSION {
        warn!(
            agent = version::VERSION,
            controller = controller_version,
            "version mismatch with controller"
        );
        if controller_version > version::VERSION {
            warn!(
                "agent is outdated; run 'stapply-ctl update {}' to update",
                ctx.agent_id
            );
        }
    }

    let reply = PingReply {
        request_id,
        agent_id: ctx.agent_id.clone(),
        version: version::VERSION.to_string(),
        uptime_seconds: ctx.started_at.elapsed().as_secs(),
        cpu_usage: ctx.cpu.usage(),
        memory_usage: facts::memory_usage_percent(),
    };
    ctx.send_reply(reply_to, &reply).await;
}
