use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::{signal, sync::watch};
use tracing::{error, info};

use common::{netutil, proto, version};
use stapply_agent::{
    actions::Registry,
    bus, config,
    handlers::{self, AgentContext},
    sampler::{cpu_sampler_loop, CpuGauge},
    telemetry,
};

#[derive(Debug, Parser)]
#[command(name = "stapply-agent", version = version::VERSION)]
struct AgentArgs {
    /// Path to the agent configuration file.
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: String,

    /// Allow connection to public NATS servers (insecure).
    #[arg(long)]
    allow_public: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    let args = AgentArgs::parse();

    let cfg = config::load(&args.config)?;
    let agent_id = config::resolve_agent_id(&cfg)?;
    let broker_url = netutil::normalize_url(&config::resolve_broker(&cfg)?);
    netutil::validate_url(&broker_url, args.allow_public)?;

    info!(
        version = version::VERSION,
        agent_id = %agent_id,
        broker = %broker_url,
        "starting stapply-agent"
    );

    let client = bus::connect(&broker_url, &cfg.nats_creds, &agent_id).await?;
    info!(broker = %broker_url, "connected to broker");

    let secret = std::env::var(netutil::ENV_SHARED_KEY)
        .ok()
        .filter(|value| !value.is_empty());
    if secret.is_some() {
        info!("payload encryption enabled ({} is set)", netutil::ENV_SHARED_KEY);
    }

    let cpu = Arc::new(CpuGauge::default());
    let ctx = Arc::new(AgentContext {
        client: client.clone(),
        agent_id: agent_id.clone(),
        secret,
        registry: Registry::new(),
        cpu: cpu.clone(),
        started_at: Instant::now(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sampler_handle = {
        let sampler_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(err) = cpu_sampler_loop(cpu, sampler_shutdown).await {
                error!(?err, "cpu sampler loop terminated with error");
            }
        })
    };

    let mut listener_handles = Vec::new();
    for verb in [
        proto::verbs::PING,
        proto::verbs::RUN,
        proto::verbs::DISCOVER,
        proto::verbs::UPDATE,
    ] {
        let subject = proto::subject(verb, &agent_id);
        let sub = client
            .subscribe(subject.clone())
            .await
            .map_err(|err| anyhow::anyhow!("failed to subscribe to {subject}: {err}"))?;
        info!(%subject, "subscribed");

        let ctx = ctx.clone();
        let shutdown = shutdown_rx.clone();
        listener_handles.push(tokio::spawn(handlers::listen(ctx, verb, sub, shutdown)));
    }

    shutdown_signal().await;
    info!("shutdown signal received, draining");
    let _ = shutdown_tx.send(true);

    for handle in listener_handles {
        let _ = handle.await;
    }
    let _ = sampler_handle.await;

    if let Err(err) = client.flush().await {
        error!(%err, "error flushing broker connection");
    }

    info!("agent stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => stream.recv().await,
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                None
            }
        };
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
