use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Connects to the broker with unbounded automatic reconnect and a fixed
/// back-off. Connection events are logged so operators can see flaps.
pub async fn connect(url: &str, creds_file: &str, agent_id: &str) -> Result<async_nats::Client> {
    let mut options = async_nats::ConnectOptions::new()
        .name(format!("stapply-agent-{agent_id}"))
        .reconnect_delay_callback(|_attempts| RECONNECT_DELAY)
        .event_callback(|event| async move {
            match event {
                async_nats::Event::Disconnected => warn!("disconnected from broker"),
                async_nats::Event::Connected => info!("reconnected to broker"),
                other => debug!(%other, "broker connection event"),
            }
        });

    if !creds_file.is_empty() {
        options = options
            .credentials_file(creds_file)
            .await
            .with_context(|| format!("failed to read NATS credentials file {creds_file}"))?;
    }

    options
        .connect(url)
        .await
        .with_context(|| format!("failed to connect to broker at {url}"))
}
