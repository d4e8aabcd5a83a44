pub mod adhoc;
pub mod discover;
pub mod ping;
pub mod preflight;
pub mod run;
pub mod status;
pub mod update;

use anyhow::Result;

use common::netutil;

use crate::args::GlobalArgs;
use crate::bus::{self, NatsBus};

/// Resolves the broker address (flag, then `STAPPLY_DEFAULT_NATS`, then the
/// command-specific fallback), validates it against the private-network
/// gate, and connects.
pub(crate) async fn build_bus(globals: &GlobalArgs, fallback: Option<&str>) -> Result<NatsBus> {
    let server = match globals.nats.as_deref().filter(|value| !value.is_empty()) {
        Some(value) => value.to_string(),
        None => match netutil::default_nats_from_env()? {
            Some(value) => value,
            None => fallback.unwrap_or("localhost").to_string(),
        },
    };

    let url = netutil::normalize_url(&server);
    netutil::validate_url(&url, globals.allow_public)?;

    let client = bus::connect(&url).await?;
    Ok(NatsBus::new(client, globals.secret.clone(), globals.timeout))
}
