//! Broker URL normalisation and private-network validation.
//!
//! By default the controller and agent refuse to talk to a broker that
//! resolves to a public address; `--allow-public` overrides the gate.

use std::net::{IpAddr, ToSocketAddrs};

use anyhow::{bail, Context, Result};
use ipnet::Ipv4Net;

const DEFAULT_PORT: u16 = 4222;

/// Environment variable naming the default broker when neither a flag nor
/// config provides one. The value must look like an FQDN or an IP address.
pub const ENV_DEFAULT_NATS: &str = "STAPPLY_DEFAULT_NATS";

/// Environment variable carrying the shared payload-encryption secret.
pub const ENV_SHARED_KEY: &str = "STAPPLY_SHARED_KEY";

fn private_v4_ranges() -> [Ipv4Net; 4] {
    // RFC1918 plus the CGNAT range (RFC6598, used by Tailscale and similar).
    [
        "10.0.0.0/8".parse().expect("valid cidr"),
        "172.16.0.0/12".parse().expect("valid cidr"),
        "192.168.0.0/16".parse().expect("valid cidr"),
        "100.64.0.0/10".parse().expect("valid cidr"),
    ]
}

/// Whether an address falls inside the private allow-list.
pub fn is_private_ip(ip: IpAddr) -> bool {
    if ip.is_loopback() {
        return true;
    }
    match ip {
        IpAddr::V4(v4) => private_v4_ranges().iter().any(|net| net.contains(&v4)),
        IpAddr::V6(_) => false,
    }
}

/// Human-readable list of the allowed ranges, for rejection messages.
pub fn format_allowed_networks() -> String {
    [
        "127.0.0.0/8 (localhost)",
        "10.0.0.0/8 (private LAN)",
        "172.16.0.0/12 (private LAN)",
        "192.168.0.0/16 (private LAN)",
        "100.64.0.0/10 (CGNAT/Tailscale)",
    ]
    .join(", ")
}

/// Adds the default scheme (`nats://`) and port (`4222`) when missing.
/// Explicit schemes (`nats://`, `tls://`) and explicit ports are preserved,
/// so the function is a fixed point on its own output.
pub fn normalize_url(server: &str) -> String {
    if server.is_empty() {
        return String::new();
    }

    let with_scheme = if server.contains("://") {
        server.to_string()
    } else {
        format!("nats://{server}")
    };

    match url::Url::parse(&with_scheme) {
        Ok(mut parsed) if parsed.port().is_none() => {
            if parsed.set_port(Some(DEFAULT_PORT)).is_ok() {
                parsed.to_string()
            } else {
                with_scheme
            }
        }
        _ => with_scheme,
    }
}

/// Validates that a broker URL points at a private network.
///
/// The hostname is resolved and the URL is accepted iff any resolved
/// address is private; acceptance depends only on the resolved IP set.
pub fn validate_url(broker_url: &str, allow_public: bool) -> Result<()> {
    let parsed = url::Url::parse(broker_url)
        .with_context(|| format!("invalid broker URL: {broker_url}"))?;
    let host = parsed
        .host_str()
        .with_context(|| format!("broker URL missing hostname: {broker_url}"))?;
    let port = parsed.port().unwrap_or(DEFAULT_PORT);

    let ips: Vec<IpAddr> = if let Ok(literal) = host.trim_matches(&['[', ']'][..]).parse::<IpAddr>() {
        vec![literal]
    } else {
        (host, port)
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve broker hostname {host}"))?
            .map(|addr| addr.ip())
            .collect()
    };

    if ips.is_empty() {
        bail!("no IP addresses found for broker hostname {host}");
    }

    if ips.iter().copied().any(is_private_ip) || allow_public {
        return Ok(());
    }

    bail!(
        "broker URL {} resolves to public addresses ({}). Only private networks ({}) \
         are allowed by default; use --allow-public to override",
        broker_url,
        ips[0],
        format_allowed_networks()
    );
}

/// Reads [`ENV_DEFAULT_NATS`], rejecting values that cannot be an FQDN or
/// an IP address (no dot, no colon).
pub fn default_nats_from_env() -> Result<Option<String>> {
    match std::env::var(ENV_DEFAULT_NATS) {
        Ok(value) if value.is_empty() => Ok(None),
        Ok(value) => {
            if !value.contains('.') && !value.contains(':') {
                bail!(
                    "invalid {ENV_DEFAULT_NATS}: {value:?}; must be an FQDN with dots or an IP address"
                );
            }
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}
