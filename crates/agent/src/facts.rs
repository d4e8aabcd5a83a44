//! Read-only system facts for the `discover` verb.
//!
//! Every field is best-effort: a datum that cannot be read produces a
//! warning and a zero value, never a dropped reply.

use std::path::Path;

use sysinfo::{Disks, Networks, System};
use tracing::warn;

use common::proto::DiscoverReply;

pub fn gather(agent_id: &str, request_id: String) -> DiscoverReply {
    let mut sys = System::new_all();
    sys.refresh_all();

    let hostname = System::host_name().unwrap_or_else(|| {
        warn!("failed to determine hostname");
        "unknown".to_string()
    });

    DiscoverReply {
        request_id,
        agent_id: agent_id.to_string(),
        hostname,
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        cpu_count: sys.cpus().len(),
        memory_total: sys.total_memory(),
        memory_free: sys.available_memory(),
        disk_usage_root: root_disk_usage(),
        ip_addresses: ip_addresses(),
    }
}

/// Instantaneous memory utilisation percentage.
pub fn memory_usage_percent() -> f64 {
    let mut sys = System::new();
    sys.refresh_memory();

    let total = sys.total_memory();
    if total == 0 {
        return 0.0;
    }
    let used = total.saturating_sub(sys.available_memory());
    used as f64 / total as f64 * 100.0
}

fn root_disk_usage() -> u32 {
    let disks = Disks::new_with_refreshed_list();
    let Some(root) = disks
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
    else {
        warn!("no disk mounted at / found; reporting zero utilisation");
        return 0;
    };

    let total = root.total_space();
    if total == 0 {
        return 0;
    }
    let used = total.saturating_sub(root.available_space());
    ((used * 100) / total) as u32
}

fn ip_addresses() -> Vec<String> {
    let networks = Networks::new_with_refreshed_list();
    let mut ips = Vec::new();
    for (_name, data) in networks.iter() {
        for network in data.ip_networks() {
            if network.addr.is_loopback() {
                continue;
            }
            ips.push(network.addr.to_string());
        }
    }
    ips
}
