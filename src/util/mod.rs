use local_ip_address::list_afinet_netifas;
use std::net::{IpAddr, Ipv4Addr};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber. `RUST_LOG` overrides the default `info` level.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_log() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Pick an IPv4 address that can be shared with a remote ICE peer.
///
/// Iterates over the host's interfaces, skipping loopback, link-local and
/// broadcast addresses, and returns the first routable one. Falls back to
/// loopback when there is none, which still lets two peers on the same
/// machine connect.
pub fn select_host_address() -> IpAddr {
    if let Ok(network_interfaces) = list_afinet_netifas() {
        for (name, ip) in network_interfaces {
            if let IpAddr::V4(v) = ip {
                if !v.is_loopback() && !v.is_link_local() && !v.is_broadcast() {
                    info!("Using interface {} / {}", name, v);
                    return ip;
                }
            }
        }
    }

    debug!("No routable interface, falling back to loopback");
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}
