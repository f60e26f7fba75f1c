//! Loopback detection for socket local addresses.

use crate::exec::Executor;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::{collections::HashSet, net::IpAddr};
use tracing::debug;

/// Lists the addresses assigned to the node's loopback interface as JSON.
pub const LO_ADDRS: &[&str] = &["ip", "-j", "addr", "show", "dev", "lo"];

/// Decides whether a socket is only reachable from the node itself.
///
/// A socket is loopback-only when its local address is in `127.0.0.0/8`
/// or `::1` (including IPv4-mapped forms), or is one of the addresses
/// assigned to the node's loopback interface. Some topologies bind
/// node-local services to such non-127 aliases.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoopbackFilter {
    aliases: HashSet<IpAddr>,
}

#[derive(Debug, Deserialize)]
struct Link {
    #[serde(default)]
    addr_info: Vec<AddrInfo>,
}

#[derive(Debug, Deserialize)]
struct AddrInfo {
    local: Option<String>,
}

// === impl LoopbackFilter ===

impl LoopbackFilter {
    pub fn new(aliases: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            aliases: aliases.into_iter().map(canonical).collect(),
        }
    }

    /// Reads the node's loopback interface addresses.
    pub async fn discover<E: Executor>(exec: &E, ctx: &E::Context) -> Result<Self> {
        let out = exec
            .run(ctx, LO_ADDRS)
            .await
            .context("listing loopback addresses")?;
        let filter = Self::from_ip_json(&out)?;
        debug!(aliases = ?filter.aliases, "Loopback addresses");
        Ok(filter)
    }

    /// Parses `ip -j addr` output.
    pub fn from_ip_json(json: &[u8]) -> Result<Self> {
        let links = serde_json::from_slice::<Vec<Link>>(json)
            .context("parsing loopback interface addresses")?;
        let mut aliases = HashSet::new();
        for addr in links.into_iter().flat_map(|l| l.addr_info) {
            let Some(local) = addr.local else { continue };
            let ip = local
                .parse::<IpAddr>()
                .with_context(|| format!("invalid loopback address {local:?}"))?;
            aliases.insert(canonical(ip));
        }
        Ok(Self { aliases })
    }

    pub fn is_loopback(&self, ip: IpAddr) -> bool {
        let ip = canonical(ip);
        ip.is_loopback() || self.aliases.contains(&ip)
    }

    /// Checks a socket's `<address>:<port>` local endpoint. Endpoints whose
    /// address cannot be parsed, such as the `*` wildcard, are not loopback.
    pub fn is_loopback_endpoint(&self, endpoint: &str) -> bool {
        match endpoint_ip(endpoint) {
            Some(ip) => self.is_loopback(ip),
            None => false,
        }
    }
}

/// Maps IPv4-mapped IPv6 addresses to IPv4.
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Extracts the address of an `ss` local endpoint.
///
/// Handles `10.0.0.1:22`, `[::1]:631`, `:::22`, `127.0.0.53%lo:53` and
/// `[fe80::1]%eth0:546`.
pub fn endpoint_ip(endpoint: &str) -> Option<IpAddr> {
    let (host, _port) = endpoint.rsplit_once(':')?;
    let host = host.split('%').next().unwrap_or(host);
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    host.parse().ok()
}
