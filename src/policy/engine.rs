//! Inbound and outbound network policy enforcement

use std::net::{IpAddr, SocketAddr};
use url::Url;

use super::classify::{classify, in_cidr_set, AddressClass};
use crate::config::{InstanceConfig, OutboundMode};
use crate::error::{Error, Result};

/// A policy-approved dial target.
///
/// `addr` is the address the dispatcher must connect to. Classification and
/// connection use the same resolved address, so there is no window between
/// the check and the dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinnedTarget {
    pub addr: SocketAddr,
    pub class: AddressClass,
}

/// Check a client source address against the instance's inbound allowlist.
/// An empty allowlist admits any source.
pub fn check_inbound(instance: &InstanceConfig, client_ip: IpAddr) -> Result<()> {
    if instance.restrict_in_cidrs.is_empty()
        || in_cidr_set(client_ip, &instance.restrict_in_cidrs)
    {
        Ok(())
    } else {
        Err(Error::InboundDenied)
    }
}

/// Resolve the target host and return the pinned address the dispatcher
/// must dial, or deny.
///
/// Literal IP targets are classified directly. Hostnames are resolved once
/// through the system resolver; candidates are scanned in resolver order
/// and the first address that passes policy is pinned. Addresses that fail
/// policy are never dialed.
pub async fn resolve_and_check(instance: &InstanceConfig, target: &Url) -> Result<PinnedTarget> {
    let port = target
        .port_or_known_default()
        .ok_or_else(|| Error::bad_target("target URL has no port"))?;

    let candidates: Vec<SocketAddr> = match target.host() {
        Some(url::Host::Ipv4(ip)) => vec![SocketAddr::new(IpAddr::V4(ip), port)],
        Some(url::Host::Ipv6(ip)) => vec![SocketAddr::new(IpAddr::V6(ip), port)],
        Some(url::Host::Domain(domain)) => tokio::net::lookup_host((domain, port))
            .await
            .map_err(|e| Error::unreachable(format!("DNS lookup for '{}' failed: {}", domain, e)))?
            .collect(),
        None => return Err(Error::bad_target("target URL has no host")),
    };

    if candidates.is_empty() {
        return Err(Error::unreachable("hostname resolved to no addresses"));
    }

    for addr in candidates {
        let class = classify(addr.ip());
        if admits(instance, addr.ip(), class) {
            return Ok(PinnedTarget { addr, class });
        }
    }

    Err(Error::OutboundDenied)
}

fn admits(instance: &InstanceConfig, ip: IpAddr, class: AddressClass) -> bool {
    match instance.restrict_out {
        OutboundMode::Any => true,
        OutboundMode::External => class == AddressClass::Public,
        OutboundMode::Internal => {
            matches!(class, AddressClass::Private | AddressClass::Loopback)
        }
        OutboundMode::Cidr => in_cidr_set(ip, &instance.restrict_out_cidrs),
    }
}
