//! Destination address classification

use ipnet::IpNet;
use std::net::IpAddr;

/// The network class of an IP address, used by the outbound policy modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressClass {
    Loopback,
    LinkLocal,
    Private,
    Public,
}

/// Classify an address into loopback / link-local / private / public.
///
/// Fixed prefixes: 127.0.0.0/8 and ::1 are loopback; 169.254.0.0/16 and
/// fe80::/10 are link-local; 10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16 and
/// fc00::/7 are private. Everything else is public, including carrier-grade
/// NAT 100.64.0.0/10. IPv4-mapped IPv6 addresses are unwrapped first.
pub fn classify(addr: IpAddr) -> AddressClass {
    match unmap(addr) {
        IpAddr::V4(ip) => {
            if ip.is_loopback() {
                AddressClass::Loopback
            } else if ip.is_link_local() {
                AddressClass::LinkLocal
            } else if ip.is_private() {
                AddressClass::Private
            } else {
                AddressClass::Public
            }
        }
        IpAddr::V6(ip) => {
            if ip.is_loopback() {
                AddressClass::Loopback
            } else if (ip.segments()[0] & 0xffc0) == 0xfe80 {
                AddressClass::LinkLocal
            } else if (ip.segments()[0] & 0xfe00) == 0xfc00 {
                AddressClass::Private
            } else {
                AddressClass::Public
            }
        }
    }
}

/// Membership test against a CIDR set. IPv4-mapped addresses are unwrapped
/// so `::ffff:10.0.0.1` matches `10.0.0.0/8`.
pub fn in_cidr_set(addr: IpAddr, set: &[IpNet]) -> bool {
    let addr = unmap(addr);
    set.iter().any(|net| net.contains(&addr))
}

fn unmap(addr: IpAddr) -> IpAddr {
    if let IpAddr::V6(v6) = addr {
        if let Some(v4) = v6.to_ipv4_mapped() {
            return IpAddr::V4(v4);
        }
    }
    addr
}
