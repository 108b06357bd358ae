//! Local interface resolution.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use local_ip_address::{list_afinet_netifas, local_ip};

/// Address of the interface a datagram toward `target` would leave from.
///
/// Connecting a UDP socket sends nothing; it only makes the kernel pick a
/// route.
fn routed_ip(target: &str) -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(target).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

/// The address a handler binds to: the explicit one, else the interface
/// routing toward the SSDP group, else the host's primary address, else the
/// wildcard address.
pub(crate) fn resolve_ip(explicit: Option<Ipv4Addr>) -> Ipv4Addr {
    if let Some(ip) = explicit {
        return ip;
    }
    routed_ip("239.255.255.250:1900")
        .or_else(|| match local_ip() {
            Ok(IpAddr::V4(ip)) => Some(ip),
            _ => None,
        })
        .unwrap_or_else(|| {
            tracing::warn!("could not determine the local IP address, binding every interface");
            Ipv4Addr::UNSPECIFIED
        })
}

/// Interfaces discovery and advertisement listening run on.
///
/// A specific address is its own single interface. The wildcard address
/// expands to every non-loopback IPv4 interface.
pub(crate) fn interface_ips(ip: Ipv4Addr) -> Vec<Ipv4Addr> {
    if !ip.is_unspecified() {
        return vec![ip];
    }
    let mut ips: Vec<Ipv4Addr> = match list_afinet_netifas() {
        Ok(interfaces) => interfaces
            .into_iter()
            .filter_map(|(name, addr)| match addr {
                IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified() => {
                    tracing::debug!(interface = %name, ip = %v4, "using interface");
                    Some(v4)
                }
                _ => None,
            })
            .collect(),
        Err(e) => {
            tracing::debug!(error = %e, "could not list network interfaces");
            Vec::new()
        }
    };
    ips.sort();
    ips.dedup();
    if ips.is_empty() {
        ips.push(routed_ip("10.255.255.255:1").unwrap_or(Ipv4Addr::LOCALHOST));
    }
    ips
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_ip_wins() {
        let ip = Ipv4Addr::new(192, 168, 1, 20);
        assert_eq!(resolve_ip(Some(ip)), ip);
        assert_eq!(interface_ips(ip), vec![ip]);
    }

    #[test]
    fn test_wildcard_expands_to_some_interface() {
        let ips = interface_ips(Ipv4Addr::UNSPECIFIED);
        assert!(!ips.is_empty());
        assert!(ips.iter().all(|ip| !ip.is_unspecified()));
    }
}
