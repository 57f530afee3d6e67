//! Local address discovery

use std::net::{IpAddr, UdpSocket};

/// Best-effort internal IPv4 address of this host.
///
/// Opens a UDP socket routed toward a public address without sending any
/// packets; the kernel's route lookup picks the outbound interface. Falls
/// back to loopback when the host has no route.
pub fn internal_ip() -> IpAddr {
    let fallback: IpAddr = [127, 0, 0, 1].into();

    let Ok(socket) = UdpSocket::bind(("0.0.0.0", 0)) else {
        return fallback;
    };
    if socket.connect(("8.8.8.8", 53)).is_err() {
        return fallback;
    }
    socket.local_addr().map(|a| a.ip()).unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_ip_is_ipv4() {
        let ip = internal_ip();
        assert!(ip.is_ipv4());
    }
}
