use std::net::IpAddr;

/// Loopback or private-network address: the only sources allowed to use the
/// local execution token.
pub fn is_local_ip(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.is_loopback() || v4.is_private(),
            // fd00::/8 unique local
            None => v6.is_loopback() || v6.octets()[0] == 0xfd,
        },
    }
}

/// Loopback only, including `::ffff:127.0.0.0/104`.
pub fn is_loopback_ip(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(|v4| v4.is_loopback())
            .unwrap_or_else(|| v6.is_loopback()),
    }
}
