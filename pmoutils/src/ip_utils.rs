use get_if_addrs::get_if_addrs;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// Guesses the LAN address of this host.
///
/// A UDP socket is "connected" to a public address so the OS picks the
/// outgoing interface; no packet is sent. Falls back to `127.0.0.1`.
pub fn guess_local_ip() -> String {
    match UdpSocket::bind("0.0.0.0:0") {
        Ok(socket) => {
            if socket.connect("8.8.8.8:80").is_ok() {
                if let Ok(local_addr) = socket.local_addr() {
                    return local_addr.ip().to_string();
                }
            }
            "127.0.0.1".to_string()
        }
        Err(_) => "127.0.0.1".to_string(),
    }
}

/// Lists the non-loopback IPv4 addresses of every interface.
///
/// Listeners on the LAN reach the mountpoints through one of these, so the
/// dashboard shows them next to the broadcast server port.
pub fn lan_addresses() -> Vec<Ipv4Addr> {
    let mut result = Vec::new();

    if let Ok(interfaces) = get_if_addrs() {
        for iface in interfaces {
            if let IpAddr::V4(ip) = iface.ip() {
                if !ip.is_loopback() && !result.contains(&ip) {
                    result.push(ip);
                }
            }
        }
    }

    result
}

/// Tells whether a bind address only accepts connections from this host.
///
/// `localhost`, `127.x.x.x` and `::1` restrict a server to local clients,
/// which defeats LAN distribution.
pub fn is_loopback_bind(address: &str) -> bool {
    let trimmed = address.trim();
    if trimmed.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match trimmed.parse::<IpAddr>() {
        Ok(ip) => ip.is_loopback(),
        Err(_) => false,
    }
}

/// Tells whether a bind address listens on every interface.
pub fn is_wildcard_bind(address: &str) -> bool {
    match address.trim().parse::<IpAddr>() {
        Ok(ip) => ip.is_unspecified(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guess_local_ip_returns_valid_ip() {
        let ip = guess_local_ip();
        assert!(ip.parse::<IpAddr>().is_ok(), "Should return a valid IP address");
    }

    #[test]
    fn test_lan_addresses_exclude_loopback() {
        for ip in lan_addresses() {
            assert!(!ip.is_loopback());
        }
    }

    #[test]
    fn test_lan_addresses_have_no_duplicates() {
        let ips = lan_addresses();
        let unique: std::collections::HashSet<_> = ips.iter().collect();
        assert_eq!(ips.len(), unique.len());
    }

    #[test]
    fn test_loopback_bind_detection() {
        assert!(is_loopback_bind("127.0.0.1"));
        assert!(is_loopback_bind(" localhost "));
        assert!(is_loopback_bind("::1"));
        assert!(!is_loopback_bind("0.0.0.0"));
        assert!(!is_loopback_bind("192.168.1.10"));
        assert!(!is_loopback_bind("not-an-ip"));
    }

    #[test]
    fn test_wildcard_bind_detection() {
        assert!(is_wildcard_bind("0.0.0.0"));
        assert!(is_wildcard_bind("::"));
        assert!(!is_wildcard_bind("192.168.1.10"));
        assert!(!is_wildcard_bind("localhost"));
    }
}
