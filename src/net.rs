//! Client IP resolution and private/loopback classification.

use std::net::IpAddr;

use axum::http::HeaderMap;
use ipnet::IpNet;

/// Is this address private, loopback, link-local, or otherwise non-routable
/// on the public internet? Used to gate the machine-scoped sibling fallback.
pub fn is_private_or_loopback(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(ip) => {
            ip.is_private()
                || ip.is_loopback()
                || ip.is_link_local()
                || ip.is_broadcast()
                || ip.is_unspecified()
                // CGNAT range 100.64.0.0/10
                || (ip.octets()[0] == 100 && (ip.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(ip) => {
            if let Some(mapped) = ip.to_ipv4_mapped() {
                return is_private_or_loopback(&IpAddr::V4(mapped));
            }
            ip.is_loopback()
                || ip.is_unspecified()
                // ULA fc00::/7
                || (ip.segments()[0] & 0xfe00) == 0xfc00
                // Link-local fe80::/10
                || (ip.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

fn is_trusted(ip: &IpAddr, trusted_proxies: &[IpNet]) -> bool {
    trusted_proxies.iter().any(|net| net.contains(ip))
}

/// Resolve the effective client IP: walk the forwarded chain
/// right-to-left, discarding addresses that belong to a trusted proxy; the
/// first untrusted address is the client. Falls back to `X-Real-IP`, then to
/// the raw socket address.
pub fn resolve_client_ip(
    socket_addr: IpAddr,
    headers: &HeaderMap,
    trusted_proxies: &[IpNet],
) -> IpAddr {
    if let Some(xff) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        let candidates: Vec<&str> = xff.split(',').map(|s| s.trim()).collect();
        for candidate in candidates.iter().rev() {
            if let Ok(ip) = candidate.parse::<IpAddr>() {
                if !is_trusted(&ip, trusted_proxies) {
                    return ip;
                }
            }
        }
    }

    if let Some(real_ip) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<IpAddr>().ok())
    {
        return real_ip;
    }

    socket_addr
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(
                axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                v.parse().unwrap(),
            );
        }
        h
    }

    #[test]
    fn private_ip_rfc1918_and_loopback() {
        assert!(is_private_or_loopback(&"10.0.0.1".parse().unwrap()));
        assert!(is_private_or_loopback(&"192.168.1.1".parse().unwrap()));
        assert!(is_private_or_loopback(&"127.0.0.1".parse().unwrap()));
        assert!(is_private_or_loopback(&"::1".parse().unwrap()));
    }

    #[test]
    fn private_ip_cgnat_and_v4_mapped() {
        assert!(is_private_or_loopback(&"100.64.0.1".parse().unwrap()));
        assert!(!is_private_or_loopback(&"100.0.0.1".parse().unwrap()));
        assert!(is_private_or_loopback(&"::ffff:10.0.0.1".parse().unwrap()));
        assert!(!is_private_or_loopback(&"::ffff:8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn public_ip_is_not_private() {
        assert!(!is_private_or_loopback(&"8.8.8.8".parse().unwrap()));
        assert!(!is_private_or_loopback(
            &"2607:f8b0:4004:800::200e".parse().unwrap()
        ));
    }

    #[test]
    fn resolve_client_ip_trusts_xff_from_trusted_proxy() {
        let trusted: Vec<IpNet> = vec!["10.0.0.1/32".parse().unwrap()];
        let h = headers(&[("x-forwarded-for", "203.0.113.5, 10.0.0.1")]);
        let ip = resolve_client_ip("10.0.0.1".parse().unwrap(), &h, &trusted);
        assert_eq!(ip, "203.0.113.5".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn resolve_client_ip_ignores_untrusted_socket() {
        let h = headers(&[("x-forwarded-for", "192.168.1.100")]);
        let ip = resolve_client_ip("203.0.113.42".parse().unwrap(), &h, &[]);
        assert_eq!(ip, "203.0.113.42".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn resolve_client_ip_falls_back_to_x_real_ip() {
        let trusted: Vec<IpNet> = vec!["10.0.0.0/8".parse().unwrap()];
        let h = headers(&[("x-real-ip", "203.0.113.42")]);
        let ip = resolve_client_ip("10.0.0.5".parse().unwrap(), &h, &trusted);
        assert_eq!(ip, "203.0.113.42".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn resolve_client_ip_falls_back_to_socket_addr() {
        let ip = resolve_client_ip("203.0.113.1".parse().unwrap(), &HeaderMap::new(), &[]);
        assert_eq!(ip, "203.0.113.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn resolve_client_ip_walks_past_multiple_trusted_hops() {
        let trusted: Vec<IpNet> = vec!["10.0.0.0/8".parse().unwrap()];
        let h = headers(&[("x-forwarded-for", "198.51.100.7, 10.0.0.2, 10.0.0.1")]);
        let ip = resolve_client_ip("10.0.0.1".parse().unwrap(), &h, &trusted);
        assert_eq!(ip, "198.51.100.7".parse::<IpAddr>().unwrap());
    }
}
