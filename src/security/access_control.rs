//! Client IP resolution and IP allow/deny rules.
//!
//! # Resolution Order
//! 1. First entry of `X-Forwarded-For`
//! 2. `X-Real-IP`
//! 3. `X-Client-IP`
//! 4. Socket peer address
//!
//! # Design Decisions
//! - Rules are exact addresses or CIDR blocks, parsed once at startup
//! - Unparseable header values fall through to the next source

use std::net::IpAddr;

use axum::http::HeaderMap;

/// Error returned for a malformed IP rule.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid IP rule '{0}'")]
pub struct IpRuleError(pub String);

/// A single IP match rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpRule {
    Exact(IpAddr),
    Cidr { network: IpAddr, prefix: u8 },
}

impl IpRule {
    /// Parse `"10.0.0.1"` or `"10.0.0.0/8"` style rules.
    pub fn parse(rule: &str) -> Result<Self, IpRuleError> {
        let rule = rule.trim();
        let err = || IpRuleError(rule.to_string());

        match rule.split_once('/') {
            None => rule.parse().map(IpRule::Exact).map_err(|_| err()),
            Some((addr, prefix)) => {
                let network: IpAddr = addr.parse().map_err(|_| err())?;
                let prefix: u8 = prefix.parse().map_err(|_| err())?;
                let max = if network.is_ipv4() { 32 } else { 128 };
                if prefix > max {
                    return Err(err());
                }
                Ok(IpRule::Cidr { network, prefix })
            }
        }
    }

    /// Parse a list of rules, failing on the first malformed one.
    pub fn parse_all<S: AsRef<str>>(rules: &[S]) -> Result<Vec<Self>, IpRuleError> {
        rules.iter().map(|r| IpRule::parse(r.as_ref())).collect()
    }

    pub fn matches(&self, ip: IpAddr) -> bool {
        match *self {
            IpRule::Exact(addr) => addr == normalize(ip),
            IpRule::Cidr { network, prefix } => match (network, normalize(ip)) {
                (IpAddr::V4(net), IpAddr::V4(ip)) => {
                    let mask = u32::MAX.checked_shl(32 - prefix as u32).unwrap_or(0);
                    u32::from(net) & mask == u32::from(ip) & mask
                }
                (IpAddr::V6(net), IpAddr::V6(ip)) => {
                    let mask = u128::MAX.checked_shl(128 - prefix as u32).unwrap_or(0);
                    u128::from(net) & mask == u128::from(ip) & mask
                }
                _ => false,
            },
        }
    }
}

/// Map IPv4-mapped IPv6 addresses back to IPv4 so v4 rules apply to them.
fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

/// Resolve the client IP from proxy headers, then the socket peer.
pub fn resolve_client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> Option<IpAddr> {
    let from_header = |name: &str, first_only: bool| {
        headers.get(name).and_then(|value| value.to_str().ok()).and_then(|value| {
            let candidate = if first_only {
                value.split(',').next().unwrap_or_default()
            } else {
                value
            };
            candidate.trim().parse::<IpAddr>().ok()
        })
    };

    from_header("x-forwarded-for", true)
        .or_else(|| from_header("x-real-ip", false))
        .or_else(|| from_header("x-client-ip", false))
        .or(peer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::message::header_map;

    #[test]
    fn test_rule_parsing() {
        assert_eq!(
            IpRule::parse("10.0.0.1").unwrap(),
            IpRule::Exact("10.0.0.1".parse().unwrap())
        );
        assert!(IpRule::parse("10.0.0.0/8").is_ok());
        assert!(IpRule::parse("::1/128").is_ok());
        assert!(IpRule::parse("10.0.0.0/33").is_err());
        assert!(IpRule::parse("not-an-ip").is_err());
    }

    #[test]
    fn test_cidr_matching() {
        let rule = IpRule::parse("192.168.0.0/16").unwrap();
        assert!(rule.matches("192.168.4.20".parse().unwrap()));
        assert!(!rule.matches("192.169.0.1".parse().unwrap()));
        assert!(rule.matches("::ffff:192.168.1.1".parse().unwrap()));

        let any = IpRule::parse("0.0.0.0/0").unwrap();
        assert!(any.matches("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_resolution_order() {
        let peer: IpAddr = "127.0.0.1".parse().unwrap();

        let headers = header_map([
            ("X-Forwarded-For", "203.0.113.5, 10.0.0.1"),
            ("X-Real-IP", "198.51.100.7"),
        ]);
        assert_eq!(
            resolve_client_ip(&headers, Some(peer)),
            Some("203.0.113.5".parse().unwrap())
        );

        let headers = header_map([("X-Forwarded-For", "garbage"), ("X-Client-IP", "198.51.100.9")]);
        assert_eq!(
            resolve_client_ip(&headers, Some(peer)),
            Some("198.51.100.9".parse().unwrap())
        );

        assert_eq!(resolve_client_ip(&HeaderMap::new(), Some(peer)), Some(peer));
        assert_eq!(resolve_client_ip(&HeaderMap::new(), None), None);
    }
}
