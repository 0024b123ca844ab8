//! Addresses of virtual network endpoints.

use std::fmt;

use crate::error::{Error, Result};

/// Address of a virtual network endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Addr {
    /// Full network name, e.g. "pipeα" or "lonetβ".
    pub net: String,
    /// Name of the host access point on the network.
    pub host: String,
    /// Port on the host. Port 0 is never allocated; it only appears as
    /// the autobind request in listen addresses.
    pub port: u32,
}

impl Addr {
    pub fn new(net: impl Into<String>, host: impl Into<String>, port: u32) -> Addr {
        Addr {
            net: net.into(),
            host: host.into(),
            port,
        }
    }

    /// Name of the network this address belongs to.
    pub fn network(&self) -> &str {
        &self.net
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parse `"host:port"` into an address on the named network.
///
/// The host part may be empty (`":0"`); resolving an empty host to a
/// concrete one is up to the caller.
pub fn parse_addr(network: &str, addr: &str) -> Result<Addr> {
    let (host, portstr) = split_host_port(addr)?;
    let port = portstr.parse::<u32>().map_err(|_| Error::InvalidAddr {
        addr: addr.to_string(),
        reason: "invalid port".to_string(),
    })?;
    Ok(Addr {
        net: network.to_string(),
        host,
        port,
    })
}

/// Split `"host:port"`, accepting `"[host]:port"` for hosts that contain
/// colons themselves.
fn split_host_port(addr: &str) -> Result<(String, &str)> {
    let bad = |reason: &str| Error::InvalidAddr {
        addr: addr.to_string(),
        reason: reason.to_string(),
    };

    let i = addr.rfind(':').ok_or_else(|| bad("missing port"))?;
    let (host, port) = (&addr[..i], &addr[i + 1..]);

    if let Some(h) = host.strip_prefix('[') {
        let h = h.strip_suffix(']').ok_or_else(|| bad("missing ']' in address"))?;
        Ok((h.to_string(), port))
    } else if host.contains(':') {
        Err(bad("too many colons in address"))
    } else {
        Ok((host.to_string(), port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_addr() {
        let a = parse_addr("pipeα", "α:1").unwrap();
        assert_eq!(a, Addr::new("pipeα", "α", 1));
        assert_eq!(a.to_string(), "α:1");
    }

    #[test]
    fn test_parse_addr_empty_host() {
        let a = parse_addr("pipeα", ":0").unwrap();
        assert_eq!(a.host, "");
        assert_eq!(a.port, 0);
    }

    #[test]
    fn test_parse_addr_bracketed() {
        let a = parse_addr("t", "[a:b]:7").unwrap();
        assert_eq!(a.host, "a:b");
        assert_eq!(a.port, 7);
        assert_eq!(a.to_string(), "[a:b]:7");
    }

    #[test]
    fn test_parse_addr_invalid() {
        assert!(parse_addr("t", "α").is_err()); // missing port
        assert!(parse_addr("t", "α:-1").is_err()); // negative port
        assert!(parse_addr("t", "α:x").is_err()); // non-numeric port
        assert!(parse_addr("t", "a:b:1").is_err()); // stray colon
        assert!(parse_addr("t", "[a:b:1").is_err()); // unterminated bracket
    }
}
