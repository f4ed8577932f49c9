//! Downstream SOCKS proxy target

use std::fmt;
use std::net::SocketAddr;

use crate::error::{Error, Result};

/// Resolved address of the downstream SOCKS proxy
///
/// Resolution happens once when a session starts; the target never changes
/// while the session runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    text: String,
    addr: SocketAddr,
}

impl ProxyTarget {
    /// Resolve `host:port` (or `[v6]:port`) to a socket address
    pub async fn resolve(text: &str) -> Result<Self> {
        let text = text.trim();
        let (host, port) = split_host_port(text)?;

        if let Ok(ip) = host.parse() {
            return Ok(Self {
                text: text.to_string(),
                addr: SocketAddr::new(ip, port),
            });
        }

        let mut addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| Error::InvalidAddress(format!("{}: {}", text, e)))?;

        let addr = addrs
            .next()
            .ok_or_else(|| Error::InvalidAddress(format!("{}: no addresses found", text)))?;

        log::debug!("Resolved proxy {} to {}", text, addr);
        Ok(Self {
            text: text.to_string(),
            addr,
        })
    }

    /// Build a target from an already resolved address
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self {
            text: addr.to_string(),
            addr,
        }
    }

    /// Resolved socket address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Address as the caller wrote it
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.text == self.addr.to_string() {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "{} ({})", self.text, self.addr)
        }
    }
}

/// Split `host:port`, accepting bracketed IPv6 hosts
pub fn split_host_port(text: &str) -> Result<(&str, u16)> {
    let invalid = |why: &str| Error::InvalidAddress(format!("{:?}: {}", text, why));

    let (host, port) = if let Some(rest) = text.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| invalid("unclosed '['"))?;
        let port = tail.strip_prefix(':').ok_or_else(|| invalid("missing port"))?;
        (host, port)
    } else {
        text.rsplit_once(':').ok_or_else(|| invalid("missing port"))?
    };

    if host.is_empty() {
        return Err(invalid("empty host"));
    }

    let port: u16 = port.parse().map_err(|_| invalid("bad port"))?;
    if port == 0 {
        return Err(invalid("port 0"));
    }

    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("127.0.0.1:1080").unwrap(), ("127.0.0.1", 1080));
        assert_eq!(split_host_port("proxy.local:443").unwrap(), ("proxy.local", 443));
        assert_eq!(split_host_port("[::1]:1080").unwrap(), ("::1", 1080));
    }

    #[test]
    fn test_split_host_port_rejects() {
        for bad in ["127.0.0.1", ":1080", "host:", "host:70000", "host:0", "[::1:80", "[::1]80"] {
            assert!(
                matches!(split_host_port(bad), Err(Error::InvalidAddress(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_resolve_literal() {
        let target = ProxyTarget::resolve(" 127.0.0.1:1080 ").await.unwrap();
        assert_eq!(target.addr(), "127.0.0.1:1080".parse().unwrap());
        assert_eq!(target.to_string(), "127.0.0.1:1080");
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let target = ProxyTarget::resolve("localhost:1080").await.unwrap();
        assert!(target.addr().ip().is_loopback());
        assert_eq!(target.as_str(), "localhost:1080");
    }

    #[tokio::test]
    async fn test_resolve_malformed() {
        let err = ProxyTarget::resolve("not-an-address").await.unwrap_err();
        assert!(err.is_config_error());
    }
}
