//! Listener and server address specifications.
//!
//! Addresses come from configuration as `"host:port"` strings. An empty host
//! (`":7701"`) binds all interfaces; port `0` requests an OS-assigned
//! ephemeral port, reported back through the service's management queries
//! after binding. Malformed strings fail at setup, not at accept time.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use common::ValveError;
use tokio::net::lookup_host;

/// A parsed, not-yet-resolved `host:port` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSpec {
    host: String,
    port: u16,
}

impl AddressSpec {
    /// Parses a `"host:port"` specification.
    ///
    /// Accepted forms: `"example.org:7701"`, `"127.0.0.1:0"`, `":7701"`
    /// (wildcard host), `"[::1]:7701"` (bracketed IPv6 literal).
    ///
    /// # Errors
    ///
    /// Returns [`ValveError::BadAddress`] when the colon separator is
    /// missing or the port is not a decimal `u16`.
    pub fn parse(spec: &str) -> Result<Self, ValveError> {
        let (host, port) = spec
            .rsplit_once(':')
            .ok_or_else(|| ValveError::BadAddress(format!("{spec:?}: missing ':port'")))?;

        let port: u16 = port
            .parse()
            .map_err(|_| ValveError::BadAddress(format!("{spec:?}: invalid port {port:?}")))?;

        // Strip brackets from IPv6 literals; reject a lone '[' or ']'.
        let host = if host.starts_with('[') && host.ends_with(']') {
            &host[1..host.len() - 1]
        } else if host.contains(['[', ']']) {
            return Err(ValveError::BadAddress(format!("{spec:?}: unbalanced brackets")));
        } else {
            host
        };

        Ok(Self {
            host: host.to_owned(),
            port,
        })
    }

    /// The configured host (empty for wildcard).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The configured port (`0` means ephemeral).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// True when the spec binds all interfaces.
    pub fn is_wildcard(&self) -> bool {
        self.host.is_empty()
    }

    /// Resolves the spec to a concrete socket address.
    ///
    /// Uses the first address the resolver returns; a wildcard host maps to
    /// `0.0.0.0`.
    ///
    /// # Errors
    ///
    /// Returns [`ValveError::BadAddress`] when resolution fails or yields
    /// nothing.
    pub async fn resolve(&self) -> Result<SocketAddr, ValveError> {
        if self.host.is_empty() {
            return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port));
        }

        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }

        let mut addrs = lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| ValveError::BadAddress(format!("{}:{}: {e}", self.host, self.port)))?;

        addrs
            .next()
            .ok_or_else(|| ValveError::BadAddress(format!("{}:{}: no addresses", self.host, self.port)))
    }
}

/// The addresses configured under one logical listener name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSet {
    specs: Vec<AddressSpec>,
}

impl AddressSet {
    /// Parses every entry, failing fast on the first malformed one.
    pub fn parse_all(specs: &[String]) -> Result<Self, ValveError> {
        let specs = specs
            .iter()
            .map(|s| AddressSpec::parse(s))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { specs })
    }

    /// Number of configured addresses.
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// True when no addresses were configured.
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Resolves every spec, in configuration order.
    pub async fn resolve(&self) -> Result<Vec<SocketAddr>, ValveError> {
        let mut addrs = Vec::with_capacity(self.specs.len());
        for spec in &self.specs {
            addrs.push(spec.resolve().await?);
        }
        Ok(addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let spec = AddressSpec::parse("127.0.0.1:7701").unwrap();
        assert_eq!(spec.port(), 7701);
        assert!(!spec.is_wildcard());
    }

    #[test]
    fn parses_wildcard_host() {
        let spec = AddressSpec::parse(":7701").unwrap();
        assert!(spec.is_wildcard());
        assert_eq!(spec.port(), 7701);
    }

    #[test]
    fn parses_ephemeral_port() {
        let spec = AddressSpec::parse("127.0.0.1:0").unwrap();
        assert_eq!(spec.port(), 0);
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let spec = AddressSpec::parse("[::1]:7701").unwrap();
        assert_eq!(spec.port(), 7701);
    }

    #[test]
    fn rejects_missing_port() {
        assert!(AddressSpec::parse("localhost").is_err());
    }

    #[test]
    fn rejects_non_numeric_port() {
        assert!(AddressSpec::parse("localhost:http").is_err());
        assert!(AddressSpec::parse("localhost:70000").is_err());
    }

    #[test]
    fn rejects_unbalanced_brackets() {
        assert!(AddressSpec::parse("[::1:7701").is_err());
    }

    #[tokio::test]
    async fn resolves_ip_literals_without_dns() {
        let addr = AddressSpec::parse("127.0.0.1:9000").unwrap().resolve().await.unwrap();
        assert_eq!(addr, "127.0.0.1:9000".parse::<SocketAddr>().unwrap());

        let addr = AddressSpec::parse(":9000").unwrap().resolve().await.unwrap();
        assert_eq!(addr.port(), 9000);
        assert!(addr.ip().is_unspecified());
    }

    #[tokio::test]
    async fn resolves_sets_in_order() {
        let set = AddressSet::parse_all(&["127.0.0.1:1".into(), "127.0.0.1:2".into()]).unwrap();
        let addrs = set.resolve().await.unwrap();
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[0].port(), 1);
        assert_eq!(addrs[1].port(), 2);
    }

    #[test]
    fn set_fails_fast_on_first_bad_entry() {
        assert!(AddressSet::parse_all(&["127.0.0.1:1".into(), "oops".into()]).is_err());
    }
}
