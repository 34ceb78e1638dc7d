//! Address classification and accept-address filters
//!
//! A tunnel endpoint is either a `host:port` socket address or an identity on
//! the overlay network. The classification is done once, when a tunnel is
//! built, and decides which transport adapters serve each side.

use std::fmt;

use regex::Regex;

use crate::{Result, TunnelError};

/// Token that asks for listening on the overlay identity
pub const OVERLAY_SENTINEL: &str = "nkn";

/// Which transport serves one side of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Plain TCP/UDP socket
    Socket,
    /// Overlay network identity
    Overlay,
}

impl Side {
    pub fn is_overlay(self) -> bool {
        self == Side::Overlay
    }
}

/// Classify the listening side.
///
/// Empty, the sentinel (any case), or anything that is not `host:port`
/// listens on the overlay.
pub fn classify_from(from: &str) -> Side {
    if from.is_empty()
        || from.eq_ignore_ascii_case(OVERLAY_SENTINEL)
        || split_host_port(from).is_none()
    {
        Side::Overlay
    } else {
        Side::Socket
    }
}

/// Classify the dialing side: no port separator means an overlay address.
pub fn classify_to(to: &str) -> Side {
    if to.contains(':') {
        Side::Socket
    } else {
        Side::Overlay
    }
}

/// Split `host:port` (or `[v6]:port`) into its parts.
///
/// The port must be present but is not range checked, matching what a socket
/// resolver accepts as syntax.
pub fn split_host_port(addr: &str) -> Option<(&str, &str)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?;
        if port.contains(':') {
            return None;
        }
        return Some((host, port));
    }
    let (host, port) = addr.rsplit_once(':')?;
    if host.contains(':') || host.contains('[') || host.contains(']') || port.contains(']') {
        return None;
    }
    Some((host, port))
}

/// Allow-list of peer identities, each entry a regular expression.
#[derive(Clone)]
pub struct AcceptAddrs {
    patterns: Vec<Regex>,
}

impl AcceptAddrs {
    /// Compile a list of patterns
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| {
                Regex::new(p.as_ref())
                    .map_err(|e| TunnelError::Config(format!("accept address {:?}: {}", p.as_ref(), e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Parse a comma separated list, ignoring blank entries
    pub fn parse_list(list: &str) -> Result<Self> {
        Self::new(list.split(',').map(str::trim).filter(|p| !p.is_empty()))
    }

    /// Whether `addr` matches any pattern
    pub fn matches(&self, addr: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(addr))
    }

    /// Source patterns
    pub fn patterns(&self) -> Vec<&str> {
        self.patterns.iter().map(Regex::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl fmt::Debug for AcceptAddrs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.patterns()).finish()
    }
}

/// `None` accepts everybody.
pub fn accepts(filter: Option<&AcceptAddrs>, addr: &str) -> bool {
    filter.map_or(true, |f| f.matches(addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_from() {
        assert_eq!(classify_from(""), Side::Overlay);
        assert_eq!(classify_from("nkn"), Side::Overlay);
        assert_eq!(classify_from("NKN"), Side::Overlay);
        assert_eq!(classify_from("somehost"), Side::Overlay);
        assert_eq!(classify_from("127.0.0.1:8000"), Side::Socket);
        assert_eq!(classify_from(":8000"), Side::Socket);
        assert_eq!(classify_from("[::1]:8000"), Side::Socket);
        assert_eq!(classify_from("::1"), Side::Overlay);
    }

    #[test]
    fn test_classify_to() {
        assert_eq!(classify_to("127.0.0.1:9000"), Side::Socket);
        assert_eq!(classify_to("bob.be285ff9330122ce"), Side::Overlay);
        assert_eq!(classify_to("be285ff9330122ce"), Side::Overlay);
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("localhost:80"), Some(("localhost", "80")));
        assert_eq!(split_host_port("[::1]:443"), Some(("::1", "443")));
        assert_eq!(split_host_port("localhost"), None);
        assert_eq!(split_host_port("[::1]"), None);
        assert_eq!(split_host_port("a:b:c"), None);
    }

    #[test]
    fn test_accept_addrs_matching() {
        let filter = AcceptAddrs::new(["^alice\\.", "7aafe088$"]).unwrap();
        assert!(filter.matches("alice.abcdef"));
        assert!(filter.matches("bob.0000007aafe088"));
        assert!(!filter.matches("bob.abcdef"));
        assert_eq!(filter.len(), 2);
    }

    #[test]
    fn test_accept_addrs_parse_list() {
        let filter = AcceptAddrs::parse_list("^alice, ,^bob").unwrap();
        assert_eq!(filter.patterns(), vec!["^alice", "^bob"]);
    }

    #[test]
    fn test_accept_addrs_invalid_pattern() {
        let err = AcceptAddrs::new(["("]).unwrap_err();
        assert!(matches!(err, TunnelError::Config(_)));
    }

    #[test]
    fn test_accepts_none_allows_all() {
        assert!(accepts(None, "anyone"));
        let filter = AcceptAddrs::new(["^alice"]).unwrap();
        assert!(!accepts(Some(&filter), "bob"));
    }
}
