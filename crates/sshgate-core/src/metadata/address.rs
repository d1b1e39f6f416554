//! `host:port` codec for the client's remote address.
//!
//! The text form is what the authentication and configuration services see on
//! the wire, so it must survive a decode/encode cycle bit for bit. IPv6
//! literals are bracketed (`[fe80::1]:2222`), IPv4 is not (`127.0.0.1:22`).

use crate::error::{GateError, GateResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

/// IP address and port of the connecting client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteAddress {
    pub ip: IpAddr,
    pub port: u16,
}

impl RemoteAddress {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl Default for RemoteAddress {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    }
}

impl From<SocketAddr> for RemoteAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{ip}:{}", self.port),
            IpAddr::V6(ip) => write!(f, "[{ip}]:{}", self.port),
        }
    }
}

impl FromStr for RemoteAddress {
    type Err = GateError;

    /// Split on the last colon, then strip one pair of brackets from the host.
    fn from_str(input: &str) -> GateResult<Self> {
        let (host, port) = input.rsplit_once(':').ok_or_else(|| {
            GateError::InvalidAddress(format!("invalid IP:port combination: {input}"))
        })?;

        let port: i64 = port
            .parse()
            .map_err(|_| GateError::InvalidAddress(format!("invalid port number: {port}")))?;
        let port = u16::try_from(port)
            .map_err(|_| GateError::InvalidAddress(format!("invalid port number: {port}")))?;

        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        let ip: IpAddr = host
            .parse()
            .map_err(|_| GateError::InvalidAddress(format!("invalid IP address: {host}")))?;

        Ok(Self { ip, port })
    }
}

impl Serialize for RemoteAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RemoteAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn encodes_ipv4_without_brackets() {
        let addr = RemoteAddress::new("127.0.0.1".parse().unwrap(), 1234);
        assert_eq!(addr.to_string(), "127.0.0.1:1234");
    }

    #[test]
    fn encodes_ipv6_with_brackets() {
        let addr = RemoteAddress::new("fe80::1".parse().unwrap(), 2222);
        assert_eq!(addr.to_string(), "[fe80::1]:2222");
    }

    #[test]
    fn round_trips_through_text() {
        let texts = [
            "127.0.0.1:1234",
            "[fe80::]:0",
            "[fe80::1]:2222",
            "10.0.0.1:65535",
            "[::1]:22",
        ];
        for text in texts {
            let addr: RemoteAddress = text.parse().unwrap();
            assert_eq!(addr.to_string(), text);
        }
    }

    #[test]
    fn decodes_unbracketed_ipv6() {
        let addr: RemoteAddress = "fe80::1:22".parse().unwrap();
        assert_eq!(addr.ip, IpAddr::V6("fe80::1".parse::<Ipv6Addr>().unwrap()));
        assert_eq!(addr.port, 22);
    }

    #[test]
    fn rejects_missing_colon() {
        for text in ["127.0.0.1", "", "localhost"] {
            let err = text.parse::<RemoteAddress>().unwrap_err();
            assert!(matches!(err, GateError::InvalidAddress(_)), "{text}: {err}");
        }
    }

    #[test]
    fn rejects_bad_port() {
        for text in ["127.0.0.1:ssh", "127.0.0.1:65536", "127.0.0.1:-1", "127.0.0.1:"] {
            assert!(matches!(
                text.parse::<RemoteAddress>(),
                Err(GateError::InvalidAddress(_))
            ));
        }
    }

    #[test]
    fn rejects_bad_host() {
        assert!(matches!(
            "example.com:22".parse::<RemoteAddress>(),
            Err(GateError::InvalidAddress(_))
        ));
    }

    #[test]
    fn json_is_a_plain_string() {
        let addr = RemoteAddress::new("fe80::1".parse().unwrap(), 2222);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"[fe80::1]:2222\"");
        let back: RemoteAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn json_rejects_malformed_text() {
        assert!(serde_json::from_str::<RemoteAddress>("\"nope\"").is_err());
        assert!(serde_json::from_str::<RemoteAddress>("1234").is_err());
    }
}
