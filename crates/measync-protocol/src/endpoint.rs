//! Live transport addressing.
//!
//! Endpoints are written `tcp://<host>:<port>` for both binding and
//! connecting. A host of `*` binds every interface; connecting to `*` goes
//! to the local machine.

use std::fmt;
use std::str::FromStr;

/// Default port of the data (publish/subscribe) channel.
pub const DEFAULT_DATA_PORT: u16 = 5555;

/// Default port of the control (request/reply) channel.
pub const DEFAULT_CONTROL_PORT: u16 = 5556;

const SCHEME: &str = "tcp://";
const ANY_HOST: &str = "*";

/// Errors that can occur when parsing an endpoint.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EndpointError {
    #[error("Endpoint {0:?} must start with tcp://")]
    MissingScheme(String),

    #[error("Endpoint {0:?} has no port")]
    MissingPort(String),

    #[error("Endpoint {0:?} has no host")]
    MissingHost(String),

    #[error("Invalid port in endpoint {0:?}")]
    InvalidPort(String),
}

/// A `tcp://host:port` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }

    /// `tcp://localhost:<port>`.
    pub fn localhost(port: u16) -> Self {
        Self::new("localhost", port)
    }

    /// `tcp://*:<port>`, binding every interface.
    pub fn any(port: u16) -> Self {
        Self::new(ANY_HOST, port)
    }

    /// Parse a `tcp://host:port` string.
    pub fn parse(raw: &str) -> Result<Self, EndpointError> {
        let rest = raw
            .strip_prefix(SCHEME)
            .ok_or_else(|| EndpointError::MissingScheme(raw.to_string()))?;
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| EndpointError::MissingPort(raw.to_string()))?;
        if host.is_empty() {
            return Err(EndpointError::MissingHost(raw.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| EndpointError::InvalidPort(raw.to_string()))?;
        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Same host, different port.
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            host: self.host.clone(),
            port,
        }
    }

    /// Socket address string suitable for binding a listener.
    pub fn bind_addr(&self) -> String {
        if self.host == ANY_HOST {
            format!("0.0.0.0:{}", self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Host used when connecting to this endpoint.
    pub fn connect_host(&self) -> &str {
        if self.host == ANY_HOST {
            "127.0.0.1"
        } else {
            &self.host
        }
    }

    /// WebSocket URL of the endpoint.
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/", self.connect_host(), self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}:{}", SCHEME, self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect_endpoint() {
        let ep = Endpoint::parse("tcp://localhost:5555").unwrap();
        assert_eq!(ep.host(), "localhost");
        assert_eq!(ep.port(), 5555);
        assert_eq!(ep.to_string(), "tcp://localhost:5555");
        assert_eq!(ep.ws_url(), "ws://localhost:5555/");
    }

    #[test]
    fn test_parse_wildcard_bind() {
        let ep: Endpoint = "tcp://*:5556".parse().unwrap();
        assert_eq!(ep, Endpoint::any(DEFAULT_CONTROL_PORT));
        assert_eq!(ep.bind_addr(), "0.0.0.0:5556");
        assert_eq!(ep.ws_url(), "ws://127.0.0.1:5556/");
    }

    #[test]
    fn test_parse_ipv6() {
        let ep = Endpoint::parse("tcp://[::1]:7000").unwrap();
        assert_eq!(ep.host(), "[::1]");
        assert_eq!(ep.bind_addr(), "[::1]:7000");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Endpoint::parse("ws://localhost:1"),
            Err(EndpointError::MissingScheme(_))
        ));
        assert!(matches!(
            Endpoint::parse("tcp://localhost"),
            Err(EndpointError::MissingPort(_))
        ));
        assert!(matches!(
            Endpoint::parse("tcp://:5555"),
            Err(EndpointError::MissingHost(_))
        ));
        assert!(matches!(
            Endpoint::parse("tcp://localhost:70000"),
            Err(EndpointError::InvalidPort(_))
        ));
    }

    #[test]
    fn test_with_port() {
        let ep = Endpoint::localhost(DEFAULT_DATA_PORT).with_port(5557);
        assert_eq!(ep.to_string(), "tcp://localhost:5557");
    }
}
