//! Remote endpoint addresses
//!
//! A `RemoteAddress` is a validated `host:port` pair. The host may be an IPv4
//! literal, a bracketed IPv6 literal (`[::1]:443`) or a hostname; validation is
//! purely syntactic, no DNS resolution happens here.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

/// Address parsing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("Missing port in address: {0}")]
    MissingPort(String),

    #[error("Invalid port in address: {0}")]
    InvalidPort(String),

    #[error("Invalid host in address: {0}")]
    InvalidHost(String),
}

/// A validated remote `host:port` endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemoteAddress {
    host: String,
    port: u16,
}

impl RemoteAddress {
    /// Parse and validate a `host:port` string
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        let raw = raw.trim();

        // Bracketed IPv6: [::1]:443
        if let Some(rest) = raw.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| AddressError::InvalidHost(raw.to_string()))?;
            if host.parse::<IpAddr>().is_err() {
                return Err(AddressError::InvalidHost(raw.to_string()));
            }
            let port_str = tail
                .strip_prefix(':')
                .ok_or_else(|| AddressError::MissingPort(raw.to_string()))?;
            let port = Self::parse_port(port_str, raw)?;
            return Ok(Self {
                host: host.to_string(),
                port,
            });
        }

        let (host, port_str) = raw
            .rsplit_once(':')
            .ok_or_else(|| AddressError::MissingPort(raw.to_string()))?;

        // A bare IPv6 literal would leave colons in the host part; require brackets
        if host.contains(':') {
            return Err(AddressError::InvalidHost(raw.to_string()));
        }

        if host.is_empty() || !Self::is_valid_host(host) {
            return Err(AddressError::InvalidHost(raw.to_string()));
        }

        let port = Self::parse_port(port_str, raw)?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Host part, without brackets
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port part
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The `host:port` form accepted by `TcpStream::connect`
    pub fn to_connect_string(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    fn parse_port(port_str: &str, raw: &str) -> Result<u16, AddressError> {
        let port: u16 = port_str
            .parse()
            .map_err(|_| AddressError::InvalidPort(raw.to_string()))?;
        if port == 0 {
            return Err(AddressError::InvalidPort(raw.to_string()));
        }
        Ok(port)
    }

    fn is_valid_host(host: &str) -> bool {
        if host.parse::<IpAddr>().is_ok() {
            return true;
        }
        // Hostname labels: alphanumeric plus '-', '_' and '.' separators
        host.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !host.starts_with('.')
            && !host.ends_with('.')
    }
}

impl FromStr for RemoteAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_connect_string())
    }
}

impl TryFrom<String> for RemoteAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RemoteAddress> for String {
    fn from(addr: RemoteAddress) -> Self {
        addr.to_connect_string()
    }
}
