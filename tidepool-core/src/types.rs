//! Addressing types for cluster hosts.
//!
//! - [`NetworkAddress`]: IP address + port
//! - [`SiloAddress`]: network address + generation, identifying one
//!   incarnation of a host process

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Network address (IPv4/IPv6 + port).
///
/// # Example
///
/// ```rust
/// use tidepool_core::NetworkAddress;
/// use std::net::{IpAddr, Ipv4Addr};
///
/// let addr = NetworkAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 11111);
/// assert_eq!(addr.to_string(), "127.0.0.1:11111");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NetworkAddress {
    /// IP address (IPv4 or IPv6).
    pub ip: IpAddr,
    /// Port number.
    pub port: u16,
}

impl NetworkAddress {
    /// Create a new network address.
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Parse from a string like `"127.0.0.1:11111"` or `"[::1]:11111"`.
    pub fn parse(s: &str) -> Result<Self, NetworkAddressParseError> {
        let (ip_str, port_str) = if let Some(bracket_end) = s.rfind(']') {
            if !s.starts_with('[') {
                return Err(NetworkAddressParseError::InvalidIp);
            }
            let port_str = s[bracket_end + 1..]
                .strip_prefix(':')
                .ok_or(NetworkAddressParseError::MissingPort)?;
            (&s[1..bracket_end], port_str)
        } else {
            s.rsplit_once(':')
                .ok_or(NetworkAddressParseError::MissingPort)?
        };

        let ip: IpAddr = ip_str
            .parse()
            .map_err(|_| NetworkAddressParseError::InvalidIp)?;
        let port: u16 = port_str
            .parse()
            .map_err(|_| NetworkAddressParseError::InvalidPort)?;
        Ok(Self::new(ip, port))
    }
}

impl std::fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

/// Error parsing a [`NetworkAddress`] or [`SiloAddress`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkAddressParseError {
    /// The IP address could not be parsed.
    #[error("invalid IP address")]
    InvalidIp,
    /// The port is missing.
    #[error("missing port")]
    MissingPort,
    /// The port could not be parsed.
    #[error("invalid port")]
    InvalidPort,
    /// The generation could not be parsed.
    #[error("invalid generation")]
    InvalidGeneration,
}

/// Identity of one host process incarnation.
///
/// The generation distinguishes restarts at the same endpoint: a silo that
/// crashes and comes back on the same port gets a new generation, so
/// directory entries pointing at the previous incarnation are recognisably
/// stale.
///
/// Silo addresses are totally ordered (endpoint first, then generation).
///
/// # Example
///
/// ```rust
/// use tidepool_core::SiloAddress;
///
/// let silo = SiloAddress::parse("127.0.0.1:11111@3").expect("valid silo address");
/// assert_eq!(silo.generation, 3);
/// assert_eq!(silo.to_string(), "S127.0.0.1:11111@3");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SiloAddress {
    /// Network endpoint of the silo.
    pub endpoint: NetworkAddress,
    /// Incarnation number, usually the process start time.
    pub generation: u64,
}

impl SiloAddress {
    /// Create a new silo address.
    pub fn new(endpoint: NetworkAddress, generation: u64) -> Self {
        Self {
            endpoint,
            generation,
        }
    }

    /// Parse from `"<endpoint>@<generation>"`, e.g. `"127.0.0.1:11111@3"`.
    pub fn parse(s: &str) -> Result<Self, NetworkAddressParseError> {
        let s = s.strip_prefix('S').unwrap_or(s);
        let (endpoint, generation) = s
            .rsplit_once('@')
            .ok_or(NetworkAddressParseError::InvalidGeneration)?;
        let generation = generation
            .parse()
            .map_err(|_| NetworkAddressParseError::InvalidGeneration)?;
        Ok(Self::new(NetworkAddress::parse(endpoint)?, generation))
    }

    /// Whether `other` is a later incarnation at the same endpoint.
    pub fn is_predecessor_of(&self, other: &SiloAddress) -> bool {
        self.endpoint == other.endpoint && self.generation < other.generation
    }
}

impl std::fmt::Display for SiloAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S{}@{}", self.endpoint, self.generation)
    }
}
