//! Network endpoint value type.
use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::path::PathBuf;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::message::MessageError;

/// Classification of the network an endpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKind {
    Loopback,
    Private,
    Public,
    Multicast,
    Broadcast,
}

/// An address sufficient to reach a peer or a local service.
///
/// IP endpoints order before Unix endpoints; among IP endpoints, IPv4
/// orders before IPv6 and both compare lexicographically on their network
/// bytes, then on port. This ordering decides which side of a peer pair
/// owns the outbound connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// A TCP or UDP endpoint.
    Ip(SocketAddr),
    /// A Unix socket path.
    Unix {
        path: PathBuf,
        /// Abstract socket (Linux only, no filesystem entry).
        abstract_ns: bool,
        /// Auto-bound socket with no name at all.
        unnamed: bool,
    },
}

impl Endpoint {
    /// Build an IP endpoint.
    pub fn ip(addr: IpAddr, port: u16) -> Self {
        Self::Ip(SocketAddr::new(addr, port))
    }

    /// Build a pathed Unix endpoint.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix {
            path: path.into(),
            abstract_ns: false,
            unnamed: false,
        }
    }

    /// Parse an endpoint, supplying a port when the string carries none.
    ///
    /// `host:port` and `[v6]:port` forms parse as IP endpoints; strings
    /// starting with `/` are Unix paths, with `@` marking the abstract
    /// namespace.
    pub fn parse(s: &str, default_port: u16) -> Result<Self, MessageError> {
        let s = s.trim();

        if s.is_empty() {
            return Err(MessageError::InvalidEndpoint(s.to_string()));
        }
        if let Some(path) = s.strip_prefix('@') {
            return Ok(Self::Unix {
                path: PathBuf::from(path),
                abstract_ns: true,
                unnamed: path.is_empty(),
            });
        }
        if s.starts_with('/') {
            return Ok(Self::unix(s));
        }
        if let Ok(sockaddr) = SocketAddr::from_str(s) {
            return Ok(Self::Ip(sockaddr));
        }
        if let Ok(addr) = IpAddr::from_str(s) {
            return Ok(Self::Ip(SocketAddr::new(addr, default_port)));
        }
        // `[v6]` without a port.
        if let Some(inner) = s.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
            if let Ok(addr) = Ipv6Addr::from_str(inner) {
                return Ok(Self::Ip(SocketAddr::new(IpAddr::V6(addr), default_port)));
            }
        }
        Err(MessageError::InvalidEndpoint(s.to_string()))
    }

    /// The socket address, for IP endpoints.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Ip(sockaddr) => Some(*sockaddr),
            Self::Unix { .. } => None,
        }
    }

    /// The port, for IP endpoints.
    pub fn port(&self) -> Option<u16> {
        self.socket_addr().map(|s| s.port())
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, Self::Unix { .. })
    }

    /// Classify the network this endpoint lives on.
    pub fn network_kind(&self) -> NetworkKind {
        match self {
            Self::Unix { .. } => NetworkKind::Loopback,
            Self::Ip(sockaddr) => match sockaddr.ip() {
                IpAddr::V4(ip) => classify_v4(ip),
                IpAddr::V6(ip) => classify_v6(ip),
            },
        }
    }

    /// Whether the endpoint is usable to reach another host.
    pub fn is_remote(&self) -> bool {
        matches!(self.network_kind(), NetworkKind::Private | NetworkKind::Public)
    }

    /// Network-byte key used for the total order.
    fn sort_key(&self) -> (u8, Vec<u8>) {
        match self {
            Self::Ip(SocketAddr::V4(v4)) => {
                let mut bytes = v4.ip().octets().to_vec();
                bytes.extend_from_slice(&v4.port().to_be_bytes());
                (0, bytes)
            }
            Self::Ip(SocketAddr::V6(v6)) => {
                let mut bytes = v6.ip().octets().to_vec();
                bytes.extend_from_slice(&v6.port().to_be_bytes());
                bytes.extend_from_slice(&v6.scope_id().to_be_bytes());
                (1, bytes)
            }
            Self::Unix { path, .. } => (2, path.as_os_str().as_encoded_bytes().to_vec()),
        }
    }
}

fn classify_v4(ip: Ipv4Addr) -> NetworkKind {
    if ip.is_loopback() {
        NetworkKind::Loopback
    } else if ip.is_broadcast() {
        NetworkKind::Broadcast
    } else if ip.is_multicast() {
        NetworkKind::Multicast
    } else if ip.is_private() || ip.is_link_local() {
        NetworkKind::Private
    } else {
        NetworkKind::Public
    }
}

fn classify_v6(ip: Ipv6Addr) -> NetworkKind {
    if ip.is_loopback() {
        NetworkKind::Loopback
    } else if ip.is_multicast() {
        NetworkKind::Multicast
    } else if (ip.segments()[0] & 0xffc0) == 0xfe80 || (ip.segments()[0] & 0xfe00) == 0xfc00 {
        NetworkKind::Private
    } else {
        NetworkKind::Public
    }
}

impl Ord for Endpoint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for Endpoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(sockaddr) => write!(f, "{}", sockaddr),
            Self::Unix { path, abstract_ns, .. } => {
                if *abstract_ns {
                    write!(f, "@{}", path.display())
                } else {
                    write!(f, "{}", path.display())
                }
            }
        }
    }
}

impl FromStr for Endpoint {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s, 0)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(sockaddr: SocketAddr) -> Self {
        Self::Ip(sockaddr)
    }
}

impl From<SocketAddrV4> for Endpoint {
    fn from(v4: SocketAddrV4) -> Self {
        Self::Ip(SocketAddr::V4(v4))
    }
}

impl From<SocketAddrV6> for Endpoint {
    fn from(v6: SocketAddrV6) -> Self {
        Self::Ip(SocketAddr::V6(v6))
    }
}

impl Serialize for Endpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(de::Error::custom)
    }
}
