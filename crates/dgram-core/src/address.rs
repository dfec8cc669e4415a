//! Platform-independent socket endpoint representation.

use std::fmt;
use std::net::SocketAddr;

/// A v4-or-v6 socket endpoint, kept distinct from [`std::net::SocketAddr`]
/// so the rest of the crate family can add transport-specific variants
/// later without breaking this one's `Copy`/`Eq`/`Hash` guarantees.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[non_exhaustive]
pub enum SocketEndpoint {
    V4 { addr: [u8; 4], port: u16 },
    V6 { addr: [u16; 8], port: u16 },
}

impl SocketEndpoint {
    pub fn port(&self) -> u16 {
        match self {
            Self::V4 { port, .. } | Self::V6 { port, .. } => *port,
        }
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, Self::V6 { .. })
    }
}

impl fmt::Display for SocketEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 { addr, port } => {
                write!(f, "{}.{}.{}.{}:{}", addr[0], addr[1], addr[2], addr[3], port)
            }
            Self::V6 { addr, port } => {
                let segments: Vec<String> = addr.iter().map(|s| format!("{s:x}")).collect();
                write!(f, "[{}]:{}", segments.join(":"), port)
            }
        }
    }
}

impl From<SocketAddr> for SocketEndpoint {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Self::V4 {
                addr: v4.ip().octets(),
                port: v4.port(),
            },
            SocketAddr::V6(v6) => Self::V6 {
                addr: v6.ip().segments(),
                port: v6.port(),
            },
        }
    }
}

impl From<SocketEndpoint> for SocketAddr {
    fn from(endpoint: SocketEndpoint) -> Self {
        match endpoint {
            SocketEndpoint::V4 { addr, port } => {
                SocketAddr::from((std::net::Ipv4Addr::from(addr), port))
            }
            SocketEndpoint::V6 { addr, port } => {
                SocketAddr::from((std::net::Ipv6Addr::from(addr), port))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_round_trips_through_std_socket_addr() {
        let std_addr: SocketAddr = "127.0.0.1:4040".parse().unwrap();
        let endpoint = SocketEndpoint::from(std_addr);
        assert_eq!(SocketAddr::from(endpoint), std_addr);
    }

    #[test]
    fn display_matches_std_format_for_v4() {
        let std_addr: SocketAddr = "192.168.1.1:9000".parse().unwrap();
        let endpoint = SocketEndpoint::from(std_addr);
        assert_eq!(endpoint.to_string(), "192.168.1.1:9000");
    }
}
