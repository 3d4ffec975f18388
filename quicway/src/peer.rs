//! Canonical peer-endpoint value.

use std::net::{IpAddr, SocketAddr};

/// Address family of a peer endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

/// A peer's transport endpoint as delivered by the socket layer.
///
/// Immutable once constructed; equality is family + address bytes + port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddr(SocketAddr);

impl PeerAddr {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn family(&self) -> AddressFamily {
        match self.0 {
            SocketAddr::V4(_) => AddressFamily::V4,
            SocketAddr::V6(_) => AddressFamily::V6,
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    /// The std form consumed by `quiche::RecvInfo` and friends.
    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    /// Opaque raw form handed to the send-side socket layer.
    pub fn to_raw(&self) -> socket2::SockAddr {
        self.0.into()
    }

    /// Address bytes fed into the retry-token MAC. Fixed layout so a token
    /// minted for an IPv4 peer never verifies for a mapped IPv6 one.
    pub fn mac_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(18);
        match self.0.ip() {
            IpAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
            IpAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
        }
        out.extend_from_slice(&self.0.port().to_be_bytes());
        out
    }
}

impl std::fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_by_family_bytes_port() {
        let a: PeerAddr = "192.0.2.1:4433".parse::<SocketAddr>().unwrap().into();
        let b: PeerAddr = "192.0.2.1:4433".parse::<SocketAddr>().unwrap().into();
        let c: PeerAddr = "192.0.2.1:4434".parse::<SocketAddr>().unwrap().into();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.family(), AddressFamily::V4);
        assert_eq!(a.port(), 4433);
    }

    #[test]
    fn mac_bytes_distinguish_families() {
        let v4: PeerAddr = "192.0.2.1:4433".parse::<SocketAddr>().unwrap().into();
        let v6: PeerAddr = "[::ffff:192.0.2.1]:4433"
            .parse::<SocketAddr>()
            .unwrap()
            .into();
        assert_ne!(v4.mac_bytes(), v6.mac_bytes());
        assert_eq!(v4.mac_bytes().len(), 6);
        assert_eq!(v6.mac_bytes().len(), 18);
    }
}
