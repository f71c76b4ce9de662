use std::fmt;
use std::net::{IpAddr, SocketAddr};

use rand::Rng as _;

pub mod client;
pub mod handshake;
pub mod message;
pub mod session;

pub(crate) const PSTR: &str = "BitTorrent protocol";
pub(crate) const PSTR_LEN: u8 = PSTR.len() as u8; // always 19

const PEER_ID_PREFIX: &[u8; 8] = b"-RS0001-";

/// A candidate peer address as returned by discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    pub ip_addr: IpAddr,
    pub port: u16,
}

impl Peer {
    pub fn new(ip_addr: impl Into<IpAddr>, port: u16) -> Self {
        Self {
            ip_addr: ip_addr.into(),
            port,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip_addr, self.port)
    }
}

impl From<SocketAddr> for Peer {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.addr().fmt(f)
    }
}

/// The 20-byte identifier this client presents in handshakes and announces.
///
/// Generated in Azureus style: `-RS0001-` followed by 12 random bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(PEER_ID_PREFIX);
        rand::rng().fill(&mut id[8..]);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", String::from_utf8_lossy(&self.0))
    }
}
