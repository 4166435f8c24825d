//! The per-connection protocol engine.

pub mod connection;
pub mod stream_storage;
pub mod tls;

use std::fmt;
use std::net::SocketAddr;

/// Address of a database node. The address family picks the TCP connect
/// variant used when opening a connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Host {
    address: SocketAddr,
}

impl Host {
    pub fn new(address: SocketAddr) -> Host {
        Host { address }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }
}

impl From<SocketAddr> for Host {
    fn from(address: SocketAddr) -> Host {
        Host { address }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.address.fmt(f)
    }
}
