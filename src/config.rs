//! Network configuration.
//!
//! There are no config files and no environment variables; every peer on a
//! LAN agrees on the defaults without coordination. The struct exists so
//! that tests can run several isolated sessions on one host by picking
//! distinct ports.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::protocol::DEFAULT_PORT;

/// Shared TCP/UDP port and UDP broadcast destination.
#[derive(Debug, Clone, Copy)]
pub struct NetConfig {
    /// Port used by the TCP chat server and all UDP discovery traffic.
    pub port: u16,
    /// Destination address for beacons and discovery requests.
    pub broadcast_addr: Ipv4Addr,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            port: DEFAULT_PORT,
            broadcast_addr: Ipv4Addr::BROADCAST,
        }
    }
}

impl NetConfig {
    /// The socket address UDP datagrams are broadcast to.
    pub fn broadcast_target(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.broadcast_addr, self.port)
    }
}
