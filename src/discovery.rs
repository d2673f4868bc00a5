//! UDP server discovery for the session node.
//!
//! A node looking for a session broadcasts `SERVER_INFO_REQUEST` datagrams
//! and collects the `SERVER_INFO` beacons that servers answer with. Each
//! valid beacon becomes a [`CandidateServer`]; the node then tries TCP
//! connections in order of decreasing effective age.
//!
//! The probe socket binds the shared chat port with address reuse so it can
//! coexist with a server owned by the same process (and with other nodes on
//! the same development host).

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Instant,
};

use log::{debug, warn};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    net::UdpSocket,
    time::{timeout, Duration},
};

use crate::config::NetConfig;
use crate::protocol::{decode_beacon, OP_SERVER_INFO_REQUEST};

/// Hard cap on one discovery pass.
const PROBE_WINDOW: Duration = Duration::from_secs(2);

/// Once any candidate has been found, the remaining window shrinks to at
/// most this much. A LAN with an existing session answers quickly.
const PROBE_FAST_WINDOW: Duration = Duration::from_secs(1);

/// Cadence of `SERVER_INFO_REQUEST` sends within the window.
const REQUEST_INTERVAL: Duration = Duration::from_millis(100);

// ────────────────────────────────────────────────────────────────────────────
// Candidate servers
// ────────────────────────────────────────────────────────────────────────────

/// A server observed during discovery that the node may try to connect to.
#[derive(Debug, Clone)]
pub struct CandidateServer {
    /// Source address of the beacon.
    pub ip: IpAddr,
    /// The server's random 64-bit identity.
    pub uid: u64,
    /// The age the server reported in its beacon, in whole seconds.
    pub age_at_discovery: u32,
    /// When the beacon was received.
    pub discovered_at: Instant,
}

impl CandidateServer {
    /// The server's age as of `now`: the reported age plus however long ago
    /// the beacon was received. Keeps candidates comparable even when they
    /// were discovered at different instants.
    pub fn effective_age(&self, now: Instant) -> u64 {
        u64::from(self.age_at_discovery)
            + now.saturating_duration_since(self.discovered_at).as_secs()
    }
}

/// Order candidates oldest-first, ties broken by higher uid. The node
/// connects to the most established server the same way the election rule
/// keeps it alive.
pub fn sort_candidates(candidates: &mut [CandidateServer], now: Instant) {
    candidates.sort_by(|a, b| {
        b.effective_age(now)
            .cmp(&a.effective_age(now))
            .then_with(|| b.uid.cmp(&a.uid))
    });
}

// ────────────────────────────────────────────────────────────────────────────
// Socket setup
// ────────────────────────────────────────────────────────────────────────────

/// Bind a UDP socket on `port` with `SO_REUSEADDR` (and `SO_REUSEPORT` where
/// available) plus `SO_BROADCAST`, using `socket2` so the options are set
/// before the bind. Reuse lets a node's probe socket, its own server's
/// election socket, and other local processes share the one well-known port.
pub(crate) fn bind_reusable_udp(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(not(target_os = "windows"))]
    if let Err(e) = socket.set_reuse_port(true) {
        warn!("SO_REUSEPORT unavailable (non-fatal): {}", e);
    }
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&socket2::SockAddr::from(addr))?;
    UdpSocket::from_std(socket.into())
}

// ────────────────────────────────────────────────────────────────────────────
// Discovery probe
// ────────────────────────────────────────────────────────────────────────────

/// Run one discovery pass and return every server that answered.
///
/// Sends a `SERVER_INFO_REQUEST` every 100 ms and drains beacons for up to
/// two seconds, shortening the remaining window to one second as soon as the
/// first candidate appears. Candidates are deduplicated by source IP; the
/// first beacon from an address wins.
///
/// Socket errors are tolerated: an empty LAN, a missing broadcast route, or
/// a bind failure all simply produce an empty list and the caller falls back
/// to self-hosting.
pub async fn probe(config: &NetConfig) -> Vec<CandidateServer> {
    let socket = match bind_reusable_udp(config.port) {
        Ok(s) => s,
        Err(e) => {
            warn!("discovery probe could not bind udp port {}: {}", config.port, e);
            return Vec::new();
        }
    };
    let target = SocketAddr::V4(config.broadcast_target());

    let mut found: HashMap<IpAddr, CandidateServer> = HashMap::new();
    let mut buf = [0u8; 64];
    let start = Instant::now();
    let mut deadline = start + PROBE_WINDOW;
    let mut next_request = start;

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }

        if now >= next_request {
            if let Err(e) = socket.send_to(&[OP_SERVER_INFO_REQUEST], target).await {
                debug!("discovery request send failed: {}", e);
            }
            next_request = now + REQUEST_INTERVAL;
        }

        let wait = deadline.min(next_request).saturating_duration_since(now);
        match timeout(wait, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, src))) => {
                if let Some(beacon) = decode_beacon(&buf[..len]) {
                    let received = Instant::now();
                    if !found.contains_key(&src.ip()) {
                        debug!(
                            "discovered server {:016x} at {} (age {}s)",
                            beacon.uid,
                            src.ip(),
                            beacon.age_secs
                        );
                        found.insert(
                            src.ip(),
                            CandidateServer {
                                ip: src.ip(),
                                uid: beacon.uid,
                                age_at_discovery: beacon.age_secs,
                                discovered_at: received,
                            },
                        );
                        deadline = deadline.min(received + PROBE_FAST_WINDOW);
                    }
                }
            }
            Ok(Err(e)) => {
                debug!("discovery recv error: {}", e);
            }
            Err(_) => {
                // Window slice elapsed; loop to send the next request or
                // notice the deadline.
            }
        }
    }

    found.into_values().collect()
}
