//! TCP fan-out chat server with UDP beacon election.
//!
//! ## Architecture
//!
//! ```text
//!  ┌────────────────────────────────────────────────────────────┐
//!  │                        ChatServer                          │
//!  │                                                            │
//!  │  ┌─────────────┐   per client   ┌────────────────────────┐ │
//!  │  │ accept loop │──────spawns───▶│ reader (SAY, SET_NAME) │ │
//!  │  └─────────────┘                └───────────┬────────────┘ │
//!  │                                             │ enqueue      │
//!  │  ┌──────────────────┐    mpsc queue   ┌─────▼────────┐     │
//!  │  │ election worker  │                 │   dispatch   │     │
//!  │  │ (UDP beacons)    │                 │ (fan-out to  │     │
//!  │  └──────────────────┘                 │ all writers) │     │
//!  │                                       └──────────────┘     │
//!  └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every worker selects on one shared [`CancellationToken`]; a yield (a
//! better server exists on the LAN), a listener failure, or an explicit
//! [`ChatServer::shutdown`] all funnel through the same stop path: cancel,
//! actively close every client transport, and let the workers drain.
//!
//! The election keeps exactly one server per broadcast domain: older servers
//! win, and inside a two-second fuzz band the higher uid does. A server
//! never reacts to its own beacons.

use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, UdpSocket,
    },
    sync::mpsc,
    task::JoinHandle,
    time::{timeout, Duration},
};
use tokio_util::sync::CancellationToken;

use crate::config::NetConfig;
use crate::discovery::bind_reusable_udp;
use crate::error::ChatError;
use crate::protocol::{
    decode_beacon, encode_beacon, encode_say_dispatch, read_name_payload, read_say_payload,
    Beacon, OP_SAY, OP_SERVER_INFO_REQUEST, OP_SET_NAME,
};

/// Sender name used for server-originated notices.
const SERVER_SENDER: &str = "SERVER";

/// A server younger than this beacons (and drains) on a fast cadence so
/// freshly started rivals converge quickly.
const YOUNG_AGE: Duration = Duration::from_secs(2);

/// Beacon drain window while the server is young.
const YOUNG_DRAIN_WINDOW: Duration = Duration::from_millis(100);

/// Beacon drain window once established.
const DRAIN_WINDOW: Duration = Duration::from_secs(2);

/// Age difference treated as a tie; tolerates clock skew and beacon delay.
const AGE_FUZZ_SECS: i64 = 2;

// ────────────────────────────────────────────────────────────────────────────
// Election rule
// ────────────────────────────────────────────────────────────────────────────

/// Whether this server should yield to a rival advertising `other_age_secs`
/// and `other_uid`. Older wins; within the fuzz band the higher uid wins.
/// A pure function of its inputs so the outcome is deterministic.
fn should_yield(this_age_secs: u32, other_age_secs: u32, this_uid: u64, other_uid: u64) -> bool {
    let delta = i64::from(other_age_secs) - i64::from(this_age_secs);
    if delta > AGE_FUZZ_SECS {
        return true;
    }
    delta.abs() <= AGE_FUZZ_SECS && other_uid > this_uid
}

// ────────────────────────────────────────────────────────────────────────────
// Server state
// ────────────────────────────────────────────────────────────────────────────

type WriterSlot = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

/// A connected client as the server sees it. The id is unique for the
/// server's lifetime and never recycles; removing the record closes (or has
/// already closed) the transport.
struct ClientRecord {
    name: String,
    writer: WriterSlot,
}

/// A message waiting for fan-out.
struct Dispatch {
    name: String,
    text: String,
}

struct ServerInner {
    uid: u64,
    started: Instant,
    broadcast_target: SocketAddr,
    clients: RwLock<HashMap<u64, ClientRecord>>,
    next_client_id: AtomicU64,
    queue: mpsc::UnboundedSender<Dispatch>,
    cancel: CancellationToken,
}

impl ServerInner {
    fn age(&self) -> Duration {
        self.started.elapsed()
    }

    /// Age in whole seconds as carried in beacons.
    fn age_secs(&self) -> u32 {
        self.age().as_secs().min(u64::from(u32::MAX)) as u32
    }

    /// Queue a message for fan-out. Silently dropped once the dispatch
    /// worker has stopped.
    fn enqueue(&self, name: impl Into<String>, text: impl Into<String>) {
        let _ = self.queue.send(Dispatch {
            name: name.into(),
            text: text.into(),
        });
    }

    fn client_name(&self, id: u64) -> Option<String> {
        self.clients.read().get(&id).map(|rec| rec.name.clone())
    }

    /// Replace a client's name. Returns the old name, or `None` when the new
    /// name is identical or the record is already gone.
    fn rename_client(&self, id: u64, new_name: &str) -> Option<String> {
        let mut table = self.clients.write();
        let record = table.get_mut(&id)?;
        if record.name == new_name {
            return None;
        }
        Some(std::mem::replace(&mut record.name, new_name.to_owned()))
    }

    /// Remove a client record. At most one caller gets the name back, so
    /// the disconnect notice is enqueued exactly once.
    fn remove_client(&self, id: u64) -> Option<String> {
        self.clients.write().remove(&id).map(|rec| rec.name)
    }
}

/// Cancel all workers and actively close every client transport so remote
/// receive loops observe EOF. Shared by yield, listener failure, and
/// [`ChatServer::shutdown`].
async fn stop(inner: &ServerInner) {
    inner.cancel.cancel();
    let writers: Vec<WriterSlot> = {
        let mut table = inner.clients.write();
        table.drain().map(|(_, rec)| rec.writer).collect()
    };
    for writer in writers {
        let _ = writer.lock().await.shutdown().await;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Public handle
// ────────────────────────────────────────────────────────────────────────────

/// A running chat server: TCP fan-out plus the UDP election worker.
pub struct ChatServer {
    inner: Arc<ServerInner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ChatServer {
    /// Bind the TCP listener and the shared-port UDP socket, then spawn the
    /// accept, dispatch, and election workers. Bind failures surface here,
    /// before any task exists.
    pub async fn start(config: NetConfig) -> Result<ChatServer, ChatError> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.port)).await?;
        let udp = bind_reusable_udp(config.port)?;

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ServerInner {
            uid: rand::random(),
            started: Instant::now(),
            broadcast_target: SocketAddr::V4(config.broadcast_target()),
            clients: RwLock::new(HashMap::new()),
            next_client_id: AtomicU64::new(0),
            queue: queue_tx,
            cancel: CancellationToken::new(),
        });

        info!(
            "chat server started (uid {:016x}, port {})",
            inner.uid, config.port
        );

        let handles = vec![
            tokio::spawn(run_accept(inner.clone(), listener)),
            tokio::spawn(run_dispatch(inner.clone(), queue_rx)),
            tokio::spawn(run_election(inner.clone(), udp)),
        ];

        Ok(ChatServer {
            inner,
            handles: Mutex::new(handles),
        })
    }

    /// The server's random 64-bit identity.
    pub fn uid(&self) -> u64 {
        self.inner.uid
    }

    /// Whether the server has stopped or begun stopping (yield, listener
    /// failure, or shutdown).
    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Signal stop, close every client socket, and join all workers.
    /// Idempotent; never returns while a worker may still touch a transport.
    pub async fn shutdown(&self) {
        stop(&self.inner).await;
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("chat server {:016x} stopped", self.inner.uid);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Accept loop
// ────────────────────────────────────────────────────────────────────────────

/// Accept TCP clients. Each gets the next id, a name defaulting to its IP,
/// a record in the table, and its own reader task. A listener error stops
/// the whole server.
async fn run_accept(inner: Arc<ServerInner>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer_addr)) => {
                let id = inner.next_client_id.fetch_add(1, Ordering::Relaxed);
                let name = peer_addr.ip().to_string();
                let (read_half, write_half) = stream.into_split();
                inner.clients.write().insert(
                    id,
                    ClientRecord {
                        name: name.clone(),
                        writer: Arc::new(tokio::sync::Mutex::new(write_half)),
                    },
                );
                info!("client {} connected from {}", id, peer_addr);
                tokio::spawn(run_client_reader(inner.clone(), id, read_half));
                inner.enqueue(SERVER_SENDER, format!("{} connected.", name));
            }
            Err(e) => {
                warn!("listener failed, stopping server: {}", e);
                stop(&inner).await;
                break;
            }
        }
    }
    debug!("accept loop stopped");
}

// ────────────────────────────────────────────────────────────────────────────
// Per-client reader
// ────────────────────────────────────────────────────────────────────────────

/// Read frames from one client until the transport fails or the server
/// stops. A transport failure removes the record (at most once) and queues
/// the disconnect notice.
async fn run_client_reader(inner: Arc<ServerInner>, id: u64, mut reader: OwnedReadHalf) {
    loop {
        let result = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            r = read_client_frame(&inner, id, &mut reader) => r,
        };
        if let Err(e) = result {
            debug!("client {} read ended: {}", id, e);
            break;
        }
    }
    if let Some(name) = inner.remove_client(id) {
        inner.enqueue(SERVER_SENDER, format!("{} disconnected.", name));
    }
}

/// Handle one inbound frame from a client.
async fn read_client_frame(
    inner: &ServerInner,
    id: u64,
    reader: &mut OwnedReadHalf,
) -> std::io::Result<()> {
    let opcode = reader.read_u8().await?;
    match opcode {
        OP_SAY => {
            let text = read_say_payload(reader).await?;
            let text = text.trim().to_owned();
            if let Some(name) = inner.client_name(id) {
                inner.enqueue(name, text);
            }
        }
        OP_SET_NAME => {
            let name = read_name_payload(reader).await?;
            let new_name = name.trim().to_owned();
            if let Some(old) = inner.rename_client(id, &new_name) {
                inner.enqueue(
                    SERVER_SENDER,
                    format!("{} changed their name to {}", old, new_name),
                );
            }
        }
        other => {
            debug!("client {}: skipping unknown opcode {}", id, other);
        }
    }
    Ok(())
}

// ────────────────────────────────────────────────────────────────────────────
// Dispatch worker
// ────────────────────────────────────────────────────────────────────────────

/// Single consumer of the message queue. Each message is encoded once and
/// written to every registered client; a client whose write fails is
/// dropped and the fan-out proceeds for the rest.
async fn run_dispatch(inner: Arc<ServerInner>, mut queue: mpsc::UnboundedReceiver<Dispatch>) {
    loop {
        let item = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            item = queue.recv() => item,
        };
        let Some(Dispatch { name, text }) = item else {
            break;
        };
        let frame = encode_say_dispatch(&name, &text);
        let targets: Vec<(u64, WriterSlot)> = {
            let table = inner.clients.read();
            table
                .iter()
                .map(|(id, rec)| (*id, rec.writer.clone()))
                .collect()
        };
        for (id, writer) in targets {
            // Cancellation-aware: a stalled peer must not keep its writer
            // lock held against the stop path.
            let result = tokio::select! {
                _ = inner.cancel.cancelled() => return,
                r = async { writer.lock().await.write_all(&frame).await } => r,
            };
            if let Err(e) = result {
                debug!("dropping client {} after write failure: {}", id, e);
                if let Some(name) = inner.remove_client(id) {
                    inner.enqueue(SERVER_SENDER, format!("{} disconnected.", name));
                }
            }
        }
    }
    debug!("dispatch worker stopped");
}

// ────────────────────────────────────────────────────────────────────────────
// Election worker
// ────────────────────────────────────────────────────────────────────────────

/// Advertise this server and watch for rivals.
///
/// Each iteration sends one beacon, then drains inbound datagrams for a
/// window: 100 ms while the server is younger than two seconds, two seconds
/// afterwards. A `SERVER_INFO_REQUEST` gets one extra beacon in reply (to
/// the broadcast address, like every beacon). A valid rival beacon is put
/// through the election rule; losing means closing every client socket and
/// winding the server down.
async fn run_election(inner: Arc<ServerInner>, socket: UdpSocket) {
    let mut buf = [0u8; 64];
    loop {
        if inner.cancel.is_cancelled() {
            break;
        }
        send_beacon(&inner, &socket).await;

        let window = if inner.age() < YOUNG_AGE {
            YOUNG_DRAIN_WINDOW
        } else {
            DRAIN_WINDOW
        };
        let deadline = Instant::now() + window;

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let result = tokio::select! {
                _ = inner.cancel.cancelled() => return,
                r = timeout(deadline - now, socket.recv_from(&mut buf)) => r,
            };
            let (len, src) = match result {
                Err(_) => break, // window elapsed
                Ok(Err(e)) => {
                    warn!("election recv error: {}", e);
                    break;
                }
                Ok(Ok(received)) => received,
            };

            if len == 1 && buf[0] == OP_SERVER_INFO_REQUEST {
                send_beacon(&inner, &socket).await;
                continue;
            }

            let Some(beacon) = decode_beacon(&buf[..len]) else {
                continue; // malformed or corrupt, silently dropped
            };
            if beacon.uid == inner.uid {
                continue; // our own broadcast echoed back
            }

            let this_age = inner.age_secs();
            if should_yield(this_age, beacon.age_secs, inner.uid, beacon.uid) {
                info!(
                    "yielding to server {:016x} at {} (age {}s vs our {}s)",
                    beacon.uid, src, beacon.age_secs, this_age
                );
                stop(&inner).await;
                return;
            }
            debug!(
                "keeping the session over server {:016x} (age {}s vs our {}s)",
                beacon.uid, beacon.age_secs, this_age
            );
        }
    }
    debug!("election worker stopped");
}

/// Broadcast one `SERVER_INFO` beacon. Send failures are tolerated; the
/// next iteration carries the same decision inputs.
async fn send_beacon(inner: &ServerInner, socket: &UdpSocket) {
    let datagram = encode_beacon(&Beacon {
        age_secs: inner.age_secs(),
        uid: inner.uid,
    });
    if let Err(e) = socket.send_to(&datagram, inner.broadcast_target).await {
        debug!("beacon send failed: {}", e);
    }
}
