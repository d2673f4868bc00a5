//! The session node: the public face of the crate.
//!
//! A [`ChatNode`] joins whatever chat session exists on the LAN, or
//! transparently creates one. The session loop:
//!
//! 1. **Discover** servers with a broadcast probe.
//! 2. **Attempt** a TCP connection to each candidate, oldest first.
//! 3. **Fall back** to self-hosting: start an owned [`ChatServer`] and
//!    connect to it over loopback.
//! 4. On connection loss, go back to 1. The owned server is kept while it
//!    is alive (this node may now be the best candidate on the LAN) and
//!    disposed once it has stopped.
//!
//! Messages sent while the node has no connection land in a FIFO backlog
//! and are flushed right after the next successful connect.
//!
//! Everything the node has to say arrives on one [`ChatMessage`] receiver:
//! chat traffic, server notices (`name == "SERVER"`), and node-local status
//! notices (`name == "CLIENT"`).

use std::{
    collections::VecDeque,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::client::{ChatClient, ClientEvent};
use crate::config::NetConfig;
use crate::discovery::{probe, sort_candidates};
use crate::error::ChatError;
use crate::protocol::{validate_message, validate_name};
use crate::server::ChatServer;

/// Sender name carried by node-local status notices.
const STATUS_SENDER: &str = "CLIENT";

/// Capacity of the event channels between client, node, and consumer.
const EVENT_CHANNEL_CAPACITY: usize = 100;

/// A named message surfaced by the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub name: String,
    pub text: String,
}

struct NodeInner {
    config: NetConfig,
    /// The node's display name, applied to every client instance.
    name: Mutex<Option<String>>,
    /// Messages produced while offline, flushed after the next connect.
    backlog: Mutex<VecDeque<String>>,
    /// The current client, if any. `say` reads this without ever waiting on
    /// connection attempts in progress.
    client: Mutex<Option<Arc<ChatClient>>>,
    /// The owned server, if this node is (or was) self-hosting.
    server: tokio::sync::Mutex<Option<ChatServer>>,
    events: mpsc::Sender<ChatMessage>,
    cancel: CancellationToken,
}

impl NodeInner {
    /// Deliver a message to the consumer. Cancellation-aware so a consumer
    /// that stopped draining can never hold up `shutdown`.
    async fn emit(&self, msg: ChatMessage) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.events.send(msg) => {}
        }
    }

    async fn emit_status(&self, text: &str) {
        self.emit(ChatMessage {
            name: STATUS_SENDER.to_owned(),
            text: text.to_owned(),
        })
        .await;
    }
}

/// A LAN chat node. See the module docs for the session behavior.
pub struct ChatNode {
    inner: Arc<NodeInner>,
    started: AtomicBool,
    session_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChatNode {
    /// Create a node and the receiver its [`ChatMessage`]s arrive on.
    pub fn new(config: NetConfig) -> (ChatNode, mpsc::Receiver<ChatMessage>) {
        let (events, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let node = ChatNode {
            inner: Arc::new(NodeInner {
                config,
                name: Mutex::new(None),
                backlog: Mutex::new(VecDeque::new()),
                client: Mutex::new(None),
                server: tokio::sync::Mutex::new(None),
                events,
                cancel: CancellationToken::new(),
            }),
            started: AtomicBool::new(false),
            session_task: Mutex::new(None),
        };
        (node, receiver)
    }

    /// Begin session acquisition in the background. Non-blocking and
    /// idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        let task = tokio::spawn(run_session(inner));
        *self.session_task.lock() = Some(task);
    }

    /// Send a chat message.
    ///
    /// Validation is synchronous: empty or oversized input fails with
    /// `InvalidArgument` before any bytes move. While the node has no
    /// connection the (validated) message joins the backlog and `say`
    /// returns `Ok`.
    pub async fn say(&self, text: &str) -> Result<(), ChatError> {
        let msg = validate_message(text)?;
        let client = self.inner.client.lock().clone();
        if let Some(client) = client {
            match client.say(&msg).await {
                Err(ChatError::NotConnected) => {} // backlog below
                other => return other,
            }
        }
        debug!("backlogging message while offline");
        self.inner.backlog.lock().push_back(msg);
        Ok(())
    }

    /// Set the display name. Validated synchronously; when connected the
    /// change is pushed to the server as a `SET_NAME`.
    pub async fn set_name(&self, raw: &str) -> Result<(), ChatError> {
        let name = validate_name(raw)?;
        *self.inner.name.lock() = Some(name.clone());
        let client = self.inner.client.lock().clone();
        if let Some(client) = client {
            client.set_name(&name).await?;
        }
        Ok(())
    }

    /// The display name, if one has been set.
    pub fn name(&self) -> Option<String> {
        self.inner.name.lock().clone()
    }

    /// Stop the session loop, close the client, and dispose any owned
    /// server. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let task = self.session_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let client = self.inner.client.lock().take();
        if let Some(client) = client {
            client.close().await;
        }
        let server = self.inner.server.lock().await.take();
        if let Some(server) = server {
            server.shutdown().await;
        }
        info!("node stopped");
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Session loop
// ────────────────────────────────────────────────────────────────────────────

/// Acquire a session, pump events until the connection dies, repeat.
async fn run_session(inner: Arc<NodeInner>) {
    loop {
        if inner.cancel.is_cancelled() {
            break;
        }
        inner.emit_status("Searching for session…").await;

        let Some(mut client_events) = acquire_session(&inner).await else {
            break; // cancelled
        };
        inner.emit_status("Connected.").await;
        drain_backlog(&inner).await;

        let lost = pump_events(&inner, &mut client_events).await;

        let client = inner.client.lock().take();
        if let Some(client) = client {
            client.close().await;
        }
        if !lost {
            break; // cancelled
        }
        inner.emit_status("Connection Lost.").await;
    }
    debug!("session loop stopped");
}

/// Loop of discovery, candidate attempts, and the self-host fallback.
/// Returns the connected client's event receiver, or `None` on cancel.
async fn acquire_session(inner: &Arc<NodeInner>) -> Option<mpsc::Receiver<ClientEvent>> {
    loop {
        if inner.cancel.is_cancelled() {
            return None;
        }

        // A server that yielded (or died) is no candidate to keep around.
        dispose_stopped_server(inner).await;

        let mut candidates = tokio::select! {
            _ = inner.cancel.cancelled() => return None,
            candidates = probe(&inner.config) => candidates,
        };
        sort_candidates(&mut candidates, Instant::now());

        for candidate in candidates {
            if inner.cancel.is_cancelled() {
                return None;
            }
            let addr = SocketAddr::new(candidate.ip, inner.config.port);
            if let Some(events) = try_connect(inner, addr).await {
                info!("joined session at {}", addr);
                return Some(events);
            }
        }

        // Nobody answered, or nobody accepted: host the session ourselves.
        inner.emit_status("Starting new session.").await;
        {
            let mut server = inner.server.lock().await;
            if let Some(old) = server.take() {
                old.shutdown().await;
            }
        }
        match ChatServer::start(inner.config).await {
            Ok(server) => {
                *inner.server.lock().await = Some(server);
                let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), inner.config.port);
                if let Some(events) = try_connect(inner, addr).await {
                    info!("hosting a new session");
                    return Some(events);
                }
                // Could not reach our own server; next pass will discover
                // it or replace it.
                warn!("could not connect to the owned server, retrying");
            }
            Err(e) => {
                warn!("failed to start a session server: {}", e);
            }
        }
    }
}

/// Dispose of an owned server that has stopped (typically because it
/// yielded the election). A live server is kept: this node may be the
/// best candidate on the LAN.
async fn dispose_stopped_server(inner: &NodeInner) {
    let mut server = inner.server.lock().await;
    if server.as_ref().is_some_and(|s| s.is_stopped()) {
        if let Some(old) = server.take() {
            old.shutdown().await;
        }
    }
}

/// Close any previous client, then try one TCP connection. On success the
/// fresh client (carrying the node's name) is installed and its event
/// receiver returned.
async fn try_connect(inner: &Arc<NodeInner>, addr: SocketAddr) -> Option<mpsc::Receiver<ClientEvent>> {
    let previous = inner.client.lock().take();
    if let Some(previous) = previous {
        previous.close().await;
    }

    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let name = inner.name.lock().clone();
    let client = Arc::new(ChatClient::new(events_tx, name));

    match client.connect(addr).await {
        Ok(()) => {
            *inner.client.lock() = Some(client);
            Some(events_rx)
        }
        Err(e) => {
            debug!("candidate {} rejected the connection: {}", addr, e);
            None
        }
    }
}

/// Flush the offline backlog through the connected client in FIFO order,
/// swallowing per-message errors.
async fn drain_backlog(inner: &NodeInner) {
    let client = inner.client.lock().clone();
    let Some(client) = client else { return };
    let pending: Vec<String> = {
        let mut backlog = inner.backlog.lock();
        backlog.drain(..).collect()
    };
    for msg in pending {
        if let Err(e) = client.say(&msg).await {
            debug!("backlogged message dropped: {}", e);
        }
    }
}

/// Forward `MessageSaid` events to the consumer until the connection is
/// lost (`true`) or the node is cancelled (`false`).
async fn pump_events(inner: &NodeInner, events: &mut mpsc::Receiver<ClientEvent>) -> bool {
    loop {
        let event = tokio::select! {
            _ = inner.cancel.cancelled() => return false,
            event = events.recv() => event,
        };
        match event {
            Some(ClientEvent::MessageSaid { name, text }) => {
                inner.emit(ChatMessage { name, text }).await;
            }
            Some(ClientEvent::ConnectionLost) | None => return true,
        }
    }
}
