//! TCP chat client: one connection to a server, a receive loop, and
//! serialized writes.
//!
//! The client surfaces everything it hears through a [`ClientEvent`] channel
//! handed in at construction: a [`ClientEvent::MessageSaid`] per received
//! `SAY_DISPATCH`, and a single [`ClientEvent::ConnectionLost`] when the
//! receive loop dies from a transport failure rather than an explicit
//! [`ChatClient::close`].
//!
//! The lifecycle is one-way: unconnected → connected → closed. A closed
//! client is terminal; the session node builds a fresh instance for every
//! connection attempt and carries the display name across.

use std::net::SocketAddr;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::error::ChatError;
use crate::protocol::{
    encode_say, encode_set_name, read_say_dispatch, validate_message, validate_name,
    OP_SAY_DISPATCH,
};

/// Events emitted by a [`ChatClient`].
#[derive(Debug)]
pub enum ClientEvent {
    /// A named message dispatched by the server.
    MessageSaid { name: String, text: String },
    /// The receive loop terminated because the transport failed. Not emitted
    /// on an explicit `close`.
    ConnectionLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Unconnected,
    Connected,
    Closed,
}

/// The single exclusive writer slot: every frame written to the stream goes
/// through this lock, so `SAY` and `SET_NAME` writes never interleave.
type WriterSlot = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

/// A chat client owning exactly one TCP stream.
pub struct ChatClient {
    state: Mutex<ClientState>,
    /// Display name; its own lock because the getter, the setter, and the
    /// connect-time `SET_NAME` send may race.
    name: Mutex<Option<String>>,
    writer: Mutex<Option<WriterSlot>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    events: mpsc::Sender<ClientEvent>,
}

impl ChatClient {
    /// Create an unconnected client. `name`, when present, is sent as a
    /// `SET_NAME` during [`connect`](Self::connect); it must already be
    /// validated.
    pub fn new(events: mpsc::Sender<ClientEvent>, name: Option<String>) -> Self {
        ChatClient {
            state: Mutex::new(ClientState::Unconnected),
            name: Mutex::new(name),
            writer: Mutex::new(None),
            recv_task: Mutex::new(None),
            cancel: CancellationToken::new(),
            events,
        }
    }

    /// Open the TCP session, start the receive loop, send a `SET_NAME` if a
    /// name has been set, then mark the client connected.
    ///
    /// Fails with `AlreadyConnected` unless the client is unconnected, and
    /// with `Network` on any transport error.
    pub async fn connect(&self, addr: SocketAddr) -> Result<(), ChatError> {
        if *self.state.lock() != ClientState::Unconnected {
            return Err(ChatError::AlreadyConnected);
        }

        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        let writer: WriterSlot = Arc::new(tokio::sync::Mutex::new(write_half));

        let task = tokio::spawn(run_receive_loop(
            read_half,
            self.events.clone(),
            self.cancel.clone(),
        ));

        let preset = self.name.lock().clone();
        if let Some(name) = preset {
            let frame = encode_set_name(&name);
            if let Err(e) = writer.lock().await.write_all(&frame).await {
                task.abort();
                return Err(ChatError::Network(e));
            }
        }

        *self.writer.lock() = Some(writer);
        *self.recv_task.lock() = Some(task);
        *self.state.lock() = ClientState::Connected;
        debug!("client connected to {}", addr);
        Ok(())
    }

    /// Send a chat message.
    ///
    /// The text is trimmed and validated first (`InvalidArgument`); when the
    /// client is not connected the caller gets `NotConnected` and is
    /// responsible for any backlogging.
    pub async fn say(&self, text: &str) -> Result<(), ChatError> {
        let msg = validate_message(text)?;
        let writer = self.connected_writer().ok_or(ChatError::NotConnected)?;
        let frame = encode_say(&msg);
        writer.lock().await.write_all(&frame).await?;
        Ok(())
    }

    /// Store a display name and, when connected, push a `SET_NAME` to the
    /// server. When unconnected the name is kept for the next `connect`.
    pub async fn set_name(&self, raw: &str) -> Result<(), ChatError> {
        let name = validate_name(raw)?;
        *self.name.lock() = Some(name.clone());
        if let Some(writer) = self.connected_writer() {
            let frame = encode_set_name(&name);
            writer.lock().await.write_all(&frame).await?;
        }
        Ok(())
    }

    /// The currently stored display name.
    pub fn name(&self) -> Option<String> {
        self.name.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.state.lock() == ClientState::Connected
    }

    /// Close the client. Idempotent.
    ///
    /// Signals the receive loop, joins it, then shuts the transport down
    /// under the writer slot so no in-flight write is still touching the
    /// stream when this returns. The client is terminal afterwards.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == ClientState::Closed {
                return;
            }
            *state = ClientState::Closed;
        }
        self.cancel.cancel();
        let task = self.recv_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            let _ = writer.lock().await.shutdown().await;
        }
        debug!("client closed");
    }

    fn connected_writer(&self) -> Option<WriterSlot> {
        if *self.state.lock() != ClientState::Connected {
            return None;
        }
        self.writer.lock().clone()
    }
}

/// Receive loop: one opcode byte, then the `SAY_DISPATCH` payload. Unknown
/// opcodes are ignored for forward compatibility. EOF or a transport error
/// ends the loop and raises `ConnectionLost`; cancellation (an explicit
/// close) ends it silently.
async fn run_receive_loop(
    mut reader: OwnedReadHalf,
    events: mpsc::Sender<ClientEvent>,
    cancel: CancellationToken,
) {
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            r = read_dispatch_frame(&mut reader) => r,
        };
        match result {
            Ok(Some((name, text))) => {
                // Cancellation-aware so a full channel can never hold up a
                // close that is waiting to join this loop.
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = events.send(ClientEvent::MessageSaid { name, text }) => {}
                }
            }
            Ok(None) => {
                // Unknown opcode, skipped.
            }
            Err(e) => {
                debug!("client receive loop ended: {}", e);
                break;
            }
        }
    }
    if !cancel.is_cancelled() {
        let _ = events.send(ClientEvent::ConnectionLost).await;
    }
}

/// Read one inbound frame. `Ok(None)` means an opcode we do not understand.
async fn read_dispatch_frame(
    reader: &mut OwnedReadHalf,
) -> std::io::Result<Option<(String, String)>> {
    use tokio::io::AsyncReadExt;
    let opcode = reader.read_u8().await?;
    if opcode != OP_SAY_DISPATCH {
        debug!("ignoring unexpected opcode {} from server", opcode);
        return Ok(None);
    }
    let (name, text) = read_say_dispatch(reader).await?;
    Ok(Some((name, text)))
}
