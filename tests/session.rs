//! Loopback integration tests for the client, server, and node layers.
//!
//! Every test picks its own port so several isolated sessions can coexist
//! on one host. Nothing here depends on broadcast delivery working: the
//! node tests exercise the empty-LAN self-host path, and the election test
//! injects forged beacons over loopback unicast.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use lanchat::protocol::{encode_beacon, Beacon};
use lanchat::{ChatClient, ChatError, ChatMessage, ChatNode, ChatServer, ClientEvent, NetConfig};

fn test_config(port: u16) -> NetConfig {
    NetConfig {
        port,
        ..NetConfig::default()
    }
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

fn new_client() -> (ChatClient, mpsc::Receiver<ClientEvent>) {
    let (tx, rx) = mpsc::channel(64);
    (ChatClient::new(tx, None), rx)
}

// ── Client event helpers ─────────────────────────────────────────────────

async fn next_client_event(rx: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
    timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for a client event")
        .expect("client event channel closed")
}

/// Next `MessageSaid` from `name`, skipping everything else.
async fn message_from(rx: &mut mpsc::Receiver<ClientEvent>, from: &str) -> String {
    loop {
        if let ClientEvent::MessageSaid { name, text } = next_client_event(rx).await {
            if name == from {
                return text;
            }
        }
    }
}

/// Next `MessageSaid` whose text contains `needle`.
async fn message_containing(rx: &mut mpsc::Receiver<ClientEvent>, needle: &str) -> (String, String) {
    loop {
        if let ClientEvent::MessageSaid { name, text } = next_client_event(rx).await {
            if text.contains(needle) {
                return (name, text);
            }
        }
    }
}

// ── Node message helpers ─────────────────────────────────────────────────

async fn next_message(rx: &mut mpsc::Receiver<ChatMessage>) -> ChatMessage {
    timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for a node message")
        .expect("node message channel closed")
}

/// The next CLIENT status notice must be `expected`; other traffic in
/// between is skipped. Asserts the status order as a side effect.
async fn expect_status(rx: &mut mpsc::Receiver<ChatMessage>, expected: &str) {
    loop {
        let msg = next_message(rx).await;
        if msg.name == "CLIENT" {
            assert_eq!(msg.text, expected);
            return;
        }
    }
}

/// Next message from an actual chat participant (neither CLIENT nor SERVER).
async fn next_user_message(rx: &mut mpsc::Receiver<ChatMessage>) -> ChatMessage {
    loop {
        let msg = next_message(rx).await;
        if msg.name != "CLIENT" && msg.name != "SERVER" {
            return msg;
        }
    }
}

async fn message_with_text(rx: &mut mpsc::Receiver<ChatMessage>, needle: &str) -> ChatMessage {
    loop {
        let msg = next_message(rx).await;
        if msg.text.contains(needle) {
            return msg;
        }
    }
}

// ── Server + client ──────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn server_fans_out_to_every_client() -> Result<()> {
    let server = ChatServer::start(test_config(44111)).await?;
    let (c1, mut rx1) = new_client();
    c1.connect(loopback(44111)).await?;

    // The first server notice a client sees is its own arrival.
    let notice = message_from(&mut rx1, "SERVER").await;
    assert_eq!(notice, "127.0.0.1 connected.");

    let (c2, mut rx2) = new_client();
    c2.connect(loopback(44111)).await?;
    // Wait for c2's own arrival notice: it proves the server has registered
    // c2, so the next dispatch reaches it.
    assert_eq!(message_from(&mut rx2, "SERVER").await, "127.0.0.1 connected.");

    c1.say("hello everyone").await?;
    assert_eq!(message_from(&mut rx1, "127.0.0.1").await, "hello everyone");
    assert_eq!(message_from(&mut rx2, "127.0.0.1").await, "hello everyone");

    // Whitespace is trimmed before dispatch.
    c2.say("  padded  ").await?;
    assert_eq!(message_from(&mut rx1, "127.0.0.1").await, "padded");

    c1.close().await;
    c2.close().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn rename_is_announced_once_and_attributed() -> Result<()> {
    let server = ChatServer::start(test_config(44121)).await?;
    let (c1, _rx1) = new_client();
    c1.connect(loopback(44121)).await?;
    let (c2, mut rx2) = new_client();
    c2.connect(loopback(44121)).await?;
    assert_eq!(message_from(&mut rx2, "SERVER").await, "127.0.0.1 connected.");

    c1.set_name("alice").await?;
    let (name, text) = message_containing(&mut rx2, "changed their name").await;
    assert_eq!(name, "SERVER");
    assert_eq!(text, "127.0.0.1 changed their name to alice");

    // Re-registering the same name is ignored; subsequent messages carry
    // the new name.
    c1.set_name("alice").await?;
    c1.say("it is me").await?;
    let (name, text) = message_containing(&mut rx2, "it is me").await;
    assert_eq!(name, "alice");
    assert_eq!(text, "it is me");

    c1.close().await;
    c2.close().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn departures_are_announced() -> Result<()> {
    let server = ChatServer::start(test_config(44161)).await?;
    let (c1, mut rx1) = new_client();
    c1.connect(loopback(44161)).await?;
    assert_eq!(message_from(&mut rx1, "SERVER").await, "127.0.0.1 connected.");
    let (c2, _rx2) = new_client();
    c2.connect(loopback(44161)).await?;
    // c2's arrival seen by c1: both clients are registered.
    assert_eq!(message_from(&mut rx1, "SERVER").await, "127.0.0.1 connected.");

    c2.close().await;
    let (name, text) = message_containing(&mut rx1, "disconnected").await;
    assert_eq!(name, "SERVER");
    assert_eq!(text, "127.0.0.1 disconnected.");

    c1.close().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn client_lifecycle_is_enforced_and_close_is_idempotent() -> Result<()> {
    let server = ChatServer::start(test_config(44171)).await?;

    let (client, _rx) = new_client();
    assert!(matches!(
        client.say("nobody is listening").await,
        Err(ChatError::NotConnected)
    ));

    client.connect(loopback(44171)).await?;
    assert!(matches!(
        client.connect(loopback(44171)).await,
        Err(ChatError::AlreadyConnected)
    ));

    client.close().await;
    client.close().await;

    // Closed is terminal: a fresh instance is needed to reconnect.
    assert!(matches!(
        client.connect(loopback(44171)).await,
        Err(ChatError::AlreadyConnected)
    ));
    assert!(matches!(
        client.say("still closed").await,
        Err(ChatError::NotConnected)
    ));

    server.shutdown().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn connecting_to_a_dead_port_is_a_network_error() {
    let (client, _rx) = new_client();
    // Nothing listens on this port.
    let result = client.connect(loopback(44199)).await;
    assert!(matches!(result, Err(ChatError::Network(_))));
}

// ── Election ─────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn server_yields_to_an_older_beacon_but_not_to_a_corrupt_one() -> Result<()> {
    let server = ChatServer::start(test_config(44131)).await?;
    let (client, mut rx) = new_client();
    client.connect(loopback(44131)).await?;
    assert_eq!(message_from(&mut rx, "SERVER").await, "127.0.0.1 connected.");

    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    let forged = encode_beacon(&Beacon {
        age_secs: 3600,
        uid: 1,
    });

    // Same payload with a flipped CRC byte must be silently dropped.
    let mut corrupt = forged;
    corrupt[13] ^= 0xFF;
    socket.send_to(&corrupt, loopback(44131)).await?;
    sleep(Duration::from_millis(400)).await;
    assert!(!server.is_stopped());

    // The genuine article is an hour older than us: we yield.
    socket.send_to(&forged, loopback(44131)).await?;
    let mut yielded = false;
    for _ in 0..100 {
        if server.is_stopped() {
            yielded = true;
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    assert!(yielded, "server did not yield to an older rival");

    // Yielding closes client sockets, so the client loses its connection.
    loop {
        if let ClientEvent::ConnectionLost = next_client_event(&mut rx).await {
            break;
        }
    }

    client.close().await;
    server.shutdown().await;
    Ok(())
}

// ── Node ─────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn node_hosts_a_session_on_an_empty_lan() -> Result<()> {
    let (node, mut messages) = ChatNode::new(test_config(44141));
    node.start();

    expect_status(&mut messages, "Searching for session…").await;
    expect_status(&mut messages, "Starting new session.").await;
    expect_status(&mut messages, "Connected.").await;

    node.say("hello").await?;
    let msg = next_user_message(&mut messages).await;
    assert_eq!(msg.text, "hello");
    assert_eq!(msg.name, "127.0.0.1");

    // A live rename is announced and then attributed.
    node.set_name("alice").await?;
    let notice = message_with_text(&mut messages, "changed their name").await;
    assert_eq!(notice.name, "SERVER");
    assert_eq!(notice.text, "127.0.0.1 changed their name to alice");

    node.say("hi again").await?;
    let msg = next_user_message(&mut messages).await;
    assert_eq!(msg.name, "alice");
    assert_eq!(msg.text, "hi again");

    node.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_backlog_is_delivered_in_order() -> Result<()> {
    let (node, mut messages) = ChatNode::new(test_config(44151));
    node.set_name("carol").await?;
    node.start();

    // Discovery takes about two seconds on an empty LAN; these land in the
    // backlog well before any connection exists.
    node.say("first queued").await?;
    node.say("second queued").await?;

    expect_status(&mut messages, "Searching for session…").await;
    expect_status(&mut messages, "Starting new session.").await;
    expect_status(&mut messages, "Connected.").await;

    // The name set before connecting is registered during connect, so the
    // backlog drains under it, in FIFO order.
    let msg = next_user_message(&mut messages).await;
    assert_eq!((msg.name.as_str(), msg.text.as_str()), ("carol", "first queued"));
    let msg = next_user_message(&mut messages).await;
    assert_eq!((msg.name.as_str(), msg.text.as_str()), ("carol", "second queued"));

    node.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_input_is_rejected_before_any_socket_exists() {
    // Never started: there is no connection and no socket to hit.
    let (node, _messages) = ChatNode::new(test_config(44181));

    let oversized = "x".repeat(40_000);
    assert!(matches!(
        node.say(&oversized).await,
        Err(ChatError::InvalidArgument(_))
    ));
    assert!(matches!(
        node.say("   \t  ").await,
        Err(ChatError::InvalidArgument(_))
    ));
    assert!(matches!(
        node.set_name("").await,
        Err(ChatError::InvalidArgument(_))
    ));
    let long_name = "n".repeat(200);
    assert!(matches!(
        node.set_name(&long_name).await,
        Err(ChatError::InvalidArgument(_))
    ));
    assert_eq!(node.name(), None);

    // Valid input while offline is accepted into the backlog.
    assert!(node.say("kept for later").await.is_ok());
    assert!(node.set_name("dave").await.is_ok());
    assert_eq!(node.name(), Some("dave".to_owned()));
}
