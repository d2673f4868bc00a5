//! Zero-configuration group chat for a single LAN broadcast domain.
//!
//! Any peer can join a chat session; if none is discoverable, the peer
//! transparently creates one and others join it. A UDP election keeps
//! exactly one authoritative server per LAN, a TCP server fans messages
//! out to every connected client, and clients reconnect through
//! rediscovery when their server dies.
//!
//! ## Architecture
//!
//! ```text
//!  ┌─────────────────────────────────────────────────────────────┐
//!  │                         ChatNode                            │
//!  │                                                             │
//!  │  ┌─────────────┐    candidates    ┌───────────────────────┐ │
//!  │  │  discovery  │─────────────────▶│     session loop      │ │
//!  │  │   (probe)   │                  │ join / host / retry   │ │
//!  │  └─────────────┘                  └─────┬──────────┬──────┘ │
//!  │                                         │ owns ≤ 1 │        │
//!  │                                   ┌─────▼─────┐ ┌──▼──────┐ │
//!  │                                   │ ChatClient│ │ChatServer│ │
//!  │                                   │ (TCP)     │ │(TCP+UDP) │ │
//!  │                                   └───────────┘ └─────────┘ │
//!  └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The usual entry point is [`ChatNode`]: call [`ChatNode::start`], feed
//! [`ChatNode::say`], and read [`ChatMessage`]s off the receiver. The
//! [`ChatClient`] and [`ChatServer`] layers underneath are public for
//! direct use and for tests.

pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod node;
pub mod protocol;
pub mod server;

pub use client::{ChatClient, ClientEvent};
pub use config::NetConfig;
pub use error::ChatError;
pub use node::{ChatMessage, ChatNode};
pub use server::ChatServer;
