//! Error kinds surfaced at the public API boundary.

use thiserror::Error;

/// Errors reported by the node, client, and server surfaces.
///
/// Worker loops recover expected transport failures internally (a client
/// record is removed, a receive loop raises `ConnectionLost`); only the
/// kinds below reach callers.
#[derive(Debug, Error)]
pub enum ChatError {
    /// A message or name was empty after trimming, or its UTF-16LE encoding
    /// exceeds the protocol length limit. Raised synchronously before any
    /// bytes reach a socket.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// `connect` was called on a client that is not in the unconnected state.
    #[error("client is already connected")]
    AlreadyConnected,

    /// A send was attempted on a client with no live connection.
    #[error("client is not connected")]
    NotConnected,

    /// Any transport failure: bind, connect, read, or write. A beacon CRC
    /// mismatch is a silent drop, not a `Network` error.
    #[error("network failure: {0}")]
    Network(#[from] std::io::Error),
}
