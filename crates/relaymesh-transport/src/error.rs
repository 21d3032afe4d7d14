use std::net::SocketAddr;

use crate::ConnId;

/// Errors returned by the relaymesh transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("dial to {url} failed: {source}")]
    Dial {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("send on {conn} failed: connection is gone")]
    Send { conn: ConnId },

    #[error("send on {conn} failed: peer is not reading")]
    Stalled { conn: ConnId },

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("node is shut down")]
    Shutdown,

    #[error("invalid identifier: {0}")]
    InvalidId(String),
}
