//! relaymesh transport layer.
//!
//! Wraps WebSocket connectivity (an axum listener for inbound upgrades,
//! tokio-tungstenite for outbound dials) behind a stable, connection-oriented
//! API. The protocol layer only ever sees [`ConnId`] handles, text frames and
//! [`TransportEvent`]s.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use relaymesh_transport::{ConnId, TransportConfig, TransportEvent, WsNode};
//!
//! # async fn example() -> Result<(), relaymesh_transport::TransportError> {
//! let mut node = WsNode::bind("0.0.0.0:10509".parse().unwrap(), TransportConfig::new()).await?;
//!
//! // Dial another tracker
//! let conn = ConnId::fresh();
//! node.dial(conn, "ws://203.0.113.7:10509/relay?hash=00&id=00".into());
//!
//! while let Some(event) = node.recv().await {
//!     if let TransportEvent::Message { conn, text } = event {
//!         node.send(conn, text).await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod connection;
mod error;
mod node;
mod route;

pub use config::TransportConfig;
pub use error::TransportError;
pub use node::{TransportEvent, WsNode};
pub use route::Route;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use sha1::{Digest, Sha1};

// ── 160-bit identities ───────────────────────────────────────────────

macro_rules! sha1_identity {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; 20]);

        impl $name {
            /// Wrap raw digest bytes.
            pub fn from_bytes(bytes: [u8; 20]) -> Self {
                Self(bytes)
            }

            /// The raw 20 bytes.
            pub fn as_bytes(&self) -> &[u8; 20] {
                &self.0
            }

            fn digest(input: &[u8]) -> Self {
                let mut hasher = Sha1::new();
                hasher.update(input);
                Self(hasher.finalize().into())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let hex = hex::encode(self.0);
                write!(f, "{}({}...)", stringify!($name), &hex[..12])
            }
        }

        impl FromStr for $name {
            type Err = TransportError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mut bytes = [0u8; 20];
                hex::decode_to_slice(s, &mut bytes)
                    .map_err(|_| TransportError::InvalidId(s.to_string()))?;
                Ok(Self(bytes))
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

sha1_identity!(
    /// Relay identity: SHA-1 of the node's `host:port` address.
    ///
    /// Two nodes advertising the same address are the same relay.
    /// Displayed and parsed as 40 lowercase hex characters.
    NodeId
);

impl NodeId {
    /// Derive the identity of the relay reachable at `address` (`host:port`).
    pub fn from_address(address: &str) -> Self {
        Self::digest(address.as_bytes())
    }
}

sha1_identity!(
    /// DHT key for a topic: SHA-1 of the topic string.
    InfoHash
);

impl InfoHash {
    /// Derive the DHT key a topic is announced under.
    pub fn from_topic(topic: &str) -> Self {
        Self::digest(topic.as_bytes())
    }
}

// ── Connection handles ───────────────────────────────────────────────

static NEXT_CONN: AtomicU64 = AtomicU64::new(1);

/// Process-unique handle for one WebSocket connection, inbound or outbound.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    /// Allocate a handle no other connection in this process uses.
    pub fn fresh() -> Self {
        Self(NEXT_CONN.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

impl fmt::Debug for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
