use std::time::Duration;

use crate::types::{ConnId, InfoHash};

use super::NodeEvent;

/// Intention produced by the pure logic of [`NodeState`](super::state::NodeState).
///
/// Every handle_* / tick_* method returns `Vec<NodeEffect>`; the event loop
/// then carries them out through the transport and the DHT.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEffect {
    /// Text frame on one connection.
    Send { conn: ConnId, text: String },

    Close { conn: ConnId },

    /// Open a relay link.
    Dial { conn: ConnId, url: String },

    Lookup { info_hash: InfoHash },

    Announce { info_hash: InfoHash, port: u16 },

    /// Stop accepting connections; reopen after the delay, if any.
    PauseListener { reopen_after: Option<Duration> },

    ResumeListener,

    /// Lifecycle event for the application.
    Emit(NodeEvent),
}
