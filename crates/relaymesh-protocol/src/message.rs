//! Wire messages: JSON objects discriminated by an `action` field.
//!
//! Relay links between trackers, signalling between a client and its
//! tracker, and mesh control frames between agents all share the envelope.
//! Mesh control frames carry the [`MESH_PREFIX`] so they never collide with
//! application payloads on the same channel.
use serde::{Deserialize, Serialize};

use crate::error::RelayMeshError;
use crate::types::{InfoHash, NodeId, PeerId, RequestId};

/// Prefix marking a data-channel frame as mesh control traffic.
pub const MESH_PREFIX: &str = "mesh:";

/// Opaque connection descriptor (offer or answer) produced by the
/// data-channel layer. Relayed verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Descriptor(pub serde_json::Value);

// ── Relay links (tracker ↔ tracker) ───────────────────────────────────

/// Identity a tracker declares when a relay link opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHello {
    pub id: NodeId,
    pub address: String,
    pub web: String,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Topic the link was opened for.
    pub relay: InfoHash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum RelayMessage {
    Session(SessionHello),
    /// The sender also serves `relay` and counts this link under it.
    Add {
        relay: InfoHash,
        #[serde(default)]
        reply: bool,
    },
    /// The sender no longer counts this link under `relay`.
    Sub { relay: InfoHash },
    Ping,
    Pong,
    /// The sender's listener is back; it can take redirected clients.
    On,
    /// The sender's listener is down.
    Off,
    Error { error: String },
}

// ── Signalling (client ↔ tracker) ─────────────────────────────────────

/// `req` is always the initiating client, `res` the answering one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum SignalMessage {
    /// Client asks for one more match.
    Session,
    /// Tracker tells `req` to originate a handshake toward `res`.
    Init { req: PeerId, res: PeerId },
    Request {
        req: PeerId,
        res: PeerId,
        request: Descriptor,
    },
    Response {
        req: PeerId,
        res: PeerId,
        response: Descriptor,
    },
    /// Handshake complete.
    Proc { req: PeerId, res: PeerId },
    /// The handshake with `id` was abandoned.
    Interrupt { id: PeerId },
    /// Sent to `res` once `req` acknowledged completion.
    Shake,
    /// Reconnect to another tracker.
    Relay {
        #[serde(default)]
        relay: Option<String>,
    },
    Error { error: String },
    Ping,
    Pong,
}

// ── Mesh (agent ↔ agent) ──────────────────────────────────────────────

/// Payload shared by every search/session frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchFrame {
    pub id: RequestId,
    /// Agent that started the search.
    pub start: PeerId,
    /// Agent that accepted it, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Descriptor>,
    /// Relay hops taken so far.
    #[serde(default)]
    pub hops: u32,
}

impl SearchFrame {
    pub fn new(id: RequestId, start: PeerId) -> Self {
        Self {
            id,
            start,
            stop: None,
            data: None,
            hops: 0,
        }
    }

    /// Same transaction, no descriptor attached.
    pub fn bare(&self) -> Self {
        Self {
            data: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum MeshMessage {
    /// Gossip: the sender now has a channel to `add`.
    Add { add: PeerId },
    /// Gossip: the sender lost its channel to `sub`.
    Sub { sub: PeerId },
    BeforeSearch(SearchFrame),
    AfterSearch(SearchFrame),
    BeforeSession(SearchFrame),
    AfterSession(SearchFrame),
    Nonmsg(SearchFrame),
    Abort(SearchFrame),
}

/// A frame received on a data channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelFrame {
    Mesh(MeshMessage),
    Data(String),
}

impl ChannelFrame {
    /// Split control traffic from application payloads.
    pub fn parse(text: &str) -> Result<Self, RelayMeshError> {
        match text.strip_prefix(MESH_PREFIX) {
            Some(json) => Ok(ChannelFrame::Mesh(serde_json::from_str(json)?)),
            None => Ok(ChannelFrame::Data(text.to_string())),
        }
    }

    /// Text to put on the channel.
    pub fn encode(&self) -> Result<String, RelayMeshError> {
        match self {
            ChannelFrame::Mesh(msg) => Ok(format!("{MESH_PREFIX}{}", serde_json::to_string(msg)?)),
            ChannelFrame::Data(text) => Ok(text.clone()),
        }
    }
}
