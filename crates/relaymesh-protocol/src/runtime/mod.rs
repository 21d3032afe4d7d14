/// Node runtime: drives a tracker/relay node over a live transport.
///
/// The runtime owns the transport and all protocol state (relay
/// membership, signalling tracker). It exposes a channel-based API so the
/// application never touches sockets or protocol internals. The mesh agent
/// has its own runtime in [`agent`].
pub mod agent;
pub mod connector;
mod effect;
mod executor;
mod r#loop;
mod state;
mod transport;

use std::net::SocketAddr;

use relaymesh_dht::PeerFound;
use relaymesh_metrics::{Counter, Gauge};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::config::NodeConfig;
use crate::error::RelayMeshError;
use crate::types::NodeId;

pub use effect::NodeEffect;
pub use state::NodeState;
pub use transport::{Dht, Transport};

// ── Commands (app → runtime) ──────────────────────────────────────────

/// Commands the application sends to the node event loop.
pub enum NodeCommand {
    /// Snapshot of the node counters.
    Stats { reply: oneshot::Sender<NodeStats> },
    /// Resume serving after a `Stop` (or when spawned with `init = false`).
    Start,
    /// Close every connection and stop listening; the task keeps running.
    Stop,
    /// Stop and end the task.
    Shutdown,
}

// ── Events (runtime → app) ───────────────────────────────────────────

/// Lifecycle events of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// The listener is accepting connections.
    Listening { addr: SocketAddr },
    /// The node started serving.
    Start,
    /// The node stopped serving.
    Stop,
    /// A non-fatal error.
    Error { description: String },
    /// Informational: matches, links, rejections.
    Ev { description: String },
    /// The listener closed.
    Close,
}

/// Node counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeStats {
    pub clients: Gauge,
    pub relay_links: Gauge,
    pub clients_accepted: Counter,
    pub clients_rejected: Counter,
    pub matches: Counter,
    pub interrupts: Counter,
    pub handshakes: Counter,
    pub links_opened: Counter,
    pub links_closed: Counter,
    pub dial_failures: Counter,
}

// ── NodeHandle (app-facing API) ──────────────────────────────────────

/// Handle to communicate with a running node.
///
/// Cheap to clone. All methods are channel sends.
#[derive(Clone)]
pub struct NodeHandle {
    cmd_tx: mpsc::Sender<NodeCommand>,
    local_id: NodeId,
}

impl NodeHandle {
    /// This node's identity.
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub async fn stats(&self) -> Result<NodeStats, RelayMeshError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(NodeCommand::Stats { reply: tx })
            .await
            .map_err(|_| RelayMeshError::Shutdown)?;
        rx.await.map_err(|_| RelayMeshError::Shutdown)
    }

    pub async fn start(&self) -> Result<(), RelayMeshError> {
        self.cmd_tx
            .send(NodeCommand::Start)
            .await
            .map_err(|_| RelayMeshError::Shutdown)
    }

    pub async fn stop(&self) -> Result<(), RelayMeshError> {
        self.cmd_tx
            .send(NodeCommand::Stop)
            .await
            .map_err(|_| RelayMeshError::Shutdown)
    }

    /// Graceful shutdown.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(NodeCommand::Shutdown).await;
    }
}

// ── NodeChannels ─────────────────────────────────────────────────────

/// Channels returned to the application when the node starts.
pub struct NodeChannels {
    pub handle: NodeHandle,
    pub events: mpsc::Receiver<NodeEvent>,
}

// ── NodeRuntime ──────────────────────────────────────────────────────

/// The node runtime. Spawn it and talk to it over channels.
pub struct NodeRuntime;

impl NodeRuntime {
    /// Spawn the event loop as a tokio task.
    ///
    /// `peers` is the peer-found stream of `dht`.
    pub fn spawn<T, D>(
        transport: T,
        dht: D,
        peers: mpsc::Receiver<PeerFound>,
        config: NodeConfig,
    ) -> NodeChannels
    where
        T: Transport + 'static,
        D: Dht,
    {
        let local_id = config.node_id();
        let (cmd_tx, cmd_rx) = mpsc::channel::<NodeCommand>(64);
        let (event_tx, event_rx) = mpsc::channel::<NodeEvent>(256);

        tokio::spawn(r#loop::node_loop(
            transport, dht, peers, config, cmd_rx, event_tx,
        ));

        NodeChannels {
            handle: NodeHandle { cmd_tx, local_id },
            events: event_rx,
        }
    }
}
