//! relaymesh protocol layer.
//!
//! Trackers link up per topic over the DHT and match the clients that
//! connect to them; matched clients exchange connection descriptors through
//! the tracker, then grow their mesh on their own by relaying search frames
//! over the channels they already have.
//!
//! Wire format: JSON objects tagged by `action`.
//! Search state: pluggable store (in-memory or SQLite).

pub mod agent;
pub mod backoff;
pub mod config;
pub mod error;
pub mod membership;
pub mod message;
pub mod runtime;
pub mod search;
pub mod store;
pub mod tracker;
pub mod types;

pub use agent::{
    AgentAction, AgentEvent, BootstrapMeta, BootstrapTimer, ChannelOrigin, DataChannel,
    MeshAgent, PendingDiscovery, Tracks,
};
pub use backoff::DialBackoff;
pub use config::{AgentConfig, LimitConfig, NodeConfig, TimerConfig, DEFAULT_PORT};
pub use error::{RejectReason, RelayMeshError};
pub use membership::{LocalRelay, MembershipAction, MembershipEvent, RelayLink, RelayMembership};
pub use message::{
    ChannelFrame, Descriptor, MeshMessage, RelayMessage, SearchFrame, SessionHello,
    SignalMessage, MESH_PREFIX,
};
pub use runtime::agent::{AgentChannels, AgentCommand, AgentHandle, AgentRuntime};
pub use runtime::connector::{ChannelEvent, PeerConnector};
pub use runtime::{
    Dht, NodeChannels, NodeCommand, NodeEffect, NodeEvent, NodeHandle, NodeRuntime, NodeState,
    NodeStats, Transport,
};
pub use search::pick_untried;
pub use store::{MemoryStore, SearchState, SearchStore, SqliteStore, StoreError};
pub use tracker::{ClientSession, SignalTracker, TrackerAction, TrackerEvent};
pub use types::{now_ms, ConnId, InfoHash, NodeId, PeerId, RequestId, MAX_CHANNELS, MAX_SEARCH_HOPS};
