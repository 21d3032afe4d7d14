use std::time::Duration;

use serde::Serialize;

use crate::message::{ChannelFrame, Descriptor, MeshMessage, SignalMessage};
use crate::types::PeerId;

/// Intention produced by [`MeshAgent`](super::MeshAgent); the agent runtime
/// performs it.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentAction {
    /// Frame for the signalling tracker.
    SignalSend(SignalMessage),
    ConnectTracker { url: String },
    CloseTracker,
    /// Reconnect to the tracker after `delay`.
    ScheduleReconnect { delay: Duration },
    /// Start a channel attempt and report its local descriptor back.
    CreateChannel {
        peer: PeerId,
        initiator: bool,
        remote: Option<Descriptor>,
    },
    /// Hand the remote descriptor to an existing attempt.
    ApplyRemote { peer: PeerId, descriptor: Descriptor },
    ChannelSend { peer: PeerId, frame: ChannelFrame },
    DestroyChannel { peer: PeerId },
    Emit(AgentEvent),
}

impl AgentAction {
    pub(crate) fn mesh(peer: &PeerId, msg: MeshMessage) -> Self {
        AgentAction::ChannelSend {
            peer: peer.clone(),
            frame: ChannelFrame::Mesh(msg),
        }
    }
}

/// What the agent reports to the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    Started,
    Stopped,
    TrackerOpen,
    TrackerClosed,
    /// The tracker sent us elsewhere.
    Redirected { tracker: String },
    Connected { peer: PeerId },
    Disconnected { peer: PeerId },
    Message { from: PeerId, text: String },
    /// A half-open channel was not connected in time.
    BootstrapExpired { peer: PeerId },
    Error { description: String },
}

/// Channel counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tracks {
    /// Channels plus in-flight discoveries.
    pub total: usize,
    pub temp: usize,
    pub conn: usize,
}
