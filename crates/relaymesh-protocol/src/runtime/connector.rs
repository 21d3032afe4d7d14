use crate::message::Descriptor;
use crate::types::PeerId;

/// Data-channel layer seen by the agent runtime.
///
/// The peer-connection stack that actually moves bytes lives outside this
/// crate; it builds one attempt per peer, reports progress as
/// [`ChannelEvent`]s and never interprets descriptors beyond its own.
#[async_trait::async_trait]
pub trait PeerConnector: Send + Sync + 'static {
    /// Start an attempt toward `peer` and return our local descriptor.
    /// `remote` is the peer's offer when we answer.
    async fn create(
        &self,
        peer: &PeerId,
        initiator: bool,
        remote: Option<Descriptor>,
    ) -> Result<Descriptor, String>;

    /// Complete an initiated attempt with the peer's answer.
    async fn accept(&self, peer: &PeerId, remote: Descriptor) -> Result<(), String>;

    async fn send(&self, peer: &PeerId, text: String) -> Result<(), String>;

    /// Tear the attempt or channel down. Unknown peers are ignored.
    async fn destroy(&self, peer: &PeerId);
}

/// Progress of a channel, reported by the connector's owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Connected { peer: PeerId },
    Data { peer: PeerId, text: String },
    Closed { peer: PeerId },
    Error { peer: PeerId, description: String },
}
