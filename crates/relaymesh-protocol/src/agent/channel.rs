use std::collections::BTreeSet;

use crate::message::SearchFrame;
use crate::types::{PeerId, RequestId};

/// How a data channel came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrigin {
    /// Matched by the signalling tracker.
    Tracker,
    /// Found through a mesh search.
    Mesh,
}

/// Who asked for a mesh-bootstrapped channel and through which relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapMeta {
    pub id: RequestId,
    /// Channel the session frames travel on.
    pub relay: PeerId,
    pub start: PeerId,
    pub stop: PeerId,
}

impl BootstrapMeta {
    /// The frame that aborts or acknowledges this bootstrap.
    pub fn frame(&self) -> SearchFrame {
        SearchFrame {
            id: self.id.clone(),
            start: self.start.clone(),
            stop: Some(self.stop.clone()),
            data: None,
            hops: 0,
        }
    }
}

/// Expiry of a half-open channel. Times are Unix ms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapTimer {
    deadline: Option<u64>,
}

impl BootstrapTimer {
    pub fn arm(&mut self, now: u64, timeout_ms: u64) {
        self.deadline = Some(now.saturating_add(timeout_ms));
    }

    /// Disarm. Returns whether the timer was armed; safe to call repeatedly.
    pub fn cancel(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }
}

/// A direct channel to one peer, connected or not yet.
#[derive(Debug, Clone)]
pub struct DataChannel {
    pub peer: PeerId,
    pub connected: bool,
    pub origin: ChannelOrigin,
    /// Peers this channel's remote end told us it reaches.
    pub neighbors: BTreeSet<PeerId>,
    /// Searches we relay that arrived or left through this channel.
    pub relaying: BTreeSet<RequestId>,
    pub bootstrap: Option<BootstrapMeta>,
    pub timer: BootstrapTimer,
}

impl DataChannel {
    pub fn new(peer: PeerId, origin: ChannelOrigin) -> Self {
        Self {
            peer,
            connected: false,
            origin,
            neighbors: BTreeSet::new(),
            relaying: BTreeSet::new(),
            bootstrap: None,
            timer: BootstrapTimer::default(),
        }
    }
}

/// A locally started search for any new peer ("temp").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDiscovery {
    pub id: RequestId,
    pub start: PeerId,
    pub tried: Vec<PeerId>,
    /// Hop the search is currently out on.
    pub relay: Option<PeerId>,
}

impl PendingDiscovery {
    pub fn new(start: PeerId) -> Self {
        Self {
            id: RequestId::generate(),
            start,
            tried: Vec::new(),
            relay: None,
        }
    }

    pub fn frame(&self) -> SearchFrame {
        SearchFrame::new(self.id.clone(), self.start.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_expires_at_deadline() {
        let mut timer = BootstrapTimer::default();
        assert!(!timer.is_expired(u64::MAX));
        timer.arm(1_000, 60_000);
        assert!(!timer.is_expired(60_999));
        assert!(timer.is_expired(61_000));
    }

    #[test]
    fn cancel_twice_is_harmless() {
        let mut timer = BootstrapTimer::default();
        timer.arm(0, 10);
        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert!(!timer.is_armed());
        assert!(!timer.is_expired(100));
    }

    #[test]
    fn meta_frame_names_both_ends() {
        let meta = BootstrapMeta {
            id: RequestId::new("r"),
            relay: PeerId::new("hop"),
            start: PeerId::new("a"),
            stop: PeerId::new("b"),
        };
        let frame = meta.frame();
        assert_eq!(frame.start, PeerId::new("a"));
        assert_eq!(frame.stop, Some(PeerId::new("b")));
        assert!(frame.data.is_none());
    }
}
