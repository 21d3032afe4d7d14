/// MeshAgent: the client side of the mesh. Handles tracker signalling, data-channel
/// bookkeeping, neighbour gossip and refill.
///
/// Pure state machine: every handler returns the [`AgentAction`]s to perform.
/// The only suspension points are the search store and the data-channel
/// layer; the latter is modelled as a pending step per peer that resumes in
/// [`MeshAgent::on_local_descriptor`]. The search/session handlers live in
/// [`crate::search`].
pub mod action;
pub mod channel;

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::message::{ChannelFrame, Descriptor, MeshMessage, SearchFrame, SignalMessage, MESH_PREFIX};
use crate::store::SearchStore;
use crate::types::{PeerId, RequestId};

pub use action::{AgentAction, AgentEvent, Tracks};
pub use channel::{BootstrapMeta, BootstrapTimer, ChannelOrigin, DataChannel, PendingDiscovery};

/// Below this many channels a lost channel is replaced through the tracker.
const LOW_WATER: usize = 3;

/// What to do once the local descriptor for a channel attempt is ready.
#[derive(Debug, Clone)]
pub(crate) enum SignalStep {
    /// Tracker told us to originate toward this peer.
    Init,
    /// Tracker relayed this peer's offer to us.
    Request,
    /// We accepted a search as its target; reply travels back via `relay`.
    Target { frame: SearchFrame, relay: PeerId },
    /// Our own discovery was answered; continue the session via `relay`.
    Origin { frame: SearchFrame, relay: PeerId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackerState {
    Closed,
    Connecting,
    Open,
}

struct TrackerLink {
    state: TrackerState,
    /// `host:port` currently used; replaced on redirect.
    address: String,
    redirected: bool,
    /// Match requests waiting for the socket to open.
    wanted: usize,
}

pub struct MeshAgent<S> {
    pub(crate) id: PeerId,
    pub(crate) config: AgentConfig,
    pub(crate) store: S,
    pub(crate) channels: BTreeMap<PeerId, DataChannel>,
    pub(crate) temps: BTreeMap<RequestId, PendingDiscovery>,
    pub(crate) signals: BTreeMap<PeerId, SignalStep>,
    pub(crate) rng: StdRng,
    running: bool,
    tracker: TrackerLink,
}

impl<S: SearchStore> MeshAgent<S> {
    pub fn new(config: AgentConfig, store: S) -> Self {
        let id = config.id.clone().unwrap_or_else(PeerId::generate);
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let tracker = TrackerLink {
            state: TrackerState::Closed,
            address: config.tracker.clone(),
            redirected: false,
            wanted: 0,
        };
        Self {
            id,
            config,
            store,
            channels: BTreeMap::new(),
            temps: BTreeMap::new(),
            signals: BTreeMap::new(),
            rng,
            running: false,
            tracker,
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn channel(&self, peer: &PeerId) -> Option<&DataChannel> {
        self.channels.get(peer)
    }

    pub fn channels(&self) -> impl Iterator<Item = &DataChannel> {
        self.channels.values()
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.channels
            .values()
            .filter(|c| c.connected)
            .map(|c| c.peer.clone())
            .collect()
    }

    pub fn discoveries(&self) -> impl Iterator<Item = &PendingDiscovery> {
        self.temps.values()
    }

    /// Tracker address in use (changes after a redirect).
    pub fn tracker_address(&self) -> &str {
        &self.tracker.address
    }

    pub fn tracks(&self) -> Tracks {
        Tracks {
            total: self.total(),
            temp: self.temps.len(),
            conn: self.channels.len(),
        }
    }

    /// Channels, in-flight channel attempts and discoveries.
    pub(crate) fn total(&self) -> usize {
        self.channels.len() + self.signals.len() + self.temps.len()
    }

    pub(crate) fn room(&self) -> usize {
        self.config.max_channels.saturating_sub(self.total())
    }

    /// We already have, or are building, a channel to `peer`.
    pub(crate) fn knows(&self, peer: &PeerId) -> bool {
        self.channels.contains_key(peer) || self.signals.contains_key(peer)
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    pub fn begin(&mut self) -> Vec<AgentAction> {
        if self.running {
            return Vec::new();
        }
        info!(id = %self.id, topic = %self.config.topic, "mesh agent starting");
        self.running = true;
        let mut actions = vec![AgentAction::Emit(AgentEvent::Started)];
        actions.extend(self.request_matches(true));
        actions
    }

    /// Abort discoveries, destroy every channel, close the tracker socket.
    pub async fn end(&mut self) -> Vec<AgentAction> {
        self.running = false;
        let mut actions = Vec::new();

        for (_, discovery) in std::mem::take(&mut self.temps) {
            if let Some(relay) = discovery.relay.as_ref() {
                if self.channels.get(relay).is_some_and(|c| c.connected) {
                    actions.push(AgentAction::mesh(relay, MeshMessage::Abort(discovery.frame())));
                }
            }
        }

        let relayed: Vec<RequestId> = self
            .channels
            .values()
            .flat_map(|c| c.relaying.iter().cloned())
            .collect();
        for id in relayed {
            if let Err(e) = self.store.del(&id).await {
                warn!(%id, "search state not deleted: {e}");
            }
        }

        for peer in std::mem::take(&mut self.signals).into_keys() {
            actions.push(AgentAction::DestroyChannel { peer });
        }
        for peer in std::mem::take(&mut self.channels).into_keys() {
            actions.push(AgentAction::DestroyChannel { peer });
        }

        if self.tracker.state != TrackerState::Closed {
            self.tracker.state = TrackerState::Closed;
            actions.push(AgentAction::CloseTracker);
        }
        self.tracker.wanted = 0;
        self.tracker.redirected = false;

        info!(id = %self.id, "mesh agent stopped");
        actions.push(AgentAction::Emit(AgentEvent::Stopped));
        actions
    }

    // ── Tracker ──────────────────────────────────────────────────────

    /// Ask the tracker for matches: enough to fill every free slot, or one.
    pub fn request_matches(&mut self, fill: bool) -> Vec<AgentAction> {
        if !self.running {
            return Vec::new();
        }
        let room = self.room();
        if room == 0 {
            return Vec::new();
        }
        let want = if fill { room } else { 1 };

        match self.tracker.state {
            TrackerState::Open => (0..want)
                .map(|_| AgentAction::SignalSend(SignalMessage::Session))
                .collect(),
            TrackerState::Connecting => {
                self.tracker.wanted = self.tracker.wanted.max(want);
                Vec::new()
            }
            TrackerState::Closed => match self.config.signal_url(&self.tracker.address, &self.id) {
                Ok(url) => {
                    self.tracker.state = TrackerState::Connecting;
                    self.tracker.wanted = want;
                    debug!(%url, "connecting to tracker");
                    vec![AgentAction::ConnectTracker { url }]
                }
                Err(e) => vec![AgentAction::Emit(AgentEvent::Error {
                    description: e.to_string(),
                })],
            },
        }
    }

    pub fn on_tracker_open(&mut self) -> Vec<AgentAction> {
        self.tracker.state = TrackerState::Open;
        let want = std::mem::take(&mut self.tracker.wanted).min(self.room());
        let mut actions = vec![AgentAction::Emit(AgentEvent::TrackerOpen)];
        actions.extend((0..want).map(|_| AgentAction::SignalSend(SignalMessage::Session)));
        actions
    }

    pub fn on_tracker_closed(&mut self) -> Vec<AgentAction> {
        let was = self.tracker.state;
        self.tracker.state = TrackerState::Closed;
        let mut actions = vec![AgentAction::Emit(AgentEvent::TrackerClosed)];
        // Redirects and failed connects retry; a tracker that simply let us
        // go is dialled again on the next refill.
        if self.running && (self.tracker.redirected || was == TrackerState::Connecting) {
            self.tracker.redirected = false;
            actions.push(AgentAction::ScheduleReconnect {
                delay: self.config.reconnect_delay,
            });
        } else {
            self.tracker.wanted = 0;
        }
        actions
    }

    /// Reconnect timer fired.
    pub fn reconnect(&mut self) -> Vec<AgentAction> {
        if self.tracker.state != TrackerState::Closed {
            return Vec::new();
        }
        self.request_matches(true)
    }

    pub async fn handle_signal(&mut self, msg: SignalMessage) -> Vec<AgentAction> {
        match msg {
            SignalMessage::Init { req, res } => {
                if req != self.id || res == self.id || self.knows(&res) || !self.running {
                    debug!(?res, "ignoring init");
                    return Vec::new();
                }
                self.signals.insert(res.clone(), SignalStep::Init);
                vec![AgentAction::CreateChannel {
                    peer: res,
                    initiator: true,
                    remote: None,
                }]
            }
            SignalMessage::Request { req, res, request } => {
                if res != self.id || req == self.id || self.knows(&req) || !self.running {
                    debug!(?req, "ignoring request");
                    return Vec::new();
                }
                self.signals.insert(req.clone(), SignalStep::Request);
                vec![AgentAction::CreateChannel {
                    peer: req,
                    initiator: false,
                    remote: Some(request),
                }]
            }
            SignalMessage::Response { req, res, response } => {
                if req != self.id {
                    return Vec::new();
                }
                match self.channels.get(&res) {
                    Some(ch) if !ch.connected && ch.origin == ChannelOrigin::Tracker => vec![
                        AgentAction::ApplyRemote {
                            peer: res.clone(),
                            descriptor: response,
                        },
                        AgentAction::SignalSend(SignalMessage::Proc { req, res }),
                    ],
                    _ => Vec::new(),
                }
            }
            SignalMessage::Interrupt { id } => {
                let half_open = self
                    .channels
                    .get(&id)
                    .is_some_and(|c| !c.connected && c.origin == ChannelOrigin::Tracker);
                let signalling = matches!(
                    self.signals.get(&id),
                    Some(SignalStep::Init | SignalStep::Request)
                );
                if half_open || signalling {
                    debug!(?id, "handshake interrupted by tracker");
                    self.drop_channel(&id).await
                } else {
                    Vec::new()
                }
            }
            SignalMessage::Relay { relay: Some(tracker) } => {
                info!(%tracker, "redirected to another tracker");
                self.tracker.address = tracker.clone();
                self.tracker.redirected = true;
                vec![
                    AgentAction::Emit(AgentEvent::Redirected { tracker }),
                    AgentAction::CloseTracker,
                ]
            }
            SignalMessage::Error { error } => {
                warn!(%error, "tracker error");
                vec![AgentAction::Emit(AgentEvent::Error { description: error })]
            }
            SignalMessage::Ping => vec![AgentAction::SignalSend(SignalMessage::Pong)],
            other => {
                debug!(?other, "ignored tracker frame");
                Vec::new()
            }
        }
    }

    // ── Channel attempts ─────────────────────────────────────────────

    /// The data-channel layer produced our descriptor for `peer`.
    pub fn on_local_descriptor(
        &mut self,
        peer: &PeerId,
        descriptor: Descriptor,
        now: u64,
    ) -> Vec<AgentAction> {
        let Some(step) = self.signals.remove(peer) else {
            // Attempt was dropped while the descriptor was being made.
            return vec![AgentAction::DestroyChannel { peer: peer.clone() }];
        };
        let timeout = self.config.bootstrap_timeout.as_millis() as u64;

        match step {
            SignalStep::Init => {
                self.channels
                    .insert(peer.clone(), DataChannel::new(peer.clone(), ChannelOrigin::Tracker));
                vec![AgentAction::SignalSend(SignalMessage::Request {
                    req: self.id.clone(),
                    res: peer.clone(),
                    request: descriptor,
                })]
            }
            SignalStep::Request => {
                self.channels
                    .insert(peer.clone(), DataChannel::new(peer.clone(), ChannelOrigin::Tracker));
                vec![AgentAction::SignalSend(SignalMessage::Response {
                    req: peer.clone(),
                    res: self.id.clone(),
                    response: descriptor,
                })]
            }
            SignalStep::Target { frame, relay } => {
                if !self.channels.get(&relay).is_some_and(|c| c.connected) {
                    return vec![AgentAction::DestroyChannel { peer: peer.clone() }];
                }
                let mut ch = DataChannel::new(peer.clone(), ChannelOrigin::Mesh);
                ch.bootstrap = Some(BootstrapMeta {
                    id: frame.id.clone(),
                    relay: relay.clone(),
                    start: frame.start.clone(),
                    stop: self.id.clone(),
                });
                ch.timer.arm(now, timeout);
                self.channels.insert(peer.clone(), ch);

                let reply = SearchFrame {
                    stop: Some(self.id.clone()),
                    data: Some(descriptor),
                    ..frame
                };
                vec![AgentAction::mesh(&relay, MeshMessage::AfterSearch(reply))]
            }
            SignalStep::Origin { frame, relay } => {
                if !self.channels.get(&relay).is_some_and(|c| c.connected) {
                    return vec![AgentAction::DestroyChannel { peer: peer.clone() }];
                }
                let mut ch = DataChannel::new(peer.clone(), ChannelOrigin::Mesh);
                ch.bootstrap = Some(BootstrapMeta {
                    id: frame.id.clone(),
                    relay: relay.clone(),
                    start: self.id.clone(),
                    stop: peer.clone(),
                });
                ch.timer.arm(now, timeout);
                self.channels.insert(peer.clone(), ch);

                let session = SearchFrame {
                    data: Some(descriptor),
                    ..frame
                };
                vec![AgentAction::mesh(&relay, MeshMessage::BeforeSession(session))]
            }
        }
    }

    /// The data-channel layer failed for `peer` (descriptor or transport).
    pub async fn on_channel_error(&mut self, peer: &PeerId, description: String) -> Vec<AgentAction> {
        warn!(?peer, %description, "channel error");
        let mut actions = vec![AgentAction::Emit(AgentEvent::Error { description })];
        if let Some(SignalStep::Target { frame, relay } | SignalStep::Origin { frame, relay }) =
            self.signals.get(peer)
        {
            if self.channels.get(relay).is_some_and(|c| c.connected) {
                actions.push(AgentAction::mesh(relay, MeshMessage::Abort(frame.bare())));
            }
        }
        actions.extend(self.drop_channel(peer).await);
        actions
    }

    pub fn on_channel_connected(&mut self, peer: &PeerId) -> Vec<AgentAction> {
        let Some(ch) = self.channels.get_mut(peer) else {
            return Vec::new();
        };
        if ch.connected {
            return Vec::new();
        }
        ch.connected = true;
        ch.timer.cancel();
        let meta = ch.bootstrap.take();
        info!(?peer, "channel connected");

        let mut actions = Vec::new();
        if let Some(meta) = meta {
            if self.channels.get(&meta.relay).is_some_and(|c| c.connected) {
                actions.push(AgentAction::mesh(&meta.relay, MeshMessage::AfterSession(meta.frame())));
            }
        }

        let others: Vec<PeerId> = self
            .channels
            .values()
            .filter(|c| c.connected && c.peer != *peer)
            .map(|c| c.peer.clone())
            .collect();
        for other in others {
            actions.push(AgentAction::mesh(&other, MeshMessage::Add { add: peer.clone() }));
            actions.push(AgentAction::mesh(peer, MeshMessage::Add { add: other }));
        }
        actions.push(AgentAction::Emit(AgentEvent::Connected { peer: peer.clone() }));
        actions
    }

    pub async fn on_channel_data(&mut self, from: &PeerId, text: &str) -> Vec<AgentAction> {
        if !self.channels.get(from).is_some_and(|c| c.connected) {
            debug!(?from, "data from unknown channel");
            return Vec::new();
        }
        match ChannelFrame::parse(text) {
            Ok(ChannelFrame::Data(text)) => vec![AgentAction::Emit(AgentEvent::Message {
                from: from.clone(),
                text,
            })],
            Ok(ChannelFrame::Mesh(msg)) => self.handle_mesh(from, msg).await,
            Err(e) => {
                warn!(?from, "malformed mesh frame: {e}");
                let mut actions = vec![AgentAction::Emit(AgentEvent::Error {
                    description: e.to_string(),
                })];
                actions.extend(self.drop_channel(from).await);
                actions
            }
        }
    }

    pub async fn on_channel_closed(&mut self, peer: &PeerId) -> Vec<AgentAction> {
        match self.channels.remove(peer) {
            Some(ch) => self.release_channel(ch).await,
            None => {
                if self.signals.remove(peer).is_some() {
                    self.refill(None)
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// Destroy half-open channels whose bootstrap expired.
    pub async fn tick_bootstrap(&mut self, now: u64) -> Vec<AgentAction> {
        let expired: Vec<PeerId> = self
            .channels
            .values()
            .filter(|c| !c.connected && c.timer.is_expired(now))
            .map(|c| c.peer.clone())
            .collect();

        let mut actions = Vec::new();
        for peer in expired {
            let meta = self.channels.get_mut(&peer).and_then(|ch| {
                ch.timer.cancel();
                ch.bootstrap.take()
            });
            if let Some(meta) = meta {
                if self.channels.get(&meta.relay).is_some_and(|c| c.connected) {
                    actions.push(AgentAction::mesh(&meta.relay, MeshMessage::Abort(meta.frame())));
                }
            }
            debug!(?peer, "bootstrap expired");
            actions.push(AgentAction::Emit(AgentEvent::BootstrapExpired { peer: peer.clone() }));
            actions.extend(self.drop_channel(&peer).await);
        }
        actions
    }

    /// Destroy our side of `peer` and run the close bookkeeping.
    pub(crate) async fn drop_channel(&mut self, peer: &PeerId) -> Vec<AgentAction> {
        let mut actions = vec![AgentAction::DestroyChannel { peer: peer.clone() }];
        actions.extend(self.on_channel_closed(peer).await);
        actions
    }

    async fn release_channel(&mut self, ch: DataChannel) -> Vec<AgentAction> {
        let mut actions = Vec::new();

        for id in &ch.relaying {
            match self.store.get(id).await {
                Ok(Some(state)) => {
                    let frame = SearchFrame {
                        stop: state.stop.clone(),
                        ..SearchFrame::new(state.id.clone(), state.start.clone())
                    };
                    for party in [Some(&state.start_relay), state.stop_relay.as_ref()]
                        .into_iter()
                        .flatten()
                    {
                        if *party != ch.peer && self.channels.get(party).is_some_and(|c| c.connected) {
                            actions.push(AgentAction::mesh(party, MeshMessage::Abort(frame.clone())));
                        }
                    }
                    actions.extend(self.forget(id).await);
                }
                Ok(None) => {}
                Err(e) => actions.push(AgentAction::Emit(AgentEvent::Error {
                    description: e.to_string(),
                })),
            }
        }

        self.temps.retain(|_, d| d.relay.as_ref() != Some(&ch.peer));

        if ch.connected {
            info!(peer = ?ch.peer, "channel closed");
            let others: Vec<PeerId> = self
                .channels
                .values()
                .filter(|c| c.connected)
                .map(|c| c.peer.clone())
                .collect();
            for other in others {
                actions.push(AgentAction::mesh(&other, MeshMessage::Sub { sub: ch.peer.clone() }));
            }
            actions.push(AgentAction::Emit(AgentEvent::Disconnected { peer: ch.peer.clone() }));
        }

        actions.extend(self.refill(ch.bootstrap.as_ref()));
        actions
    }

    /// Delete a relayed search and unlink it from every channel.
    pub(crate) async fn forget(&mut self, id: &RequestId) -> Vec<AgentAction> {
        for ch in self.channels.values_mut() {
            ch.relaying.remove(id);
        }
        match self.store.del(id).await {
            Ok(()) => Vec::new(),
            Err(e) => {
                warn!(%id, "search state not deleted: {e}");
                vec![AgentAction::Emit(AgentEvent::Error {
                    description: e.to_string(),
                })]
            }
        }
    }

    /// Replace a lost channel or discovery.
    pub(crate) fn refill(&mut self, bootstrap: Option<&BootstrapMeta>) -> Vec<AgentAction> {
        if !self.running {
            return Vec::new();
        }
        let mut actions = Vec::new();
        if let Some(meta) = bootstrap {
            if self.channels.get(&meta.relay).is_some_and(|c| c.connected) {
                actions.push(AgentAction::mesh(&meta.relay, MeshMessage::Abort(meta.frame())));
            }
        }
        let count = self.total();
        if count == 0 {
            actions.extend(self.request_matches(true));
        } else if count < LOW_WATER.min(self.config.max_channels) {
            actions.extend(self.request_matches(false));
        } else if count < self.config.max_channels {
            actions.extend(self.begin_discovery());
        }
        actions
    }

    // ── Mesh gossip and payloads ─────────────────────────────────────

    async fn handle_mesh(&mut self, from: &PeerId, msg: MeshMessage) -> Vec<AgentAction> {
        match msg {
            MeshMessage::Add { add } => {
                if add != *from {
                    if let Some(ch) = self.channels.get_mut(from) {
                        ch.neighbors.insert(add);
                    }
                }
                Vec::new()
            }
            MeshMessage::Sub { sub } => {
                if let Some(ch) = self.channels.get_mut(from) {
                    ch.neighbors.remove(&sub);
                }
                Vec::new()
            }
            MeshMessage::BeforeSearch(frame) => self.before_search(from, frame).await,
            MeshMessage::AfterSearch(frame) => self.after_search(from, frame).await,
            MeshMessage::BeforeSession(frame) => self.before_session(from, frame).await,
            MeshMessage::AfterSession(frame) => self.after_session(from, frame).await,
            MeshMessage::Nonmsg(frame) => self.nonmsg(from, frame).await,
            MeshMessage::Abort(frame) => self.abort(from, frame).await,
        }
    }

    /// Application payload to one connected peer.
    pub fn send(&self, peer: &PeerId, text: &str) -> Vec<AgentAction> {
        if text.starts_with(MESH_PREFIX) {
            return refuse(format!("payload may not start with {MESH_PREFIX}"));
        }
        if !self.channels.get(peer).is_some_and(|c| c.connected) {
            return refuse(format!("no connected channel to {peer}"));
        }
        vec![AgentAction::ChannelSend {
            peer: peer.clone(),
            frame: ChannelFrame::Data(text.to_string()),
        }]
    }

    /// Application payload to every connected peer.
    pub fn broadcast(&self, text: &str) -> Vec<AgentAction> {
        if text.starts_with(MESH_PREFIX) {
            return refuse(format!("payload may not start with {MESH_PREFIX}"));
        }
        self.channels
            .values()
            .filter(|c| c.connected)
            .map(|c| AgentAction::ChannelSend {
                peer: c.peer.clone(),
                frame: ChannelFrame::Data(text.to_string()),
            })
            .collect()
    }

    /// Pass on a payload received from `from` without flooding twice: skip
    /// channels known to reach `from`, and where `from` and a target share
    /// neighbours, only the smallest id among us and them forwards.
    pub fn mesh_forward(&self, from: &PeerId, text: &str) -> Vec<AgentAction> {
        let Some(source) = self.channels.get(from) else {
            return Vec::new();
        };
        self.channels
            .values()
            .filter(|c| c.connected && c.peer != *from && !c.neighbors.contains(from))
            .filter(|c| {
                source
                    .neighbors
                    .intersection(&c.neighbors)
                    .all(|shared| self.id <= *shared)
            })
            .map(|c| AgentAction::ChannelSend {
                peer: c.peer.clone(),
                frame: ChannelFrame::Data(text.to_string()),
            })
            .collect()
    }
}

fn refuse(description: String) -> Vec<AgentAction> {
    vec![AgentAction::Emit(AgentEvent::Error { description })]
}
