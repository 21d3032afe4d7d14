//! In-memory mesh: agents exchange frames through a FIFO queue, channel
//! attempts complete as soon as both ends have a descriptor, and an optional
//! [`SignalTracker`] plays the tracker.
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use relaymesh_protocol::{
    AgentAction, AgentConfig, AgentEvent, ConnId, Descriptor, MemoryStore, MeshAgent, PeerId,
    SignalMessage, SignalTracker, TrackerAction, TrackerEvent,
};
use serde_json::json;

pub const TOPIC: &str = "movies";

pub fn peer(s: &str) -> PeerId {
    PeerId::new(s)
}

enum Delivery {
    Frame { from: PeerId, text: String },
    Descriptor { peer: PeerId, descriptor: Descriptor },
    DescriptorFailed { peer: PeerId },
    Connected { peer: PeerId },
    Closed { peer: PeerId },
    Signal(SignalMessage),
    TrackerOpen,
}

struct Tracker {
    inner: SignalTracker,
    conns: BTreeMap<ConnId, PeerId>,
    by_peer: BTreeMap<PeerId, ConnId>,
}

pub struct MeshSim {
    agents: BTreeMap<PeerId, MeshAgent<MemoryStore>>,
    queue: VecDeque<(PeerId, Delivery)>,
    /// (owner, remote) pairs with a descriptor in flight or made.
    attempts: BTreeSet<(PeerId, PeerId)>,
    links: BTreeSet<(PeerId, PeerId)>,
    tracker: Option<Tracker>,
    failing: BTreeSet<PeerId>,
    blocked: Vec<String>,
    pub events: BTreeMap<PeerId, Vec<AgentEvent>>,
    pub tracker_events: Vec<TrackerEvent>,
    /// Every mesh frame put on a channel: (from, to, text).
    pub frames: Vec<(PeerId, PeerId, String)>,
    pub now: u64,
}

impl MeshSim {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("warn")
            .with_test_writer()
            .try_init();
        Self {
            agents: BTreeMap::new(),
            queue: VecDeque::new(),
            attempts: BTreeSet::new(),
            links: BTreeSet::new(),
            tracker: None,
            failing: BTreeSet::new(),
            blocked: Vec::new(),
            events: BTreeMap::new(),
            tracker_events: Vec::new(),
            frames: Vec::new(),
            now: 1_000,
        }
    }

    /// Route signalling through a real tracker instead of straight between
    /// agents.
    pub fn with_tracker() -> Self {
        let mut sim = Self::new();
        sim.tracker = Some(Tracker {
            inner: SignalTracker::new(&[TOPIC.to_string()], 0, 0),
            conns: BTreeMap::new(),
            by_peer: BTreeMap::new(),
        });
        sim
    }

    pub fn config(id: &str, max: usize) -> AgentConfig {
        AgentConfig::new("127.0.0.1:10509", TOPIC)
            .id(peer(id))
            .max_channels(max)
            .rng_seed(11)
    }

    pub async fn add(&mut self, id: &str, max: usize) {
        self.add_with(Self::config(id, max)).await;
    }

    /// Add a running agent.
    pub async fn add_with(&mut self, config: AgentConfig) {
        let mut agent = MeshAgent::new(config, MemoryStore::new());
        let id = agent.id().clone();
        let actions = agent.begin();
        self.agents.insert(id.clone(), agent);
        self.apply(&id, actions);
        self.run().await;
    }

    pub fn agent(&self, id: &str) -> &MeshAgent<MemoryStore> {
        &self.agents[&peer(id)]
    }

    pub fn connected(&self, a: &str, b: &str) -> bool {
        self.agent(a).channel(&peer(b)).is_some_and(|c| c.connected)
    }

    pub fn neighbors(&self, of: &str, via: &str) -> Vec<PeerId> {
        self.agent(of)
            .channel(&peer(via))
            .map(|c| c.neighbors.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stored(&self, id: &str) -> usize {
        self.agent(id).store().len()
    }

    pub fn events_of(&self, id: &str) -> &[AgentEvent] {
        self.events.get(&peer(id)).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Mesh frames sent so far carrying `"action":"<action>"`.
    pub fn count(&self, action: &str) -> usize {
        let tag = format!("\"action\":\"{action}\"");
        self.frames.iter().filter(|(_, _, t)| t.contains(&tag)).count()
    }

    /// Drop every mesh frame containing `needle`.
    pub fn block(&mut self, needle: &str) {
        self.blocked.push(needle.to_string());
    }

    /// Make channel attempts started by `id` fail.
    pub fn fail_creates(&mut self, id: &str) {
        self.failing.insert(peer(id));
    }

    /// Have the tracker tell `a` to connect to `b`, and run to quiescence.
    pub async fn introduce(&mut self, a: &str, b: &str) {
        self.queue.push_back((
            peer(a),
            Delivery::Signal(SignalMessage::Init {
                req: peer(a),
                res: peer(b),
            }),
        ));
        self.run().await;
    }

    pub async fn discover(&mut self, id: &str) {
        let actions = self
            .agents
            .get_mut(&peer(id))
            .map(|a| a.begin_discovery())
            .unwrap_or_default();
        self.apply(&peer(id), actions);
        self.run().await;
    }

    pub async fn send(&mut self, id: &str, to: &str, text: &str) {
        let actions = self.agent(id).send(&peer(to), text);
        self.apply(&peer(id), actions);
        self.run().await;
    }

    pub async fn mesh_forward(&mut self, id: &str, from: &str, text: &str) {
        let actions = self.agent(id).mesh_forward(&peer(from), text);
        self.apply(&peer(id), actions);
        self.run().await;
    }

    /// Bootstrap tick on one agent at `now`.
    pub async fn tick(&mut self, id: &str, now: u64) {
        self.now = now;
        let mut actions = Vec::new();
        if let Some(agent) = self.agents.get_mut(&peer(id)) {
            actions = agent.tick_bootstrap(now).await;
        }
        self.apply(&peer(id), actions);
        self.run().await;
    }

    /// The link between `a` and `b` drops on both sides.
    pub async fn cut(&mut self, a: &str, b: &str) {
        let (a, b) = (peer(a), peer(b));
        if self.links.remove(&link(&a, &b)) {
            self.attempts.remove(&(a.clone(), b.clone()));
            self.attempts.remove(&(b.clone(), a.clone()));
            self.queue.push_back((a.clone(), Delivery::Closed { peer: b.clone() }));
            self.queue.push_back((b, Delivery::Closed { peer: a }));
        }
        self.run().await;
    }

    pub async fn run(&mut self) {
        let mut steps = 0;
        while let Some((to, delivery)) = self.queue.pop_front() {
            steps += 1;
            assert!(steps < 10_000, "mesh never went quiet");
            let now = self.now;
            let Some(agent) = self.agents.get_mut(&to) else {
                continue;
            };
            let actions = match delivery {
                Delivery::Frame { from, text } => agent.on_channel_data(&from, &text).await,
                Delivery::Descriptor { peer, descriptor } => {
                    agent.on_local_descriptor(&peer, descriptor, now)
                }
                Delivery::DescriptorFailed { peer } => {
                    agent.on_channel_error(&peer, "no route".into()).await
                }
                Delivery::Connected { peer } => agent.on_channel_connected(&peer),
                Delivery::Closed { peer } => agent.on_channel_closed(&peer).await,
                Delivery::Signal(msg) => agent.handle_signal(msg).await,
                Delivery::TrackerOpen => agent.on_tracker_open(),
            };
            self.apply(&to, actions);
        }
    }

    fn apply(&mut self, from: &PeerId, actions: Vec<AgentAction>) {
        for action in actions {
            match action {
                AgentAction::ChannelSend { peer, frame } => {
                    let text = frame.encode().unwrap();
                    if self.blocked.iter().any(|b| text.contains(b.as_str())) {
                        continue;
                    }
                    self.frames.push((from.clone(), peer.clone(), text.clone()));
                    self.queue.push_back((
                        peer,
                        Delivery::Frame {
                            from: from.clone(),
                            text,
                        },
                    ));
                }
                AgentAction::CreateChannel { peer, .. } => {
                    if self.failing.contains(from) {
                        self.queue
                            .push_back((from.clone(), Delivery::DescriptorFailed { peer }));
                        continue;
                    }
                    self.attempts.insert((from.clone(), peer.clone()));
                    let descriptor = Descriptor(json!({ "from": from.as_str(), "to": peer.as_str() }));
                    self.queue
                        .push_back((from.clone(), Delivery::Descriptor { peer, descriptor }));
                }
                AgentAction::ApplyRemote { peer, .. } => {
                    let both = self.attempts.contains(&(from.clone(), peer.clone()))
                        && self.attempts.contains(&(peer.clone(), from.clone()));
                    if both && self.links.insert(link(from, &peer)) {
                        self.queue
                            .push_back((from.clone(), Delivery::Connected { peer: peer.clone() }));
                        self.queue
                            .push_back((peer, Delivery::Connected { peer: from.clone() }));
                    }
                }
                AgentAction::DestroyChannel { peer } => {
                    self.attempts.remove(&(from.clone(), peer.clone()));
                    if self.links.remove(&link(from, &peer)) {
                        self.attempts.remove(&(peer.clone(), from.clone()));
                        self.queue
                            .push_back((peer, Delivery::Closed { peer: from.clone() }));
                    }
                }
                AgentAction::SignalSend(msg) => self.signal(from, msg),
                AgentAction::ConnectTracker { .. } => self.connect_tracker(from),
                AgentAction::CloseTracker | AgentAction::ScheduleReconnect { .. } => {}
                AgentAction::Emit(event) => self.events.entry(from.clone()).or_default().push(event),
            }
        }
    }

    fn signal(&mut self, from: &PeerId, msg: SignalMessage) {
        if let Some(tracker) = self.tracker.as_mut() {
            let Some(conn) = tracker.by_peer.get(from).copied() else {
                return;
            };
            let actions = tracker.inner.handle_message(conn, msg);
            self.apply_tracker(actions);
            return;
        }
        // No tracker: hand offers and answers straight to the other side.
        match &msg {
            SignalMessage::Request { res, .. } => {
                self.queue.push_back((res.clone(), Delivery::Signal(msg)));
            }
            SignalMessage::Response { req, .. } => {
                self.queue.push_back((req.clone(), Delivery::Signal(msg)));
            }
            _ => {}
        }
    }

    fn connect_tracker(&mut self, from: &PeerId) {
        let Some(tracker) = self.tracker.as_mut() else {
            return;
        };
        let conn = ConnId::fresh();
        tracker.conns.insert(conn, from.clone());
        tracker.by_peer.insert(from.clone(), conn);
        let actions = tracker.inner.connect(conn, Some(TOPIC), Some(from.as_str()));
        self.queue.push_back((from.clone(), Delivery::TrackerOpen));
        self.apply_tracker(actions);
    }

    fn apply_tracker(&mut self, actions: Vec<TrackerAction>) {
        for action in actions {
            match action {
                TrackerAction::Send { conn, msg } => {
                    let to = self
                        .tracker
                        .as_ref()
                        .and_then(|t| t.conns.get(&conn).cloned());
                    if let Some(to) = to {
                        self.queue.push_back((to, Delivery::Signal(msg)));
                    }
                }
                TrackerAction::Event(event) => self.tracker_events.push(event),
                TrackerAction::Close { .. } | TrackerAction::Shed { .. } => {}
            }
        }
    }
}

fn link(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}
