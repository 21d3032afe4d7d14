/// NodeState: pure protocol state of a tracker/relay node.
///
/// Routes transport events to the signalling tracker or the relay
/// membership, turns their actions into [`NodeEffect`]s and keeps the
/// counters. Does no I/O itself.
use rand::rngs::StdRng;
use rand::SeedableRng;
use relaymesh_dht::PeerFound;
use relaymesh_transport::{Route, TransportEvent};
use serde::Serialize;

use crate::config::NodeConfig;
use crate::error::RejectReason;
use crate::membership::{LocalRelay, MembershipAction, MembershipEvent, RelayMembership};
use crate::message::{RelayMessage, SignalMessage};
use crate::tracker::{SignalTracker, TrackerAction, TrackerEvent};
use crate::types::ConnId;

use super::{NodeEffect, NodeEvent, NodeStats};

pub struct NodeState {
    pub(crate) config: NodeConfig,
    pub(crate) membership: RelayMembership,
    pub(crate) tracker: SignalTracker,
    stats: NodeStats,
    running: bool,
    /// Listener paused because the client ceiling was hit.
    shed: bool,
    rng: StdRng,
}

impl NodeState {
    pub fn new(config: NodeConfig) -> Self {
        let membership = RelayMembership::new(
            LocalRelay::from_config(&config),
            &config.hashes,
            config.limit.server_connections,
            config.timer.backoff_unit.as_millis() as u64,
        );
        let tracker = SignalTracker::new(
            &config.hashes,
            config.limit.client_connections,
            config.limit.signal_connections,
        );
        Self {
            config,
            membership,
            tracker,
            stats: NodeStats::default(),
            running: false,
            shed: false,
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_shed(&self) -> bool {
        self.shed
    }

    pub fn stats(&self) -> NodeStats {
        self.stats.clone()
    }

    /// First effects after spawn: serve right away, or stay closed.
    pub fn boot(&mut self) -> Vec<NodeEffect> {
        if self.config.init {
            self.start()
        } else {
            vec![NodeEffect::PauseListener { reopen_after: None }]
        }
    }

    pub fn start(&mut self) -> Vec<NodeEffect> {
        if self.running {
            return vec![];
        }
        self.running = true;
        self.shed = false;
        let mut effects = vec![NodeEffect::ResumeListener, NodeEffect::Emit(NodeEvent::Start)];
        let actions = self.membership.talk();
        effects.extend(self.membership_effects(actions));
        effects
    }

    /// Close every client and relay link and stop listening.
    pub fn stop(&mut self) -> Vec<NodeEffect> {
        if !self.running {
            return vec![];
        }
        self.running = false;
        self.shed = false;
        self.membership.clear_backoff();

        let mut effects: Vec<NodeEffect> = self
            .tracker
            .sessions()
            .map(|s| NodeEffect::Close { conn: s.conn })
            .collect();
        effects.extend(self.membership.links().map(|l| NodeEffect::Close { conn: l.conn }));
        effects.push(NodeEffect::PauseListener { reopen_after: None });
        effects.push(NodeEffect::Emit(NodeEvent::Stop));
        effects
    }

    // ── Transport ─────────────────────────────────────────────────────

    pub fn handle_transport(&mut self, event: TransportEvent, now: u64) -> Vec<NodeEffect> {
        let effects = match event {
            TransportEvent::Listening { addr } => {
                self.shed = false;
                let mut effects = vec![NodeEffect::Emit(NodeEvent::Listening { addr })];
                let actions = self.membership.broadcast(RelayMessage::On);
                effects.extend(self.membership_effects(actions));
                effects
            }
            TransportEvent::ListenerClosed => {
                let mut effects = self.membership_effects(self.membership.broadcast(RelayMessage::Off));
                effects.push(NodeEffect::Emit(NodeEvent::Close));
                effects
            }
            TransportEvent::Accepted { conn, route } => self.accepted(conn, route, now),
            TransportEvent::Opened { conn } => {
                let actions = self.membership.link_opened(conn, now);
                self.membership_effects(actions)
            }
            TransportEvent::DialFailed { conn, error } => {
                tracing::debug!("relay dial {conn} failed: {error}");
                let actions = self.membership.dial_failed(conn, now);
                self.membership_effects(actions)
            }
            TransportEvent::Message { conn, text } => self.message(conn, &text, now),
            TransportEvent::Closed { conn } => {
                if self.tracker.owns(conn) {
                    let actions = self.tracker.disconnect(conn);
                    self.tracker_effects(actions)
                } else {
                    let actions = self.membership.link_closed(conn);
                    self.membership_effects(actions)
                }
            }
        };
        self.refresh_gauges();
        effects
    }

    fn accepted(&mut self, conn: ConnId, route: Route, now: u64) -> Vec<NodeEffect> {
        if !self.running {
            return vec![NodeEffect::Close { conn }];
        }
        match route {
            Route::Signal { hash, id } => {
                let actions = self.tracker.connect(conn, hash.as_deref(), id.as_deref());
                self.tracker_effects(actions)
            }
            Route::Relay { hash, id } => {
                let actions = self.membership.accept_inbound(conn, hash.as_deref(), id.as_deref(), now);
                self.membership_effects(actions)
            }
            Route::Unsupported { path } => {
                let reason = RejectReason::UnsupportedRoute;
                vec![
                    encode(
                        conn,
                        &SignalMessage::Error {
                            error: reason.to_string(),
                        },
                    ),
                    NodeEffect::Close { conn },
                    NodeEffect::Emit(NodeEvent::Ev {
                        description: format!("refused {path}: {reason}"),
                    }),
                ]
            }
        }
    }

    fn message(&mut self, conn: ConnId, text: &str, now: u64) -> Vec<NodeEffect> {
        if self.tracker.owns(conn) {
            match serde_json::from_str::<SignalMessage>(text) {
                Ok(msg) => {
                    let actions = self.tracker.handle_message(conn, msg);
                    self.tracker_effects(actions)
                }
                Err(e) => malformed(conn, "client", e),
            }
        } else if self.membership.owns(conn) {
            match serde_json::from_str::<RelayMessage>(text) {
                Ok(msg) => {
                    let actions = self.membership.handle_message(conn, msg, now);
                    self.membership_effects(actions)
                }
                Err(e) => malformed(conn, "relay", e),
            }
        } else {
            tracing::trace!("frame on unknown connection {conn}, dropped");
            vec![]
        }
    }

    // ── DHT and timers ────────────────────────────────────────────────

    pub fn handle_peer_found(&mut self, found: PeerFound, now: u64) -> Vec<NodeEffect> {
        if !self.running {
            return vec![];
        }
        let actions = self.membership.handle_peer_found(found.addr, found.info_hash, now);
        self.membership_effects(actions)
    }

    pub fn tick_check_server(&mut self, now: u64) -> Vec<NodeEffect> {
        let actions = self.membership.check_links(now);
        self.membership_effects(actions)
    }

    pub fn tick_check_client(&mut self) -> Vec<NodeEffect> {
        let actions = self.tracker.check_clients();
        self.tracker_effects(actions)
    }

    pub fn tick_talking(&mut self) -> Vec<NodeEffect> {
        if !self.running {
            return vec![];
        }
        let actions = self.membership.talk();
        self.membership_effects(actions)
    }

    /// The shedding cooldown elapsed.
    pub fn listener_reopen(&mut self) -> Vec<NodeEffect> {
        if !self.running || !self.shed {
            return vec![];
        }
        vec![NodeEffect::ResumeListener]
    }

    // ── Action mapping ────────────────────────────────────────────────

    fn tracker_effects(&mut self, actions: Vec<TrackerAction>) -> Vec<NodeEffect> {
        let mut effects = Vec::with_capacity(actions.len());
        for action in actions {
            match action {
                TrackerAction::Send { conn, msg } => effects.push(encode(conn, &msg)),
                TrackerAction::Close { conn } => effects.push(NodeEffect::Close { conn }),
                TrackerAction::Shed { conn, topic } => effects.extend(self.shed(conn, &topic)),
                TrackerAction::Event(event) => effects.extend(self.tracker_event(event)),
            }
        }
        effects
    }

    /// Redirect the arriving client and pause the listener for a cooldown.
    fn shed(&mut self, conn: ConnId, topic: &str) -> Vec<NodeEffect> {
        let relay = self.membership.random_relay(topic, &mut self.rng);
        let mut effects = vec![
            encode(conn, &SignalMessage::Relay { relay }),
            NodeEffect::Close { conn },
        ];
        if !self.shed {
            self.shed = true;
            effects.push(NodeEffect::PauseListener {
                reopen_after: Some(self.config.timer.redo),
            });
        }
        effects
    }

    fn tracker_event(&mut self, event: TrackerEvent) -> Option<NodeEffect> {
        let description = match event {
            TrackerEvent::Connected { .. } => {
                self.stats.clients_accepted.inc();
                return None;
            }
            TrackerEvent::Disconnected { .. } => return None,
            TrackerEvent::Rejected { conn, reason } => {
                self.stats.clients_rejected.inc();
                format!("client {conn} rejected: {reason}")
            }
            TrackerEvent::Matched { req, res } => {
                self.stats.matches.inc();
                format!("matched {req} with {res}")
            }
            TrackerEvent::Interrupted { id, with } => {
                self.stats.interrupts.inc();
                format!("{id} interrupted its handshake with {with}")
            }
            TrackerEvent::Completed { req, res } => {
                self.stats.handshakes.inc();
                format!("{req} and {res} are connected")
            }
            TrackerEvent::Violation { id, reason } => {
                tracing::warn!("client {id}: {reason}");
                format!("client {id}: {reason}")
            }
        };
        Some(NodeEffect::Emit(NodeEvent::Ev { description }))
    }

    fn membership_effects(&mut self, actions: Vec<MembershipAction>) -> Vec<NodeEffect> {
        let mut effects = Vec::with_capacity(actions.len());
        for action in actions {
            match action {
                MembershipAction::Dial { conn, url } => effects.push(NodeEffect::Dial { conn, url }),
                MembershipAction::Send { conn, msg } => effects.push(encode(conn, &msg)),
                MembershipAction::Close { conn } => effects.push(NodeEffect::Close { conn }),
                MembershipAction::Lookup { info_hash } => {
                    effects.push(NodeEffect::Lookup { info_hash })
                }
                MembershipAction::Announce { info_hash, port } => {
                    effects.push(NodeEffect::Announce { info_hash, port })
                }
                MembershipAction::Event(event) => effects.push(self.membership_event(event)),
            }
        }
        effects
    }

    fn membership_event(&mut self, event: MembershipEvent) -> NodeEffect {
        let description = match event {
            MembershipEvent::LinkEstablished { id, info_hash } => {
                self.stats.links_opened.inc();
                format!("relay {id} joined {info_hash}")
            }
            MembershipEvent::LinkClosed { id } => {
                self.stats.links_closed.inc();
                format!("relay {id} left")
            }
            MembershipEvent::Rejected { conn, reason } => {
                format!("relay {conn} rejected: {reason}")
            }
            MembershipEvent::Violation { id, reason } => {
                tracing::warn!("relay {id}: {reason}");
                format!("relay {id}: {reason}")
            }
            MembershipEvent::DialFailed { id, wait } => {
                self.stats.dial_failures.inc();
                format!("relay {id} unreachable, retry in {wait}ms")
            }
            MembershipEvent::PeerError { id, error } => format!("relay {id} reported: {error}"),
        };
        NodeEffect::Emit(NodeEvent::Ev { description })
    }

    fn refresh_gauges(&mut self) {
        self.stats.clients.set(self.tracker.client_count() as i64);
        self.stats.relay_links.set(self.membership.link_count() as i64);
    }
}

fn encode<M: Serialize>(conn: ConnId, msg: &M) -> NodeEffect {
    match serde_json::to_string(msg) {
        Ok(text) => NodeEffect::Send { conn, text },
        Err(e) => NodeEffect::Emit(NodeEvent::Error {
            description: format!("encode frame for {conn}: {e}"),
        }),
    }
}

fn malformed(conn: ConnId, who: &str, e: serde_json::Error) -> Vec<NodeEffect> {
    tracing::debug!("malformed {who} frame on {conn}: {e}");
    vec![
        NodeEffect::Close { conn },
        NodeEffect::Emit(NodeEvent::Error {
            description: format!("malformed {who} frame: {e}"),
        }),
    ]
}
