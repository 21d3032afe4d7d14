/// RelayMembership: tracker-to-tracker links grouped by topic.
///
/// Pure state machine: learns candidate relays from DHT peer events, opens
/// or accepts links, confirms each with a `session` exchange and keeps
/// per-topic membership lists consistent with the link table. Returns
/// actions; the runtime performs the I/O.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;

use rand::seq::IndexedRandom;

use crate::backoff::DialBackoff;
use crate::config::NodeConfig;
use crate::error::RejectReason;
use crate::message::{RelayMessage, SessionHello};
use crate::types::{ConnId, InfoHash, NodeId};

/// What this node says about itself in a `session` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRelay {
    pub id: NodeId,
    pub address: String,
    pub web: String,
    pub host: String,
    pub port: u16,
    pub domain: Option<String>,
}

impl LocalRelay {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            id: config.node_id(),
            address: config.address(),
            web: config.web(),
            host: config.host.clone(),
            port: config.port,
            domain: config.domain.clone(),
        }
    }

    pub fn hello(&self, relay: InfoHash) -> SessionHello {
        SessionHello {
            id: self.id,
            address: self.address.clone(),
            web: self.web.clone(),
            host: self.host.clone(),
            port: self.port,
            domain: self.domain.clone(),
            relay,
        }
    }
}

/// One relay link.
#[derive(Debug, Clone)]
pub struct RelayLink {
    pub conn: ConnId,
    pub id: NodeId,
    /// We dialed it.
    pub outbound: bool,
    /// Socket is open (always true for inbound links).
    pub opened: bool,
    /// Answered since the last liveness tick.
    pub active: bool,
    /// Peer's listener is up; it can take redirected clients.
    pub session: bool,
    /// `session` exchange validated.
    pub established: bool,
    pub last_activity: u64,
    /// Topic named in the dial or accept, awaiting the peer's `session`.
    pending_topic: Option<InfoHash>,
    pub topics: Vec<InfoHash>,
    pub address: Option<String>,
    pub web: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    LinkEstablished { id: NodeId, info_hash: InfoHash },
    LinkClosed { id: NodeId },
    Rejected { conn: ConnId, reason: RejectReason },
    Violation { id: NodeId, reason: String },
    DialFailed { id: NodeId, wait: u64 },
    PeerError { id: NodeId, error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum MembershipAction {
    Dial { conn: ConnId, url: String },
    Send { conn: ConnId, msg: RelayMessage },
    Close { conn: ConnId },
    Lookup { info_hash: InfoHash },
    Announce { info_hash: InfoHash, port: u16 },
    Event(MembershipEvent),
}

pub struct RelayMembership {
    local: LocalRelay,
    links: HashMap<NodeId, RelayLink>,
    by_conn: HashMap<ConnId, NodeId>,
    /// Served topics, in configuration order, with their members.
    topics: Vec<(InfoHash, Vec<NodeId>)>,
    backoff: DialBackoff,
    /// Links per topic; zero is unlimited.
    server_limit: usize,
}

impl RelayMembership {
    pub fn new(local: LocalRelay, topics: &[String], server_limit: usize, backoff_unit_ms: u64) -> Self {
        let mut served: Vec<(InfoHash, Vec<NodeId>)> = Vec::new();
        for topic in topics.iter().filter(|t| !t.is_empty()) {
            let ih = InfoHash::from_topic(topic);
            if !served.iter().any(|(h, _)| *h == ih) {
                served.push((ih, Vec::new()));
            }
        }
        Self {
            local,
            links: HashMap::new(),
            by_conn: HashMap::new(),
            topics: served,
            backoff: DialBackoff::new(backoff_unit_ms),
            server_limit,
        }
    }

    pub fn local(&self) -> &LocalRelay {
        &self.local
    }

    pub fn serves(&self, ih: &InfoHash) -> bool {
        self.topics.iter().any(|(h, _)| h == ih)
    }

    pub fn members(&self, ih: &InfoHash) -> &[NodeId] {
        self.topics
            .iter()
            .find(|(h, _)| h == ih)
            .map(|(_, m)| m.as_slice())
            .unwrap_or(&[])
    }

    pub fn link(&self, id: &NodeId) -> Option<&RelayLink> {
        self.links.get(id)
    }

    pub fn owns(&self, conn: ConnId) -> bool {
        self.by_conn.contains_key(&conn)
    }

    pub fn links(&self) -> impl Iterator<Item = &RelayLink> {
        self.links.values()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn backoff(&self) -> &DialBackoff {
        &self.backoff
    }

    fn at_limit(&self, ih: &InfoHash) -> bool {
        self.server_limit > 0 && self.members(ih).len() >= self.server_limit
    }

    fn members_mut(&mut self, ih: &InfoHash) -> Option<&mut Vec<NodeId>> {
        self.topics.iter_mut().find(|(h, _)| h == ih).map(|(_, m)| m)
    }

    fn join(&mut self, id: NodeId, ih: InfoHash) {
        if let Some(members) = self.members_mut(&ih) {
            if !members.contains(&id) {
                members.push(id);
            }
        }
        if let Some(link) = self.links.get_mut(&id) {
            if !link.topics.contains(&ih) {
                link.topics.push(ih);
            }
        }
    }

    fn leave(&mut self, id: NodeId, ih: &InfoHash) {
        if let Some(members) = self.members_mut(ih) {
            members.retain(|m| *m != id);
        }
        if let Some(link) = self.links.get_mut(&id) {
            link.topics.retain(|t| t != ih);
        }
    }

    // ── DHT ───────────────────────────────────────────────────────────

    /// One lookup + announce per topic not already at its link limit.
    pub fn talk(&self) -> Vec<MembershipAction> {
        let mut actions = Vec::new();
        for (ih, _) in &self.topics {
            if self.at_limit(ih) {
                tracing::debug!("{ih}: at link limit, not looking up");
                continue;
            }
            actions.push(MembershipAction::Lookup { info_hash: *ih });
            actions.push(MembershipAction::Announce {
                info_hash: *ih,
                port: self.local.port,
            });
        }
        actions
    }

    /// A DHT peer announced `ih` at `addr`.
    pub fn handle_peer_found(&mut self, addr: SocketAddr, ih: InfoHash, now: u64) -> Vec<MembershipAction> {
        if !self.serves(&ih) {
            return vec![];
        }
        let address = addr.to_string();
        let id = NodeId::from_address(&address);
        if address == self.local.address || id == self.local.id {
            return vec![];
        }
        if !self.backoff.permits(&id, now) {
            tracing::debug!("{id}: still backing off, skipping {address}");
            return vec![];
        }

        if let Some(link) = self.links.get(&id) {
            if !link.opened || !link.established {
                return vec![];
            }
            if self.members(&ih).contains(&id) {
                return vec![];
            }
            let conn = link.conn;
            self.join(id, ih);
            return vec![MembershipAction::Send {
                conn,
                msg: RelayMessage::Add {
                    relay: ih,
                    reply: true,
                },
            }];
        }

        if self.at_limit(&ih) {
            return vec![];
        }

        let conn = ConnId::fresh();
        let url = format!("ws://{address}/relay?hash={ih}&id={}", self.local.id);
        self.insert(RelayLink {
            conn,
            id,
            outbound: true,
            opened: false,
            active: true,
            session: false,
            established: false,
            last_activity: now,
            pending_topic: Some(ih),
            topics: Vec::new(),
            address: None,
            web: None,
        });
        tracing::debug!("dialing relay {id} at {address} for {ih}");
        vec![MembershipAction::Dial { conn, url }]
    }

    fn insert(&mut self, link: RelayLink) {
        self.by_conn.insert(link.conn, link.id);
        self.links.insert(link.id, link);
    }

    // ── Link lifecycle ────────────────────────────────────────────────

    /// Our dial completed.
    pub fn link_opened(&mut self, conn: ConnId, now: u64) -> Vec<MembershipAction> {
        let Some(id) = self.by_conn.get(&conn).copied() else {
            return vec![MembershipAction::Close { conn }];
        };
        self.backoff.clear(&id);
        let Some(link) = self.links.get_mut(&id) else {
            return vec![MembershipAction::Close { conn }];
        };
        link.opened = true;
        link.last_activity = now;
        match link.pending_topic {
            Some(ih) => vec![MembershipAction::Send {
                conn,
                msg: RelayMessage::Session(self.local.hello(ih)),
            }],
            None => vec![],
        }
    }

    /// Our dial failed before the socket opened.
    pub fn dial_failed(&mut self, conn: ConnId, now: u64) -> Vec<MembershipAction> {
        let Some(id) = self.by_conn.remove(&conn) else {
            return vec![];
        };
        self.links.remove(&id);
        let wait = self.backoff.record_failure(id, now);
        vec![MembershipAction::Event(MembershipEvent::DialFailed { id, wait })]
    }

    /// Another tracker opened `/relay?hash&id`.
    pub fn accept_inbound(
        &mut self,
        conn: ConnId,
        hash: Option<&str>,
        id: Option<&str>,
        now: u64,
    ) -> Vec<MembershipAction> {
        let (Some(hash), Some(id)) = (hash, id) else {
            return reject(conn, RejectReason::MissingParams);
        };
        let Ok(id) = NodeId::from_str(id) else {
            return reject(conn, RejectReason::MissingParams);
        };
        let ih = match InfoHash::from_str(hash) {
            Ok(ih) if self.serves(&ih) => ih,
            _ => return reject(conn, RejectReason::UnknownTopic),
        };
        if self.links.contains_key(&id) || id == self.local.id {
            return reject(conn, RejectReason::AlreadyConnected);
        }
        if self.at_limit(&ih) {
            return reject(conn, RejectReason::LimitReached);
        }

        self.insert(RelayLink {
            conn,
            id,
            outbound: false,
            opened: true,
            active: true,
            session: false,
            established: false,
            last_activity: now,
            pending_topic: Some(ih),
            topics: Vec::new(),
            address: None,
            web: None,
        });
        vec![MembershipAction::Send {
            conn,
            msg: RelayMessage::Session(self.local.hello(ih)),
        }]
    }

    /// A frame arrived on a relay link.
    pub fn handle_message(&mut self, conn: ConnId, msg: RelayMessage, now: u64) -> Vec<MembershipAction> {
        let Some(id) = self.by_conn.get(&conn).copied() else {
            return vec![];
        };
        match self.links.get_mut(&id) {
            Some(link) => link.last_activity = now,
            None => return vec![],
        }

        match msg {
            RelayMessage::Session(hello) => self.handle_session(conn, id, hello),
            RelayMessage::Add { relay, .. } => {
                if self.links.get(&id).is_some_and(|l| l.established) && self.serves(&relay) {
                    self.join(id, relay);
                }
                vec![]
            }
            RelayMessage::Sub { relay } => {
                if !self.serves(&relay) {
                    return vec![];
                }
                let only = self
                    .links
                    .get(&id)
                    .is_some_and(|l| l.topics.len() == 1 && l.topics[0] == relay);
                if only {
                    return vec![MembershipAction::Close { conn }];
                }
                self.leave(id, &relay);
                vec![]
            }
            RelayMessage::Ping => vec![MembershipAction::Send {
                conn,
                msg: RelayMessage::Pong,
            }],
            RelayMessage::Pong => {
                self.update(&id, |l| l.active = true);
                vec![]
            }
            RelayMessage::On => {
                self.update(&id, |l| l.session = true);
                vec![]
            }
            RelayMessage::Off => {
                self.update(&id, |l| l.session = false);
                vec![]
            }
            RelayMessage::Error { error } => {
                vec![MembershipAction::Event(MembershipEvent::PeerError { id, error })]
            }
        }
    }

    fn update(&mut self, id: &NodeId, f: impl FnOnce(&mut RelayLink)) {
        if let Some(link) = self.links.get_mut(id) {
            f(link);
        }
    }

    fn handle_session(&mut self, conn: ConnId, id: NodeId, hello: SessionHello) -> Vec<MembershipAction> {
        let Some(link) = self.links.get_mut(&id) else {
            return vec![];
        };
        if link.established {
            return vec![];
        }
        let reason = if link.pending_topic != Some(hello.relay) {
            Some(format!("session for unexpected topic {}", hello.relay))
        } else if NodeId::from_address(&hello.address) != hello.id {
            Some(format!("id does not match address {}", hello.address))
        } else if hello.id != id {
            Some(format!("declared id {} is not the linked relay", hello.id))
        } else {
            None
        };
        if let Some(reason) = reason {
            tracing::warn!("relay {id}: {reason}");
            return vec![
                MembershipAction::Close { conn },
                MembershipAction::Event(MembershipEvent::Violation { id, reason }),
            ];
        }

        link.established = true;
        link.session = true;
        link.pending_topic = None;
        link.address = Some(hello.address);
        link.web = Some(hello.web);
        self.join(id, hello.relay);
        tracing::info!("relay {id} joined {}", hello.relay);
        vec![MembershipAction::Event(MembershipEvent::LinkEstablished {
            id,
            info_hash: hello.relay,
        })]
    }

    /// Liveness check: close links silent since the last tick, ping the rest.
    /// A silent relay is backed off like a failed dial.
    pub fn check_links(&mut self, now: u64) -> Vec<MembershipAction> {
        let mut actions = Vec::new();
        for link in self.links.values_mut() {
            if !link.active {
                let wait = self.backoff.record_failure(link.id, now);
                tracing::debug!("relay {} missed a ping, closing (backoff {wait})", link.id);
                actions.push(MembershipAction::Close { conn: link.conn });
                continue;
            }
            link.active = false;
            if link.opened {
                actions.push(MembershipAction::Send {
                    conn: link.conn,
                    msg: RelayMessage::Ping,
                });
            }
        }
        actions
    }

    /// A relay socket is gone. Drops it from every topic and the link table.
    pub fn link_closed(&mut self, conn: ConnId) -> Vec<MembershipAction> {
        let Some(id) = self.by_conn.remove(&conn) else {
            return vec![];
        };
        self.links.remove(&id);
        for (_, members) in &mut self.topics {
            members.retain(|m| *m != id);
        }
        vec![MembershipAction::Event(MembershipEvent::LinkClosed { id })]
    }

    // ── Queries used by the node ──────────────────────────────────────

    /// `web` address of a random session-capable relay serving `topic`.
    pub fn random_relay<R: rand::Rng + ?Sized>(&self, topic: &str, rng: &mut R) -> Option<String> {
        let ih = InfoHash::from_topic(topic);
        let candidates: Vec<&String> = self
            .members(&ih)
            .iter()
            .filter_map(|id| self.links.get(id))
            .filter(|l| l.session)
            .filter_map(|l| l.web.as_ref())
            .collect();
        candidates.choose(rng).map(|w| (*w).clone())
    }

    /// Send `msg` on every open link.
    pub fn broadcast(&self, msg: RelayMessage) -> Vec<MembershipAction> {
        self.links
            .values()
            .filter(|l| l.opened)
            .map(|l| MembershipAction::Send {
                conn: l.conn,
                msg: msg.clone(),
            })
            .collect()
    }

    pub fn clear_backoff(&mut self) {
        self.backoff.clear_all();
    }
}

fn reject(conn: ConnId, reason: RejectReason) -> Vec<MembershipAction> {
    vec![
        MembershipAction::Send {
            conn,
            msg: RelayMessage::Error {
                error: reason.to_string(),
            },
        },
        MembershipAction::Close { conn },
        MembershipAction::Event(MembershipEvent::Rejected { conn, reason }),
    ]
}
