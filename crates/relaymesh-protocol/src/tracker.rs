/// SignalTracker: matches clients of a topic and relays their handshake.
///
/// Pure state machine. Each connected client is a [`ClientSession`]; idle
/// clients wait in a per-topic pool until another client arrives. The
/// four-step handshake (`init` → `request` → `response` → `proc`) is relayed
/// verbatim, checking at every step that the target is a pending
/// counterpart of the sender.
use std::collections::HashMap;

use indexmap::{IndexMap, IndexSet};

use crate::error::RejectReason;
use crate::message::SignalMessage;
use crate::types::{ConnId, PeerId};

/// One signalling client.
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub conn: ConnId,
    pub id: PeerId,
    pub topic: String,
    /// Answered since the last liveness tick.
    pub active: bool,
    /// Counterparts of handshakes in flight.
    pub pending: IndexSet<PeerId>,
    /// Counterparts already connected; never matched again.
    pub completed: IndexSet<PeerId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    Connected { id: PeerId },
    Rejected { conn: ConnId, reason: RejectReason },
    Matched { req: PeerId, res: PeerId },
    Interrupted { id: PeerId, with: PeerId },
    Completed { req: PeerId, res: PeerId },
    Disconnected { id: PeerId },
    Violation { id: PeerId, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrackerAction {
    Send { conn: ConnId, msg: SignalMessage },
    Close { conn: ConnId },
    /// Over the client ceiling: redirect this connection and shed the listener.
    Shed { conn: ConnId, topic: String },
    Event(TrackerEvent),
}

pub struct SignalTracker {
    clients: HashMap<PeerId, ClientSession>,
    by_conn: HashMap<ConnId, PeerId>,
    /// Waiting clients per served topic, oldest first.
    offers: IndexMap<String, IndexSet<PeerId>>,
    client_limit: usize,
    signal_limit: usize,
}

impl SignalTracker {
    pub fn new(topics: &[String], client_limit: usize, signal_limit: usize) -> Self {
        let offers = topics
            .iter()
            .filter(|t| !t.is_empty())
            .map(|t| (t.clone(), IndexSet::new()))
            .collect();
        Self {
            clients: HashMap::new(),
            by_conn: HashMap::new(),
            offers,
            client_limit,
            signal_limit,
        }
    }

    pub fn serves(&self, topic: &str) -> bool {
        self.offers.contains_key(topic)
    }

    pub fn client(&self, id: &PeerId) -> Option<&ClientSession> {
        self.clients.get(id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn owns(&self, conn: ConnId) -> bool {
        self.by_conn.contains_key(&conn)
    }

    /// Clients waiting for a match on `topic`, oldest first.
    pub fn pool(&self, topic: &str) -> Vec<PeerId> {
        self.offers
            .get(topic)
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Clients currently connected, for redirecting on shutdown.
    pub fn sessions(&self) -> impl Iterator<Item = &ClientSession> {
        self.clients.values()
    }

    /// A client opened `/signal?hash&id`.
    pub fn connect(&mut self, conn: ConnId, hash: Option<&str>, id: Option<&str>) -> Vec<TrackerAction> {
        let (Some(topic), Some(id)) = (hash, id) else {
            return reject(conn, RejectReason::MissingParams);
        };
        if id.is_empty() {
            return reject(conn, RejectReason::MissingParams);
        }
        if !self.serves(topic) {
            return reject(conn, RejectReason::UnknownTopic);
        }
        let id = PeerId::new(id);
        if self.clients.contains_key(&id) {
            return reject(conn, RejectReason::AlreadyConnected);
        }
        if self.client_limit > 0 && self.clients.len() >= self.client_limit {
            tracing::info!("client ceiling of {} reached, shedding", self.client_limit);
            return vec![
                TrackerAction::Shed {
                    conn,
                    topic: topic.to_string(),
                },
                TrackerAction::Event(TrackerEvent::Rejected {
                    conn,
                    reason: RejectReason::LimitReached,
                }),
            ];
        }

        self.clients.insert(
            id.clone(),
            ClientSession {
                conn,
                id: id.clone(),
                topic: topic.to_string(),
                active: true,
                pending: IndexSet::new(),
                completed: IndexSet::new(),
            },
        );
        self.by_conn.insert(conn, id.clone());

        let mut actions = vec![TrackerAction::Event(TrackerEvent::Connected { id: id.clone() })];
        actions.extend(self.match_offers(&id));
        actions
    }

    /// Pair `id` with the oldest eligible waiting client, or queue it.
    pub fn match_offers(&mut self, id: &PeerId) -> Vec<TrackerAction> {
        let Some(me) = self.clients.get(id) else {
            return vec![];
        };
        let topic = me.topic.clone();
        let Some(pool) = self.offers.get(&topic) else {
            return vec![];
        };
        if pool.contains(id) {
            return vec![];
        }

        let waiting: Vec<PeerId> = pool.iter().cloned().collect();
        let mut stale = Vec::new();
        let mut partner = None;
        for other in waiting {
            if other == *id || me.completed.contains(&other) || me.pending.contains(&other) {
                continue;
            }
            if self.clients.contains_key(&other) {
                partner = Some(other);
                break;
            }
            stale.push(other);
        }

        let mut actions = Vec::new();
        if let Some(pool) = self.offers.get_mut(&topic) {
            for gone in &stale {
                pool.shift_remove(gone);
            }
            match &partner {
                Some(other) => {
                    pool.shift_remove(other);
                }
                None => {
                    pool.insert(id.clone());
                }
            }
        }

        if let Some(other) = partner {
            if let Some(me) = self.clients.get_mut(id) {
                me.pending.insert(other.clone());
            }
            if let Some(them) = self.clients.get_mut(&other) {
                them.pending.insert(id.clone());
                actions.push(TrackerAction::Send {
                    conn: them.conn,
                    msg: SignalMessage::Init {
                        req: other.clone(),
                        res: id.clone(),
                    },
                });
            }
            tracing::debug!("matched {other} -> {id}");
            actions.push(TrackerAction::Event(TrackerEvent::Matched {
                req: other,
                res: id.clone(),
            }));
        }
        actions
    }

    /// A frame from a connected client.
    pub fn handle_message(&mut self, conn: ConnId, msg: SignalMessage) -> Vec<TrackerAction> {
        let Some(me) = self.by_conn.get(&conn).cloned() else {
            return vec![];
        };
        match msg {
            SignalMessage::Session => self.match_offers(&me),
            SignalMessage::Request { req, res, request } => {
                if req != me {
                    return self.violation(&me, "request from a client that is not req");
                }
                let to = res.clone();
                self.relay(&me, &to, SignalMessage::Request { req, res, request })
            }
            SignalMessage::Response { req, res, response } => {
                if res != me {
                    return self.violation(&me, "response from a client that is not res");
                }
                let to = req.clone();
                self.relay(&me, &to, SignalMessage::Response { req, res, response })
            }
            SignalMessage::Proc { req, res } => {
                if req != me {
                    return self.violation(&me, "proc from a client that is not req");
                }
                self.complete(&me, &res)
            }
            SignalMessage::Pong => {
                if let Some(session) = self.clients.get_mut(&me) {
                    session.active = true;
                }
                vec![]
            }
            SignalMessage::Ping => vec![TrackerAction::Send {
                conn,
                msg: SignalMessage::Pong,
            }],
            other => {
                tracing::debug!("{me}: ignoring unexpected {other:?}");
                vec![]
            }
        }
    }

    /// Forward a handshake step from `from` to its pending counterpart `to`.
    fn relay(&mut self, from: &PeerId, to: &PeerId, msg: SignalMessage) -> Vec<TrackerAction> {
        let pending = self.clients.get(from).is_some_and(|c| c.pending.contains(to));
        match self.clients.get(to) {
            Some(target) if pending => vec![TrackerAction::Send {
                conn: target.conn,
                msg,
            }],
            _ => self.interrupt(from, to),
        }
    }

    fn interrupt(&mut self, who: &PeerId, with: &PeerId) -> Vec<TrackerAction> {
        if let Some(them) = self.clients.get_mut(with) {
            them.pending.shift_remove(who);
        }
        let Some(session) = self.clients.get_mut(who) else {
            return vec![];
        };
        session.pending.shift_remove(with);
        let mut actions = vec![
            TrackerAction::Send {
                conn: session.conn,
                msg: SignalMessage::Interrupt { id: with.clone() },
            },
            TrackerAction::Event(TrackerEvent::Interrupted {
                id: who.clone(),
                with: with.clone(),
            }),
        ];
        actions.extend(self.match_offers(who));
        actions
    }

    /// `req` acknowledged the handshake with `res`.
    fn complete(&mut self, req: &PeerId, res: &PeerId) -> Vec<TrackerAction> {
        let pending = self.clients.get(req).is_some_and(|c| c.pending.contains(res));
        if !pending {
            return self.interrupt(req, res);
        }
        let mut actions = Vec::new();
        if let Some(them) = self.clients.get_mut(res) {
            actions.push(TrackerAction::Send {
                conn: them.conn,
                msg: SignalMessage::Shake,
            });
            them.pending.shift_remove(req);
            them.completed.insert(req.clone());
            if self.signal_limit > 0 && them.completed.len() >= self.signal_limit {
                actions.push(TrackerAction::Close { conn: them.conn });
            }
        }
        if let Some(me) = self.clients.get_mut(req) {
            me.pending.shift_remove(res);
            me.completed.insert(res.clone());
            if self.signal_limit > 0 && me.completed.len() >= self.signal_limit {
                actions.push(TrackerAction::Close { conn: me.conn });
            }
        }
        actions.push(TrackerAction::Event(TrackerEvent::Completed {
            req: req.clone(),
            res: res.clone(),
        }));
        actions
    }

    fn violation(&mut self, id: &PeerId, reason: &str) -> Vec<TrackerAction> {
        tracing::warn!("{id}: {reason}");
        vec![TrackerAction::Event(TrackerEvent::Violation {
            id: id.clone(),
            reason: reason.to_string(),
        })]
    }

    /// A client socket is gone. Interrupts and re-matches its counterparts.
    pub fn disconnect(&mut self, conn: ConnId) -> Vec<TrackerAction> {
        let Some(id) = self.by_conn.remove(&conn) else {
            return vec![];
        };
        let Some(session) = self.clients.remove(&id) else {
            return vec![];
        };
        if let Some(pool) = self.offers.get_mut(&session.topic) {
            pool.shift_remove(&id);
        }

        let mut actions = Vec::new();
        for other in &session.pending {
            let Some(them) = self.clients.get_mut(other) else {
                continue;
            };
            them.pending.shift_remove(&id);
            actions.push(TrackerAction::Send {
                conn: them.conn,
                msg: SignalMessage::Interrupt { id: id.clone() },
            });
            actions.push(TrackerAction::Event(TrackerEvent::Interrupted {
                id: other.clone(),
                with: id.clone(),
            }));
            actions.extend(self.match_offers(other));
        }
        actions.push(TrackerAction::Event(TrackerEvent::Disconnected { id }));
        actions
    }

    /// Liveness check: close clients silent since the last tick, ping the rest.
    pub fn check_clients(&mut self) -> Vec<TrackerAction> {
        let mut actions = Vec::new();
        for session in self.clients.values_mut() {
            if !session.active {
                actions.push(TrackerAction::Close { conn: session.conn });
                continue;
            }
            session.active = false;
            actions.push(TrackerAction::Send {
                conn: session.conn,
                msg: SignalMessage::Ping,
            });
        }
        actions
    }
}

fn reject(conn: ConnId, reason: RejectReason) -> Vec<TrackerAction> {
    vec![
        TrackerAction::Send {
            conn,
            msg: SignalMessage::Error {
                error: reason.to_string(),
            },
        },
        TrackerAction::Close { conn },
        TrackerAction::Event(TrackerEvent::Rejected { conn, reason }),
    ]
}
