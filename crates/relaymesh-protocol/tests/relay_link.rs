/// Integration tests: two tracker nodes linking over the relay route and
/// redirecting clients to each other when one is full.
///
/// Pure in-memory simulation: the transport is replaced by a queue of
/// events between two `NodeState`s.
use std::collections::VecDeque;

use relaymesh_dht::PeerFound;
use relaymesh_protocol::{
    ConnId, InfoHash, LimitConfig, NodeConfig, NodeEffect, NodeEvent, NodeState,
};
use relaymesh_transport::{Route, TransportEvent};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Side {
    A,
    B,
}

struct Pair {
    a: NodeState,
    b: NodeState,
    /// The relay link as each side addresses it.
    link: Option<(ConnId, ConnId)>,
    queue: VecDeque<(Side, TransportEvent)>,
    /// Frames sent to anything that is not the relay link.
    to_clients: Vec<(ConnId, serde_json::Value)>,
    evs: Vec<String>,
}

fn config(host: &str, limit: usize) -> NodeConfig {
    NodeConfig::new(host).hash("movies").limit(LimitConfig {
        client_connections: limit,
        ..LimitConfig::default()
    })
}

impl Pair {
    fn new(limit: usize) -> Self {
        let mut a = NodeState::new(config("10.0.0.1", limit));
        let mut b = NodeState::new(config("10.0.0.2", limit));
        a.boot();
        b.boot();
        Self {
            a,
            b,
            link: None,
            queue: VecDeque::new(),
            to_clients: Vec::new(),
            evs: Vec::new(),
        }
    }

    fn node(&mut self, side: Side) -> &mut NodeState {
        match side {
            Side::A => &mut self.a,
            Side::B => &mut self.b,
        }
    }

    fn pump(&mut self, side: Side, effects: Vec<NodeEffect>) {
        for effect in effects {
            match effect {
                NodeEffect::Send { conn, text } => match self.link {
                    Some((ca, cb)) if side == Side::A && conn == ca => {
                        self.queue.push_back((Side::B, TransportEvent::Message { conn: cb, text }))
                    }
                    Some((ca, cb)) if side == Side::B && conn == cb => {
                        self.queue.push_back((Side::A, TransportEvent::Message { conn: ca, text }))
                    }
                    _ => self
                        .to_clients
                        .push((conn, serde_json::from_str(&text).unwrap())),
                },
                NodeEffect::Dial { conn, url } => {
                    assert_eq!(side, Side::A, "only A dials in these tests");
                    let url = url::Url::parse(&url).unwrap();
                    let route = Route::parse(url.path(), url.query());
                    let accepted = ConnId::fresh();
                    self.link = Some((conn, accepted));
                    self.queue.push_back((
                        Side::B,
                        TransportEvent::Accepted {
                            conn: accepted,
                            route,
                        },
                    ));
                    self.queue.push_back((Side::A, TransportEvent::Opened { conn }));
                }
                NodeEffect::Emit(NodeEvent::Ev { description }) => self.evs.push(description),
                _ => {}
            }
        }
    }

    fn deliver(&mut self, side: Side, event: TransportEvent) {
        self.queue.push_back((side, event));
        self.run();
    }

    fn run(&mut self) {
        while let Some((side, event)) = self.queue.pop_front() {
            let effects = self.node(side).handle_transport(event, 0);
            self.pump(side, effects);
        }
    }

    fn link_up(&mut self) {
        let found = PeerFound {
            addr: "10.0.0.2:10509".parse().unwrap(),
            info_hash: InfoHash::from_topic("movies"),
        };
        let effects = self.a.handle_peer_found(found, 0);
        self.pump(Side::A, effects);
        self.run();
    }

    /// A client connects to `side`; returns its connection.
    fn client(&mut self, side: Side, id: &str) -> ConnId {
        let conn = ConnId::fresh();
        self.deliver(
            side,
            TransportEvent::Accepted {
                conn,
                route: Route::Signal {
                    hash: Some("movies".into()),
                    id: Some(id.into()),
                },
            },
        );
        conn
    }

    fn relay_frame(&self, conn: ConnId) -> Option<serde_json::Value> {
        self.to_clients
            .iter()
            .find(|(c, f)| *c == conn && f["action"] == "relay")
            .map(|(_, f)| f["relay"].clone())
    }
}

#[test]
fn dht_peer_becomes_relay_link() {
    let mut pair = Pair::new(0);
    pair.link_up();

    assert_eq!(pair.a.stats().relay_links.get(), 1);
    assert_eq!(pair.b.stats().relay_links.get(), 1);
    assert_eq!(pair.a.stats().links_opened.get(), 1);
    assert_eq!(pair.b.stats().links_opened.get(), 1);
    assert_eq!(
        pair.evs.iter().filter(|e| e.contains("joined")).count(),
        2
    );
}

#[test]
fn full_node_redirects_to_linked_relay() {
    let mut pair = Pair::new(1);
    pair.link_up();

    pair.client(Side::B, "x");
    let y = pair.client(Side::B, "y");
    assert_eq!(
        pair.relay_frame(y),
        Some(serde_json::Value::String("10.0.0.1:10509".into()))
    );
    assert!(pair.b.is_shed());
}

#[test]
fn closed_listener_is_not_offered_for_redirects() {
    let mut pair = Pair::new(1);
    pair.link_up();

    // B announces its listener is down.
    pair.deliver(Side::B, TransportEvent::ListenerClosed);

    pair.client(Side::A, "x");
    let y = pair.client(Side::A, "y");
    assert_eq!(pair.relay_frame(y), Some(serde_json::Value::Null));

    // Back up: A may send clients there again.
    pair.deliver(
        Side::B,
        TransportEvent::Listening {
            addr: "10.0.0.2:10509".parse().unwrap(),
        },
    );
    let z = pair.client(Side::A, "z");
    assert_eq!(
        pair.relay_frame(z),
        Some(serde_json::Value::String("10.0.0.2:10509".into()))
    );
}

#[test]
fn dropped_link_leaves_both_sides() {
    let mut pair = Pair::new(0);
    pair.link_up();
    let (ca, cb) = pair.link.unwrap();

    pair.deliver(Side::A, TransportEvent::Closed { conn: ca });
    pair.deliver(Side::B, TransportEvent::Closed { conn: cb });
    assert_eq!(pair.a.stats().relay_links.get(), 0);
    assert_eq!(pair.b.stats().relay_links.get(), 0);
    assert_eq!(pair.a.stats().links_closed.get(), 1);
}
