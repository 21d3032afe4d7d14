//! Search and session relaying between mesh agents.
//!
//! A discovery walks the mesh hop by hop until some agent with spare
//! capacity accepts it (`beforeSearch` → `afterSearch`), backtracking with
//! `nonmsg` out of dead ends. The two ends then exchange descriptors along
//! the same path (`beforeSession` → `afterSession`). Every relaying hop keeps
//! a [`SearchState`] naming the channel the search came from (`start_relay`)
//! and the one it went to (`stop_relay`); frames are only ever forwarded
//! between that pair. `abort` tears the path down from either side and is
//! safe to replay.

use std::collections::BTreeMap;

use rand::seq::IndexedRandom;
use rand::Rng;
use tracing::{debug, warn};

use crate::agent::{AgentAction, AgentEvent, ChannelOrigin, DataChannel, MeshAgent, PendingDiscovery, SignalStep};
use crate::message::{MeshMessage, SearchFrame};
use crate::store::{SearchState, SearchStore, StoreError};
use crate::types::PeerId;

/// Random untried candidate, preferring those `useful` accepts.
pub fn pick_untried<R: Rng + ?Sized>(
    candidates: &[PeerId],
    tried: &[PeerId],
    useful: impl Fn(&PeerId) -> bool,
    rng: &mut R,
) -> Option<PeerId> {
    let fresh: Vec<&PeerId> = candidates.iter().filter(|c| !tried.contains(c)).collect();
    let preferred: Vec<&PeerId> = fresh.iter().copied().filter(|c| useful(c)).collect();
    let pool = if preferred.is_empty() { &fresh } else { &preferred };
    pool.choose(rng).map(|c| (*c).clone())
}

/// `peer` may lead somewhere new: some other connected channel of ours is
/// not among the peers it reported.
fn adds_reach(channels: &BTreeMap<PeerId, DataChannel>, peer: &PeerId) -> bool {
    let Some(candidate) = channels.get(peer) else {
        return false;
    };
    channels
        .values()
        .any(|c| c.connected && c.peer != *peer && !candidate.neighbors.contains(&c.peer))
}

impl<S: SearchStore> MeshAgent<S> {
    /// Connected hop not yet tried and not in `exclude`.
    pub(crate) fn next_hop(&mut self, tried: &[PeerId], exclude: &[&PeerId]) -> Option<PeerId> {
        let candidates: Vec<PeerId> = self
            .channels
            .values()
            .filter(|c| c.connected && !exclude.contains(&&c.peer))
            .map(|c| c.peer.clone())
            .collect();
        let channels = &self.channels;
        pick_untried(&candidates, tried, |p| adds_reach(channels, p), &mut self.rng)
    }

    /// Look for one more peer through the mesh; falls back to the tracker
    /// when no channel can carry the search.
    pub fn begin_discovery(&mut self) -> Vec<AgentAction> {
        if !self.is_running() || self.room() == 0 {
            return Vec::new();
        }
        let mut discovery = PendingDiscovery::new(self.id.clone());
        match self.next_hop(&[], &[]) {
            Some(hop) => {
                discovery.tried.push(hop.clone());
                discovery.relay = Some(hop.clone());
                let frame = discovery.frame();
                debug!(id = %frame.id, ?hop, "discovery started");
                self.temps.insert(discovery.id.clone(), discovery);
                vec![AgentAction::mesh(&hop, MeshMessage::BeforeSearch(frame))]
            }
            None => self.request_matches(false),
        }
    }

    pub(crate) async fn before_search(&mut self, from: &PeerId, frame: SearchFrame) -> Vec<AgentAction> {
        let nonmsg = || vec![AgentAction::mesh(from, MeshMessage::Nonmsg(frame.bare()))];

        if frame.start == self.id || self.temps.contains_key(&frame.id) {
            return nonmsg();
        }

        if self.is_running() && self.room() > 0 && !self.knows(&frame.start) {
            debug!(id = %frame.id, start = ?frame.start, "accepting search");
            let peer = frame.start.clone();
            self.signals.insert(
                peer.clone(),
                SignalStep::Target {
                    frame: frame.bare(),
                    relay: from.clone(),
                },
            );
            return vec![AgentAction::CreateChannel {
                peer,
                initiator: true,
                remote: None,
            }];
        }

        match self.store.get(&frame.id).await {
            Ok(Some(_)) => return nonmsg(),
            Ok(None) => {}
            Err(e) => return self.persist_failed(e, &frame, &[from]),
        }
        if frame.hops >= self.config.max_search_hops {
            debug!(id = %frame.id, hops = frame.hops, "search hop limit");
            return nonmsg();
        }

        let state = SearchState::new(frame.id.clone(), frame.start.clone(), from.clone(), frame.hops);
        if let Err(e) = self.store.create(&state).await {
            return self.persist_failed(e, &frame, &[from]);
        }
        if let Some(ch) = self.channels.get_mut(from) {
            ch.relaying.insert(frame.id.clone());
        }
        self.forward_search(state, &frame).await
    }

    /// Send a relayed search to a fresh hop, or back out of a dead end.
    async fn forward_search(&mut self, mut state: SearchState, frame: &SearchFrame) -> Vec<AgentAction> {
        let hop = self.next_hop(&state.tried, &[&state.start_relay, &state.start]);
        match hop {
            Some(hop) => {
                state.tried.push(hop.clone());
                state.stop_relay = Some(hop.clone());
                if let Err(e) = self.store.put(&state).await {
                    let mut actions = self.forget(&state.id).await;
                    actions.extend(self.persist_failed(e, frame, &[&state.start_relay]));
                    return actions;
                }
                let next = SearchFrame {
                    hops: state.hops + 1,
                    ..frame.bare()
                };
                debug!(id = %state.id, ?hop, hops = next.hops, "search forwarded");
                vec![AgentAction::mesh(&hop, MeshMessage::BeforeSearch(next))]
            }
            None => {
                debug!(id = %state.id, "search dead end");
                let mut actions = Vec::new();
                if self.is_connected(&state.start_relay) {
                    actions.push(AgentAction::mesh(&state.start_relay, MeshMessage::Nonmsg(frame.bare())));
                }
                actions.extend(self.forget(&state.id).await);
                actions
            }
        }
    }

    pub(crate) async fn nonmsg(&mut self, from: &PeerId, frame: SearchFrame) -> Vec<AgentAction> {
        if let Some(discovery) = self.temps.get(&frame.id) {
            if discovery.relay.as_ref() != Some(from) {
                debug!(id = %frame.id, ?from, "stale nonmsg");
                return Vec::new();
            }
            let tried = discovery.tried.clone();
            return match self.next_hop(&tried, &[]) {
                Some(hop) => {
                    let Some(discovery) = self.temps.get_mut(&frame.id) else {
                        return Vec::new();
                    };
                    discovery.tried.push(hop.clone());
                    discovery.relay = Some(hop.clone());
                    vec![AgentAction::mesh(&hop, MeshMessage::BeforeSearch(discovery.frame()))]
                }
                None => {
                    debug!(id = %frame.id, "discovery exhausted every hop");
                    self.temps.remove(&frame.id);
                    // Walking the same mesh again would only repeat this.
                    self.request_matches(false)
                }
            };
        }

        let state = match self.store.get(&frame.id).await {
            Ok(Some(state)) => state,
            Ok(None) => return Vec::new(),
            Err(e) => return self.lost_track(e, &frame, from),
        };
        if state.stop_relay.as_ref() != Some(from) {
            debug!(id = %frame.id, ?from, "stale nonmsg");
            return Vec::new();
        }
        if !self.is_connected(&state.start_relay) {
            return self.forget(&state.id).await;
        }
        let frame = SearchFrame {
            hops: state.hops,
            ..frame.bare()
        };
        self.forward_search(state, &frame).await
    }

    pub(crate) async fn after_search(&mut self, from: &PeerId, frame: SearchFrame) -> Vec<AgentAction> {
        let abort = |to: &PeerId| AgentAction::mesh(to, MeshMessage::Abort(frame.bare()));

        if frame.start == self.id {
            let Some(discovery) = self.temps.remove(&frame.id) else {
                return vec![abort(from)];
            };
            let (Some(stop), Some(data)) = (frame.stop.clone(), frame.data.clone()) else {
                warn!(id = %frame.id, "afterSearch without stop or descriptor");
                return vec![abort(from)];
            };
            if discovery.relay.as_ref() != Some(from) || stop == self.id || self.knows(&stop) {
                warn!(id = %frame.id, ?from, "afterSearch rejected");
                return vec![abort(from)];
            }
            debug!(id = %frame.id, ?stop, "discovery found a peer");
            self.signals.insert(
                stop.clone(),
                SignalStep::Origin {
                    frame: frame.bare(),
                    relay: from.clone(),
                },
            );
            return vec![AgentAction::CreateChannel {
                peer: stop,
                initiator: false,
                remote: Some(data),
            }];
        }

        let mut state = match self.store.get(&frame.id).await {
            Ok(Some(state)) => state,
            Ok(None) => return vec![abort(from)],
            Err(e) => return self.lost_track(e, &frame, from),
        };
        if state.stop_relay.as_ref() != Some(from) || !self.is_connected(&state.start_relay) {
            warn!(id = %frame.id, ?from, "afterSearch off the recorded path");
            let mut actions = vec![abort(from)];
            actions.extend(self.forget(&state.id).await);
            return actions;
        }

        state.stop = frame.stop.clone();
        if let Err(e) = self.store.put(&state).await {
            let mut actions = self.forget(&state.id).await;
            actions.extend(self.persist_failed(e, &frame, &[from, &state.start_relay]));
            return actions;
        }
        if let Some(ch) = self.channels.get_mut(from) {
            ch.relaying.insert(frame.id.clone());
        }
        vec![AgentAction::mesh(&state.start_relay, MeshMessage::AfterSearch(frame))]
    }

    pub(crate) async fn before_session(&mut self, from: &PeerId, frame: SearchFrame) -> Vec<AgentAction> {
        let abort = |to: &PeerId| AgentAction::mesh(to, MeshMessage::Abort(frame.bare()));

        // We are the target holding a half-open channel for this search.
        let target = self.channels.get(&frame.start).and_then(|ch| {
            ch.bootstrap
                .as_ref()
                .filter(|meta| meta.id == frame.id && !ch.connected)
                .map(|meta| meta.relay.clone())
        });
        if let Some(relay) = target {
            return match (&relay == from, frame.data.clone()) {
                (true, Some(descriptor)) => vec![AgentAction::ApplyRemote {
                    peer: frame.start.clone(),
                    descriptor,
                }],
                _ => {
                    warn!(id = %frame.id, ?from, "beforeSession off the recorded path");
                    let mut actions = vec![abort(from)];
                    if let Some(ch) = self.channels.get_mut(&frame.start) {
                        ch.bootstrap = None;
                    }
                    actions.extend(self.drop_channel(&frame.start).await);
                    actions
                }
            };
        }

        let state = match self.store.get(&frame.id).await {
            Ok(Some(state)) => state,
            Ok(None) => return vec![abort(from)],
            Err(e) => return self.lost_track(e, &frame, from),
        };
        let stop_relay = match state.stop_relay.clone() {
            Some(hop) if *from == state.start_relay && self.is_connected(&hop) => hop,
            _ => {
                warn!(id = %frame.id, ?from, "beforeSession off the recorded path");
                let mut actions = vec![abort(from)];
                actions.extend(self.forget(&state.id).await);
                return actions;
            }
        };
        vec![AgentAction::mesh(&stop_relay, MeshMessage::BeforeSession(frame))]
    }

    pub(crate) async fn after_session(&mut self, from: &PeerId, frame: SearchFrame) -> Vec<AgentAction> {
        match self.store.get(&frame.id).await {
            Ok(Some(state)) => {
                let mut actions = Vec::new();
                if let Some(other) = state.other_party(from) {
                    if self.is_connected(other) {
                        actions.push(AgentAction::mesh(other, MeshMessage::AfterSession(frame.bare())));
                    }
                }
                actions.extend(self.forget(&state.id).await);
                actions
            }
            Ok(None) => {
                // Both ends acknowledge; the second one finds nothing left.
                self.settle(&frame);
                Vec::new()
            }
            Err(e) => self.lost_track(e, &frame, from),
        }
    }

    /// Tear down a search or session. Replaying it is a no-op.
    pub(crate) async fn abort(&mut self, from: &PeerId, frame: SearchFrame) -> Vec<AgentAction> {
        match self.store.get(&frame.id).await {
            Ok(Some(state)) => {
                let mut actions = Vec::new();
                if let Some(other) = state.other_party(from) {
                    if self.is_connected(other) {
                        actions.push(AgentAction::mesh(other, MeshMessage::Abort(frame.bare())));
                    }
                }
                actions.extend(self.forget(&state.id).await);
                return actions;
            }
            Ok(None) => {}
            Err(e) => {
                return vec![AgentAction::Emit(AgentEvent::Error {
                    description: e.to_string(),
                })]
            }
        }

        if let Some(discovery) = self.temps.get(&frame.id) {
            if discovery.relay.as_ref() == Some(from) {
                self.temps.remove(&frame.id);
                return self.begin_discovery();
            }
            return Vec::new();
        }

        // A descriptor still being made for this search.
        let signalling = self.signals.iter().find_map(|(peer, step)| match step {
            SignalStep::Target { frame: f, relay } | SignalStep::Origin { frame: f, relay }
                if f.id == frame.id && relay == from =>
            {
                Some(peer.clone())
            }
            _ => None,
        });
        if let Some(peer) = signalling {
            debug!(id = %frame.id, ?peer, "bootstrap aborted before descriptor");
            return self.drop_channel(&peer).await;
        }

        let half_open = self.channels.values().find_map(|ch| {
            let meta = ch.bootstrap.as_ref()?;
            (meta.id == frame.id && meta.relay == *from).then(|| (ch.peer.clone(), ch.connected))
        });
        match half_open {
            Some((peer, connected)) => {
                if let Some(ch) = self.channels.get_mut(&peer) {
                    ch.bootstrap = None;
                    ch.timer.cancel();
                }
                if connected {
                    Vec::new()
                } else {
                    debug!(id = %frame.id, ?peer, "bootstrap aborted");
                    self.drop_channel(&peer).await
                }
            }
            None => Vec::new(),
        }
    }

    /// Clear bootstrap metadata for a completed session.
    fn settle(&mut self, frame: &SearchFrame) {
        let peer = if frame.start == self.id {
            frame.stop.clone()
        } else if frame.stop.as_ref() == Some(&self.id) {
            Some(frame.start.clone())
        } else {
            None
        };
        let Some(ch) = peer.and_then(|p| self.channels.get_mut(&p)) else {
            return;
        };
        if ch.origin == ChannelOrigin::Mesh && ch.bootstrap.as_ref().is_some_and(|m| m.id == frame.id) {
            ch.bootstrap = None;
        }
    }

    /// The record for `frame` could not be read. Abort toward `from` and every
    /// channel still relaying the search.
    fn lost_track(&mut self, e: StoreError, frame: &SearchFrame, from: &PeerId) -> Vec<AgentAction> {
        let mut parties = vec![from.clone()];
        for (peer, ch) in self.channels.iter_mut() {
            if ch.relaying.remove(&frame.id) && peer != from {
                parties.push(peer.clone());
            }
        }
        let parties: Vec<&PeerId> = parties.iter().collect();
        self.persist_failed(e, frame, &parties)
    }

    /// The search can no longer be tracked: abort it toward `parties`.
    fn persist_failed(&self, e: StoreError, frame: &SearchFrame, parties: &[&PeerId]) -> Vec<AgentAction> {
        warn!(id = %frame.id, "search state unavailable: {e}");
        let mut actions = vec![AgentAction::Emit(AgentEvent::Error {
            description: e.to_string(),
        })];
        for party in parties {
            if self.is_connected(party) {
                actions.push(AgentAction::mesh(party, MeshMessage::Abort(frame.bare())));
            }
        }
        actions
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.channels.get(peer).is_some_and(|c| c.connected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::message::{ChannelFrame, Descriptor};
    use crate::store::MemoryStore;
    use crate::types::RequestId;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    fn peer(s: &str) -> PeerId {
        PeerId::new(s)
    }

    fn agent(id: &str, max: usize) -> MeshAgent<MemoryStore> {
        let config = AgentConfig::new("127.0.0.1:10509", "topic")
            .id(peer(id))
            .max_channels(max)
            .rng_seed(3);
        let mut agent = MeshAgent::new(config, MemoryStore::new());
        agent.begin();
        agent
    }

    fn connect(agent: &mut MeshAgent<MemoryStore>, other: &str) {
        agent
            .channels
            .insert(peer(other), DataChannel::new(peer(other), ChannelOrigin::Tracker));
        agent.on_channel_connected(&peer(other));
    }

    fn frame(id: &str, start: &str) -> SearchFrame {
        SearchFrame::new(RequestId::new(id), peer(start))
    }

    fn mesh_to(actions: &[AgentAction]) -> Vec<(PeerId, MeshMessage)> {
        actions
            .iter()
            .filter_map(|a| match a {
                AgentAction::ChannelSend {
                    peer,
                    frame: ChannelFrame::Mesh(msg),
                } => Some((peer.clone(), msg.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn pick_prefers_useful_candidates() {
        let mut rng = StdRng::seed_from_u64(1);
        let candidates = [peer("a"), peer("b"), peer("c")];
        for _ in 0..20 {
            let pick = pick_untried(&candidates, &[], |p| *p == peer("b"), &mut rng);
            assert_eq!(pick, Some(peer("b")));
        }
    }

    #[test]
    fn pick_falls_back_to_any_untried() {
        let mut rng = StdRng::seed_from_u64(1);
        let candidates = [peer("a"), peer("b")];
        let pick = pick_untried(&candidates, &[peer("a")], |_| false, &mut rng);
        assert_eq!(pick, Some(peer("b")));
        assert_eq!(pick_untried(&candidates, &candidates, |_| true, &mut rng), None);
    }

    proptest! {
        #[test]
        fn pick_never_returns_tried_or_foreign(
            names in proptest::collection::btree_set("[a-f]{1,3}", 0..8),
            tried_mask in proptest::collection::vec(any::<bool>(), 8),
            seed in any::<u64>(),
        ) {
            let candidates: Vec<PeerId> = names.iter().map(|n| PeerId::new(n.as_str())).collect();
            let tried: Vec<PeerId> = candidates
                .iter()
                .zip(tried_mask.iter())
                .filter(|(_, t)| **t)
                .map(|(c, _)| c.clone())
                .collect();
            let mut rng = StdRng::seed_from_u64(seed);
            match pick_untried(&candidates, &tried, |p| p.as_str().len() == 1, &mut rng) {
                Some(p) => {
                    prop_assert!(candidates.contains(&p));
                    prop_assert!(!tried.contains(&p));
                }
                None => prop_assert!(candidates.iter().all(|c| tried.contains(c))),
            }
        }
    }

    #[tokio::test]
    async fn origin_replies_nonmsg_to_its_own_search() {
        let mut a = agent("a", 6);
        connect(&mut a, "b");
        let actions = a.before_search(&peer("b"), frame("r1", "a")).await;
        assert_eq!(mesh_to(&actions), vec![(peer("b"), MeshMessage::Nonmsg(frame("r1", "a")))]);
    }

    #[tokio::test]
    async fn agent_with_room_becomes_target() {
        let mut a = agent("a", 6);
        connect(&mut a, "hop");
        let actions = a.before_search(&peer("hop"), frame("r1", "origin")).await;
        assert_eq!(
            actions,
            vec![AgentAction::CreateChannel { peer: peer("origin"), initiator: true, remote: None }]
        );

        let actions = a.on_local_descriptor(&peer("origin"), Descriptor(json!("offer")), 1_000);
        let sent = mesh_to(&actions);
        match &sent[0] {
            (to, MeshMessage::AfterSearch(f)) => {
                assert_eq!(*to, peer("hop"));
                assert_eq!(f.stop, Some(peer("a")));
                assert_eq!(f.data, Some(Descriptor(json!("offer"))));
            }
            other => panic!("unexpected {other:?}"),
        }
        let ch = a.channel(&peer("origin")).unwrap();
        assert!(ch.timer.is_armed());
        assert!(ch.timer.is_expired(61_000));
    }

    #[tokio::test]
    async fn full_agent_relays_and_records_state() {
        let mut a = agent("a", 2);
        connect(&mut a, "left");
        connect(&mut a, "right");
        let actions = a.before_search(&peer("left"), frame("r1", "origin")).await;
        let sent = mesh_to(&actions);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, peer("right"));
        assert!(matches!(&sent[0].1, MeshMessage::BeforeSearch(f) if f.hops == 1));

        let state = a.store().get(&RequestId::new("r1")).await.unwrap().unwrap();
        assert_eq!(state.start_relay, peer("left"));
        assert_eq!(state.stop_relay, Some(peer("right")));
        assert!(a.channel(&peer("left")).unwrap().relaying.contains(&RequestId::new("r1")));
    }

    #[tokio::test]
    async fn hop_limit_backtracks_without_state() {
        let mut a = agent("a", 2);
        connect(&mut a, "left");
        connect(&mut a, "right");
        let mut f = frame("r1", "origin");
        f.hops = 8;
        let actions = a.before_search(&peer("left"), f.clone()).await;
        assert_eq!(mesh_to(&actions), vec![(peer("left"), MeshMessage::Nonmsg(f))]);
        assert!(a.store().is_empty());
    }

    #[tokio::test]
    async fn nonmsg_from_stale_hop_is_ignored() {
        let mut a = agent("a", 2);
        connect(&mut a, "left");
        connect(&mut a, "right");
        a.before_search(&peer("left"), frame("r1", "origin")).await;
        assert!(a.nonmsg(&peer("left"), frame("r1", "origin")).await.is_empty());
        assert_eq!(a.store().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_relay_backtracks_and_forgets() {
        let mut a = agent("a", 2);
        connect(&mut a, "left");
        connect(&mut a, "right");
        a.before_search(&peer("left"), frame("r1", "origin")).await;
        let actions = a.nonmsg(&peer("right"), frame("r1", "origin")).await;
        assert_eq!(
            mesh_to(&actions),
            vec![(peer("left"), MeshMessage::Nonmsg(frame("r1", "origin")))]
        );
        assert!(a.store().is_empty());
        assert!(a.channel(&peer("left")).unwrap().relaying.is_empty());
    }

    #[tokio::test]
    async fn persistence_failure_aborts_toward_sender() {
        let mut a = agent("a", 2);
        connect(&mut a, "left");
        connect(&mut a, "right");
        a.store().set_fail_writes(true);
        let actions = a.before_search(&peer("left"), frame("r1", "origin")).await;
        assert!(matches!(&actions[0], AgentAction::Emit(AgentEvent::Error { .. })));
        assert_eq!(
            mesh_to(&actions),
            vec![(peer("left"), MeshMessage::Abort(frame("r1", "origin")))]
        );
    }

    #[tokio::test]
    async fn unreadable_state_aborts_both_sides() {
        let mut a = agent("a", 2);
        connect(&mut a, "left");
        connect(&mut a, "right");
        a.before_search(&peer("left"), frame("r1", "origin")).await;

        a.store().set_fail_reads(true);
        let actions = a.nonmsg(&peer("right"), frame("r1", "origin")).await;
        assert!(matches!(&actions[0], AgentAction::Emit(AgentEvent::Error { .. })));
        let sent = mesh_to(&actions);
        assert_eq!(sent.len(), 2);
        assert!(sent.contains(&(peer("left"), MeshMessage::Abort(frame("r1", "origin")))));
        assert!(sent.contains(&(peer("right"), MeshMessage::Abort(frame("r1", "origin")))));
        assert!(a.channel(&peer("left")).unwrap().relaying.is_empty());
    }

    #[tokio::test]
    async fn unreadable_session_aborts_both_relays() {
        let mut a = agent("a", 2);
        connect(&mut a, "left");
        connect(&mut a, "right");
        a.before_search(&peer("left"), frame("r1", "origin")).await;
        let mut found = frame("r1", "origin");
        found.stop = Some(peer("z"));
        found.data = Some(Descriptor(json!("offer")));
        a.after_search(&peer("right"), found).await;

        a.store().set_fail_reads(true);
        let actions = a.after_session(&peer("left"), frame("r1", "origin")).await;
        let sent = mesh_to(&actions);
        assert!(sent.contains(&(peer("left"), MeshMessage::Abort(frame("r1", "origin")))));
        assert!(sent.contains(&(peer("right"), MeshMessage::Abort(frame("r1", "origin")))));
    }

    #[tokio::test]
    async fn lost_create_race_aborts_instead_of_backtracking() {
        let mut a = agent("a", 2);
        connect(&mut a, "left");
        connect(&mut a, "right");
        a.store().lose_create_races(1);
        let actions = a.before_search(&peer("left"), frame("r1", "origin")).await;
        assert_eq!(
            mesh_to(&actions),
            vec![(peer("left"), MeshMessage::Abort(frame("r1", "origin")))]
        );
        assert!(a.channel(&peer("left")).unwrap().relaying.is_empty());
    }

    #[tokio::test]
    async fn after_search_from_wrong_relay_aborts_discovery() {
        let mut a = agent("a", 6);
        connect(&mut a, "b");
        connect(&mut a, "c");
        a.begin_discovery();
        let discovery = a.discoveries().next().unwrap().clone();
        let wrong = if discovery.relay == Some(peer("b")) { "c" } else { "b" };

        let mut f = discovery.frame();
        f.stop = Some(peer("z"));
        f.data = Some(Descriptor(json!("offer")));
        let actions = a.after_search(&peer(wrong), f).await;
        assert!(matches!(&mesh_to(&actions)[0], (to, MeshMessage::Abort(_)) if *to == peer(wrong)));
        assert_eq!(a.tracks().temp, 0);
    }

    #[tokio::test]
    async fn abort_is_forwarded_once_and_replay_is_noop() {
        let mut a = agent("a", 2);
        connect(&mut a, "left");
        connect(&mut a, "right");
        a.before_search(&peer("left"), frame("r1", "origin")).await;

        let actions = a.abort(&peer("left"), frame("r1", "origin")).await;
        assert_eq!(
            mesh_to(&actions),
            vec![(peer("right"), MeshMessage::Abort(frame("r1", "origin")))]
        );
        assert!(a.store().is_empty());

        assert!(a.abort(&peer("left"), frame("r1", "origin")).await.is_empty());
        assert!(a.abort(&peer("right"), frame("r1", "origin")).await.is_empty());
    }

    #[tokio::test]
    async fn closing_a_channel_aborts_relayed_searches() {
        let mut a = agent("a", 2);
        connect(&mut a, "left");
        connect(&mut a, "right");
        a.before_search(&peer("left"), frame("r1", "origin")).await;

        let actions = a.on_channel_closed(&peer("left")).await;
        assert!(mesh_to(&actions).contains(&(peer("right"), MeshMessage::Abort(frame("r1", "origin")))));
        assert!(a.store().is_empty());
    }
}
