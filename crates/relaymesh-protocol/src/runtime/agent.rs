/// Agent runtime: drives a [`MeshAgent`] over a tracker socket and a
/// data-channel connector.
///
/// One task owns the agent. The tracker socket is an outbound transport
/// connection; channel attempts are created on spawned tasks whose
/// descriptors come back through an internal queue, so a slow connector
/// never blocks signalling.
use std::sync::Arc;
use std::time::Duration;

use relaymesh_transport::TransportEvent;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Instant};

use crate::agent::{AgentAction, AgentEvent, MeshAgent, Tracks};
use crate::error::RelayMeshError;
use crate::message::{Descriptor, SignalMessage};
use crate::store::SearchStore;
use crate::types::{now_ms, ConnId, PeerId};

use super::connector::{ChannelEvent, PeerConnector};
use super::executor::publish;
use super::transport::Transport;

/// Parked deadline for the reconnect timer.
const FAR: Duration = Duration::from_secs(86_400 * 365);

/// How often half-open channels are checked against their deadline.
const BOOTSTRAP_TICK: Duration = Duration::from_secs(1);

// ── Commands (app → runtime) ──────────────────────────────────────────

pub enum AgentCommand {
    /// Application payload to one connected peer.
    Send { peer: PeerId, text: String },
    /// Application payload to every connected peer.
    Broadcast { text: String },
    /// Re-flood a payload received from `from`.
    MeshForward { from: PeerId, text: String },
    Begin,
    End,
    Tracks { reply: oneshot::Sender<Tracks> },
    Shutdown,
}

// ── AgentHandle (app-facing API) ─────────────────────────────────────

/// Handle to a running agent. Cheap to clone.
#[derive(Clone)]
pub struct AgentHandle {
    cmd_tx: mpsc::Sender<AgentCommand>,
    local_id: PeerId,
}

impl AgentHandle {
    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Queue a payload for `peer`. Refusals come back as
    /// [`AgentEvent::Error`].
    pub async fn send(&self, peer: PeerId, text: impl Into<String>) -> Result<(), RelayMeshError> {
        self.command(AgentCommand::Send {
            peer,
            text: text.into(),
        })
        .await
    }

    pub async fn broadcast(&self, text: impl Into<String>) -> Result<(), RelayMeshError> {
        self.command(AgentCommand::Broadcast { text: text.into() }).await
    }

    pub async fn mesh_forward(&self, from: PeerId, text: impl Into<String>) -> Result<(), RelayMeshError> {
        self.command(AgentCommand::MeshForward {
            from,
            text: text.into(),
        })
        .await
    }

    pub async fn begin(&self) -> Result<(), RelayMeshError> {
        self.command(AgentCommand::Begin).await
    }

    pub async fn end(&self) -> Result<(), RelayMeshError> {
        self.command(AgentCommand::End).await
    }

    pub async fn tracks(&self) -> Tracks {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(AgentCommand::Tracks { reply: tx }).await.is_err() {
            return Tracks::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Graceful shutdown.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(AgentCommand::Shutdown).await;
    }

    async fn command(&self, cmd: AgentCommand) -> Result<(), RelayMeshError> {
        self.cmd_tx.send(cmd).await.map_err(|_| RelayMeshError::Shutdown)
    }
}

// ── AgentChannels ────────────────────────────────────────────────────

pub struct AgentChannels {
    pub handle: AgentHandle,
    pub events: mpsc::Receiver<AgentEvent>,
}

// ── AgentRuntime ─────────────────────────────────────────────────────

/// The agent runtime. Spawn it and talk to it over channels.
pub struct AgentRuntime;

impl AgentRuntime {
    /// Spawn the agent loop. `channel_events` is fed by whoever owns the
    /// connector's sockets.
    pub fn spawn<S, T, C>(
        agent: MeshAgent<S>,
        transport: T,
        connector: Arc<C>,
        channel_events: mpsc::Receiver<ChannelEvent>,
    ) -> AgentChannels
    where
        S: SearchStore + 'static,
        T: Transport + 'static,
        C: PeerConnector,
    {
        let local_id = agent.id().clone();
        let (cmd_tx, cmd_rx) = mpsc::channel::<AgentCommand>(64);
        let (event_tx, event_rx) = mpsc::channel::<AgentEvent>(256);

        let driver = Driver {
            transport,
            connector,
            tracker: None,
            event_tx,
            outcome_tx: None,
        };
        tokio::spawn(agent_loop(agent, driver, channel_events, cmd_rx));

        AgentChannels {
            handle: AgentHandle { cmd_tx, local_id },
            events: event_rx,
        }
    }
}

/// Result of work done off the loop.
enum Outcome {
    Descriptor {
        peer: PeerId,
        result: Result<Descriptor, String>,
    },
    Failed {
        peer: PeerId,
        description: String,
    },
}

/// Performs [`AgentAction`]s.
struct Driver<T, C> {
    transport: T,
    connector: Arc<C>,
    /// Connection carrying the tracker socket, once dialled.
    tracker: Option<ConnId>,
    event_tx: mpsc::Sender<AgentEvent>,
    outcome_tx: Option<mpsc::UnboundedSender<Outcome>>,
}

impl<T: Transport, C: PeerConnector> Driver<T, C> {
    async fn execute(&mut self, actions: Vec<AgentAction>) {
        for action in actions {
            match action {
                AgentAction::SignalSend(msg) => self.signal(&msg).await,
                AgentAction::ConnectTracker { url } => {
                    let conn = ConnId::fresh();
                    self.tracker = Some(conn);
                    self.transport.dial(conn, url);
                }
                AgentAction::CloseTracker => {
                    // Keep the id: the close still has to reach the agent.
                    if let Some(conn) = self.tracker {
                        self.transport.close(conn).await;
                    }
                }
                // Armed by the loop.
                AgentAction::ScheduleReconnect { .. } => {}
                AgentAction::CreateChannel {
                    peer,
                    initiator,
                    remote,
                } => {
                    let connector = self.connector.clone();
                    let outcome_tx = self.outcome_tx.clone();
                    tokio::spawn(async move {
                        let result = connector.create(&peer, initiator, remote).await;
                        if let Some(tx) = outcome_tx {
                            let _ = tx.send(Outcome::Descriptor { peer, result });
                        }
                    });
                }
                AgentAction::ApplyRemote { peer, descriptor } => {
                    if let Err(description) = self.connector.accept(&peer, descriptor).await {
                        self.fail(peer, description);
                    }
                }
                AgentAction::ChannelSend { peer, frame } => match frame.encode() {
                    Ok(text) => {
                        if let Err(description) = self.connector.send(&peer, text).await {
                            self.fail(peer, description);
                        }
                    }
                    Err(e) => self.emit(AgentEvent::Error {
                        description: e.to_string(),
                    }),
                },
                AgentAction::DestroyChannel { peer } => self.connector.destroy(&peer).await,
                AgentAction::Emit(event) => self.emit(event),
            }
        }
    }

    async fn signal(&mut self, msg: &SignalMessage) {
        let Some(conn) = self.tracker else {
            tracing::debug!(?msg, "no tracker socket, frame dropped");
            return;
        };
        match serde_json::to_string(msg) {
            Ok(text) => {
                if let Err(e) = self.transport.send_text(conn, text).await {
                    tracing::debug!("tracker send failed: {e}");
                }
            }
            Err(e) => self.emit(AgentEvent::Error {
                description: format!("encode tracker frame: {e}"),
            }),
        }
    }

    fn fail(&self, peer: PeerId, description: String) {
        if let Some(tx) = &self.outcome_tx {
            let _ = tx.send(Outcome::Failed { peer, description });
        }
    }

    fn emit(&self, event: AgentEvent) {
        publish(&self.event_tx, event);
    }
}

async fn agent_loop<S, T, C>(
    mut agent: MeshAgent<S>,
    mut driver: Driver<T, C>,
    mut channel_events: mpsc::Receiver<ChannelEvent>,
    mut cmd_rx: mpsc::Receiver<AgentCommand>,
) where
    S: SearchStore,
    T: Transport,
    C: PeerConnector,
{
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<Outcome>();
    driver.outcome_tx = Some(outcome_tx);

    let mut bootstrap = tokio::time::interval(BOOTSTRAP_TICK);
    // Skip the immediate first tick
    bootstrap.tick().await;

    let reconnect = sleep(FAR);
    tokio::pin!(reconnect);
    let mut reconnect_armed = false;

    loop {
        let actions = tokio::select! {
            // ── 1. Tracker socket ───────────────────────────────
            event = driver.transport.recv() => {
                match event {
                    Some(event) => tracker_event(&mut agent, &mut driver, event).await,
                    None => {
                        tracing::info!("transport closed, agent loop exiting");
                        break;
                    }
                }
            }

            // ── 2. Data channels ────────────────────────────────
            Some(event) = channel_events.recv() => match event {
                ChannelEvent::Connected { peer } => agent.on_channel_connected(&peer),
                ChannelEvent::Data { peer, text } => agent.on_channel_data(&peer, &text).await,
                ChannelEvent::Closed { peer } => agent.on_channel_closed(&peer).await,
                ChannelEvent::Error { peer, description } => {
                    agent.on_channel_error(&peer, description).await
                }
            },

            // ── 3. Off-loop results ─────────────────────────────
            Some(outcome) = outcome_rx.recv() => match outcome {
                Outcome::Descriptor { peer, result: Ok(descriptor) } => {
                    agent.on_local_descriptor(&peer, descriptor, now_ms())
                }
                Outcome::Descriptor { peer, result: Err(description) }
                | Outcome::Failed { peer, description } => {
                    agent.on_channel_error(&peer, description).await
                }
            },

            // ── 4. Application commands ─────────────────────────
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(AgentCommand::Send { peer, text }) => agent.send(&peer, &text),
                    Some(AgentCommand::Broadcast { text }) => agent.broadcast(&text),
                    Some(AgentCommand::MeshForward { from, text }) => agent.mesh_forward(&from, &text),
                    Some(AgentCommand::Begin) => agent.begin(),
                    Some(AgentCommand::End) => {
                        reconnect_armed = false;
                        agent.end().await
                    }
                    Some(AgentCommand::Tracks { reply }) => {
                        let _ = reply.send(agent.tracks());
                        continue;
                    }
                    Some(AgentCommand::Shutdown) | None => {
                        let actions = agent.end().await;
                        driver.execute(actions).await;
                        tracing::info!("agent shut down");
                        break;
                    }
                }
            }

            // ── 5. Timers ───────────────────────────────────────
            _ = bootstrap.tick() => agent.tick_bootstrap(now_ms()).await,
            () = &mut reconnect, if reconnect_armed => {
                reconnect_armed = false;
                agent.reconnect()
            }
        };

        if let Some(delay) = reconnect_delay(&actions) {
            reconnect.as_mut().reset(Instant::now() + delay);
            reconnect_armed = true;
        }
        driver.execute(actions).await;
    }
}

/// Events on the tracker connection; everything else on the transport is
/// not ours.
async fn tracker_event<S, T, C>(
    agent: &mut MeshAgent<S>,
    driver: &mut Driver<T, C>,
    event: TransportEvent,
) -> Vec<AgentAction>
where
    S: SearchStore,
    T: Transport,
    C: PeerConnector,
{
    let tracker = driver.tracker;
    let ours = |conn: ConnId| tracker == Some(conn);
    match event {
        TransportEvent::Opened { conn } if ours(conn) => agent.on_tracker_open(),
        TransportEvent::DialFailed { conn, error } if ours(conn) => {
            tracing::warn!("tracker unreachable: {error}");
            driver.tracker = None;
            agent.on_tracker_closed()
        }
        TransportEvent::Closed { conn } if ours(conn) => {
            driver.tracker = None;
            agent.on_tracker_closed()
        }
        TransportEvent::Message { conn, text } if ours(conn) => {
            match serde_json::from_str::<SignalMessage>(&text) {
                Ok(msg) => agent.handle_signal(msg).await,
                Err(e) => {
                    tracing::warn!("malformed tracker frame, closing: {e}");
                    vec![
                        AgentAction::Emit(AgentEvent::Error {
                            description: format!("malformed tracker frame: {e}"),
                        }),
                        AgentAction::CloseTracker,
                    ]
                }
            }
        }
        other => {
            tracing::trace!(?other, "transport event not for the tracker socket");
            Vec::new()
        }
    }
}

fn reconnect_delay(actions: &[AgentAction]) -> Option<Duration> {
    actions.iter().find_map(|a| match a {
        AgentAction::ScheduleReconnect { delay } => Some(*delay),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::super::connector::mock::MockConnector;
    use super::super::transport::mock::{MockRemote, MockTransport};
    use super::*;
    use crate::config::AgentConfig;
    use crate::store::MemoryStore;
    use serde_json::json;

    struct Rig {
        channels: AgentChannels,
        remote: MockRemote,
        connector: Arc<MockConnector>,
        peers: mpsc::Sender<ChannelEvent>,
    }

    fn spawn(id: &str) -> Rig {
        let config = AgentConfig::new("127.0.0.1:10509", "movies")
            .id(PeerId::new(id))
            .rng_seed(3);
        let agent = MeshAgent::new(config, MemoryStore::new());
        let (transport, remote) = MockTransport::new();
        let connector = Arc::new(MockConnector::default());
        let (peers, peers_rx) = mpsc::channel(16);
        let channels = AgentRuntime::spawn(agent, transport, connector.clone(), peers_rx);
        Rig {
            channels,
            remote,
            connector,
            peers,
        }
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never held");
    }

    /// Begin and open the tracker socket; returns its connection.
    async fn open_tracker(rig: &Rig) -> ConnId {
        rig.channels.handle.begin().await.unwrap();
        wait_for(|| rig.remote.dialed().len() == 1).await;
        let (conn, url) = rig.remote.dialed()[0].clone();
        assert_eq!(url, "ws://127.0.0.1:10509/signal?hash=movies&id=a");
        rig.remote.inject(TransportEvent::Opened { conn }).await;
        wait_for(|| rig.remote.sent().len() == 6).await;
        rig.remote.clear_sent();
        conn
    }

    async fn from_tracker(rig: &Rig, conn: ConnId, msg: serde_json::Value) {
        rig.remote
            .inject(TransportEvent::Message {
                conn,
                text: msg.to_string(),
            })
            .await;
    }

    fn tracker_frames(remote: &MockRemote) -> Vec<serde_json::Value> {
        remote
            .sent()
            .iter()
            .filter_map(|(_, t)| serde_json::from_str(t).ok())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn opening_the_tracker_requests_a_full_set() {
        let rig = spawn("a");
        open_tracker(&rig).await;
        let mut channels = rig.channels;
        assert_eq!(channels.events.recv().await, Some(AgentEvent::Started));
        assert_eq!(channels.events.recv().await, Some(AgentEvent::TrackerOpen));
    }

    #[tokio::test(start_paused = true)]
    async fn initiator_handshake_end_to_end() {
        let rig = spawn("a");
        let conn = open_tracker(&rig).await;

        from_tracker(&rig, conn, json!({"action": "init", "req": "a", "res": "b"})).await;
        wait_for(|| tracker_frames(&rig.remote).iter().any(|f| f["action"] == "request")).await;
        let request = tracker_frames(&rig.remote)
            .into_iter()
            .find(|f| f["action"] == "request")
            .unwrap();
        assert_eq!(request["request"], json!({"sdp": "b"}));
        assert!(rig.connector.created()[0].1);

        from_tracker(
            &rig,
            conn,
            json!({"action": "response", "req": "a", "res": "b", "response": {"sdp": "from-b"}}),
        )
        .await;
        wait_for(|| rig.connector.accepted().len() == 1).await;
        wait_for(|| tracker_frames(&rig.remote).iter().any(|f| f["action"] == "proc")).await;

        rig.peers
            .send(ChannelEvent::Connected { peer: PeerId::new("b") })
            .await
            .unwrap();
        rig.peers
            .send(ChannelEvent::Data {
                peer: PeerId::new("b"),
                text: "hello".into(),
            })
            .await
            .unwrap();

        let mut channels = rig.channels;
        let mut seen = Vec::new();
        while let Some(event) = channels.events.recv().await {
            let done = matches!(event, AgentEvent::Message { .. });
            seen.push(event);
            if done {
                break;
            }
        }
        assert!(seen.contains(&AgentEvent::Connected { peer: PeerId::new("b") }));
        assert_eq!(
            seen.last(),
            Some(&AgentEvent::Message {
                from: PeerId::new("b"),
                text: "hello".into()
            })
        );

        channels.handle.send(PeerId::new("b"), "hi back").await.unwrap();
        wait_for(|| rig.connector.sent().contains(&(PeerId::new("b"), "hi back".to_string()))).await;
        assert_eq!(channels.handle.tracks().await.conn, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_create_drops_the_attempt() {
        let rig = spawn("a");
        let conn = open_tracker(&rig).await;
        rig.connector.set_fail_creates(true);

        from_tracker(&rig, conn, json!({"action": "init", "req": "a", "res": "b"})).await;
        wait_for(|| rig.connector.destroyed().contains(&PeerId::new("b"))).await;
        assert_eq!(rig.channels.handle.tracks().await.total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn redirect_reconnects_to_new_tracker() {
        let rig = spawn("a");
        let conn = open_tracker(&rig).await;

        from_tracker(&rig, conn, json!({"action": "relay", "relay": "10.0.0.2:10509"})).await;
        wait_for(|| rig.remote.closed() == vec![conn]).await;
        rig.remote.inject(TransportEvent::Closed { conn }).await;

        sleep(Duration::from_secs(6)).await;
        wait_for(|| rig.remote.dialed().len() == 2).await;
        assert_eq!(
            rig.remote.dialed()[1].1,
            "ws://10.0.0.2:10509/signal?hash=movies&id=a"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn tracker_ping_is_answered() {
        let rig = spawn("a");
        let conn = open_tracker(&rig).await;
        from_tracker(&rig, conn, json!({"action": "ping"})).await;
        wait_for(|| tracker_frames(&rig.remote) == vec![json!({"action": "pong"})]).await;
    }

    #[tokio::test(start_paused = true)]
    async fn garbage_from_tracker_closes_it() {
        let rig = spawn("a");
        let conn = open_tracker(&rig).await;
        rig.remote
            .inject(TransportEvent::Message {
                conn,
                text: "{not json".into(),
            })
            .await;
        wait_for(|| rig.remote.closed() == vec![conn]).await;

        let mut channels = rig.channels;
        let mut saw_error = false;
        while let Ok(event) = channels.events.try_recv() {
            saw_error |= matches!(event, AgentEvent::Error { .. });
        }
        assert!(saw_error);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_tracker() {
        let rig = spawn("a");
        let conn = open_tracker(&rig).await;
        rig.channels.handle.shutdown().await;
        wait_for(|| rig.remote.closed() == vec![conn]).await;
        assert!(rig.channels.handle.begin().await.is_err());
    }
}
