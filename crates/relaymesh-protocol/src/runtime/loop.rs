/// The node runtime event loop.
///
/// A single async task that owns [`NodeState`] and multiplexes over
/// transport events, DHT peer reports, application commands and timers.
use std::time::Duration;

use relaymesh_dht::PeerFound;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};

use crate::config::NodeConfig;
use crate::types::now_ms;

use super::executor::execute_effects;
use super::state::NodeState;
use super::transport::{Dht, Transport};
use super::{NodeCommand, NodeEffect, NodeEvent};

/// Parked deadline for a timer that is not armed.
const FAR: Duration = Duration::from_secs(86_400 * 365);

/// Main event loop. Owns all node state.
pub(super) async fn node_loop<T: Transport, D: Dht>(
    mut transport: T,
    dht: D,
    mut peers: mpsc::Receiver<PeerFound>,
    config: NodeConfig,
    mut cmd_rx: mpsc::Receiver<NodeCommand>,
    event_tx: mpsc::Sender<NodeEvent>,
) {
    let timer = config.timer.clone();
    let mut state = NodeState::new(config);

    // ── Timers ──────────────────────────────────────────────────────
    let mut check_server = tokio::time::interval(timer.check_server);
    let mut check_client = tokio::time::interval(timer.check_client);
    let mut talking = tokio::time::interval(timer.talking);

    // Skip the immediate first tick on all intervals
    check_server.tick().await;
    check_client.tick().await;
    talking.tick().await;

    let reopen = sleep(FAR);
    tokio::pin!(reopen);
    let mut reopen_armed = false;

    let effects = state.boot();
    if let Some(after) = reopen_delay(&effects) {
        reopen.as_mut().reset(Instant::now() + after);
        reopen_armed = true;
    }
    execute_effects(effects, &mut transport, &dht, &event_tx).await;

    loop {
        let effects = tokio::select! {
            // ── 1. Transport ────────────────────────────────────
            event = transport.recv() => {
                match event {
                    Some(event) => state.handle_transport(event, now_ms()),
                    None => {
                        tracing::info!("transport closed, node loop exiting");
                        break;
                    }
                }
            }

            // ── 2. DHT peer reports ─────────────────────────────
            Some(found) = peers.recv() => state.handle_peer_found(found, now_ms()),

            // ── 3. Application commands ─────────────────────────
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(NodeCommand::Stats { reply }) => {
                        let _ = reply.send(state.stats());
                        continue;
                    }
                    Some(NodeCommand::Start) => state.start(),
                    Some(NodeCommand::Stop) => state.stop(),
                    Some(NodeCommand::Shutdown) | None => {
                        let effects = state.stop();
                        execute_effects(effects, &mut transport, &dht, &event_tx).await;
                        tracing::info!("node shut down");
                        break;
                    }
                }
            }

            // ── 4. Timers ───────────────────────────────────────
            _ = check_server.tick() => state.tick_check_server(now_ms()),
            _ = check_client.tick() => state.tick_check_client(),
            _ = talking.tick() => state.tick_talking(),
            () = &mut reopen, if reopen_armed => {
                reopen_armed = false;
                state.listener_reopen()
            }
        };

        if let Some(after) = reopen_delay(&effects) {
            reopen.as_mut().reset(Instant::now() + after);
            reopen_armed = true;
        }
        execute_effects(effects, &mut transport, &dht, &event_tx).await;
    }
}

fn reopen_delay(effects: &[NodeEffect]) -> Option<Duration> {
    effects.iter().find_map(|e| match e {
        NodeEffect::PauseListener { reopen_after } => *reopen_after,
        _ => None,
    })
}
