//! Effect executor: the only place that touches I/O.
//!
//! Takes `Vec<NodeEffect>` from the pure state and performs the actual
//! transport, DHT and channel operations.
use std::fmt::Debug;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::transport::{Dht, Transport};
use super::{NodeEffect, NodeEvent};

/// Execute effects in order. DHT work is spawned so a slow lookup never
/// stalls the loop.
pub(super) async fn execute_effects<T: Transport, D: Dht>(
    effects: Vec<NodeEffect>,
    transport: &mut T,
    dht: &D,
    event_tx: &mpsc::Sender<NodeEvent>,
) {
    for effect in effects {
        match effect {
            NodeEffect::Send { conn, text } => {
                if let Err(e) = transport.send_text(conn, text).await {
                    tracing::debug!("send to {conn} failed: {e}");
                }
            }
            NodeEffect::Close { conn } => transport.close(conn).await,
            NodeEffect::Dial { conn, url } => transport.dial(conn, url),
            NodeEffect::Lookup { info_hash } => {
                let dht = dht.clone();
                let tx = event_tx.clone();
                tokio::spawn(async move {
                    match dht.lookup(info_hash).await {
                        Ok(found) => tracing::debug!("lookup {info_hash}: {found} peers"),
                        Err(e) => {
                            publish(&tx, NodeEvent::Error {
                                description: format!("lookup {info_hash}: {e}"),
                            });
                        }
                    }
                });
            }
            NodeEffect::Announce { info_hash, port } => {
                let dht = dht.clone();
                let tx = event_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = dht.announce(info_hash, port).await {
                        publish(&tx, NodeEvent::Error {
                            description: format!("announce {info_hash}: {e}"),
                        });
                    }
                });
            }
            NodeEffect::PauseListener { .. } => transport.pause_listener().await,
            NodeEffect::ResumeListener => {
                if let Err(e) = transport.resume_listener().await {
                    publish(event_tx, NodeEvent::Error {
                        description: format!("listener: {e}"),
                    });
                }
            }
            NodeEffect::Emit(event) => {
                publish(event_tx, event);
            }
        }
    }
}

/// Hand an event to the owner without blocking the loop. A full buffer
/// loses the event; a dropped receiver means nobody is listening.
pub(super) fn publish<E: Debug>(tx: &mpsc::Sender<E>, event: E) -> bool {
    match tx.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(event)) => {
            tracing::warn!(?event, "event buffer full, event dropped");
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}
