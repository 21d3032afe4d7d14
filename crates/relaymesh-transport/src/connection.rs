use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, Mutex, Notify};

use crate::node::TransportEvent;
use crate::ConnId;

/// What the node asks a connection task to do.
#[derive(Debug)]
pub(crate) enum Outbound {
    Text(String),
    Close,
}

/// Routes outbound frames to the task pumping each live connection.
///
/// A connection is registered when its socket is ready and removed when
/// its pump exits, whichever side closed it.
pub(crate) struct ConnectionPool {
    slots: Mutex<HashMap<ConnId, Slot>>,
    send_buffer: usize,
}

/// One live connection: its outbound queue and a switch that stops its pump
/// even while a write is stuck.
#[derive(Clone)]
pub(crate) struct Slot {
    pub tx: mpsc::Sender<Outbound>,
    kill: Arc<Notify>,
}

impl Slot {
    /// Drop the socket without a close handshake.
    pub fn kill(&self) {
        self.kill.notify_one();
    }

    /// Ask for an orderly close; a full queue means the pump is stuck, so
    /// the socket is dropped instead.
    pub fn close(&self) {
        if self.tx.try_send(Outbound::Close).is_err() {
            self.kill();
        }
    }
}

/// What a pump needs from its registration.
pub(crate) struct Registered {
    pub outbound: mpsc::Receiver<Outbound>,
    pub kill: Arc<Notify>,
}

impl ConnectionPool {
    pub fn new(send_buffer: usize) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            send_buffer,
        }
    }

    /// Register a live connection, returning the queue its pump drains.
    pub async fn register(&self, conn: ConnId) -> Registered {
        let (tx, outbound) = mpsc::channel(self.send_buffer);
        let kill = Arc::new(Notify::new());
        let slot = Slot {
            tx,
            kill: kill.clone(),
        };
        self.slots.lock().await.insert(conn, slot);
        Registered { outbound, kill }
    }

    pub async fn slot(&self, conn: ConnId) -> Option<Slot> {
        self.slots.lock().await.get(&conn).cloned()
    }

    pub async fn remove(&self, conn: ConnId) {
        self.slots.lock().await.remove(&conn);
    }

    /// Ask every live connection to close.
    pub async fn close_all(&self) {
        let slots: Vec<_> = self.slots.lock().await.values().cloned().collect();
        for slot in slots {
            slot.close();
        }
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }
}

// ── Frame abstraction ────────────────────────────────────────────────

/// An incoming frame reduced to what the protocol cares about.
pub(crate) enum Incoming {
    Text(String),
    Close,
    Ignored,
}

/// Common surface of the axum (server side) and tungstenite (client side)
/// message types, so one pump serves both directions.
pub(crate) trait WsFrame: Sized + Send + 'static {
    fn text(text: String) -> Self;
    fn close() -> Self;
    fn classify(self) -> Incoming;
}

impl WsFrame for axum::extract::ws::Message {
    fn text(text: String) -> Self {
        Self::Text(text.into())
    }

    fn close() -> Self {
        Self::Close(None)
    }

    fn classify(self) -> Incoming {
        match self {
            Self::Text(text) => Incoming::Text(text.as_str().to_owned()),
            Self::Close(_) => Incoming::Close,
            _ => Incoming::Ignored,
        }
    }
}

impl WsFrame for tokio_tungstenite::tungstenite::Message {
    fn text(text: String) -> Self {
        Self::Text(text.into())
    }

    fn close() -> Self {
        Self::Close(None)
    }

    fn classify(self) -> Incoming {
        match self {
            Self::Text(text) => Incoming::Text(text.as_str().to_owned()),
            Self::Close(_) => Incoming::Close,
            _ => Incoming::Ignored,
        }
    }
}

// ── Pump ─────────────────────────────────────────────────────────────

/// Drive one socket until either side closes it.
///
/// Incoming text frames become [`TransportEvent::Message`]; the final
/// [`TransportEvent::Closed`] is always emitted exactly once.
pub(crate) async fn pump<S, M, E>(
    conn: ConnId,
    socket: S,
    registered: Registered,
    pool: Arc<ConnectionPool>,
    events: mpsc::Sender<TransportEvent>,
    max_message_size: usize,
) where
    S: Stream<Item = Result<M, E>> + Sink<M> + Send + 'static,
    <S as Sink<M>>::Error: Display,
    M: WsFrame,
    E: Display,
{
    let Registered { mut outbound, kill } = registered;
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            _ = kill.notified() => {
                tracing::debug!("{conn}: dropped");
                break;
            }
            out = outbound.recv() => match out {
                Some(Outbound::Text(text)) => {
                    let written = tokio::select! {
                        written = sink.send(M::text(text)) => written,
                        _ = kill.notified() => {
                            tracing::debug!("{conn}: dropped mid-write");
                            break;
                        }
                    };
                    if let Err(e) = written {
                        tracing::debug!("{conn}: write failed: {e}");
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.send(M::close()).await;
                    break;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(frame)) => match frame.classify() {
                    Incoming::Text(text) => {
                        if text.len() > max_message_size {
                            tracing::warn!(
                                "{conn}: frame of {} bytes exceeds {max_message_size}, closing",
                                text.len()
                            );
                            let _ = sink.send(M::close()).await;
                            break;
                        }
                        if events.send(TransportEvent::Message { conn, text }).await.is_err() {
                            break;
                        }
                    }
                    Incoming::Close => break,
                    Incoming::Ignored => {}
                },
                Some(Err(e)) => {
                    tracing::debug!("{conn}: read failed: {e}");
                    break;
                }
                None => break,
            },
        }
    }

    pool.remove(conn).await;
    let _ = events.send(TransportEvent::Closed { conn }).await;
}
