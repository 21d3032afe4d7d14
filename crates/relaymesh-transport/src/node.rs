use crate::config::TransportConfig;
use crate::connection::{pump, ConnectionPool, Outbound};
use crate::route::Route;
use crate::{ConnId, TransportError};

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Banner served on `GET /`.
const HEALTH_BANNER: &str = "thanks for testing relaymesh";

/// Everything the transport reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The listener is accepting connections.
    Listening { addr: SocketAddr },
    /// The listener stopped (paused or failed); live connections are untouched.
    ListenerClosed,
    /// An inbound WebSocket upgrade completed.
    Accepted { conn: ConnId, route: Route },
    /// An outbound dial completed.
    Opened { conn: ConnId },
    /// An outbound dial failed before the socket opened.
    DialFailed { conn: ConnId, error: String },
    /// A text frame arrived.
    Message { conn: ConnId, text: String },
    /// The connection is gone, whoever closed it.
    Closed { conn: ConnId },
}

struct Listener {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

#[derive(Clone)]
struct ListenerState {
    pool: Arc<ConnectionPool>,
    events: mpsc::Sender<TransportEvent>,
    max_message_size: usize,
}

/// A relaymesh transport node: one listener plus any number of dialed sockets.
///
/// Inbound connections arrive through an axum router (`/signal`, `/relay`,
/// plus the `HEAD`/`GET /` health endpoint); outbound connections are dialed
/// with tokio-tungstenite. Both kinds are pumped by the same per-connection
/// task and addressed by [`ConnId`].
pub struct WsNode {
    pool: Arc<ConnectionPool>,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: mpsc::Receiver<TransportEvent>,
    listener: Option<Listener>,
    bind_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    config: TransportConfig,
}

impl WsNode {
    /// Create a node that listens on `addr`.
    pub async fn bind(addr: SocketAddr, config: TransportConfig) -> Result<Self, TransportError> {
        let mut node = Self::client(config);
        node.bind_addr = Some(addr);
        node.start_listener().await?;
        Ok(node)
    }

    /// Create a dial-only node (no listener).
    pub fn client(config: TransportConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.recv_buffer);
        Self {
            pool: Arc::new(ConnectionPool::new(config.send_buffer)),
            events_tx,
            events_rx,
            listener: None,
            bind_addr: None,
            local_addr: None,
            config,
        }
    }

    /// Address the listener is (or was last) bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Whether the listener is currently accepting.
    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    /// Dial `url`. The outcome arrives later as `Opened` or `DialFailed`.
    pub fn dial(&self, conn: ConnId, url: String) {
        let pool = self.pool.clone();
        let events = self.events_tx.clone();
        let max = self.config.max_message_size;

        tokio::spawn(async move {
            match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((socket, _response)) => {
                    let registered = pool.register(conn).await;
                    if events.send(TransportEvent::Opened { conn }).await.is_err() {
                        pool.remove(conn).await;
                        return;
                    }
                    pump(conn, socket, registered, pool, events, max).await;
                }
                Err(e) => {
                    let error = TransportError::Dial {
                        url,
                        source: e.into(),
                    };
                    tracing::debug!("{conn}: {error}");
                    let _ = events
                        .send(TransportEvent::DialFailed {
                            conn,
                            error: error.to_string(),
                        })
                        .await;
                }
            }
        });
    }

    /// Queue a text frame on a live connection.
    ///
    /// Never waits on the peer: when its queue is full the peer is not
    /// reading, so the connection is dropped and the send fails.
    pub async fn send(&self, conn: ConnId, text: String) -> Result<(), TransportError> {
        if text.len() > self.config.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: text.len(),
                max: self.config.max_message_size,
            });
        }
        let slot = self
            .pool
            .slot(conn)
            .await
            .ok_or(TransportError::Send { conn })?;
        match slot.tx.try_send(Outbound::Text(text)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::warn!("{conn}: peer is not reading, dropping it");
                slot.kill();
                Err(TransportError::Stalled { conn })
            }
            Err(TrySendError::Closed(_)) => Err(TransportError::Send { conn }),
        }
    }

    /// Close a connection. Unknown handles are ignored.
    pub async fn close(&self, conn: ConnId) {
        if let Some(slot) = self.pool.slot(conn).await {
            slot.close();
        }
    }

    /// Receive the next transport event. `None` once the node is dropped.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.events_rx.recv().await
    }

    /// Stop accepting new connections; existing ones stay open.
    pub async fn pause_listener(&mut self) {
        if let Some(listener) = self.listener.take() {
            let _ = listener.shutdown.send(());
            let _ = listener.task.await;
        }
    }

    /// Re-open the listener after [`pause_listener`](Self::pause_listener).
    pub async fn resume_listener(&mut self) -> Result<(), TransportError> {
        if self.listener.is_some() {
            return Ok(());
        }
        self.start_listener().await
    }

    /// Close every connection and stop listening.
    pub async fn shutdown(mut self) -> Result<(), TransportError> {
        self.pause_listener().await;
        self.pool.close_all().await;
        Ok(())
    }

    async fn start_listener(&mut self) -> Result<(), TransportError> {
        let Some(bind) = self.bind_addr else {
            return Ok(());
        };
        // Re-open on the port we actually got, even when bound to port 0.
        let addr = self.local_addr.unwrap_or(bind);

        let tcp = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        let local = tcp.local_addr().unwrap_or(addr);
        self.local_addr = Some(local);

        let state = ListenerState {
            pool: self.pool.clone(),
            events: self.events_tx.clone(),
            max_message_size: self.config.max_message_size,
        };
        let app = Router::new()
            .route("/", get(health).fallback(reject))
            .fallback(upgrade)
            .with_state(state);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let events = self.events_tx.clone();
        let task = tokio::spawn(async move {
            let _ = events.send(TransportEvent::Listening { addr: local }).await;
            let served = axum::serve(tcp, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                tracing::warn!("listener on {local} failed: {e}");
            }
            let _ = events.send(TransportEvent::ListenerClosed).await;
        });

        tracing::info!("listening on {local}");
        self.listener = Some(Listener {
            shutdown: shutdown_tx,
            task,
        });
        Ok(())
    }
}

// ── HTTP handlers ────────────────────────────────────────────────────

async fn health() -> &'static str {
    HEALTH_BANNER
}

async fn reject() -> Response {
    (StatusCode::BAD_REQUEST, Json("invalid method or path")).into_response()
}

async fn upgrade(
    State(state): State<ListenerState>,
    uri: Uri,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Ok(ws) = ws else {
        return reject().await;
    };
    let route = Route::parse(uri.path(), uri.query());

    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| async move {
            let conn = ConnId::fresh();
            let registered = state.pool.register(conn).await;
            let accepted = TransportEvent::Accepted { conn, route };
            if state.events.send(accepted).await.is_err() {
                state.pool.remove(conn).await;
                return;
            }
            pump(
                conn,
                socket,
                registered,
                state.pool.clone(),
                state.events.clone(),
                state.max_message_size,
            )
            .await;
        })
}
