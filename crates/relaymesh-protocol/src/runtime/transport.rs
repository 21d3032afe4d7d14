use relaymesh_dht::DhtDiscovery;
use relaymesh_transport::{TransportEvent, WsNode};

use crate::types::{ConnId, InfoHash};

/// Network abstraction for the runtimes.
///
/// Production: [`WsNode`] (axum listener + tokio-tungstenite dialer).
/// Tests: `MockTransport` (records what was sent, replays injected events).
#[async_trait::async_trait]
pub trait Transport: Send {
    /// Next transport event; `None` once the transport is gone.
    async fn recv(&mut self) -> Option<TransportEvent>;

    async fn send_text(&self, conn: ConnId, text: String) -> Result<(), String>;

    async fn close(&self, conn: ConnId);

    /// Start a dial; the outcome arrives as an event.
    fn dial(&self, conn: ConnId, url: String);

    async fn pause_listener(&mut self);

    async fn resume_listener(&mut self) -> Result<(), String>;
}

/// DHT abstraction: lookups report peers on their own stream.
#[async_trait::async_trait]
pub trait Dht: Clone + Send + Sync + 'static {
    async fn lookup(&self, info_hash: InfoHash) -> Result<usize, String>;

    async fn announce(&self, info_hash: InfoHash, port: u16) -> Result<(), String>;
}

// ── Production impls ────────────────────────────────────────────────

#[async_trait::async_trait]
impl Transport for WsNode {
    async fn recv(&mut self) -> Option<TransportEvent> {
        WsNode::recv(self).await
    }

    async fn send_text(&self, conn: ConnId, text: String) -> Result<(), String> {
        WsNode::send(self, conn, text).await.map_err(|e| e.to_string())
    }

    async fn close(&self, conn: ConnId) {
        WsNode::close(self, conn).await
    }

    fn dial(&self, conn: ConnId, url: String) {
        WsNode::dial(self, conn, url)
    }

    async fn pause_listener(&mut self) {
        WsNode::pause_listener(self).await
    }

    async fn resume_listener(&mut self) -> Result<(), String> {
        WsNode::resume_listener(self).await.map_err(|e| e.to_string())
    }
}

#[async_trait::async_trait]
impl Dht for DhtDiscovery {
    async fn lookup(&self, info_hash: InfoHash) -> Result<usize, String> {
        DhtDiscovery::lookup(self, info_hash)
            .await
            .map_err(|e| e.to_string())
    }

    async fn announce(&self, info_hash: InfoHash, port: u16) -> Result<(), String> {
        DhtDiscovery::announce(self, info_hash, port)
            .await
            .map_err(|e| e.to_string())
    }
}

// ── Mocks (tests) ───────────────────────────────────────────────────

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Log {
        sent: Vec<(ConnId, String)>,
        closed: Vec<ConnId>,
        dialed: Vec<(ConnId, String)>,
        pauses: usize,
        resumes: usize,
        fail_sends: bool,
    }

    /// Fake transport: events come from a [`MockRemote`], calls are recorded.
    pub struct MockTransport {
        log: Arc<Mutex<Log>>,
        events: mpsc::Receiver<TransportEvent>,
    }

    /// Test-side handle on a [`MockTransport`] moved into a runtime.
    #[derive(Clone)]
    pub struct MockRemote {
        log: Arc<Mutex<Log>>,
        events: mpsc::Sender<TransportEvent>,
    }

    impl MockTransport {
        pub fn new() -> (Self, MockRemote) {
            let log = Arc::new(Mutex::new(Log::default()));
            let (tx, rx) = mpsc::channel(64);
            (
                Self {
                    log: log.clone(),
                    events: rx,
                },
                MockRemote { log, events: tx },
            )
        }
    }

    impl MockRemote {
        pub async fn inject(&self, event: TransportEvent) {
            self.events.send(event).await.unwrap();
        }

        pub fn sent(&self) -> Vec<(ConnId, String)> {
            self.log.lock().unwrap().sent.clone()
        }

        pub fn closed(&self) -> Vec<ConnId> {
            self.log.lock().unwrap().closed.clone()
        }

        pub fn dialed(&self) -> Vec<(ConnId, String)> {
            self.log.lock().unwrap().dialed.clone()
        }

        pub fn pauses(&self) -> usize {
            self.log.lock().unwrap().pauses
        }

        pub fn resumes(&self) -> usize {
            self.log.lock().unwrap().resumes
        }

        pub fn set_fail_sends(&self, fail: bool) {
            self.log.lock().unwrap().fail_sends = fail;
        }

        pub fn clear_sent(&self) {
            self.log.lock().unwrap().sent.clear();
        }
    }

    #[async_trait::async_trait]
    impl Transport for MockTransport {
        async fn recv(&mut self) -> Option<TransportEvent> {
            self.events.recv().await
        }

        async fn send_text(&self, conn: ConnId, text: String) -> Result<(), String> {
            let mut log = self.log.lock().unwrap();
            if log.fail_sends {
                return Err("mock: send failed".to_string());
            }
            log.sent.push((conn, text));
            Ok(())
        }

        async fn close(&self, conn: ConnId) {
            self.log.lock().unwrap().closed.push(conn);
        }

        fn dial(&self, conn: ConnId, url: String) {
            self.log.lock().unwrap().dialed.push((conn, url));
        }

        async fn pause_listener(&mut self) {
            self.log.lock().unwrap().pauses += 1;
        }

        async fn resume_listener(&mut self) -> Result<(), String> {
            self.log.lock().unwrap().resumes += 1;
            Ok(())
        }
    }

    /// Fake DHT recording lookups and announces.
    #[derive(Clone, Default)]
    pub struct MockDht {
        lookups: Arc<Mutex<Vec<InfoHash>>>,
        announces: Arc<Mutex<Vec<(InfoHash, u16)>>>,
    }

    impl MockDht {
        pub fn lookups(&self) -> Vec<InfoHash> {
            self.lookups.lock().unwrap().clone()
        }

        pub fn announces(&self) -> Vec<(InfoHash, u16)> {
            self.announces.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Dht for MockDht {
        async fn lookup(&self, info_hash: InfoHash) -> Result<usize, String> {
            self.lookups.lock().unwrap().push(info_hash);
            Ok(0)
        }

        async fn announce(&self, info_hash: InfoHash, port: u16) -> Result<(), String> {
            self.announces.lock().unwrap().push((info_hash, port));
            Ok(())
        }
    }
}
