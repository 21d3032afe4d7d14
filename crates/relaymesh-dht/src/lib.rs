//! DHT-based tracker discovery for relaymesh.
//! Uses the Mainline DHT (BEP-0005) so trackers serving the same topic find
//! each other: every tracker announces its port under the topic's
//! [`InfoHash`] and looks up the peers announced there.
//!
//! Each address a lookup yields is reported as a [`PeerFound`] on the
//! channel returned by [`DhtDiscovery::bind`].

use std::net::SocketAddr;

use anyhow::Result;
use futures_lite::StreamExt;
use mainline::{async_dht::AsyncDht, Dht, Id};
use relaymesh_transport::InfoHash;
use tokio::sync::mpsc;

/// A peer address announced under a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerFound {
    pub addr: SocketAddr,
    pub info_hash: InfoHash,
}

/// DHT discovery service. Cheap to clone.
#[derive(Clone)]
pub struct DhtDiscovery {
    dht: AsyncDht,
    peers_tx: mpsc::Sender<PeerFound>,
}

impl DhtDiscovery {
    /// Join the DHT on `port` (UDP) in server mode.
    ///
    /// Returns the service and the stream of peer-found events.
    pub fn bind(port: u16, buffer: usize) -> Result<(Self, mpsc::Receiver<PeerFound>)> {
        let dht = Dht::builder().port(port).server_mode().build()?;
        tracing::info!("DHT node bound on udp port {port}");
        let (peers_tx, peers_rx) = mpsc::channel(buffer);
        Ok((
            Self {
                dht: dht.as_async(),
                peers_tx,
            },
            peers_rx,
        ))
    }

    /// Look up every peer announced under `info_hash`.
    ///
    /// Each address found is pushed as a [`PeerFound`] event as soon as it
    /// arrives. Returns the number of addresses seen.
    pub async fn lookup(&self, info_hash: InfoHash) -> Result<usize> {
        let target = Id::from_bytes(info_hash.as_bytes())?;
        let mut stream = self.dht.get_peers(target);
        let mut found = 0;

        while let Some(batch) = stream.next().await {
            for addr in batch {
                found += 1;
                let event = PeerFound {
                    addr: SocketAddr::V4(addr),
                    info_hash,
                };
                if self.peers_tx.send(event).await.is_err() {
                    return Ok(found);
                }
            }
        }

        tracing::debug!("DHT lookup {info_hash}: {found} peers");
        Ok(found)
    }

    /// Announce that this node serves `info_hash` on `port`.
    pub async fn announce(&self, info_hash: InfoHash, port: u16) -> Result<()> {
        let target = Id::from_bytes(info_hash.as_bytes())?;
        self.dht.announce_peer(target, Some(port)).await?;
        tracing::debug!("DHT announced {info_hash} on port {port}");
        Ok(())
    }
}
