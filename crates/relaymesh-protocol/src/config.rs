use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use relaymesh_transport::TransportConfig;
use serde::Deserialize;

use crate::error::RelayMeshError;
use crate::types::{NodeId, PeerId, MAX_CHANNELS, MAX_SEARCH_HOPS};

/// Default listen and DHT port.
pub const DEFAULT_PORT: u16 = 10509;

// ── Node (tracker / relay) ────────────────────────────────────────────

/// Periodic work of a tracker node.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Relay link liveness check.
    #[serde(with = "humantime_serde")]
    pub check_server: Duration,
    /// Client liveness check.
    #[serde(with = "humantime_serde")]
    pub check_client: Duration,
    /// DHT lookup + announce round.
    #[serde(with = "humantime_serde")]
    pub talking: Duration,
    /// Listener cooldown after capacity shedding.
    #[serde(with = "humantime_serde")]
    pub redo: Duration,
    /// One unit of the relay dial backoff window.
    #[serde(with = "humantime_serde")]
    pub backoff_unit: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            check_server: Duration::from_secs(60),
            check_client: Duration::from_secs(60),
            talking: Duration::from_secs(30 * 60),
            redo: Duration::from_secs(5 * 60),
            backoff_unit: Duration::from_secs(1),
        }
    }
}

/// Capacity limits. Zero means unlimited.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LimitConfig {
    /// Relay links per topic.
    pub server_connections: usize,
    /// Connected clients before the listener is shed.
    pub client_connections: usize,
    /// Completed handshakes per client before it is closed.
    pub signal_connections: usize,
}

/// Configuration of a tracker/relay node.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Advertised host; identity is derived from `host:port`.
    pub host: String,
    pub port: u16,
    /// Advertised name handed to redirected clients.
    pub domain: Option<String>,
    /// Listen interface.
    pub bind: IpAddr,
    /// Served topics.
    pub hashes: Vec<String>,
    /// Start serving as soon as the runtime is spawned.
    pub init: bool,
    pub timer: TimerConfig,
    pub limit: LimitConfig,
    pub ws: TransportConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            domain: None,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            hashes: Vec::new(),
            init: true,
            timer: TimerConfig::default(),
            limit: LimitConfig::default(),
            ws: TransportConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn bind(mut self, bind: IpAddr) -> Self {
        self.bind = bind;
        self
    }

    pub fn hash(mut self, topic: impl Into<String>) -> Self {
        self.hashes.push(topic.into());
        self
    }

    pub fn init(mut self, init: bool) -> Self {
        self.init = init;
        self
    }

    pub fn timer(mut self, timer: TimerConfig) -> Self {
        self.timer = timer;
        self
    }

    pub fn limit(mut self, limit: LimitConfig) -> Self {
        self.limit = limit;
        self
    }

    /// `host:port`, the string our identity hashes.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Address handed to clients we redirect.
    pub fn web(&self) -> String {
        let name = self.domain.as_deref().unwrap_or(&self.host);
        format!("{name}:{}", self.port)
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_address(&self.address())
    }

    pub fn validate(&self) -> Result<(), RelayMeshError> {
        if self.host.trim().is_empty() {
            return Err(RelayMeshError::Config("must have host".into()));
        }
        if self.hashes.iter().all(|h| h.trim().is_empty()) {
            return Err(RelayMeshError::Config("must have at least one hash".into()));
        }
        Ok(())
    }
}

// ── Agent (mesh client) ───────────────────────────────────────────────

/// Configuration of a mesh agent.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// `host:port` of the signalling tracker.
    pub tracker: String,
    pub topic: String,
    /// Generated when absent.
    pub id: Option<PeerId>,
    /// Ceiling on channels plus in-flight discoveries.
    pub max_channels: usize,
    #[serde(with = "humantime_serde")]
    pub bootstrap_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,
    pub max_search_hops: u32,
    /// Fixed seed for hop selection.
    pub rng_seed: Option<u64>,
    pub ws: TransportConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            tracker: String::new(),
            topic: String::new(),
            id: None,
            max_channels: MAX_CHANNELS,
            bootstrap_timeout: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(5),
            max_search_hops: MAX_SEARCH_HOPS,
            rng_seed: None,
            ws: TransportConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn new(tracker: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            tracker: tracker.into(),
            topic: topic.into(),
            ..Self::default()
        }
    }

    pub fn id(mut self, id: PeerId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn max_channels(mut self, max: usize) -> Self {
        self.max_channels = max;
        self
    }

    pub fn bootstrap_timeout(mut self, timeout: Duration) -> Self {
        self.bootstrap_timeout = timeout;
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn max_search_hops(mut self, hops: u32) -> Self {
        self.max_search_hops = hops;
        self
    }

    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// `ws://<tracker>/signal?hash=<topic>&id=<id>`.
    pub fn signal_url(&self, tracker: &str, id: &PeerId) -> Result<String, RelayMeshError> {
        let base = format!("ws://{tracker}/signal");
        let url = url::Url::parse_with_params(
            &base,
            &[("hash", self.topic.as_str()), ("id", id.as_str())],
        )
        .map_err(|e| RelayMeshError::Config(format!("bad tracker address {tracker}: {e}")))?;
        Ok(url.into())
    }

    pub fn validate(&self) -> Result<(), RelayMeshError> {
        if self.tracker.trim().is_empty() {
            return Err(RelayMeshError::Config("must have tracker".into()));
        }
        if self.topic.is_empty() {
            return Err(RelayMeshError::Config("must have topic".into()));
        }
        if self.max_channels == 0 {
            return Err(RelayMeshError::Config("max_channels must be positive".into()));
        }
        Ok(())
    }
}
