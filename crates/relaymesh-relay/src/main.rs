use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use relaymesh_dht::DhtDiscovery;
use relaymesh_protocol::{LimitConfig, NodeConfig, NodeEvent, NodeHandle, NodeRuntime};
use relaymesh_transport::WsNode;

/// Buffer of the DHT peer-found stream.
const PEER_BUFFER: usize = 256;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "relaymesh-relay", about = "relaymesh tracker/relay node")]
struct Cli {
    /// TOML config file. Flags given on the command line override it.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Advertised host; the node id is derived from host:port.
    #[arg(long)]
    host: Option<String>,

    /// Listen and DHT port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Advertised name handed to redirected clients.
    #[arg(long)]
    domain: Option<String>,

    /// Listen interface.
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Served topics (comma-separated).
    #[arg(long, value_delimiter = ',')]
    hashes: Vec<String>,

    /// Relay links per topic (0 = unlimited).
    #[arg(long)]
    server_connections: Option<usize>,

    /// Clients before the listener is shed (0 = unlimited).
    #[arg(long)]
    client_connections: Option<usize>,

    /// Completed handshakes per client (0 = unlimited).
    #[arg(long)]
    signal_connections: Option<usize>,

    /// Wait for a start command instead of serving right away.
    #[arg(long)]
    no_init: bool,

    /// Print `ev` events.
    #[arg(long)]
    ev: bool,

    /// Print stats as JSON every N seconds.
    #[arg(long)]
    stats: Option<u64>,
}

impl Cli {
    fn node_config(&self) -> anyhow::Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                toml::from_str::<NodeConfig>(&text)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => NodeConfig::default(),
        };

        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(domain) = &self.domain {
            config.domain = Some(domain.clone());
        }
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if !self.hashes.is_empty() {
            config.hashes = self.hashes.clone();
        }
        let limit: &mut LimitConfig = &mut config.limit;
        if let Some(n) = self.server_connections {
            limit.server_connections = n;
        }
        if let Some(n) = self.client_connections {
            limit.client_connections = n;
        }
        if let Some(n) = self.signal_connections {
            limit.signal_connections = n;
        }
        if self.no_init {
            config.init = false;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.node_config()?;

    let listen = SocketAddr::new(config.bind, config.port);
    let transport = WsNode::bind(listen, config.ws.clone())
        .await
        .with_context(|| format!("binding {listen}"))?;
    let (dht, peers) = DhtDiscovery::bind(config.port, PEER_BUFFER)?;

    eprintln!("relaymesh-relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("Node ID: {}", config.node_id());
    eprintln!("Address: {}", config.address());
    eprintln!("Topics:  {}", config.hashes.join(", "));
    eprintln!();

    let channels = NodeRuntime::spawn(transport, dht, peers, config);
    let handle = channels.handle;
    let mut events = channels.events;

    if let Some(secs) = cli.stats.filter(|s| *s > 0) {
        tokio::spawn(print_stats(handle.clone(), Duration::from_secs(secs)));
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(&event, cli.ev);
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("shutting down");
                handle.shutdown().await;
                // Drain what the node reports while stopping; DHT tasks may
                // still hold the event sender.
                let drain = async {
                    while let Some(event) = events.recv().await {
                        print_event(&event, cli.ev);
                    }
                };
                let _ = tokio::time::timeout(SHUTDOWN_GRACE, drain).await;
                break;
            }
        }
    }

    Ok(())
}

fn print_event(event: &NodeEvent, ev: bool) {
    match event {
        NodeEvent::Listening { addr } => println!("listening on {addr}"),
        NodeEvent::Start => println!("start"),
        NodeEvent::Stop => println!("stop"),
        NodeEvent::Close => println!("listener closed"),
        NodeEvent::Error { description } => eprintln!("error: {description}"),
        NodeEvent::Ev { description } => {
            if ev {
                println!("ev: {description}");
            }
        }
    }
}

async fn print_stats(handle: NodeHandle, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        interval.tick().await;
        match handle.stats().await {
            Ok(stats) => match serde_json::to_string(&stats) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!("encode stats: {e}"),
            },
            // Node is gone.
            Err(_) => break,
        }
    }
}
