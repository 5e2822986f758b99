use clap::Parser;
use env_logger::Env;
use log::error;
use ringkv_node::{Config, PeerAddr};
use std::time::Duration;

/// Chord ring key-value store node
#[derive(Debug, Parser)]
#[command(name = "ringkv-node", version)]
struct Cli {
    /// Port to listen on
    port: u16,

    /// Address of a node already in the ring. Omit to start a new ring.
    #[arg(requires = "contact_port")]
    contact_ip: Option<String>,

    #[arg(requires = "contact_ip")]
    contact_port: Option<u16>,

    /// Address to bind and advertise to peers
    #[arg(long, env = "RINGKV_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Serve the HTTP status API on this port
    #[arg(long, env = "RINGKV_API_PORT")]
    api_port: Option<u16>,

    #[arg(
        long,
        env = "RINGKV_STABILIZE_MS",
        default_value_t = 5000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    stabilize_ms: u64,

    #[arg(
        long,
        env = "RINGKV_FIX_FINGERS_MS",
        default_value_t = 5000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    fix_fingers_ms: u64,

    /// Per-phase timeout for outbound peer calls
    #[arg(
        long,
        env = "RINGKV_RPC_TIMEOUT_MS",
        default_value_t = 5000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    rpc_timeout_ms: u64,

    #[arg(long, env = "RINGKV_MAX_CONNECTIONS", default_value_t = 256)]
    max_connections: usize,
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        let contact = match (cli.contact_ip, cli.contact_port) {
            (Some(ip), Some(port)) => Some(PeerAddr::new(ip, port)),
            _ => None,
        };
        Config {
            host: cli.host,
            port: cli.port,
            contact,
            api_port: cli.api_port,
            stabilize_interval: Duration::from_millis(cli.stabilize_ms),
            fix_fingers_interval: Duration::from_millis(cli.fix_fingers_ms),
            rpc_timeout: Duration::from_millis(cli.rpc_timeout_ms),
            max_connections: cli.max_connections,
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = Config::from(Cli::parse());
    if let Err(e) = ringkv_node::run(config).await {
        error!("Node failed: {}", e);
        std::process::exit(1);
    }
}
