//! RingKV node library
//!
//! A Chord ring node serving a distributed key-value store over a line-based
//! TCP protocol. Used by the `ringkv-node` binary and by the integration tests.

pub mod api;
pub mod data_store;
pub mod finger_table;
pub mod network_client;
pub mod node;


pub use data_store::DataStore;
pub use finger_table::{Finger, FingerTable};
pub use network_client::{NetworkClient, RpcError, TcpNetworkClient};
pub use node::{ChordNode, NodeInfo, SearchOutcome};

pub use ringkv_lib::messages::{PeerAddr, Request};
pub use ringkv_lib::Identifier;

use log::{error, info};
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Configuration for a ChordNode
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the node binds to and advertises to peers
    pub host: String,
    pub port: u16,
    /// Existing member to join through. `None` starts a new ring.
    pub contact: Option<PeerAddr>,
    /// Port for the HTTP status API, disabled when unset
    pub api_port: Option<u16>,
    pub stabilize_interval: Duration,
    pub fix_fingers_interval: Duration,
    pub rpc_timeout: Duration,
    pub max_connections: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            contact: None,
            api_port: None,
            stabilize_interval: Duration::from_secs(5),
            fix_fingers_interval: Duration::from_secs(5),
            rpc_timeout: network_client::DEFAULT_TIMEOUT,
            max_connections: 256,
        }
    }
}

impl Config {
    pub fn address(&self) -> PeerAddr {
        PeerAddr::new(self.host.clone(), self.port)
    }
}

impl ChordNode<TcpNetworkClient> {
    /// Create a ChordNode from config with the TCP network client
    pub fn from_config(config: &Config) -> Self {
        ChordNode::new(
            config.address(),
            Arc::new(TcpNetworkClient::new(config.rpc_timeout)),
        )
    }
}

/// Binds the listener, joins the ring, then serves until the process exits.
pub async fn run(config: Config) -> Result<(), Box<dyn Error + Send + Sync>> {
    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .map_err(|e| format!("failed to bind {}:{}: {}", config.host, config.port, e))?;

    let node = ChordNode::from_config(&config);
    info!(
        "Node {} starting at {} (identifier {})",
        node.info.addr, config.host, node.info.id
    );

    // Joining completes before the first request is served
    node.join(config.contact.clone()).await?;

    let _maintenance =
        node.spawn_maintenance(config.stabilize_interval, config.fix_fingers_interval);

    if let Some(api_port) = config.api_port {
        let api_node = node.clone();
        let host = config.host.clone();
        tokio::spawn(async move {
            let addr: SocketAddr = match format!("{}:{}", host, api_port).parse() {
                Ok(addr) => addr,
                Err(e) => {
                    error!("Invalid status API address {}:{}: {}", host, api_port, e);
                    return;
                }
            };
            if let Err(e) = api::run(api_node, addr).await {
                error!("Status API stopped: {}", e);
            }
        });
    }

    node.serve(listener, config.max_connections).await;
    Ok(())
}
