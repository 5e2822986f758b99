use async_trait::async_trait;
use log::debug;
use ringkv_lib::messages::Request;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_REPLY_BYTES: u64 = 1 << 20;

/// Any failure talking to a peer. Callers treat every variant as
/// "peer unreachable", never as an empty or missing value.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o error with {address}: {source}")]
    Io {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{phase} with {address} timed out after {after:?}")]
    Timeout {
        address: String,
        phase: &'static str,
        after: Duration,
    },
    #[error("peer {address} unreachable: {reason}")]
    Unreachable { address: String, reason: String },
    #[error("malformed reply from {address}: {reason}")]
    MalformedReply { address: String, reason: String },
}

/// One request, one reply, one connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetworkClient: Send + Sync + 'static {
    async fn call_node(&self, address: &str, request: Request) -> Result<String, RpcError>;
}

#[derive(Debug, Clone)]
pub struct TcpNetworkClient {
    timeout: Duration,
}

impl Default for TcpNetworkClient {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl TcpNetworkClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn exchange(&self, address: &str, request: &Request) -> Result<String, RpcError> {
        let mut stream = match timeout(self.timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(RpcError::Connect {
                    address: address.to_string(),
                    source,
                })
            }
            Err(_) => return Err(self.timed_out(address, "connect")),
        };

        let line = format!("{}\n", request);
        match timeout(self.timeout, stream.write_all(line.as_bytes())).await {
            Ok(Ok(())) => {}
            Ok(Err(source)) => return Err(io_error(address, source)),
            Err(_) => return Err(self.timed_out(address, "write")),
        }

        // Half-close so the peer sees the end of the request
        if let Err(e) = stream.shutdown().await {
            debug!("Shutdown error with {} (non-critical): {}", address, e);
        }

        let mut buffer = Vec::new();
        let mut limited = stream.take(MAX_REPLY_BYTES);
        match timeout(self.timeout, limited.read_to_end(&mut buffer)).await {
            Ok(Ok(_)) => {}
            Ok(Err(source)) => return Err(io_error(address, source)),
            Err(_) => return Err(self.timed_out(address, "read")),
        }

        let reply = String::from_utf8(buffer).map_err(|e| RpcError::MalformedReply {
            address: address.to_string(),
            reason: e.to_string(),
        })?;
        Ok(reply.trim_end_matches(['\r', '\n']).to_string())
    }

    fn timed_out(&self, address: &str, phase: &'static str) -> RpcError {
        RpcError::Timeout {
            address: address.to_string(),
            phase,
            after: self.timeout,
        }
    }
}

fn io_error(address: &str, source: std::io::Error) -> RpcError {
    RpcError::Io {
        address: address.to_string(),
        source,
    }
}

#[async_trait]
impl NetworkClient for TcpNetworkClient {
    async fn call_node(&self, address: &str, request: Request) -> Result<String, RpcError> {
        debug!("Sending `{}` to {}", request, address);
        let reply = self.exchange(address, &request).await?;
        debug!("Received `{}` from {}", reply, address);
        Ok(reply)
    }
}
