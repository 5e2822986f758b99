use std::convert::Infallible;
use std::net::SocketAddr;

use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{body::Bytes, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{error, info};
use ringkv_lib::Identifier;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;

use crate::finger_table::Finger;
use crate::network_client::NetworkClient;
use crate::node::{ChordNode, NodeInfo};

/// Read-only view of a node's ring position, served at `/state`.
#[derive(Debug, Serialize)]
pub struct RingState {
    pub id: Identifier,
    pub address: String,
    pub successor: NodeInfo,
    pub predecessor: Option<NodeInfo>,
    pub fingers: Vec<Finger>,
    pub key_count: usize,
}

impl RingState {
    pub fn of<T: NetworkClient>(node: &ChordNode<T>) -> Self {
        Self {
            id: node.info.id,
            address: node.info.socket_address(),
            successor: node.successor(),
            predecessor: node.predecessor(),
            fingers: node.fingers(),
            key_count: node.store.len(),
        }
    }
}

fn format_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

fn not_found() -> Response<Full<Bytes>> {
    format_response(
        StatusCode::NOT_FOUND,
        json!({ "error": "Not Found" }).to_string(),
    )
}

fn ping() -> Response<Full<Bytes>> {
    format_response(StatusCode::OK, json!({ "message": "pong" }).to_string())
}

fn state<T: NetworkClient>(node: &ChordNode<T>) -> Response<Full<Bytes>> {
    match serde_json::to_string(&RingState::of(node)) {
        Ok(body) => format_response(StatusCode::OK, body),
        Err(e) => format_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "error": e.to_string() }).to_string(),
        ),
    }
}

pub fn route<T: NetworkClient>(
    node: &ChordNode<T>,
    method: &Method,
    path: &str,
) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/ping") => ping(),
        (&Method::GET, "/state") => state(node),
        _ => not_found(),
    }
}

async fn handler<T: NetworkClient>(
    node: ChordNode<T>,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(route(&node, req.method(), req.uri().path()))
}

pub async fn run<T: NetworkClient>(
    node: ChordNode<T>,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;

    info!("Status API is listening on http://{}", addr);
    loop {
        let (tcp, _) = listener.accept().await?;
        let io = TokioIo::new(tcp);
        let node = node.clone();
        tokio::task::spawn(async move {
            let service = service_fn(move |req| handler(node.clone(), req));
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                error!("Error serving status connection: {:?}", err);
            }
        });
    }
}
