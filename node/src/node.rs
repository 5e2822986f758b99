use log::{debug, error, info, warn};
use rand::Rng;
use ringkv_lib::messages::{self, PeerAddr, ProtocolError, Request};
use ringkv_lib::{hash_identifier, is_between, is_strictly_between, Identifier, M};
use serde::Serialize;
use std::error::Error;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};

use crate::data_store::DataStore;
use crate::finger_table::{Finger, FingerTable};
use crate::network_client::{NetworkClient, RpcError};

macro_rules! log_info {
    ($address:expr, $($arg:tt)*) => ({
        info!("[{}] {}", $address, format_args!($($arg)*));
    })
}

macro_rules! log_warn {
    ($address:expr, $($arg:tt)*) => ({
        warn!("[{}] {}", $address, format_args!($($arg)*));
    })
}

macro_rules! log_error {
    ($address:expr, $($arg:tt)*) => ({
        error!("[{}] {}", $address, format_args!($($arg)*));
    })
}

pub const MAX_REQUEST_BYTES: u64 = 64 * 1024;
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);
const MIN_MAINTENANCE_INTERVAL: Duration = Duration::from_millis(1);

// A panicking holder must not take the whole node down with it
pub(crate) fn lock<U>(mutex: &Mutex<U>) -> MutexGuard<'_, U> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    pub id: Identifier,
    pub addr: PeerAddr,
}

impl NodeInfo {
    /// Identity of the node listening on `addr`, hashed from its `host|port` form.
    pub fn new(addr: PeerAddr) -> Self {
        Self {
            id: hash_identifier(&addr.to_string()),
            addr,
        }
    }

    pub fn with_id(id: Identifier, addr: PeerAddr) -> Self {
        Self { id, addr }
    }

    /// Parses an `ip|port` reply and re-hashes it.
    pub fn from_wire(reply: &str) -> Result<Self, ProtocolError> {
        Ok(Self::new(reply.parse()?))
    }

    pub fn socket_address(&self) -> String {
        self.addr.socket_address()
    }
}

/// Result of a routed search. `Unreachable` is never folded into `NotFound`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome {
    Found(String),
    NotFound,
    Unreachable,
}

#[derive(Debug)]
pub struct ChordNode<T: NetworkClient> {
    pub info: NodeInfo,
    pub successor: Arc<Mutex<NodeInfo>>,
    pub predecessor: Arc<Mutex<Option<NodeInfo>>>,
    pub finger_table: Arc<Mutex<FingerTable>>,
    pub store: Arc<DataStore>,
    pub network_client: Arc<T>,
}

impl<T: NetworkClient> Clone for ChordNode<T> {
    fn clone(&self) -> Self {
        ChordNode {
            info: self.info.clone(),
            successor: self.successor.clone(),
            predecessor: self.predecessor.clone(),
            finger_table: self.finger_table.clone(),
            store: self.store.clone(), // This clones the Arc, not the map
            network_client: self.network_client.clone(),
        }
    }
}

impl<T: NetworkClient> ChordNode<T> {
    pub fn new(addr: PeerAddr, network_client: Arc<T>) -> Self {
        Self::with_info(NodeInfo::new(addr), network_client)
    }

    pub fn with_info(info: NodeInfo, network_client: Arc<T>) -> Self {
        let finger_table = FingerTable::new(&info);
        ChordNode {
            successor: Arc::new(Mutex::new(info.clone())),
            predecessor: Arc::new(Mutex::new(None)),
            finger_table: Arc::new(Mutex::new(finger_table)),
            store: Arc::new(DataStore::new()),
            network_client,
            info,
        }
    }

    pub fn successor(&self) -> NodeInfo {
        lock(&self.successor).clone()
    }

    pub fn predecessor(&self) -> Option<NodeInfo> {
        lock(&self.predecessor).clone()
    }

    pub fn fingers(&self) -> Vec<Finger> {
        lock(&self.finger_table).entries().to_vec()
    }

    fn is_self(&self, node: &NodeInfo) -> bool {
        node.addr == self.info.addr
    }

    fn set_successor(&self, node: NodeInfo) {
        *lock(&self.successor) = node.clone();
        lock(&self.finger_table).set(0, node);
    }

    pub async fn serve(&self, listener: TcpListener, max_connections: usize) {
        let permits = Arc::new(Semaphore::new(max_connections.max(1)));
        log_info!(
            self.info.addr,
            "Chord node {} serving on {}",
            self.info.id,
            listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| self.info.socket_address())
        );

        loop {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            match listener.accept().await {
                Ok((socket, _)) => {
                    let node = self.clone();
                    tokio::spawn(async move {
                        node.handle_connection(socket).await;
                        drop(permit);
                    });
                }
                Err(e) => {
                    log_error!(self.info.addr, "Failed to accept connection: {}", e);
                }
            }
        }
    }

    async fn handle_connection(&self, socket: TcpStream) {
        let peer = socket
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown peer".to_string());
        // One byte past the limit tells an oversized request from one that fits exactly
        let mut reader = BufReader::new(socket).take(MAX_REQUEST_BYTES + 1);
        let mut request = Vec::new();

        match timeout(REQUEST_READ_TIMEOUT, reader.read_until(b'\n', &mut request)).await {
            Ok(Ok(0)) => {
                debug!("[{}] {} closed without sending a request", self.info.addr, peer);
                return;
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                log_error!(self.info.addr, "Failed to read from {}: {}", peer, e);
                return;
            }
            Err(_) => {
                log_error!(self.info.addr, "Timed out waiting for a request from {}", peer);
                return;
            }
        }

        let mut reader = reader.into_inner();
        let reply = if request.len() as u64 > MAX_REQUEST_BYTES {
            log_warn!(
                self.info.addr,
                "Rejecting request from {} larger than {} bytes",
                peer,
                MAX_REQUEST_BYTES
            );
            // Consume the rest so closing does not reset the connection under the reply
            if timeout(REQUEST_READ_TIMEOUT, tokio::io::copy(&mut reader, &mut tokio::io::sink()))
                .await
                .is_err()
            {
                debug!("[{}] Gave up draining {}", self.info.addr, peer);
            }
            messages::ERROR.to_string()
        } else {
            match std::str::from_utf8(&request) {
                Ok(line) => self.dispatch_line(line).await,
                Err(e) => {
                    log_warn!(self.info.addr, "Request from {} is not UTF-8: {}", peer, e);
                    messages::ERROR.to_string()
                }
            }
        };
        debug!("[{}] Replying to {}: `{}`", self.info.addr, peer, reply);

        let mut socket = reader.into_inner();
        if let Err(e) = socket.write_all(reply.as_bytes()).await {
            log_error!(self.info.addr, "Failed to write reply to {}: {}", peer, e);
        }
        if let Err(e) = socket.shutdown().await {
            debug!("[{}] Shutdown error (non-critical): {}", self.info.addr, e);
        }
    }

    /// Parses one raw request line and dispatches it. Malformed requests are
    /// answered with the error token.
    pub async fn dispatch_line(&self, line: &str) -> String {
        match line.parse::<Request>() {
            Ok(request) => self.dispatch(request).await,
            Err(e) => {
                log_warn!(
                    self.info.addr,
                    "Rejecting malformed request {:?}: {}",
                    line.trim_end(),
                    e
                );
                messages::ERROR.to_string()
            }
        }
    }

    pub async fn dispatch(&self, request: Request) -> String {
        debug!("[{}] Received `{}`", self.info.addr, request);
        match request {
            Request::Insert { key, value } => match self.insert(key, value).await {
                Ok(()) => messages::DONE.to_string(),
                Err(_) => messages::ERROR.to_string(),
            },
            Request::Delete { key } => match self.delete(&key).await {
                Ok(()) => messages::DONE.to_string(),
                Err(_) => messages::ERROR.to_string(),
            },
            Request::Search { key } => match self.search(&key).await {
                SearchOutcome::Found(value) => value,
                SearchOutcome::NotFound => messages::NOT_FOUND.to_string(),
                SearchOutcome::Unreachable => messages::ERROR.to_string(),
            },
            Request::InsertServer { key, value } => {
                log_info!(self.info.addr, "Stored key: {}", key);
                self.store.insert(key, value);
                messages::INSERTED.to_string()
            }
            Request::DeleteServer { key } => {
                if self.store.remove(&key).is_some() {
                    log_info!(self.info.addr, "Deleted key: {}", key);
                }
                messages::DELETED.to_string()
            }
            Request::SearchServer { key } => self
                .store
                .search(&key)
                .unwrap_or_else(|| messages::SERVER_NOT_FOUND.to_string()),
            Request::SendKeys { candidate } => {
                messages::encode_entries(&self.send_keys(candidate))
            }
            Request::JoinRequest { candidate } => match self.find_successor(candidate).await {
                Ok(successor) => successor.addr.to_string(),
                Err(e) => {
                    log_error!(
                        self.info.addr,
                        "Lookup for identifier {} failed: {}",
                        candidate,
                        e
                    );
                    messages::ERROR.to_string()
                }
            },
            Request::GetSuccessor => self.successor().addr.to_string(),
            Request::GetPredecessor => self
                .predecessor()
                .map(|p| p.addr.to_string())
                .unwrap_or_default(),
            Request::Notify { candidate, peer } => {
                let info = NodeInfo::new(peer);
                if info.id != candidate {
                    log_warn!(
                        self.info.addr,
                        "Notify from {} claimed identifier {} but hashes to {}",
                        info.addr,
                        candidate,
                        info.id
                    );
                }
                self.notify(info);
                String::new()
            }
        }
    }

    /// Whether `id` falls in `(predecessor, self]`. With an unknown
    /// predecessor only a singleton ring can claim ownership.
    pub fn owns(&self, id: Identifier) -> bool {
        match lock(&self.predecessor).as_ref() {
            Some(predecessor) => is_between(id, predecessor.id, self.info.id),
            None => self.is_self(&lock(&self.successor)),
        }
    }

    // `None` means this node is the owner and the operation stays local.
    async fn resolve_owner(&self, id: Identifier) -> Result<Option<NodeInfo>, RpcError> {
        if self.owns(id) {
            return Ok(None);
        }
        let owner = self.find_successor(id).await?;
        if self.is_self(&owner) {
            Ok(None)
        } else {
            Ok(Some(owner))
        }
    }

    async fn call_expecting(
        &self,
        owner: &NodeInfo,
        request: Request,
        expected: &str,
    ) -> Result<(), RpcError> {
        let address = owner.socket_address();
        let reply = self.network_client.call_node(&address, request).await?;
        if reply == expected {
            Ok(())
        } else {
            Err(RpcError::MalformedReply {
                address,
                reason: format!("expected `{}`, got `{}`", expected, reply),
            })
        }
    }

    /// Stores a key-value pair at the node owning the key.
    pub async fn insert(&self, key: String, value: String) -> Result<(), RpcError> {
        let key_id = hash_identifier(&key);
        let result = match self.resolve_owner(key_id).await {
            Ok(None) => {
                log_info!(self.info.addr, "Stored key: {} (id {})", key, key_id);
                self.store.insert(key, value);
                Ok(())
            }
            Ok(Some(owner)) => {
                debug!(
                    "[{}] Forwarding insert of {} to owner {}",
                    self.info.addr, key, owner.addr
                );
                self.call_expecting(
                    &owner,
                    Request::InsertServer { key, value },
                    messages::INSERTED,
                )
                .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            log_error!(self.info.addr, "Insert for id {} failed: {}", key_id, e);
        }
        result
    }

    /// Removes a key from the node owning it. Deleting a missing key succeeds.
    pub async fn delete(&self, key: &str) -> Result<(), RpcError> {
        let key_id = hash_identifier(key);
        let result = match self.resolve_owner(key_id).await {
            Ok(None) => {
                if self.store.remove(key).is_some() {
                    log_info!(self.info.addr, "Deleted key: {}", key);
                }
                Ok(())
            }
            Ok(Some(owner)) => {
                self.call_expecting(
                    &owner,
                    Request::DeleteServer {
                        key: key.to_string(),
                    },
                    messages::DELETED,
                )
                .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            log_error!(self.info.addr, "Delete for id {} failed: {}", key_id, e);
        }
        result
    }

    pub async fn search(&self, key: &str) -> SearchOutcome {
        let key_id = hash_identifier(key);
        let owner = match self.resolve_owner(key_id).await {
            Ok(owner) => owner,
            Err(e) => {
                log_error!(self.info.addr, "Lookup for id {} failed: {}", key_id, e);
                return SearchOutcome::Unreachable;
            }
        };

        let Some(owner) = owner else {
            return match self.store.search(key) {
                Some(value) => SearchOutcome::Found(value),
                None => SearchOutcome::NotFound,
            };
        };

        let request = Request::SearchServer {
            key: key.to_string(),
        };
        match self
            .network_client
            .call_node(&owner.socket_address(), request)
            .await
        {
            Ok(reply) if reply == messages::SERVER_NOT_FOUND => SearchOutcome::NotFound,
            Ok(reply) => SearchOutcome::Found(reply),
            Err(e) => {
                log_error!(self.info.addr, "Search at {} failed: {}", owner.addr, e);
                SearchOutcome::Unreachable
            }
        }
    }

    // Finds the successor of an ID
    pub async fn find_successor(&self, id: Identifier) -> Result<NodeInfo, RpcError> {
        if self.owns(id) {
            return Ok(self.info.clone());
        }

        // If the ID is between this node and its successor, then successor is the answer
        let successor = self.successor();
        if is_between(id, self.info.id, successor.id) {
            return Ok(successor);
        }

        // Otherwise, find the closest preceding node and ask it
        let n_prime = self.closest_preceding_finger(id);
        if self.is_self(&n_prime) {
            return Ok(successor);
        }

        debug!(
            "[{}] Lookup for {} continues at {} ({})",
            self.info.addr, id, n_prime.addr, n_prime.id
        );
        let address = n_prime.socket_address();
        let reply = self
            .network_client
            .call_node(&address, Request::JoinRequest { candidate: id })
            .await?;
        NodeInfo::from_wire(&reply).map_err(|e| RpcError::MalformedReply {
            address,
            reason: e.to_string(),
        })
    }

    // Finds the node in the finger table that most immediately precedes `id`.
    pub fn closest_preceding_finger(&self, id: Identifier) -> NodeInfo {
        lock(&self.finger_table).closest_preceding(id)
    }

    /// Removes and returns the keys a node joining at `candidate` takes over.
    pub fn send_keys(&self, candidate: Identifier) -> Vec<(String, String)> {
        let entries = self.store.extract_keys_closer_to(candidate, self.info.id);
        if !entries.is_empty() {
            log_info!(
                self.info.addr,
                "Handing {} keys to joining node {}",
                entries.len(),
                candidate
            );
        }
        entries
    }

    pub async fn join(
        &self,
        contact: Option<PeerAddr>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let Some(contact) = contact else {
            log_info!(
                self.info.addr,
                "No contact node provided. Starting a new network."
            );
            self.start_new_network();
            return Ok(());
        };

        log_info!(
            self.info.addr,
            "Joining network via contact node {} as id {}",
            contact,
            self.info.id
        );
        let reply = self
            .network_client
            .call_node(
                &contact.socket_address(),
                Request::JoinRequest {
                    candidate: self.info.id,
                },
            )
            .await?;
        let successor = NodeInfo::from_wire(&reply)
            .map_err(|e| format!("contact {} answered join_request with {:?}: {}", contact, reply, e))?;

        *lock(&self.predecessor) = None;
        self.set_successor(successor.clone());
        log_info!(
            self.info.addr,
            "Joined network. Successor: {} at {}",
            successor.id,
            successor.addr
        );

        if self.is_self(&successor) {
            return Ok(());
        }

        // Take over the keys that now belong to us
        let reply = self
            .network_client
            .call_node(
                &successor.socket_address(),
                Request::SendKeys {
                    candidate: self.info.id,
                },
            )
            .await?;
        let entries = messages::decode_entries(&reply);
        if !entries.is_empty() {
            log_info!(
                self.info.addr,
                "Received {} keys from successor",
                entries.len()
            );
        }
        for (key, value) in entries {
            self.store.insert(key, value);
        }
        Ok(())
    }

    pub fn start_new_network(&self) {
        *lock(&self.predecessor) = None;
        self.set_successor(self.info.clone());
        log_info!(
            self.info.addr,
            "Started new network. I am the only node."
        );
    }

    /// A peer suggesting it is our predecessor. Accepted when we have none or
    /// it lies strictly between the current predecessor and us.
    pub fn notify(&self, candidate: NodeInfo) -> bool {
        if self.is_self(&candidate) {
            return false;
        }

        let mut predecessor = lock(&self.predecessor);
        let accept = match predecessor.as_ref() {
            None => true,
            Some(current) => is_strictly_between(candidate.id, current.id, self.info.id),
        };
        if !accept {
            debug!(
                "[{}] Notify: keeping predecessor {:?}, rejected {}",
                self.info.addr,
                predecessor.as_ref().map(|p| &p.addr),
                candidate.addr
            );
            return false;
        }

        debug!(
            "[{}] Notify: predecessor {:?} -> {}",
            self.info.addr,
            predecessor.as_ref().map(|p| &p.addr),
            candidate.addr
        );
        *predecessor = Some(candidate.clone());
        drop(predecessor);

        // A singleton ring closes on the first node that reaches us
        let mut successor = lock(&self.successor);
        if self.is_self(&successor) {
            *successor = candidate.clone();
            drop(successor);
            lock(&self.finger_table).set(0, candidate);
        }
        true
    }

    pub async fn stabilize(&self) {
        let successor = self.successor();

        // Get successor's predecessor
        let x = if self.is_self(&successor) {
            self.predecessor()
        } else {
            match self
                .network_client
                .call_node(&successor.socket_address(), Request::GetPredecessor)
                .await
            {
                Ok(reply) if reply.is_empty() => None,
                Ok(reply) => match NodeInfo::from_wire(&reply) {
                    Ok(x) => Some(x),
                    Err(e) => {
                        log_error!(
                            self.info.addr,
                            "Bad get_predecessor reply from {}: {}",
                            successor.addr,
                            e
                        );
                        None
                    }
                },
                Err(e) => {
                    log_error!(
                        self.info.addr,
                        "Failed to get predecessor from successor: {}",
                        e
                    );
                    return;
                }
            }
        };

        // If x is between self and successor, then x is the new successor
        if let Some(x) = x {
            if !self.is_self(&x) && is_strictly_between(x.id, self.info.id, successor.id) {
                let mut current = lock(&self.successor);
                // Only replace what we inspected; notify may have moved it meanwhile
                if *current == successor {
                    debug!(
                        "[{}] Stabilize: successor {} -> {}",
                        self.info.addr, successor.addr, x.addr
                    );
                    *current = x.clone();
                    drop(current);
                    lock(&self.finger_table).set(0, x);
                }
            }
        }

        // Notify successor that we might be its predecessor
        let successor = self.successor();
        if self.is_self(&successor) {
            return;
        }
        let request = Request::Notify {
            candidate: self.info.id,
            peer: self.info.addr.clone(),
        };
        if let Err(e) = self
            .network_client
            .call_node(&successor.socket_address(), request)
            .await
        {
            log_error!(self.info.addr, "Error notifying successor: {}", e);
        }
    }

    /// Refreshes finger `i` through the lookup algorithm.
    pub async fn fix_finger(&self, i: usize) -> Result<(), RpcError> {
        let Some(start) = lock(&self.finger_table).start(i) else {
            return Ok(());
        };
        let node = self.find_successor(start).await?;
        if i == 0 {
            self.set_successor(node);
        } else {
            lock(&self.finger_table).set(i, node);
        }
        Ok(())
    }

    pub async fn fix_fingers(&self) {
        // Pick a random finger to fix, to avoid all nodes fixing the same finger at the same time.
        let i = rand::thread_rng().gen_range(1..M);
        if let Err(e) = self.fix_finger(i).await {
            log_error!(self.info.addr, "Failed to refresh finger {}: {}", i, e);
        }
    }

    /// Starts the stabilization and finger-fixing loops for the lifetime of the node.
    pub fn spawn_maintenance(
        &self,
        stabilize_interval: Duration,
        fix_fingers_interval: Duration,
    ) -> Vec<JoinHandle<()>> {
        // tokio intervals panic on a zero period
        let stabilize_interval = stabilize_interval.max(MIN_MAINTENANCE_INTERVAL);
        let fix_fingers_interval = fix_fingers_interval.max(MIN_MAINTENANCE_INTERVAL);

        let node = self.clone();
        let stabilizer = tokio::spawn(async move {
            let mut interval = tokio::time::interval(stabilize_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                node.stabilize().await;
            }
        });

        let node = self.clone();
        let finger_fixer = tokio::spawn(async move {
            let mut interval = tokio::time::interval(fix_fingers_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                node.fix_fingers().await;
            }
        });

        vec![stabilizer, finger_fixer]
    }
}
