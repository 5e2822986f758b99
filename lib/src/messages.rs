use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::{Identifier, RING_SIZE};

// Reply tokens
pub const DONE: &str = "Done";
pub const INSERTED: &str = "Inserted";
pub const DELETED: &str = "Deleted";
pub const NOT_FOUND: &str = "Not found";
pub const SERVER_NOT_FOUND: &str = "NOT FOUND";
pub const ERROR: &str = "Error";

const OP_SEPARATOR: char = '|';
const KV_SEPARATOR: char = ':';
const ENTRY_SEPARATOR: char = ':';
const ENTRY_KV_SEPARATOR: char = '|';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown operation `{0}`")]
    UnknownOp(String),
    #[error("`{0}` requires a body")]
    MissingBody(&'static str),
    #[error("missing `{0}` delimiter")]
    MissingDelimiter(char),
    #[error("empty key")]
    EmptyKey,
    #[error("invalid identifier `{0}`")]
    InvalidIdentifier(String),
    #[error("invalid peer address `{0}`")]
    InvalidPeerAddress(String),
    #[error("reserved character {0:?} in {1}")]
    ReservedCharacter(char, &'static str),
    #[error("`{0}` is a reply token and cannot be stored as a value")]
    ReservedValue(String),
}

/// Network address of a peer. Travels on the wire as `host|port` and is
/// re-hashed by the receiver to obtain the peer's identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port`, suitable for opening a TCP connection.
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.host, OP_SEPARATOR, self.port)
    }
}

impl FromStr for PeerAddr {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::InvalidPeerAddress(s.to_string());
        let (host, port) = s.trim().split_once(OP_SEPARATOR).ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(PeerAddr::new(host, port))
    }
}

/// One request per connection, `<op>|<body>` on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    // Client-facing operations, routed to the owner of the key
    Insert { key: String, value: String },
    Delete { key: String },
    Search { key: String },
    // Terminal hops, always served from the receiver's local store
    InsertServer { key: String, value: String },
    DeleteServer { key: String },
    SearchServer { key: String },
    // Ring protocol
    SendKeys { candidate: Identifier },
    JoinRequest { candidate: Identifier },
    GetSuccessor,
    GetPredecessor,
    Notify { candidate: Identifier, peer: PeerAddr },
}

impl Request {
    pub fn op(&self) -> &'static str {
        match self {
            Request::Insert { .. } => "insert",
            Request::Delete { .. } => "delete",
            Request::Search { .. } => "search",
            Request::InsertServer { .. } => "insert_server",
            Request::DeleteServer { .. } => "delete_server",
            Request::SearchServer { .. } => "search_server",
            Request::SendKeys { .. } => "send_keys",
            Request::JoinRequest { .. } => "join_request",
            Request::GetSuccessor => "get_successor",
            Request::GetPredecessor => "get_predecessor",
            Request::Notify { .. } => "notify",
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = self.op();
        match self {
            Request::Insert { key, value } | Request::InsertServer { key, value } => {
                write!(f, "{}{}{}{}{}", op, OP_SEPARATOR, key, KV_SEPARATOR, value)
            }
            Request::Delete { key }
            | Request::Search { key }
            | Request::DeleteServer { key }
            | Request::SearchServer { key } => write!(f, "{}{}{}", op, OP_SEPARATOR, key),
            Request::SendKeys { candidate } | Request::JoinRequest { candidate } => {
                write!(f, "{}{}{}", op, OP_SEPARATOR, candidate)
            }
            Request::GetSuccessor | Request::GetPredecessor => write!(f, "{}", op),
            Request::Notify { candidate, peer } => {
                write!(f, "{}{}{}{}{}", op, OP_SEPARATOR, candidate, OP_SEPARATOR, peer)
            }
        }
    }
}

impl FromStr for Request {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.trim_end_matches(['\r', '\n']);
        let (op, body) = match line.split_once(OP_SEPARATOR) {
            Some((op, body)) => (op, Some(body)),
            None => (line, None),
        };

        match op {
            "insert" | "insert_server" => {
                let body = body.ok_or(ProtocolError::MissingDelimiter(OP_SEPARATOR))?;
                let (key, value) = body
                    .split_once(KV_SEPARATOR)
                    .ok_or(ProtocolError::MissingDelimiter(KV_SEPARATOR))?;
                let key = validate_key(key)?;
                let value = validate_value(value)?;
                Ok(if op == "insert" {
                    Request::Insert { key, value }
                } else {
                    Request::InsertServer { key, value }
                })
            }
            "delete" | "search" | "delete_server" | "search_server" => {
                let body = body.ok_or(ProtocolError::MissingDelimiter(OP_SEPARATOR))?;
                let key = validate_key(body)?;
                Ok(match op {
                    "delete" => Request::Delete { key },
                    "search" => Request::Search { key },
                    "delete_server" => Request::DeleteServer { key },
                    _ => Request::SearchServer { key },
                })
            }
            "send_keys" | "join_request" => {
                let body = body.ok_or(ProtocolError::MissingBody("candidate identifier"))?;
                let candidate = parse_identifier(body)?;
                Ok(if op == "send_keys" {
                    Request::SendKeys { candidate }
                } else {
                    Request::JoinRequest { candidate }
                })
            }
            "get_successor" => Ok(Request::GetSuccessor),
            "get_predecessor" => Ok(Request::GetPredecessor),
            "notify" => {
                let body = body.ok_or(ProtocolError::MissingBody("notify candidate"))?;
                let (candidate, peer) = body
                    .split_once(OP_SEPARATOR)
                    .ok_or(ProtocolError::MissingDelimiter(OP_SEPARATOR))?;
                Ok(Request::Notify {
                    candidate: parse_identifier(candidate)?,
                    peer: peer.parse()?,
                })
            }
            other => Err(ProtocolError::UnknownOp(other.to_string())),
        }
    }
}

fn parse_identifier(s: &str) -> Result<Identifier, ProtocolError> {
    match s.trim().parse::<Identifier>() {
        Ok(id) if id < RING_SIZE => Ok(id),
        _ => Err(ProtocolError::InvalidIdentifier(s.to_string())),
    }
}

pub fn validate_key(key: &str) -> Result<String, ProtocolError> {
    if key.is_empty() {
        return Err(ProtocolError::EmptyKey);
    }
    if let Some(c) = key.chars().find(|c| matches!(c, ':' | '|' | '\n')) {
        return Err(ProtocolError::ReservedCharacter(c, "key"));
    }
    Ok(key.to_string())
}

pub fn validate_value(value: &str) -> Result<String, ProtocolError> {
    if let Some(c) = value.chars().find(|c| matches!(c, ':' | '\n')) {
        return Err(ProtocolError::ReservedCharacter(c, "value"));
    }
    // Reply tokens are never storable values
    if [NOT_FOUND, SERVER_NOT_FOUND, ERROR].contains(&value) {
        return Err(ProtocolError::ReservedValue(value.to_string()));
    }
    Ok(value.to_string())
}

/// Encodes migrated entries as the `send_keys` reply: `key|value` joined by `:`.
pub fn encode_entries(entries: &[(String, String)]) -> String {
    entries
        .iter()
        .map(|(key, value)| format!("{}{}{}", key, ENTRY_KV_SEPARATOR, value))
        .collect::<Vec<_>>()
        .join(&ENTRY_SEPARATOR.to_string())
}

/// Decodes a `send_keys` reply. Empty segments and segments without a
/// `key|value` split are skipped.
pub fn decode_entries(reply: &str) -> Vec<(String, String)> {
    reply
        .split(ENTRY_SEPARATOR)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| entry.split_once(ENTRY_KV_SEPARATOR))
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}
