//! DHT Protocol Messages

use bincode::Options;
use ringdht_crypto::{InfoHash, NodeId};
use serde::{Deserialize, Serialize};

use crate::error::{DhtError, DhtResult};
use crate::node::NodeExport;
use crate::value::ValueId;
use crate::MAX_PACKET_SIZE;

/// Transaction id matching responses to requests
pub type TransactionId = u32;

/// `want` flag: IPv4 nodes
pub const WANT4: u8 = 1;
/// `want` flag: IPv6 nodes
pub const WANT6: u8 = 2;

/// Error codes carried by [`DhtResponse::Error`]
pub mod error_code {
    pub const MALFORMED: u16 = 400;
    pub const UNAUTHORIZED: u16 = 401;
    pub const REJECTED: u16 = 403;
    pub const STORAGE_FULL: u16 = 507;
}

/// DHT message types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DhtMessage {
    /// Request message
    Request(DhtRequest),
    /// Response message
    Response(DhtResponse),
}

/// DHT request types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DhtRequest {
    /// Ping - check if node is alive
    Ping {
        /// Sender's node ID
        sender_id: NodeId,
    },

    /// Find node - nodes closest to target
    FindNode {
        /// Sender's node ID
        sender_id: NodeId,
        /// Target ID
        target: InfoHash,
        /// WANT4 | WANT6
        want: u8,
    },

    /// Get values stored under key, plus closest nodes and a write token
    GetValues {
        /// Sender's node ID
        sender_id: NodeId,
        /// Key to look up
        key: InfoHash,
        /// WANT4 | WANT6
        want: u8,
    },

    /// Store a packed value
    AnnounceValue {
        /// Sender's node ID
        sender_id: NodeId,
        /// Key
        key: InfoHash,
        /// Packed value
        value: Vec<u8>,
        /// Token from a previous GetValues reply
        token: Vec<u8>,
    },
}

/// DHT response types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DhtResponse {
    /// Pong - response to ping
    Pong {
        /// Responder's node ID
        sender_id: NodeId,
    },

    /// Reply to FindNode and GetValues
    Nodes {
        /// Responder's node ID
        sender_id: NodeId,
        /// Closest IPv4 nodes
        nodes4: Vec<NodeExport>,
        /// Closest IPv6 nodes
        nodes6: Vec<NodeExport>,
        /// Write token for the requester's address
        token: Vec<u8>,
        /// Packed values, GetValues only
        values: Vec<Vec<u8>>,
    },

    /// Announce accepted
    ValueAnnounced {
        /// Responder's node ID
        sender_id: NodeId,
        /// Id of the stored value
        value_id: ValueId,
    },

    /// Error response
    Error {
        /// Responder's node ID
        sender_id: NodeId,
        /// Error code
        code: u16,
        /// Error message
        message: String,
    },
}

impl DhtMessage {
    /// Get the sender ID
    pub fn sender_id(&self) -> NodeId {
        match self {
            DhtMessage::Request(req) => match req {
                DhtRequest::Ping { sender_id }
                | DhtRequest::FindNode { sender_id, .. }
                | DhtRequest::GetValues { sender_id, .. }
                | DhtRequest::AnnounceValue { sender_id, .. } => *sender_id,
            },
            DhtMessage::Response(resp) => match resp {
                DhtResponse::Pong { sender_id }
                | DhtResponse::Nodes { sender_id, .. }
                | DhtResponse::ValueAnnounced { sender_id, .. }
                | DhtResponse::Error { sender_id, .. } => *sender_id,
            },
        }
    }
}

/// Wrapped message with transaction id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcMessage {
    /// Transaction id, echoed by the response
    pub tid: TransactionId,
    /// The message
    pub message: DhtMessage,
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_big_endian()
        .with_limit(MAX_PACKET_SIZE as u64)
}

impl RpcMessage {
    pub fn new(tid: TransactionId, message: DhtMessage) -> Self {
        Self { tid, message }
    }

    /// Create a response with same transaction id
    pub fn response(&self, response: DhtResponse) -> Self {
        Self {
            tid: self.tid,
            message: DhtMessage::Response(response),
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> DhtResult<Vec<u8>> {
        codec()
            .serialize(self)
            .map_err(|e| DhtError::SerializationError(e.to_string()))
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> DhtResult<Self> {
        codec()
            .deserialize(bytes)
            .map_err(|e| DhtError::InvalidMessage(e.to_string()))
    }
}
