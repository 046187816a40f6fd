//! DHT protocol message definitions.
//!
//! Every RPC the node understands is a variant of the closed [`Request`]
//! enum, answered by a variant of [`Response`]. The transport moves these
//! inside an [`Envelope`] so replies can be matched with their calls.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::core::{Contact, NodeId};
use crate::storage::Blob;

/// Correlates a response datagram with the call that caused it.
pub type MessageId = [u8; 20];

/// An inbound or outbound RPC request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "rpc")]
pub enum Request {
    /// Reachability check; the reply echoes the caller's observed address.
    Stun,
    /// Liveness check; the reply carries the callee's id.
    Ping { sender_id: NodeId },
    /// Store a small value under `key`.
    Store {
        sender_id: NodeId,
        key: NodeId,
        #[serde(with = "hex::serde")]
        value: Vec<u8>,
    },
    /// Ask for the contacts nearest `target`.
    FindNode { sender_id: NodeId, target: NodeId },
    /// Ask for the value under `key`, or the nearest contacts when absent.
    FindValue { sender_id: NodeId, key: NodeId },
    /// Store a bulk value under `key`.
    StoreBlob {
        sender_id: NodeId,
        key: NodeId,
        value: Blob,
    },
    /// Ask for the bulk value under `key`.
    FindBlob { sender_id: NodeId, key: NodeId },
}

impl Request {
    /// The caller's claimed id, absent only for [`Request::Stun`].
    pub fn sender_id(&self) -> Option<NodeId> {
        match self {
            Request::Stun => None,
            Request::Ping { sender_id }
            | Request::Store { sender_id, .. }
            | Request::FindNode { sender_id, .. }
            | Request::FindValue { sender_id, .. }
            | Request::StoreBlob { sender_id, .. }
            | Request::FindBlob { sender_id, .. } => Some(*sender_id),
        }
    }

    /// Short RPC name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Stun => "stun",
            Request::Ping { .. } => "ping",
            Request::Store { .. } => "store",
            Request::FindNode { .. } => "find_node",
            Request::FindValue { .. } => "find_value",
            Request::StoreBlob { .. } => "store_blob",
            Request::FindBlob { .. } => "find_blob",
        }
    }
}

/// The reply to a [`Request`].
///
/// Byte payloads travel as hex strings; a JSON array of numbers would take up
/// to four bytes per value byte.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "data")]
pub enum Response {
    /// Answer to `Stun`: the caller's address as seen by the callee.
    Stun(SocketAddr),
    /// Answer to `Ping`: the callee's id.
    Pong(NodeId),
    /// Answer to `Store` and `StoreBlob`.
    Stored(bool),
    /// Contacts ordered by ascending distance to the requested target.
    Nodes(Vec<Contact>),
    /// Answer to `FindValue` when the callee holds the key.
    Value(#[serde(with = "hex::serde")] Vec<u8>),
    /// Answer to `FindBlob`; `None` is the not-found sentinel.
    Blob(Option<Blob>),
}

/// The uniform shape every outbound call is normalised into.
///
/// `succeeded == false` means the peer did not answer (timeout, unreachable,
/// undeliverable request); `payload` is then `None`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallResult {
    pub succeeded: bool,
    pub payload: Option<Response>,
}

impl CallResult {
    pub fn success(response: Response) -> Self {
        Self {
            succeeded: true,
            payload: Some(response),
        }
    }

    pub fn failure() -> Self {
        Self {
            succeeded: false,
            payload: None,
        }
    }
}

/// Body of a datagram: either a call or the answer to one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Body {
    Request(Request),
    Response(Response),
}

/// A framed datagram.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: MessageId,
    pub body: Body,
}

impl Envelope {
    /// Wrap a request under a fresh random message id.
    pub fn request(request: Request) -> Self {
        Self {
            id: rand::random(),
            body: Body::Request(request),
        }
    }

    /// Wrap the response to the call identified by `id`.
    pub fn response(id: MessageId, response: Response) -> Self {
        Self {
            id,
            body: Body::Response(response),
        }
    }
}
