//! Typed messages of the Kadre protocol.
//!
//! Every datagram is an [`Envelope`]: routing metadata (uid, request id,
//! sender, recipient) around a [`MessageBody`]. The body is one sum type,
//! one variant per message name; handler dispatch matches on the variant.
//!
//! Request/response pairing: `FIND_NODE` ↔ `FIND_NODE_RESPONSE` and
//! `PING` ↔ `PING_RESPONSE`. A response carries the request id of the
//! request it answers. `DISCONNECT`, `RECONNECT` and `TERMINATE` are one-way
//! lifecycle controls injected by the test driver; they carry no sender.

use kadre_types::NodeId;
use serde::{Deserialize, Serialize};

use crate::ids::{RequestId, Uid};

/// Whether a message is a request or a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Originates an exchange (or is a one-way control).
    Request,
    /// Answers a prior request, carrying its request id.
    Response,
}

/// The payload of a message, tagged by message name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Ask the recipient for the closest nodes to `target` it knows about.
    FindNode {
        /// The identifier being located.
        target: NodeId,
    },
    /// The closest identifiers the responder knows to the requested target.
    FindNodeResponse {
        /// Up to `id_length` identifiers, closest first.
        nodes: Vec<NodeId>,
    },
    /// Liveness probe.
    Ping,
    /// Liveness confirmation.
    PingResponse,
    /// Stop responding to protocol traffic until `RECONNECT`.
    Disconnect,
    /// Resume responding to protocol traffic.
    Reconnect,
    /// Deregister and stop the node.
    Terminate,
}

impl MessageBody {
    /// The wire name of the message, as it appears in journal records.
    pub fn name(&self) -> &'static str {
        match self {
            Self::FindNode { .. } => "FIND_NODE",
            Self::FindNodeResponse { .. } => "FIND_NODE_RESPONSE",
            Self::Ping => "PING",
            Self::PingResponse => "PING_RESPONSE",
            Self::Disconnect => "DISCONNECT",
            Self::Reconnect => "RECONNECT",
            Self::Terminate => "TERMINATE",
        }
    }

    /// Request/response classification.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::FindNodeResponse { .. } | Self::PingResponse => MessageKind::Response,
            _ => MessageKind::Request,
        }
    }
}

/// A complete datagram as it traverses the simulated transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique message instance id (log correlation).
    pub uid: Uid,
    /// Correlation id binding a response to its request.
    pub request_id: RequestId,
    /// The sending node, absent on driver-injected lifecycle controls.
    pub sender_id: Option<NodeId>,
    /// The destination node.
    pub recipient_id: NodeId,
    /// The typed payload.
    pub body: MessageBody,
}

impl Envelope {
    /// Build an envelope sent by a node.
    pub fn from_node(
        uid: Uid,
        request_id: RequestId,
        sender_id: NodeId,
        recipient_id: NodeId,
        body: MessageBody,
    ) -> Self {
        Self {
            uid,
            request_id,
            sender_id: Some(sender_id),
            recipient_id,
            body,
        }
    }

    /// Build a driver-injected lifecycle control, which has no sender.
    pub fn control(uid: Uid, request_id: RequestId, recipient_id: NodeId, body: MessageBody) -> Self {
        Self {
            uid,
            request_id,
            sender_id: None,
            recipient_id,
            body,
        }
    }

    /// The wire name of the payload.
    pub fn name(&self) -> &'static str {
        self.body.name()
    }
}
