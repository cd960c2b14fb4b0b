//! # kadre-node
//!
//! The node core of the Kadre routing subsystem: the piece that owns a
//! routing table, listens on an inbound queue and speaks the protocol.
//!
//! This crate provides:
//! - [`AddressBook`](directory::AddressBook) — the process-wide registry
//!   mapping node ids to inbound queues; the simulated transport
//! - [`Node`](node::Node) — the receive loop and message handlers: answer
//!   `FIND_NODE` and `PING`, fold responses into the routing table, honor
//!   the `DISCONNECT`/`RECONNECT`/`TERMINATE` lifecycle, and bootstrap
//!   against a well-known origin node
//!
//! A simulation builds one [`AddressBook`](directory::AddressBook) and one
//! [`IdSource`](kadre_proto::IdSource), spawns an origin node and any number
//! of joining nodes, and then drives them purely through messages.

pub mod directory;
pub mod node;

use kadre_types::NodeId;

pub use directory::AddressBook;
pub use node::{send_control, Node, NodeHandle};

/// Errors raised while constructing a node.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// The configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(#[from] kadre_types::ConfigError),

    /// The routing table rejected its construction parameters.
    #[error(transparent)]
    Routing(#[from] kadre_routing::RoutingError),

    /// The bootstrap origin is not registered in the address book.
    #[error("origin node {0} is not registered")]
    UnknownOrigin(NodeId),
}

/// Convenience result type for node construction.
pub type Result<T> = std::result::Result<T, NodeError>;
