//! # kadre-routing
//!
//! The XOR-distance routing table of a Kadre node and its liveness
//! machinery.
//!
//! This crate implements:
//! - [`Bucket`](bucket::Bucket) — a capacity-bounded set of node entries
//!   ordered by confirmed-liveness recency
//! - [`RoutingTable`](table::RoutingTable) — one bucket per identifier bit,
//!   selected through a precomputed mask table, with per-bucket insertion
//!   pools that dedup candidates colliding with a full bucket
//! - [`PingSupervisor`](supervisor::PingSupervisor) — outstanding-PING
//!   records with an expiry scanner that fires a callback once per record
//!   not cancelled in time
//! - [`Router`](router::Router) — the table behind one lock, a pool-scanner
//!   task, and the replacement protocol: PING the least-recently-seen entry
//!   of a full bucket, keep it on response, evict and replace it on timeout
//!
//! ## Replacement protocol
//!
//! A candidate that collides with a full bucket is parked in that bucket's
//! insertion pool. The pool scanner picks one parked candidate per bucket at
//! a time (the pool's `busy` flag guarantees at most one PING in flight per
//! bucket) and probes the bucket's least-recently-seen entry. A response
//! refreshes the probed entry and discards the candidate; a timeout evicts
//! the probed entry and inserts the candidate in the freed slot.

pub mod bucket;
pub mod router;
pub mod supervisor;
pub mod table;

use kadre_proto::RequestId;
use kadre_types::NodeId;

pub use bucket::{AddOutcome, Bucket};
pub use router::{PeerDirectory, Router};
pub use supervisor::{OutstandingPing, PingSupervisor};
pub use table::{InsertOutcome, RoutingTable};

/// Errors raised by routing-table and supervisor operations.
///
/// These are programmer errors: every variant indicates a call that violates
/// an invariant of the caller, not a condition the network can produce.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    /// The local node id was offered to its own routing table.
    #[error("the local id {0} cannot be inserted into its own routing table")]
    LocalId(NodeId),

    /// An id wider than the configured key space was offered.
    #[error("id {id} does not fit the {id_length}-bit key space")]
    IdWidth {
        /// The offending identifier.
        id: NodeId,
        /// The configured identifier width.
        id_length: u32,
    },

    /// An eviction named an id that is not in the table.
    #[error("id {0} is not present in the routing table")]
    UnknownNode(NodeId),

    /// A bucket index outside `0..id_length`.
    #[error("bucket index {index} out of range (0..{id_length})")]
    BucketIndex {
        /// The offending index.
        index: usize,
        /// The configured identifier width (and bucket count).
        id_length: u32,
    },

    /// A supervisor record reused a request id that is still tracked.
    #[error("request id {0} is already supervised")]
    DuplicateRequestId(RequestId),
}

/// Convenience result type for routing operations.
pub type Result<T> = std::result::Result<T, RoutingError>;
