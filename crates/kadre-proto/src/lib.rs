//! # kadre-proto
//!
//! The message model of the Kadre protocol and its observability plumbing.
//!
//! This crate provides:
//! - **Messages** — the [`Envelope`](messages::Envelope) carrying a
//!   [`MessageBody`](messages::MessageBody) sum type, one variant per wire
//!   message (`FIND_NODE`, `FIND_NODE_RESPONSE`, `PING`, `PING_RESPONSE`)
//!   and per lifecycle control (`DISCONNECT`, `RECONNECT`, `TERMINATE`)
//! - **Identifier sources** — the per-process monotonic counters behind
//!   message uids and request ids, via [`ids::IdSource`]
//! - **Journal** — the append-only JSON-lines record of every message sent
//!   or received and of routing-table snapshots, via [`journal::Journal`]
//!
//! Messages travel between in-process nodes over tokio queues; the envelope
//! is the complete datagram. The journal is what the offline analysis
//! tooling consumes, one JSON record per line.

pub mod ids;
pub mod journal;
pub mod messages;

pub use ids::{IdSource, RequestId, Uid};
pub use journal::{Journal, JournalError, MemorySink, MessageAction};
pub use messages::{Envelope, MessageBody, MessageKind};
