//! Per-process message identifier sources.
//!
//! Two independent monotonic counters back the message model:
//!
//! - the **uid** stamps every message instance once, for log correlation;
//! - the **request id** binds a response to its request (responses copy the
//!   request's id instead of drawing a fresh one).
//!
//! An [`IdSource`] is an explicit collaborator handed to every node of a
//! simulation, never an ambient global; tests instantiate their own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Unique message identifier, used for log correlation only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(pub u64);

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation identifier binding a response to its request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared source of fresh uids and request ids.
///
/// Cloning is cheap and clones draw from the same counters, so a single
/// source shared across all nodes of a process yields globally unique ids.
#[derive(Clone, Debug, Default)]
pub struct IdSource {
    inner: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    uid: AtomicU64,
    request: AtomicU64,
}

impl IdSource {
    /// Create a fresh source with both counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw the next message uid.
    pub fn next_uid(&self) -> Uid {
        Uid(self.inner.uid.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Draw the next request id.
    pub fn next_request_id(&self) -> RequestId {
        RequestId(self.inner.request.fetch_add(1, Ordering::Relaxed) + 1)
    }
}
