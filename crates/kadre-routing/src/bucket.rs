//! A single k-bucket: a capacity-bounded set of node entries with recency.
//!
//! Entries carry a `last_seen` timestamp advanced only by confirmed
//! liveness (insertion, a re-offer of an already-present id, or a PING
//! response). Recency ties are broken by insertion order, so
//! least/most-recently-seen are total even when timestamps collide.
//! Entries never vanish on their own; they leave only through
//! [`Bucket::remove`].

use std::time::Instant;

use kadre_types::NodeId;

use crate::{Result, RoutingError};

/// Outcome of offering an id to a bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// The id was inserted into a free slot.
    Inserted,
    /// The id was already present; nothing changed.
    AlreadyPresent,
    /// The bucket is at capacity and the id is not in it.
    Full,
}

#[derive(Clone, Debug)]
struct NodeEntry {
    id: NodeId,
    last_seen: Instant,
    /// Insertion sequence within this bucket; the recency tie-breaker.
    seq: u64,
}

/// A capacity-bounded set of node entries ordered by liveness recency.
#[derive(Clone, Debug)]
pub struct Bucket {
    capacity: usize,
    next_seq: u64,
    entries: Vec<NodeEntry>,
}

impl Bucket {
    /// Create an empty bucket holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_seq: 0,
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the bucket holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the bucket is at capacity.
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Whether the given id is present.
    pub fn contains(&self, id: NodeId) -> bool {
        self.position(id).is_some()
    }

    fn position(&self, id: NodeId) -> Option<usize> {
        self.entries.iter().position(|entry| entry.id == id)
    }

    /// Offer an id to the bucket.
    ///
    /// A newly inserted entry adopts the current time as its `last_seen`.
    /// An id that is already present is left untouched (callers decide
    /// whether a re-offer counts as a liveness confirmation and call
    /// [`touch`](Self::touch) themselves).
    pub fn add(&mut self, id: NodeId) -> AddOutcome {
        if self.contains(id) {
            return AddOutcome::AlreadyPresent;
        }
        if self.is_full() {
            return AddOutcome::Full;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(NodeEntry {
            id,
            last_seen: Instant::now(),
            seq,
        });
        AddOutcome::Inserted
    }

    /// Remove an entry.
    ///
    /// # Errors
    ///
    /// [`RoutingError::UnknownNode`] if the id is not in the bucket.
    pub fn remove(&mut self, id: NodeId) -> Result<()> {
        match self.position(id) {
            Some(index) => {
                self.entries.remove(index);
                Ok(())
            }
            None => Err(RoutingError::UnknownNode(id)),
        }
    }

    /// Mark an entry as seen right now. No-op if the id is absent.
    pub fn touch(&mut self, id: NodeId) {
        if let Some(index) = self.position(id) {
            self.entries[index].last_seen = Instant::now();
            let seq = self.next_seq;
            self.next_seq += 1;
            self.entries[index].seq = seq;
        }
    }

    /// The entry with the oldest liveness confirmation.
    pub fn least_recently_seen(&self) -> Option<NodeId> {
        self.entries
            .iter()
            .min_by_key(|entry| (entry.last_seen, entry.seq))
            .map(|entry| entry.id)
    }

    /// The entry with the newest liveness confirmation.
    pub fn most_recently_seen(&self) -> Option<NodeId> {
        self.entries
            .iter()
            .max_by_key(|entry| (entry.last_seen, entry.seq))
            .map(|entry| entry.id)
    }

    /// All ids in insertion order.
    pub fn ids(&self) -> Vec<NodeId> {
        self.entries.iter().map(|entry| entry.id).collect()
    }

    /// Up to `count` ids sorted by ascending XOR distance to `target`.
    ///
    /// The sort is stable: equidistant ids keep their insertion order.
    pub fn closest_to(&self, target: NodeId, count: usize) -> Vec<NodeId> {
        let mut ids = self.ids();
        ids.sort_by_key(|id| id.distance(target));
        ids.truncate(count);
        ids
    }
}
