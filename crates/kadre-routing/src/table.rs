//! The routing table: one bucket per identifier bit, plus insertion pools.
//!
//! ## Bucket selection
//!
//! Bucket `i` holds the ids whose XOR distance to the local id has its
//! highest set bit at position `i`. Selection is by a mask table computed
//! once per local id: `mask[i] = (local_id >> i) ^ 1`, and an id belongs to
//! bucket `i` exactly when `(id >> i) == mask[i]`. For an 8-bit space and
//! local id `0b00000101`:
//!
//! ```text
//! bucket 0: 00000100      bucket 4: 0001....
//! bucket 1: 0000011.      bucket 5: 001.....
//! bucket 2: 000000..      bucket 6: 01......
//! bucket 3: 00001...      bucket 7: 1.......
//! ```
//!
//! Every non-local id in range matches exactly one mask. The local id
//! matches none; offering it is a caller bug.
//!
//! ## Insertion pools
//!
//! A candidate that collides with a full bucket is parked in that bucket's
//! pool instead of being probed immediately. The pool dedups candidates and
//! its `busy` flag admits at most one replacement probe per bucket at a
//! time; the scanning and probing itself live in
//! [`Router`](crate::router::Router).

use kadre_types::{KadConfig, NodeId};
use rand::Rng;

use crate::bucket::{AddOutcome, Bucket};
use crate::{Result, RoutingError};

/// Outcome of offering an id to the routing table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A free slot was available; the id is now in the table.
    Inserted {
        /// Index of the receiving bucket.
        bucket: usize,
    },
    /// The id was already present; its liveness timestamp was refreshed.
    Refreshed {
        /// Index of the holding bucket.
        bucket: usize,
    },
    /// The bucket is full; the id was parked in the insertion pool.
    Deferred {
        /// Index of the full bucket.
        bucket: usize,
    },
    /// The bucket is full and the id was already parked; nothing changed.
    AlreadyPending {
        /// Index of the full bucket.
        bucket: usize,
    },
    /// The bucket is full and pooling was bypassed; the id was discarded.
    ///
    /// Only [`RoutingTable::seed`] produces this.
    Dropped {
        /// Index of the full bucket.
        bucket: usize,
    },
}

impl InsertOutcome {
    /// Index of the bucket the id mapped to.
    pub fn bucket(self) -> usize {
        match self {
            Self::Inserted { bucket }
            | Self::Refreshed { bucket }
            | Self::Deferred { bucket }
            | Self::AlreadyPending { bucket }
            | Self::Dropped { bucket } => bucket,
        }
    }
}

/// A parked candidate claimed by the pool scanner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingCandidate {
    /// Index of the full bucket the candidate is waiting on.
    pub bucket: usize,
    /// The waiting id.
    pub candidate: NodeId,
}

#[derive(Clone, Debug, Default)]
struct InsertionPool {
    waiting: Vec<NodeId>,
    /// True while one candidate from this pool is being evaluated.
    busy: bool,
}

/// The per-node routing table.
pub struct RoutingTable {
    local_id: NodeId,
    id_length: u32,
    masks: Vec<u128>,
    buckets: Vec<Bucket>,
    pools: Vec<InsertionPool>,
}

impl RoutingTable {
    /// Create the routing table for `local_id`.
    ///
    /// # Errors
    ///
    /// [`RoutingError::IdWidth`] if the local id does not fit the configured
    /// identifier width.
    pub fn new(local_id: NodeId, config: &KadConfig) -> Result<Self> {
        if !local_id.fits(config.id_length) {
            return Err(RoutingError::IdWidth {
                id: local_id,
                id_length: config.id_length,
            });
        }
        let length = config.id_length as usize;
        let masks = (0..length)
            .map(|i| (local_id.raw() >> i) ^ 1)
            .collect();
        Ok(Self {
            local_id,
            id_length: config.id_length,
            masks,
            buckets: (0..length).map(|_| Bucket::new(config.k)).collect(),
            pools: (0..length).map(|_| InsertionPool::default()).collect(),
        })
    }

    /// The owning node's id.
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// The identifier width in bits (and the bucket count).
    pub fn id_length(&self) -> u32 {
        self.id_length
    }

    /// The bucket index a non-local id belongs to.
    ///
    /// # Errors
    ///
    /// [`RoutingError::LocalId`] for the local id, which belongs to no
    /// bucket; [`RoutingError::IdWidth`] for an id outside the key space.
    pub fn find_bucket(&self, id: NodeId) -> Result<usize> {
        if id == self.local_id {
            return Err(RoutingError::LocalId(id));
        }
        if !id.fits(self.id_length) {
            return Err(RoutingError::IdWidth {
                id,
                id_length: self.id_length,
            });
        }
        let raw = id.raw();
        self.masks
            .iter()
            .enumerate()
            .find(|&(i, &mask)| (raw >> i) == mask)
            .map(|(i, _)| i)
            .ok_or(RoutingError::IdWidth {
                id,
                id_length: self.id_length,
            })
    }

    /// Offer a discovered id to the table.
    ///
    /// A free slot inserts, an already-present id is refreshed, and a
    /// collision with a full bucket parks the id in the bucket's insertion
    /// pool for the scanner to evaluate. This call never probes anything
    /// itself.
    ///
    /// # Errors
    ///
    /// Propagates [`find_bucket`](Self::find_bucket) failures.
    pub fn insert(&mut self, id: NodeId) -> Result<InsertOutcome> {
        let bucket = self.find_bucket(id)?;
        match self.buckets[bucket].add(id) {
            AddOutcome::Inserted => Ok(InsertOutcome::Inserted { bucket }),
            AddOutcome::AlreadyPresent => {
                self.buckets[bucket].touch(id);
                Ok(InsertOutcome::Refreshed { bucket })
            }
            AddOutcome::Full => {
                let pool = &mut self.pools[bucket];
                if pool.waiting.contains(&id) {
                    Ok(InsertOutcome::AlreadyPending { bucket })
                } else {
                    pool.waiting.push(id);
                    Ok(InsertOutcome::Deferred { bucket })
                }
            }
        }
    }

    /// Offer an id without pooling, for seeding an empty table at bootstrap.
    ///
    /// A collision with a full bucket discards the id instead of parking it.
    ///
    /// # Errors
    ///
    /// Propagates [`find_bucket`](Self::find_bucket) failures.
    pub fn seed(&mut self, id: NodeId) -> Result<InsertOutcome> {
        let bucket = self.find_bucket(id)?;
        match self.buckets[bucket].add(id) {
            AddOutcome::Inserted => Ok(InsertOutcome::Inserted { bucket }),
            AddOutcome::AlreadyPresent => {
                self.buckets[bucket].touch(id);
                Ok(InsertOutcome::Refreshed { bucket })
            }
            AddOutcome::Full => Ok(InsertOutcome::Dropped { bucket }),
        }
    }

    /// Refresh the liveness timestamp of a present id. No-op if absent.
    ///
    /// # Errors
    ///
    /// Propagates [`find_bucket`](Self::find_bucket) failures.
    pub fn touch(&mut self, id: NodeId) -> Result<()> {
        let bucket = self.find_bucket(id)?;
        self.buckets[bucket].touch(id);
        Ok(())
    }

    /// Remove an id from its bucket, returning the bucket index.
    ///
    /// # Errors
    ///
    /// [`RoutingError::UnknownNode`] if the id is not in the table, plus
    /// [`find_bucket`](Self::find_bucket) failures.
    pub fn evict(&mut self, id: NodeId) -> Result<usize> {
        let bucket = self.find_bucket(id)?;
        self.buckets[bucket].remove(id)?;
        Ok(bucket)
    }

    /// Whether the id is present in its bucket.
    pub fn contains(&self, id: NodeId) -> bool {
        self.find_bucket(id)
            .map(|bucket| self.buckets[bucket].contains(id))
            .unwrap_or(false)
    }

    /// Total number of ids across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Bucket::len).sum()
    }

    /// Whether the table holds no ids at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Up to `count` ids sorted by ascending XOR distance to `target`,
    /// equidistant ids ordered by id.
    ///
    /// Point-in-time snapshot over all buckets.
    pub fn find_closest(&self, target: NodeId, count: usize) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.buckets.iter().flat_map(Bucket::ids).collect();
        ids.sort_by_key(|id| (id.distance(target), *id));
        ids.truncate(count);
        ids
    }

    /// The least-recently-seen id of a bucket, if the bucket is non-empty.
    pub fn least_recently_seen_in(&self, bucket: usize) -> Option<NodeId> {
        self.buckets.get(bucket)?.least_recently_seen()
    }

    /// A uniformly random id belonging to bucket `index`.
    ///
    /// Built as `mask[index] << index` with the low `index` bits drawn at
    /// random, which is exactly the id range of that bucket.
    ///
    /// # Errors
    ///
    /// [`RoutingError::BucketIndex`] if `index` is out of range.
    pub fn random_id_in_bucket(&self, index: usize) -> Result<NodeId> {
        let mask = *self
            .masks
            .get(index)
            .ok_or(RoutingError::BucketIndex {
                index,
                id_length: self.id_length,
            })?;
        let low_bits = if index == 0 {
            0
        } else {
            rand::thread_rng().gen::<u128>() & ((1u128 << index) - 1)
        };
        Ok(NodeId::new((mask << index) | low_bits))
    }

    /// Indices of empty buckets in the far half of the table.
    ///
    /// These are the refresh targets after bootstrap: the sub-trees farthest
    /// from the local id that no discovered peer has populated yet.
    pub fn empty_far_buckets(&self) -> Vec<usize> {
        let from = self.buckets.len() / 2;
        (from..self.buckets.len())
            .filter(|&i| self.buckets[i].is_empty())
            .collect()
    }

    /// Single-line textual dump: `{i:[id,id] j:[id]}` over non-empty
    /// buckets in ascending index order, ids in insertion order.
    pub fn dump(&self) -> String {
        let groups: Vec<String> = self
            .buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| !bucket.is_empty())
            .map(|(i, bucket)| {
                let ids: Vec<String> =
                    bucket.ids().iter().map(ToString::to_string).collect();
                format!("{}:[{}]", i, ids.join(","))
            })
            .collect();
        format!("{{{}}}", groups.join(" "))
    }

    // ---------------------------------------------------------------
    // Insertion-pool operations (driven by the Router's pool scanner)
    // ---------------------------------------------------------------

    /// Claim one candidate from every idle, non-empty pool.
    ///
    /// Claimed pools are flagged busy; the candidate stays parked until the
    /// probe it triggers resolves. Pools already busy are skipped.
    pub fn claim_pending(&mut self) -> Vec<PendingCandidate> {
        let mut claimed = Vec::new();
        for (bucket, pool) in self.pools.iter_mut().enumerate() {
            if pool.busy || pool.waiting.is_empty() {
                continue;
            }
            pool.busy = true;
            claimed.push(PendingCandidate {
                bucket,
                candidate: pool.waiting[0],
            });
        }
        claimed
    }

    /// Drop a candidate from a bucket's pool, if parked there.
    pub fn pool_remove(&mut self, bucket: usize, id: NodeId) {
        if let Some(pool) = self.pools.get_mut(bucket) {
            pool.waiting.retain(|waiting| *waiting != id);
        }
    }

    /// Clear a bucket's busy flag, letting the scanner claim its next
    /// candidate.
    pub fn release_pool(&mut self, bucket: usize) {
        if let Some(pool) = self.pools.get_mut(bucket) {
            pool.busy = false;
        }
    }

    /// Whether a bucket currently has a probe in flight.
    pub fn pool_is_busy(&self, bucket: usize) -> bool {
        self.pools.get(bucket).is_some_and(|pool| pool.busy)
    }

    /// The candidates parked on a bucket.
    pub fn pending_in(&self, bucket: usize) -> Vec<NodeId> {
        self.pools
            .get(bucket)
            .map(|pool| pool.waiting.clone())
            .unwrap_or_default()
    }

    /// Total parked candidates across all pools.
    pub fn pending_total(&self) -> usize {
        self.pools.iter().map(|pool| pool.waiting.len()).sum()
    }

    #[cfg(test)]
    fn bucket_ids(&self, bucket: usize) -> Vec<NodeId> {
        self.buckets[bucket].ids()
    }
}
