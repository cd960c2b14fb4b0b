//! The router: the routing table behind one lock, plus the tasks and
//! protocol steps that keep it fresh.
//!
//! A [`Router`] owns a [`RoutingTable`] guarded by a single mutex (every
//! mutation and every snapshot goes through it), a [`PingSupervisor`], and a
//! pool-scanner task. The scanner wakes on a fixed period, claims one parked
//! candidate per idle bucket pool and runs the replacement probe:
//!
//! 1. PING the bucket's least-recently-seen entry.
//! 2. On `PING_RESPONSE` (before the timeout): refresh the probed entry and
//!    discard the candidate — established nodes win.
//! 3. On timeout (or when the probed node has no reachable sink at all):
//!    evict the probed entry and insert the candidate in the freed slot.
//!
//! The pool `busy` flag is set while a probe is in flight, so a bucket never
//! has more than one outstanding PING, no matter how many concurrent
//! discoveries name it.

use std::sync::{Arc, Mutex, MutexGuard};

use kadre_proto::{Envelope, IdSource, Journal, MessageAction, MessageBody};
use kadre_types::{KadConfig, NodeId};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::supervisor::{OutstandingPing, PingSupervisor};
use crate::table::{InsertOutcome, PendingCandidate, RoutingTable};
use crate::Result;

/// The router-facing view of the process-wide address book.
///
/// Implemented by whoever owns the real registry; the router only ever
/// resolves sinks and probes liveness.
pub trait PeerDirectory: Send + Sync {
    /// The inbound queue of a node, or `None` if it is not registered.
    fn sink(&self, id: NodeId) -> Option<mpsc::UnboundedSender<Envelope>>;

    /// Whether a node is currently registered.
    fn is_running(&self, id: NodeId) -> bool;
}

struct RouterCore {
    local_id: NodeId,
    config: KadConfig,
    table: Mutex<RoutingTable>,
    directory: Arc<dyn PeerDirectory>,
    ids: IdSource,
    journal: Journal,
}

impl RouterCore {
    fn lock_table(&self) -> MutexGuard<'_, RoutingTable> {
        match self.table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// The routing table of one node together with its liveness machinery.
pub struct Router {
    core: Arc<RouterCore>,
    supervisor: PingSupervisor,
    scanner_shutdown: watch::Sender<bool>,
}

impl Router {
    /// Build the router and start its background tasks.
    ///
    /// Must be called within a tokio runtime. The supervisor scanner and the
    /// pool scanner run until [`shutdown`](Self::shutdown).
    ///
    /// # Errors
    ///
    /// [`crate::RoutingError::IdWidth`] if the local id does not fit the
    /// configured identifier width.
    pub fn new(
        local_id: NodeId,
        config: KadConfig,
        directory: Arc<dyn PeerDirectory>,
        ids: IdSource,
        journal: Journal,
    ) -> Result<Self> {
        let table = RoutingTable::new(local_id, &config)?;
        let core = Arc::new(RouterCore {
            local_id,
            config,
            table: Mutex::new(table),
            directory,
            ids,
            journal,
        });

        let expiry_core = Arc::clone(&core);
        let supervisor = PingSupervisor::spawn(
            core.config.supervisor_scan_period(),
            Arc::new(move |record| handle_expiry(&expiry_core, record)),
        );

        let (scanner_shutdown, shutdown_rx) = watch::channel(false);
        spawn_pool_scanner(Arc::clone(&core), supervisor.clone(), shutdown_rx);

        Ok(Self {
            core,
            supervisor,
            scanner_shutdown,
        })
    }

    /// The owning node's id.
    pub fn local_id(&self) -> NodeId {
        self.core.local_id
    }

    /// Offer a discovered id to the table.
    ///
    /// # Errors
    ///
    /// Propagates [`RoutingTable::insert`] failures (local id, id width).
    pub fn insert(&self, id: NodeId) -> Result<InsertOutcome> {
        let outcome = self.core.lock_table().insert(id)?;
        if let InsertOutcome::Deferred { bucket } = outcome {
            debug!(node_id = %self.core.local_id, candidate = %id, bucket, "bucket full, candidate parked");
        }
        Ok(outcome)
    }

    /// Seed the table at bootstrap, bypassing the insertion pools.
    ///
    /// # Errors
    ///
    /// Propagates [`RoutingTable::seed`] failures.
    pub fn seed(&self, id: NodeId) -> Result<InsertOutcome> {
        self.core.lock_table().seed(id)
    }

    /// Remove an id from the table.
    ///
    /// # Errors
    ///
    /// [`crate::RoutingError::UnknownNode`] if it is not present.
    pub fn evict(&self, id: NodeId) -> Result<usize> {
        self.core.lock_table().evict(id)
    }

    /// Up to `count` known ids closest to `target`, as one consistent
    /// snapshot.
    pub fn find_closest(&self, target: NodeId, count: usize) -> Vec<NodeId> {
        self.core.lock_table().find_closest(target, count)
    }

    /// Fold a `PING_RESPONSE` into the table.
    ///
    /// Cancels the outstanding record for the response's request id (a
    /// response with no record is a late duplicate and is dropped),
    /// refreshes the prober's view of the sender and discards the
    /// replacement candidate the probe was evaluating.
    pub fn on_ping_response(&self, envelope: &Envelope) {
        let Some(record) = self.supervisor.take(envelope.request_id) else {
            debug!(request_id = %envelope.request_id, "response for unknown ping dropped");
            return;
        };
        let Some(sender) = envelope.sender_id else {
            warn!(request_id = %envelope.request_id, "ping response without sender dropped");
            return;
        };

        let mut table = self.core.lock_table();
        if let Err(error) = table.touch(sender) {
            warn!(%error, "ping responder could not be refreshed");
        }
        match table.find_bucket(record.replacement) {
            Ok(bucket) => {
                // The probed entry proved alive; the candidate loses.
                table.pool_remove(bucket, record.replacement);
                table.pool_remove(bucket, sender);
                table.release_pool(bucket);
                debug!(
                    node_id = %self.core.local_id,
                    probed = %sender,
                    candidate = %record.replacement,
                    "probed entry alive, candidate discarded"
                );
            }
            Err(error) => warn!(%error, "replacement candidate has no bucket"),
        }
    }

    /// Single-line textual dump of the table.
    pub fn dump(&self) -> String {
        self.core.lock_table().dump()
    }

    /// Total number of ids in the table.
    pub fn len(&self) -> usize {
        self.core.lock_table().len()
    }

    /// Whether the table holds no ids.
    pub fn is_empty(&self) -> bool {
        self.core.lock_table().is_empty()
    }

    /// Whether an id is present in the table.
    pub fn contains(&self, id: NodeId) -> bool {
        self.core.lock_table().contains(id)
    }

    /// A random id belonging to bucket `index`.
    ///
    /// # Errors
    ///
    /// [`crate::RoutingError::BucketIndex`] if `index` is out of range.
    pub fn random_id_in_bucket(&self, index: usize) -> Result<NodeId> {
        self.core.lock_table().random_id_in_bucket(index)
    }

    /// Indices of empty buckets in the far half of the table.
    pub fn empty_far_buckets(&self) -> Vec<usize> {
        self.core.lock_table().empty_far_buckets()
    }

    /// The candidates parked on a bucket.
    pub fn pending_in(&self, bucket: usize) -> Vec<NodeId> {
        self.core.lock_table().pending_in(bucket)
    }

    /// Whether a bucket currently has a probe in flight.
    pub fn pool_is_busy(&self, bucket: usize) -> bool {
        self.core.lock_table().pool_is_busy(bucket)
    }

    /// Number of PINGs currently awaiting a response.
    pub fn outstanding_pings(&self) -> usize {
        self.supervisor.outstanding()
    }

    /// Stop the pool scanner and the supervisor. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.scanner_shutdown.send(true);
        self.supervisor.shutdown();
    }
}

fn spawn_pool_scanner(
    core: Arc<RouterCore>,
    supervisor: PingSupervisor,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(core.config.pool_scan_period());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let claimed = core.lock_table().claim_pending();
                    for pending in claimed {
                        ping_for_replacement(&core, &supervisor, pending);
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(node_id = %core.local_id, "pool scanner stopped");
    });
}

/// Probe the least-recently-seen entry of a full bucket on behalf of a
/// parked candidate.
fn ping_for_replacement(
    core: &Arc<RouterCore>,
    supervisor: &PingSupervisor,
    pending: PendingCandidate,
) {
    let PendingCandidate { bucket, candidate } = pending;

    let probed = {
        let mut table = core.lock_table();
        match table.least_recently_seen_in(bucket) {
            Some(probed) => probed,
            None => {
                // The bucket emptied while the candidate waited; take the
                // free slot directly.
                if let Err(error) = table.insert(candidate) {
                    error!(%error, "parked candidate could not be inserted");
                }
                table.pool_remove(bucket, candidate);
                table.release_pool(bucket);
                return;
            }
        }
    };

    let request_id = core.ids.next_request_id();
    let envelope = Envelope::from_node(
        core.ids.next_uid(),
        request_id,
        core.local_id,
        probed,
        MessageBody::Ping,
    );
    let record = OutstandingPing {
        request_id,
        expires_at: Instant::now() + core.config.ping_timeout(),
        message: envelope.clone(),
        replacement: candidate,
    };

    let Some(sink) = core.directory.sink(probed) else {
        debug!(node_id = %core.local_id, %probed, "probe target unreachable, treated as timed out");
        handle_expiry(core, record);
        return;
    };

    if let Err(error) = supervisor.track(record.clone()) {
        error!(%error, "probe could not be supervised");
        core.lock_table().release_pool(bucket);
        return;
    }

    debug!(node_id = %core.local_id, %probed, candidate = %candidate, %request_id, "probing least-recently-seen entry");
    core.journal.message(&envelope, MessageAction::Send);
    if sink.send(envelope).is_err() {
        // The recipient tore down its queue between lookup and send.
        supervisor.cancel(request_id);
        handle_expiry(core, record);
    }
}

/// Resolve an expired (or unreachable) probe: evict the probed entry and
/// seat the candidate in the freed slot.
fn handle_expiry(core: &Arc<RouterCore>, record: OutstandingPing) {
    let probed = record.message.recipient_id;
    let mut table = core.lock_table();

    let bucket = match table.find_bucket(record.replacement) {
        Ok(bucket) => bucket,
        Err(error) => {
            error!(%error, "expired probe carries an unroutable candidate");
            return;
        }
    };

    match table.evict(probed) {
        Ok(_) => {
            info!(node_id = %core.local_id, evicted = %probed, replacement = %record.replacement, "stale entry replaced");
        }
        Err(error) => error!(%error, "probed entry missing at eviction"),
    }
    if let Err(error) = table.insert(record.replacement) {
        error!(%error, "replacement could not be inserted");
    }
    table.pool_remove(bucket, record.replacement);
    table.release_pool(bucket);
    let dump = table.dump();
    drop(table);

    core.journal.table(record.message.uid, core.local_id, &dump);
}
