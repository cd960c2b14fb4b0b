//! Supervision of outstanding PING messages.
//!
//! PINGs travel over an unreliable datagram channel, so a missing response
//! never announces itself; it has to be noticed. The supervisor holds one
//! record per in-flight PING and runs a scanner task that periodically
//! collects the records whose expiry has passed. Each expired record fires
//! the expiry callback exactly once; a record cancelled first (because the
//! response arrived) never fires.
//!
//! Records live in a map behind a mutex. The scanner removes expired
//! records under the lock, releases it, and only then dispatches the
//! callbacks, each on its own task — a callback can take other locks freely
//! and can never stall the scanner.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use kadre_proto::{Envelope, RequestId};
use kadre_types::NodeId;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{Result, RoutingError};

/// A sent PING whose response has not arrived and whose expiry has not
/// passed.
#[derive(Clone, Debug)]
pub struct OutstandingPing {
    /// The correlation id the response must carry.
    pub request_id: RequestId,
    /// When the PING is deemed unanswered. Measured on the tokio clock so
    /// time-controlled tests can drive expiry.
    pub expires_at: Instant,
    /// The PING envelope as it was sent.
    pub message: Envelope,
    /// The candidate that replaces the probed node if the PING expires.
    pub replacement: NodeId,
}

/// Callback fired once for every record that expires without being
/// cancelled.
pub type ExpiryCallback = Arc<dyn Fn(OutstandingPing) + Send + Sync>;

type Records = Arc<Mutex<HashMap<RequestId, OutstandingPing>>>;

/// Tracks outstanding PINGs and fires an expiry callback per timed-out
/// record.
///
/// Cloning yields another handle to the same record map and scanner.
#[derive(Clone)]
pub struct PingSupervisor {
    records: Records,
    shutdown: watch::Sender<bool>,
}

impl PingSupervisor {
    /// Start a supervisor whose scanner wakes every `scan_period`.
    ///
    /// Must be called within a tokio runtime; the scanner runs until
    /// [`shutdown`](Self::shutdown).
    pub fn spawn(scan_period: Duration, on_expiry: ExpiryCallback) -> Self {
        let records: Records = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let scanner_records = Arc::clone(&records);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scan_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let expired = collect_expired(&scanner_records);
                        for record in expired {
                            let callback = Arc::clone(&on_expiry);
                            tokio::spawn(async move { callback(record) });
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            trace!("ping supervisor scanner stopped");
        });

        Self { records, shutdown }
    }

    /// Place a PING under supervision.
    ///
    /// # Errors
    ///
    /// [`RoutingError::DuplicateRequestId`] if the request id is already
    /// tracked.
    pub fn track(&self, record: OutstandingPing) -> Result<()> {
        let mut records = lock(&self.records);
        if records.contains_key(&record.request_id) {
            return Err(RoutingError::DuplicateRequestId(record.request_id));
        }
        records.insert(record.request_id, record);
        Ok(())
    }

    /// Drop a record if present. Idempotent.
    pub fn cancel(&self, request_id: RequestId) {
        lock(&self.records).remove(&request_id);
    }

    /// Remove and return a record, or `None` if it is not tracked.
    pub fn take(&self, request_id: RequestId) -> Option<OutstandingPing> {
        lock(&self.records).remove(&request_id)
    }

    /// Whether a request id is currently tracked.
    pub fn is_tracking(&self, request_id: RequestId) -> bool {
        lock(&self.records).contains_key(&request_id)
    }

    /// Number of records currently tracked.
    pub fn outstanding(&self) -> usize {
        lock(&self.records).len()
    }

    /// Stop the scanner. It exits by its next tick boundary; already
    /// dispatched callbacks still run.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

fn collect_expired(records: &Records) -> Vec<OutstandingPing> {
    let now = Instant::now();
    let mut records = lock(records);
    let expired_ids: Vec<RequestId> = records
        .iter()
        .filter(|(_, record)| record.expires_at < now)
        .map(|(id, _)| *id)
        .collect();
    let expired: Vec<OutstandingPing> = expired_ids
        .iter()
        .filter_map(|id| records.remove(id))
        .collect();
    if !expired.is_empty() {
        debug!(count = expired.len(), "outstanding pings expired");
    }
    expired
}

fn lock(records: &Records) -> MutexGuard<'_, HashMap<RequestId, OutstandingPing>> {
    match records.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
