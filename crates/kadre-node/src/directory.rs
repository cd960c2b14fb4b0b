//! The process-wide address book.
//!
//! Nodes of a simulation talk over tokio queues rather than sockets; the
//! address book maps a node id to the sending half of that node's inbound
//! queue. It doubles as the liveness oracle: a node is "running" exactly
//! while it is registered. Registration happens at node spawn, removal at
//! `TERMINATE`.
//!
//! The book is an explicit collaborator shared by reference: every test or
//! driver builds its own, there is no global instance.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use kadre_proto::Envelope;
use kadre_routing::PeerDirectory;
use kadre_types::NodeId;
use tokio::sync::mpsc;

type Sink = mpsc::UnboundedSender<Envelope>;

/// Registry of all reachable nodes in the process.
#[derive(Default)]
pub struct AddressBook {
    sinks: Mutex<HashMap<NodeId, Sink>>,
}

impl AddressBook {
    /// Create an empty address book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node's inbound queue, replacing any previous entry.
    pub fn register(&self, id: NodeId, sink: Sink) {
        self.lock().insert(id, sink);
    }

    /// Remove a node. Idempotent.
    pub fn deregister(&self, id: NodeId) {
        self.lock().remove(&id);
    }

    /// The inbound queue of a node, or `None` if it is not registered.
    pub fn lookup(&self, id: NodeId) -> Option<Sink> {
        self.lock().get(&id).cloned()
    }

    /// Whether a node is currently registered.
    pub fn is_running(&self, id: NodeId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Number of registered nodes.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no node is registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<NodeId, Sink>> {
        match self.sinks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl PeerDirectory for AddressBook {
    fn sink(&self, id: NodeId) -> Option<Sink> {
        self.lookup(id)
    }

    fn is_running(&self, id: NodeId) -> bool {
        AddressBook::is_running(self, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u128) -> NodeId {
        NodeId::new(raw)
    }

    #[test]
    fn test_register_and_lookup() {
        let book = AddressBook::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        book.register(id(5), tx);

        assert!(book.is_running(id(5)));
        assert!(book.lookup(id(5)).is_some());
        assert!(book.lookup(id(6)).is_none());
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn test_deregister() {
        let book = AddressBook::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        book.register(id(5), tx);
        book.deregister(id(5));
        book.deregister(id(5));

        assert!(!book.is_running(id(5)));
        assert!(book.is_empty());
    }

    #[test]
    fn test_lookup_returns_usable_sink() {
        let book = AddressBook::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        book.register(id(5), tx);

        let sink = book.lookup(id(5)).expect("registered");
        let envelope = Envelope::control(
            kadre_proto::Uid(1),
            kadre_proto::RequestId(1),
            id(5),
            kadre_proto::MessageBody::Reconnect,
        );
        sink.send(envelope.clone()).expect("send");
        assert_eq!(rx.try_recv().expect("delivered"), envelope);
    }
}
