//! The node core: receive loop, message handlers, lifecycle.
//!
//! A node is spawned around an inbound queue registered in the
//! [`AddressBook`]. Its receive loop consumes one message at a time and
//! dispatches on the message tag; all routing-table work happens through the
//! node's [`Router`], so handler effects are serialized with the background
//! liveness machinery by the router's single table lock.
//!
//! Lifecycle: a node starts `connected`. While disconnected (after
//! `DISCONNECT`, until `RECONNECT`) it drops every message except
//! `TERMINATE` and `RECONNECT` without a trace in the journal. `TERMINATE`
//! deregisters the node, stops the router's background tasks and ends the
//! loop.
//!
//! Bootstrap: every node except the well-known origin seeds its table with
//! the origin's id and asks the origin for the nodes closest to itself. The
//! response's request id is remembered; when that response arrives, the node
//! sends one refresh lookup per still-empty far bucket.

use std::sync::Arc;

use kadre_proto::{
    Envelope, IdSource, Journal, MessageAction, MessageBody, RequestId,
};
use kadre_routing::{PeerDirectory, Router};
use kadre_types::{KadConfig, NodeId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::directory::AddressBook;
use crate::{NodeError, Result};

/// Handle to a spawned node.
///
/// Dropping the handle does not stop the node; send it `TERMINATE`.
pub struct NodeHandle {
    id: NodeId,
    task: JoinHandle<()>,
}

impl NodeHandle {
    /// The node's id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Wait until the node's receive loop has exited.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Inject a lifecycle control (`DISCONNECT`, `RECONNECT`, `TERMINATE`) into
/// a node's queue. Returns whether the node was reachable.
///
/// Controls come from the driver, not from a node, so they carry no sender.
pub fn send_control(
    book: &AddressBook,
    ids: &IdSource,
    to: NodeId,
    body: MessageBody,
) -> bool {
    let envelope = Envelope::control(ids.next_uid(), ids.next_request_id(), to, body);
    match book.lookup(to) {
        Some(sink) => sink.send(envelope).is_ok(),
        None => false,
    }
}

/// One Kademlia node: routing table, liveness machinery and receive loop.
pub struct Node {
    local_id: NodeId,
    config: KadConfig,
    router: Router,
    address_book: Arc<AddressBook>,
    ids: IdSource,
    journal: Journal,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    connected: bool,
    /// Request id of the bootstrap lookup; `None` on the origin node.
    bootstrap_request_id: Option<RequestId>,
}

impl Node {
    /// Register, bootstrap and start a node; returns once the receive loop
    /// is running.
    ///
    /// `origin` is the well-known node used to join the network; `None`
    /// makes this node the origin itself. Must be called within a tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// Configuration and routing-table construction failures, and
    /// [`NodeError::UnknownOrigin`] if `origin` is not registered.
    pub fn spawn(
        local_id: NodeId,
        config: KadConfig,
        origin: Option<NodeId>,
        address_book: Arc<AddressBook>,
        ids: IdSource,
        journal: Journal,
    ) -> Result<NodeHandle> {
        config.validate()?;

        let (sink, inbox) = mpsc::unbounded_channel();
        address_book.register(local_id, sink);

        let directory: Arc<dyn PeerDirectory> = address_book.clone() as Arc<dyn PeerDirectory>;
        let router = Router::new(
            local_id,
            config.clone(),
            directory,
            ids.clone(),
            journal.clone(),
        )?;

        let mut node = Node {
            local_id,
            config,
            router,
            address_book,
            ids,
            journal,
            inbox,
            connected: true,
            bootstrap_request_id: None,
        };

        if let Some(origin) = origin {
            if let Err(error) = node.bootstrap(origin) {
                node.address_book.deregister(local_id);
                node.router.shutdown();
                return Err(error);
            }
        } else {
            info!(node_id = %local_id, "origin node started");
        }

        let task = tokio::spawn(node.run());
        Ok(NodeHandle { id: local_id, task })
    }

    /// Seed the table with the origin and ask it for our neighborhood.
    fn bootstrap(&mut self, origin: NodeId) -> Result<()> {
        self.router.seed(origin)?;

        let request_id = self.ids.next_request_id();
        let envelope = Envelope::from_node(
            self.ids.next_uid(),
            request_id,
            self.local_id,
            origin,
            MessageBody::FindNode {
                target: self.local_id,
            },
        );
        self.journal.message(&envelope, MessageAction::Send);
        let sink = self
            .address_book
            .lookup(origin)
            .ok_or(NodeError::UnknownOrigin(origin))?;
        sink.send(envelope)
            .map_err(|_| NodeError::UnknownOrigin(origin))?;

        self.bootstrap_request_id = Some(request_id);
        info!(node_id = %self.local_id, %origin, "bootstrap lookup sent");
        Ok(())
    }

    async fn run(mut self) {
        while let Some(envelope) = self.inbox.recv().await {
            if !self.connected
                && !matches!(
                    envelope.body,
                    MessageBody::Terminate | MessageBody::Reconnect
                )
            {
                debug!(node_id = %self.local_id, name = envelope.name(), "disconnected, message dropped");
                continue;
            }

            self.journal.message(&envelope, MessageAction::Receive);
            if !self.dispatch(envelope) {
                break;
            }
        }
        debug!(node_id = %self.local_id, "receive loop ended");
    }

    /// Handle one message. Returns `false` when the node must stop.
    fn dispatch(&mut self, envelope: Envelope) -> bool {
        match &envelope.body {
            MessageBody::FindNode { target } => self.on_find_node(&envelope, *target),
            MessageBody::FindNodeResponse { nodes } => {
                let nodes = nodes.clone();
                self.on_find_node_response(&envelope, &nodes);
            }
            MessageBody::Ping => self.on_ping(&envelope),
            MessageBody::PingResponse => self.router.on_ping_response(&envelope),
            MessageBody::Disconnect => {
                info!(node_id = %self.local_id, "disconnected");
                self.connected = false;
            }
            MessageBody::Reconnect => {
                info!(node_id = %self.local_id, "reconnected");
                self.connected = true;
            }
            MessageBody::Terminate => {
                self.on_terminate(&envelope);
                return false;
            }
        }
        true
    }

    /// Answer with the closest known ids, then learn the asker.
    fn on_find_node(&mut self, envelope: &Envelope, target: NodeId) {
        let Some(sender) = envelope.sender_id else {
            warn!(node_id = %self.local_id, "FIND_NODE without sender dropped");
            return;
        };
        debug!(node_id = %self.local_id, %sender, %target, "FIND_NODE received");

        let closest = self
            .router
            .find_closest(target, self.config.id_length as usize);
        let response = Envelope::from_node(
            self.ids.next_uid(),
            envelope.request_id,
            self.local_id,
            sender,
            MessageBody::FindNodeResponse { nodes: closest },
        );
        self.send(response);

        if let Err(error) = self.router.insert(sender) {
            warn!(node_id = %self.local_id, %error, "FIND_NODE sender not inserted");
        }
        self.journal
            .table(envelope.uid, self.local_id, &self.router.dump());
    }

    /// Fold the returned neighborhood into the table.
    fn on_find_node_response(&mut self, envelope: &Envelope, nodes: &[NodeId]) {
        debug!(
            node_id = %self.local_id,
            count = nodes.len(),
            request_id = %envelope.request_id,
            "FIND_NODE_RESPONSE received"
        );
        for &id in nodes {
            if id == self.local_id {
                continue;
            }
            if let Err(error) = self.router.insert(id) {
                warn!(node_id = %self.local_id, %error, "returned id not inserted");
            }
        }
        self.journal
            .table(envelope.uid, self.local_id, &self.router.dump());

        if self.bootstrap_request_id == Some(envelope.request_id) {
            self.refresh_far_buckets();
        }
    }

    /// Continue the join: one lookup per still-empty far bucket.
    fn refresh_far_buckets(&self) {
        let buckets = self.router.empty_far_buckets();
        for bucket in buckets.into_iter().take(self.config.alpha) {
            let target = match self.router.random_id_in_bucket(bucket) {
                Ok(target) => target,
                Err(error) => {
                    warn!(node_id = %self.local_id, %error, "refresh target not generated");
                    continue;
                }
            };
            let Some(recipient) = self.router.find_closest(target, 1).into_iter().next() else {
                continue;
            };
            debug!(node_id = %self.local_id, bucket, %target, %recipient, "refreshing far bucket");
            let lookup = Envelope::from_node(
                self.ids.next_uid(),
                self.ids.next_request_id(),
                self.local_id,
                recipient,
                MessageBody::FindNode { target },
            );
            self.send(lookup);
        }
    }

    /// Confirm liveness, then learn the asker.
    fn on_ping(&mut self, envelope: &Envelope) {
        let Some(sender) = envelope.sender_id else {
            warn!(node_id = %self.local_id, "PING without sender dropped");
            return;
        };
        if !self.address_book.is_running(sender) {
            debug!(node_id = %self.local_id, %sender, "PING from stopped node ignored");
            return;
        }

        let response = Envelope::from_node(
            self.ids.next_uid(),
            envelope.request_id,
            self.local_id,
            sender,
            MessageBody::PingResponse,
        );
        self.send(response);

        if let Err(error) = self.router.insert(sender) {
            warn!(node_id = %self.local_id, %error, "PING sender not inserted");
        }
        self.journal
            .table(envelope.uid, self.local_id, &self.router.dump());
    }

    fn on_terminate(&mut self, envelope: &Envelope) {
        info!(node_id = %self.local_id, "terminating");
        self.journal
            .table(envelope.uid, self.local_id, &self.router.dump());
        self.address_book.deregister(self.local_id);
        self.router.shutdown();
    }

    /// Hand a message to the transport; an unknown recipient is a transient.
    fn send(&self, envelope: Envelope) {
        self.journal.message(&envelope, MessageAction::Send);
        match self.address_book.lookup(envelope.recipient_id) {
            Some(sink) => {
                if sink.send(envelope).is_err() {
                    debug!(node_id = %self.local_id, "recipient queue closed, message lost");
                }
            }
            None => {
                debug!(
                    node_id = %self.local_id,
                    recipient = %envelope.recipient_id,
                    name = envelope.name(),
                    "recipient unknown, message lost"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use kadre_proto::Uid;
    use tokio::time::timeout;

    fn id(raw: u128) -> NodeId {
        NodeId::new(raw)
    }

    fn config() -> KadConfig {
        KadConfig {
            id_length: 8,
            k: 3,
            ..Default::default()
        }
    }

    struct Sim {
        book: Arc<AddressBook>,
        ids: IdSource,
    }

    impl Sim {
        fn new() -> Self {
            Self {
                book: Arc::new(AddressBook::new()),
                ids: IdSource::new(),
            }
        }

        fn spawn(&self, local: u128, origin: Option<u128>) -> NodeHandle {
            Node::spawn(
                id(local),
                config(),
                origin.map(id),
                Arc::clone(&self.book),
                self.ids.clone(),
                Journal::disabled(),
            )
            .expect("spawn node")
        }

        /// Attach a scripted peer: registered in the book, but driven by
        /// the test instead of a receive loop.
        fn attach_peer(&self, local: u128) -> mpsc::UnboundedReceiver<Envelope> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.book.register(id(local), tx);
            rx
        }

        fn send_from(&self, sender: u128, recipient: u128, body: MessageBody) {
            let envelope = Envelope::from_node(
                self.ids.next_uid(),
                self.ids.next_request_id(),
                id(sender),
                id(recipient),
                body,
            );
            let sink = self.book.lookup(id(recipient)).expect("recipient");
            sink.send(envelope).expect("deliver");
        }
    }

    fn response_nodes(envelope: &Envelope) -> Option<Vec<NodeId>> {
        match &envelope.body {
            MessageBody::FindNodeResponse { nodes } => Some(nodes.clone()),
            _ => None,
        }
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("message expected")
            .expect("queue open")
    }

    async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<Envelope>) {
        assert!(
            timeout(Duration::from_millis(500), rx.recv()).await.is_err(),
            "unexpected message"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_reaches_origin() {
        let sim = Sim::new();
        let mut origin_inbox = sim.attach_peer(0);
        let _node = sim.spawn(5, Some(0));

        let lookup = recv(&mut origin_inbox).await;
        assert_eq!(
            lookup.body,
            MessageBody::FindNode { target: id(5) }
        );
        assert_eq!(lookup.sender_id, Some(id(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_node_answers_with_closest() {
        let sim = Sim::new();
        let _origin = sim.spawn(0, None);
        let mut peer_inbox = sim.attach_peer(9);

        // Teach the origin two ids, then query it as the scripted peer.
        sim.send_from(6, 0, MessageBody::FindNode { target: id(6) });
        sim.send_from(7, 0, MessageBody::FindNode { target: id(7) });
        tokio::time::sleep(Duration::from_millis(50)).await;

        sim.send_from(9, 0, MessageBody::FindNode { target: id(7) });
        let response = recv(&mut peer_inbox).await;
        let nodes = response_nodes(&response).expect("FIND_NODE_RESPONSE");
        assert_eq!(nodes, vec![id(7), id(6)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_node_learns_the_asker() {
        let sim = Sim::new();
        let _origin = sim.spawn(0, None);
        let mut peer_inbox = sim.attach_peer(9);

        sim.send_from(9, 0, MessageBody::FindNode { target: id(9) });
        let first = recv(&mut peer_inbox).await;
        // The asker was not yet known when the response was computed.
        assert_eq!(first.body, MessageBody::FindNodeResponse { nodes: vec![] });

        sim.send_from(9, 0, MessageBody::FindNode { target: id(9) });
        let second = recv(&mut peer_inbox).await;
        assert_eq!(
            second.body,
            MessageBody::FindNodeResponse {
                nodes: vec![id(9)]
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_is_answered_with_same_request_id() {
        let sim = Sim::new();
        let _node = sim.spawn(5, None);
        let mut peer_inbox = sim.attach_peer(9);

        let envelope = Envelope::from_node(
            Uid(100),
            RequestId(42),
            id(9),
            id(5),
            MessageBody::Ping,
        );
        sim.book.lookup(id(5)).expect("node").send(envelope).expect("deliver");

        let response = recv(&mut peer_inbox).await;
        assert_eq!(response.body, MessageBody::PingResponse);
        assert_eq!(response.request_id, RequestId(42));
        assert_eq!(response.sender_id, Some(id(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_from_stopped_node_is_ignored() {
        let sim = Sim::new();
        let _node = sim.spawn(5, None);
        let mut peer_inbox = sim.attach_peer(9);

        sim.send_from(9, 5, MessageBody::Ping);
        sim.book.deregister(id(9));
        // The probe runs when the node dequeues the message, and by then the
        // sender is gone.
        assert_silent(&mut peer_inbox).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_node_goes_quiet_until_reconnect() {
        let sim = Sim::new();
        let _node = sim.spawn(5, None);
        let mut peer_inbox = sim.attach_peer(9);

        send_control(&sim.book, &sim.ids, id(5), MessageBody::Disconnect);
        sim.send_from(9, 5, MessageBody::Ping);
        assert_silent(&mut peer_inbox).await;

        send_control(&sim.book, &sim.ids, id(5), MessageBody::Reconnect);
        sim.send_from(9, 5, MessageBody::Ping);
        let response = recv(&mut peer_inbox).await;
        assert_eq!(response.body, MessageBody::PingResponse);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_deregisters_and_stops() {
        let sim = Sim::new();
        let node = sim.spawn(5, None);

        assert!(sim.book.is_running(id(5)));
        assert!(send_control(&sim.book, &sim.ids, id(5), MessageBody::Terminate));
        node.join().await;
        assert!(!sim.book.is_running(id(5)));
        assert!(!send_control(&sim.book, &sim.ids, id(5), MessageBody::Terminate));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_origin_fails_spawn() {
        let sim = Sim::new();
        let result = Node::spawn(
            id(5),
            config(),
            Some(id(99)),
            Arc::clone(&sim.book),
            sim.ids.clone(),
            Journal::disabled(),
        );
        assert!(matches!(result, Err(NodeError::UnknownOrigin(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_nodes_learn_each_other() {
        let sim = Sim::new();
        let origin = sim.spawn(0, None);
        let node = sim.spawn(5, Some(0));
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Both know each other now: each answers a probe about the other.
        let mut peer_inbox = sim.attach_peer(9);
        sim.send_from(9, 0, MessageBody::FindNode { target: id(5) });
        let from_origin = recv(&mut peer_inbox).await;
        let nodes = response_nodes(&from_origin).expect("FIND_NODE_RESPONSE");
        assert!(nodes.contains(&id(5)));

        sim.send_from(9, 5, MessageBody::FindNode { target: id(0) });
        let from_node = recv(&mut peer_inbox).await;
        let nodes = response_nodes(&from_node).expect("FIND_NODE_RESPONSE");
        assert!(nodes.contains(&id(0)));

        send_control(&sim.book, &sim.ids, id(0), MessageBody::Terminate);
        send_control(&sim.book, &sim.ids, id(5), MessageBody::Terminate);
        origin.join().await;
        node.join().await;
    }
}
