//! Integration test: network formation through the origin node.
//!
//! Exercises the join flow end to end:
//! 1. Spawn an origin node with an empty routing table
//! 2. Join several nodes, each bootstrapping with `FIND_NODE(self)` at the
//!    origin
//! 3. Verify the origin learned every joiner
//! 4. Verify joiners learned the origin (and each other where the response
//!    carried them)
//!
//! Nodes run for real on the simulated transport; the test observes them
//! purely through protocol messages from a scripted peer that is registered
//! in the address book but driven by the test.

use std::sync::Arc;
use std::time::Duration;

use kadre_node::{send_control, AddressBook, Node, NodeHandle};
use kadre_proto::{Envelope, IdSource, Journal, MessageBody};
use kadre_types::{KadConfig, NodeId};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn config() -> KadConfig {
    KadConfig {
        id_length: 8,
        k: 4,
        ..Default::default()
    }
}

fn id(raw: u128) -> NodeId {
    NodeId::new(raw)
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

    fn attach_peer(&self, local: u128) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.book.register(id(local), tx);
        rx
    }

    fn ask(&self, asker: u128, node: u128, target: u128) {
        let envelope = Envelope::from_node(
            self.ids.next_uid(),
            self.ids.next_request_id(),
            id(asker),
            id(node),
            MessageBody::FindNode { target: id(target) },
        );
        self.book
            .lookup(id(node))
            .expect("node registered")
            .send(envelope)
            .expect("deliver");
    }
}

async fn response_nodes(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Vec<NodeId> {
    let envelope = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("response expected")
        .expect("queue open");
    match envelope.body {
        MessageBody::FindNodeResponse { nodes } => nodes,
        _ => Vec::new(),
    }
}

#[tokio::test(start_paused = true)]
async fn origin_learns_every_joiner() {
    let sim = Sim::new();
    let origin = sim.spawn(0, None);

    // =========================================================
    // Step 1: join three nodes, one settled burst at a time
    // =========================================================
    let mut joined = Vec::new();
    for local in [0b0000_0110, 0b0101_0000, 0b1001_0000] {
        joined.push(sim.spawn(local, Some(0)));
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // =========================================================
    // Step 2: probe the origin from a scripted peer
    // =========================================================
    let mut peer = sim.attach_peer(1);
    sim.ask(1, 0, 0b1111_1111);
    let nodes = response_nodes(&mut peer).await;
    for local in [0b0000_0110u128, 0b0101_0000, 0b1001_0000] {
        assert!(
            nodes.contains(&id(local)),
            "origin should know joiner {local}"
        );
    }

    // =========================================================
    // Step 3: every joiner knows the origin
    // =========================================================
    for local in [0b0000_0110u128, 0b0101_0000, 0b1001_0000] {
        sim.ask(1, local, 0);
        let nodes = response_nodes(&mut peer).await;
        assert!(nodes.contains(&id(0)), "joiner {local} should know origin");
    }

    // =========================================================
    // Step 4: tear the network down
    // =========================================================
    for handle in joined {
        assert!(send_control(&sim.book, &sim.ids, handle.id(), MessageBody::Terminate));
        handle.join().await;
    }
    send_control(&sim.book, &sim.ids, id(0), MessageBody::Terminate);
    origin.join().await;
    for local in [0u128, 0b0000_0110, 0b0101_0000, 0b1001_0000] {
        assert!(!sim.book.is_running(id(local)));
    }
}

#[tokio::test(start_paused = true)]
async fn later_joiner_discovers_earlier_ones() {
    let sim = Sim::new();
    let _origin = sim.spawn(0, None);

    // First joiner only knows the origin.
    let _first = sim.spawn(0b0000_0110, Some(0));
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The second joiner's bootstrap response from the origin carries the
    // first joiner, since both sit close to each other in the key space.
    let _second = sim.spawn(0b0000_0111, Some(0));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut peer = sim.attach_peer(1);
    sim.ask(1, 0b0000_0111, 0b0000_0110);
    let nodes = response_nodes(&mut peer).await;
    assert!(nodes.contains(&id(0b0000_0110)));
    assert!(nodes.contains(&id(0)));
}

#[tokio::test(start_paused = true)]
async fn responses_are_sorted_by_distance_to_target() {
    let sim = Sim::new();
    let _origin = sim.spawn(0, None);
    for local in [0b0000_0100u128, 0b0000_0110, 0b0000_0111] {
        let _ = sim.spawn(local, Some(0));
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let mut peer = sim.attach_peer(0b1000_0000);
    sim.ask(0b1000_0000, 0, 0b0000_0110);
    let nodes = response_nodes(&mut peer).await;

    let mut previous = None;
    for node in &nodes {
        let distance = node.distance(id(0b0000_0110));
        if let Some(previous) = previous {
            assert!(distance >= previous, "response out of distance order");
        }
        previous = Some(distance);
    }
    assert_eq!(nodes.first(), Some(&id(0b0000_0110)));
}
