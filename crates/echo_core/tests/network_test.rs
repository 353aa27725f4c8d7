//! Integration tests for document replication between peers

use std::sync::{Arc, Mutex};

use echo_core::config::EchoConfig;
use echo_core::document::{MemoryStorage, ObjectStructure, SpaceDoc};
use echo_core::dxn::Dxn;
use echo_core::keys::{ObjectId, PeerId};
use echo_core::network::{
    AdapterMessage, CountingMonitor, DocumentReplicator, EchoNetworkAdapter, MemoryExtension,
    NetworkDataMonitor, NetworkEvent, PeerState, ReplicationExtension, SyncMessage,
    read_var_byte_array, read_var_uint, write_var_byte_array, write_var_uint,
};
use serde_json::{Map, json};

struct Replica {
    replicator: DocumentReplicator,
    doc: Arc<SpaceDoc>,
    monitor: Arc<CountingMonitor>,
    events: Arc<Mutex<Vec<NetworkEvent>>>,
}

impl Replica {
    fn new(peer: &str) -> Self {
        let monitor = Arc::new(CountingMonitor::new());
        let adapter = EchoNetworkAdapter::new(PeerId::from(peer), &EchoConfig::default())
            .with_monitor(Arc::clone(&monitor) as Arc<dyn NetworkDataMonitor>);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        adapter.subscribe(Arc::new(move |event: &NetworkEvent| {
            sink.lock().unwrap().push(event.clone());
        }));

        let replicator = DocumentReplicator::new(Arc::new(adapter));
        let doc = Arc::new(SpaceDoc::new(Arc::new(MemoryStorage::new())));
        replicator.add_document(Arc::clone(&doc)).unwrap();
        Self {
            replicator,
            doc,
            monitor,
            events,
        }
    }

    fn state(&self, peer: &str) -> PeerState {
        self.replicator.adapter().peer_state(&PeerId::from(peer))
    }
}

/// Deliver queued frames in both directions until both inboxes are empty.
async fn pump(links: &[(&Replica, &MemoryExtension, &Replica, &MemoryExtension)]) {
    loop {
        let mut delivered = false;
        for (left, left_end, right, right_end) in links {
            for frame in left_end.take_inbound() {
                left.replicator
                    .on_inbound(left_end.connection_id(), &frame)
                    .await
                    .unwrap();
                delivered = true;
            }
            for frame in right_end.take_inbound() {
                right
                    .replicator
                    .on_inbound(right_end.connection_id(), &frame)
                    .await
                    .unwrap();
                delivered = true;
            }
        }
        if !delivered {
            break;
        }
    }
}

fn note(title: &str) -> ObjectStructure {
    let mut data = Map::new();
    data.insert("title".to_string(), json!(title));
    ObjectStructure::object(Some(Dxn::type_ref("example.com/type/Note")), data)
}

#[tokio::test]
async fn test_edits_on_both_sides_converge() {
    let alice = Replica::new("alice");
    let bob = Replica::new("bob");
    alice.doc.create_object(&ObjectId::from("a"), &note("from alice")).unwrap();
    bob.doc.create_object(&ObjectId::from("b"), &note("from bob")).unwrap();

    let (alice_end, bob_end) = MemoryExtension::pair("alice-1", "bob-1");
    alice
        .replicator
        .on_connection_open(Arc::new(alice_end.clone()))
        .await
        .unwrap();
    bob.replicator
        .on_connection_open(Arc::new(bob_end.clone()))
        .await
        .unwrap();
    pump(&[(&alice, &alice_end, &bob, &bob_end)]).await;

    assert_eq!(alice.doc.to_json(), bob.doc.to_json());
    assert_eq!(alice.doc.object_count(), 2);
    assert_eq!(alice.state("bob"), PeerState::Replicating);
    assert_eq!(bob.state("alice"), PeerState::Replicating);

    // Concurrent text edits after the handshake
    alice.doc.set_text(&ObjectId::from("a"), "body", "left").unwrap();
    bob.doc.set_text(&ObjectId::from("b"), "body", "right").unwrap();
    alice.replicator.flush_local_updates().await.unwrap();
    bob.replicator.flush_local_updates().await.unwrap();
    pump(&[(&alice, &alice_end, &bob, &bob_end)]).await;

    assert_eq!(alice.doc.to_json(), bob.doc.to_json());
    assert_eq!(
        bob.doc.get_field(&ObjectId::from("a"), "body"),
        Some(json!("left"))
    );
    assert_eq!(alice.replicator.pending_updates(), 0);
    assert_eq!(bob.replicator.pending_updates(), 0);
    assert!(alice.monitor.stats().messages_sent >= 2);
}

#[tokio::test]
async fn test_second_transport_keeps_peer_alive() {
    let alice = Replica::new("alice");
    let bob = Replica::new("bob");

    let (alice_1, bob_1) = MemoryExtension::pair("alice-1", "bob-1");
    let (alice_2, bob_2) = MemoryExtension::pair("alice-2", "bob-2");
    for (alice_end, bob_end) in [(&alice_1, &bob_1), (&alice_2, &bob_2)] {
        alice
            .replicator
            .on_connection_open(Arc::new(alice_end.clone()))
            .await
            .unwrap();
        bob.replicator
            .on_connection_open(Arc::new(bob_end.clone()))
            .await
            .unwrap();
    }
    pump(&[
        (&alice, &alice_1, &bob, &bob_1),
        (&alice, &alice_2, &bob, &bob_2),
    ])
    .await;

    assert_eq!(alice.replicator.adapter().connection_count(&PeerId::from("bob")), 2);
    let candidates = alice
        .events
        .lock()
        .unwrap()
        .iter()
        .filter(|event| matches!(event, NetworkEvent::PeerCandidate { .. }))
        .count();
    assert_eq!(candidates, 1);

    // Losing the first transport does not disconnect bob
    alice_1.close();
    alice.replicator.on_connection_closed(alice_1.connection_id()).unwrap();
    bob.replicator.on_connection_closed(bob_1.connection_id()).unwrap();
    assert_eq!(alice.state("bob"), PeerState::Replicating);
    assert_eq!(alice.monitor.stats().connections, 1);

    alice.doc.create_object(&ObjectId::from("late"), &note("after failover")).unwrap();
    assert_eq!(alice.replicator.flush_local_updates().await.unwrap(), 1);
    pump(&[(&alice, &alice_2, &bob, &bob_2)]).await;
    assert!(bob.doc.contains_object(&ObjectId::from("late")));

    alice.replicator.on_connection_closed(alice_2.connection_id()).unwrap();
    assert_eq!(alice.state("bob"), PeerState::Disconnected);
    assert_eq!(
        alice.events.lock().unwrap().last(),
        Some(&NetworkEvent::PeerDisconnected {
            peer_id: PeerId::from("bob")
        })
    );
    assert_eq!(alice.monitor.stats().connections, 0);
}

#[tokio::test]
async fn test_reconnect_catches_up_missed_edits() {
    let alice = Replica::new("alice");
    let bob = Replica::new("bob");

    let (alice_end, bob_end) = MemoryExtension::pair("alice-1", "bob-1");
    alice.replicator.on_connection_open(Arc::new(alice_end.clone())).await.unwrap();
    bob.replicator.on_connection_open(Arc::new(bob_end.clone())).await.unwrap();
    pump(&[(&alice, &alice_end, &bob, &bob_end)]).await;
    alice.replicator.on_connection_closed(alice_end.connection_id()).unwrap();
    bob.replicator.on_connection_closed(bob_end.connection_id()).unwrap();

    // Edits while apart are flushed to nobody
    alice.doc.create_object(&ObjectId::from("offline"), &note("queued")).unwrap();
    assert_eq!(alice.replicator.flush_local_updates().await.unwrap(), 0);
    assert!(!bob.doc.contains_object(&ObjectId::from("offline")));

    let (alice_end, bob_end) = MemoryExtension::pair("alice-2", "bob-2");
    alice.replicator.on_connection_open(Arc::new(alice_end.clone())).await.unwrap();
    bob.replicator.on_connection_open(Arc::new(bob_end.clone())).await.unwrap();
    pump(&[(&alice, &alice_end, &bob, &bob_end)]).await;

    assert!(bob.doc.contains_object(&ObjectId::from("offline")));
    assert_eq!(bob.state("alice"), PeerState::Replicating);
}

#[test]
fn test_hand_built_frame_decodes() {
    let mut payload = Vec::new();
    write_var_uint(&mut payload, 0);
    write_var_uint(&mut payload, 2);
    write_var_byte_array(&mut payload, &[7; 200]);

    let mut frame = Vec::new();
    write_var_byte_array(&mut frame, b"peer-a");
    write_var_uint(&mut frame, 1);
    write_var_byte_array(&mut frame, b"peer-b");
    write_var_byte_array(&mut frame, b"root");
    write_var_byte_array(&mut frame, &payload);

    let message = AdapterMessage::decode(&frame).unwrap();
    assert_eq!(message.sender_id, PeerId::from("peer-a"));
    assert_eq!(message.target_id, Some(PeerId::from("peer-b")));
    assert_eq!(message.document_id, "root");
    assert_eq!(message.sync_message().unwrap(), SyncMessage::Update(vec![7; 200]));
    assert_eq!(message.encode(), frame);

    // A 200-byte array needs a two-byte length prefix
    let (len, used) = read_var_uint(&payload[2..]).unwrap();
    assert_eq!((len, used), (200, 2));
    let (bytes, used) = read_var_byte_array(&payload[2..]).unwrap();
    assert_eq!(bytes.len(), 200);
    assert_eq!(used, payload.len() - 2);
    assert!(read_var_byte_array(&payload[2..100]).is_none());
}
