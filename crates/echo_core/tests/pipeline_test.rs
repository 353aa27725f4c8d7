//! Integration tests for feed replay, replication between peers and snapshots

use std::sync::Arc;

use echo_core::config::EchoConfig;
use echo_core::error::Result;
use echo_core::feed::{FeedStore, MemoryFeedStore};
use echo_core::keys::{ObjectId, PeerId, SpaceKey};
use echo_core::pipeline::{KeyValueModel, Model, ModelRegistry, MutationMeta, Pipeline};
use echo_core::snapshot::{SnapshotMonitor, SnapshotStore, snapshot_if_due};
use echo_core::storage::{MemoryDirectory, NativeDirectory};
use echo_core::timeframe::Timeframe;
use futures_lite::future::block_on;
use serde_json::{Value, json};

const COUNTER_TYPE: &str = "example.com/model/Counter";

/// Sums `{"add": n}` mutations into `{"total": n}`.
struct CounterModel;

impl Model for CounterModel {
    fn type_name(&self) -> &str {
        COUNTER_TYPE
    }

    fn initial_state(&self) -> Value {
        json!({"total": 0})
    }

    fn apply(&self, state: &Value, mutation: &[u8], _meta: &MutationMeta) -> Result<Value> {
        let op: Value = serde_json::from_slice(mutation)?;
        let add = op["add"].as_i64().unwrap_or(0);
        let total = state["total"].as_i64().unwrap_or(0);
        Ok(json!({"total": total + add}))
    }
}

fn space() -> SpaceKey {
    SpaceKey::from("space-1")
}

fn pipeline_over(feed: Arc<dyn FeedStore>) -> Pipeline {
    Pipeline::new(
        space(),
        feed,
        Arc::new(ModelRegistry::with_defaults()),
        &EchoConfig::default(),
    )
}

/// Deliver `peer`'s records `[0, until)` to another feed store. Records the
/// destination already holds are delivered again and ignored.
fn replicate(from: &dyn FeedStore, to: &dyn FeedStore, peer: &PeerId, until: u64) {
    for seq in 0..until {
        to.insert(peer, seq, from.read(peer, seq).unwrap()).unwrap();
    }
}

fn materialized(pipeline: &Pipeline) -> Vec<(ObjectId, Value)> {
    pipeline
        .items()
        .items()
        .map(|item| (item.id().clone(), item.materialized()))
        .collect()
}

#[test]
fn test_reload_replays_to_identical_state() {
    let feed: Arc<dyn FeedStore> = Arc::new(MemoryFeedStore::new());
    let peer = PeerId::from("peerA");

    let mut pipeline = pipeline_over(Arc::clone(&feed));
    let id = pipeline
        .create_object_with(&peer, KeyValueModel::TYPE, KeyValueModel::set("title", json!("hello")))
        .unwrap();

    // Creation and the first set share one record
    assert_eq!(feed.length(&peer).unwrap(), 1);
    let expected: Timeframe = [(peer.clone(), 0)].into_iter().collect();
    assert_eq!(pipeline.timeframe(), &expected);
    let before = pipeline.items().get(&id).unwrap().materialized();
    assert_eq!(before, json!({"title": "hello"}));

    let mut reloaded = pipeline_over(feed);
    let report = reloaded.process().unwrap();
    assert!(report.is_clean());
    assert_eq!(report.applied, 1);
    assert_eq!(reloaded.timeframe(), &expected);
    assert_eq!(reloaded.items().get(&id).unwrap().materialized(), before);
}

#[test]
fn test_processing_twice_is_idempotent() {
    let feed: Arc<dyn FeedStore> = Arc::new(MemoryFeedStore::new());
    let peer = PeerId::from("a");
    let mut pipeline = pipeline_over(Arc::clone(&feed));
    let id = pipeline.create_object(&peer, KeyValueModel::TYPE).unwrap();
    for n in 0..5 {
        pipeline
            .mutate(&peer, &id, KeyValueModel::set("n", json!(n)))
            .unwrap();
    }
    let state = materialized(&pipeline);

    let again = pipeline.process().unwrap();
    assert_eq!(again.applied, 0);
    assert_eq!(materialized(&pipeline), state);

    // Restoring an older snapshot and replaying does not double-apply
    let snapshot = pipeline.snapshot();
    pipeline.restore(snapshot).unwrap();
    pipeline.process().unwrap();
    assert_eq!(materialized(&pipeline), state);
}

#[test]
fn test_two_peers_converge() {
    let feed_a: Arc<dyn FeedStore> = Arc::new(MemoryFeedStore::new());
    let feed_b: Arc<dyn FeedStore> = Arc::new(MemoryFeedStore::new());
    let peer_a = PeerId::from("a");

    let mut a = pipeline_over(Arc::clone(&feed_a));
    let id = a.create_object(&peer_a, KeyValueModel::TYPE).unwrap();
    let pre_mutation = feed_a.length(&peer_a).unwrap();
    for (key, value) in [("title", json!("draft")), ("done", json!(false)), ("title", json!("final"))] {
        a.mutate(&peer_a, &id, KeyValueModel::set(key, value)).unwrap();
    }

    // B has A's genesis only
    let mut b = pipeline_over(Arc::clone(&feed_b));
    replicate(feed_a.as_ref(), feed_b.as_ref(), &peer_a, pre_mutation);
    b.process().unwrap();
    assert_eq!(b.items().get(&id).unwrap().materialized(), json!({}));

    replicate(
        feed_a.as_ref(),
        feed_b.as_ref(),
        &peer_a,
        feed_a.length(&peer_a).unwrap(),
    );
    b.process().unwrap();
    assert_eq!(b.timeframe(), a.timeframe());
    assert_eq!(
        b.items().get(&id).unwrap().materialized(),
        a.items().get(&id).unwrap().materialized()
    );
    assert_eq!(
        a.items().get(&id).unwrap().materialized(),
        json!({"title": "final", "done": false})
    );
}

#[test]
fn test_concurrent_writers_converge() {
    let feed_a: Arc<dyn FeedStore> = Arc::new(MemoryFeedStore::new());
    let feed_b: Arc<dyn FeedStore> = Arc::new(MemoryFeedStore::new());
    let (peer_a, peer_b) = (PeerId::from("a"), PeerId::from("b"));

    let mut a = pipeline_over(Arc::clone(&feed_a));
    let mut b = pipeline_over(Arc::clone(&feed_b));
    let id = a.create_object(&peer_a, KeyValueModel::TYPE).unwrap();
    replicate(feed_a.as_ref(), feed_b.as_ref(), &peer_a, 1);
    b.process().unwrap();

    // Both write the same key without seeing each other
    a.mutate(&peer_a, &id, KeyValueModel::set("title", json!("from a")))
        .unwrap();
    b.mutate(&peer_b, &id, KeyValueModel::set("title", json!("from b")))
        .unwrap();

    replicate(feed_a.as_ref(), feed_b.as_ref(), &peer_a, 2);
    replicate(feed_b.as_ref(), feed_a.as_ref(), &peer_b, 1);
    a.process().unwrap();
    b.process().unwrap();

    assert_eq!(a.timeframe(), b.timeframe());
    assert_eq!(
        a.items().get(&id).unwrap().materialized(),
        b.items().get(&id).unwrap().materialized()
    );
}

#[test]
fn test_redelivered_records_apply_once() {
    let feed_a: Arc<dyn FeedStore> = Arc::new(MemoryFeedStore::new());
    let feed_b: Arc<dyn FeedStore> = Arc::new(MemoryFeedStore::new());
    let peer = PeerId::from("a");

    let mut writer = pipeline_over(Arc::clone(&feed_a));
    writer.register_model(Arc::new(CounterModel));
    let id = writer.create_object(&peer, COUNTER_TYPE).unwrap();
    for add in [1, 2] {
        writer
            .mutate(&peer, &id, serde_json::to_vec(&json!({"add": add})).unwrap())
            .unwrap();
    }

    let mut reader = pipeline_over(Arc::clone(&feed_b));
    reader.register_model(Arc::new(CounterModel));
    replicate(feed_a.as_ref(), feed_b.as_ref(), &peer, 3);
    reader.process().unwrap();

    // The last mutation arrives a second time
    assert!(!feed_b.insert(&peer, 2, feed_a.read(&peer, 2).unwrap()).unwrap());
    replicate(feed_a.as_ref(), feed_b.as_ref(), &peer, 3);
    let report = reader.process().unwrap();
    assert_eq!(report.applied, 0);
    assert_eq!(feed_b.length(&peer).unwrap(), 3);
    assert_eq!(
        reader.items().get(&id).unwrap().materialized(),
        json!({"total": 3})
    );

    // Skipping ahead is refused
    let err = feed_b
        .insert(&peer, 7, feed_a.read(&peer, 0).unwrap())
        .unwrap_err();
    assert!(err.is_invariant_violation());
}

#[test]
fn test_late_model_matches_early_model() {
    let peer = PeerId::from("a");

    // Writer knows the model from the start
    let feed: Arc<dyn FeedStore> = Arc::new(MemoryFeedStore::new());
    let mut writer = pipeline_over(Arc::clone(&feed));
    writer.register_model(Arc::new(CounterModel));
    let id = writer.create_object(&peer, COUNTER_TYPE).unwrap();
    for add in [1, 2, 3, 4] {
        writer
            .mutate(&peer, &id, serde_json::to_vec(&json!({"add": add})).unwrap())
            .unwrap();
    }
    let expected = writer.items().get(&id).unwrap().materialized();
    assert_eq!(expected, json!({"total": 10}));

    // Reader only learns about it after replaying everything
    let mut reader = pipeline_over(feed);
    let report = reader.process().unwrap();
    assert_eq!(report.buffered, 4);
    assert!(!reader.items().get(&id).unwrap().is_resolved());

    let errors = reader.register_model(Arc::new(CounterModel));
    assert!(errors.is_empty());
    assert_eq!(reader.items().get(&id).unwrap().materialized(), expected);
}

#[test]
fn test_snapshot_then_replay_equals_full_replay() {
    let feed: Arc<dyn FeedStore> = Arc::new(MemoryFeedStore::new());
    let peer = PeerId::from("a");
    let mut pipeline = pipeline_over(Arc::clone(&feed));
    let first = pipeline.create_object(&peer, KeyValueModel::TYPE).unwrap();
    pipeline
        .mutate(&peer, &first, KeyValueModel::set("title", json!("before")))
        .unwrap();

    let store = SnapshotStore::new(Arc::new(MemoryDirectory::new()));
    let key = block_on(store.store(&pipeline.snapshot())).unwrap();

    // Keep writing after the snapshot
    let second = pipeline.create_object(&peer, KeyValueModel::TYPE).unwrap();
    pipeline
        .mutate(&peer, &first, KeyValueModel::set("title", json!("after")))
        .unwrap();
    pipeline
        .mutate(&peer, &second, KeyValueModel::set("n", json!(2)))
        .unwrap();
    pipeline.delete(&peer, &second).unwrap();

    let loaded = block_on(store.load(&key)).unwrap().unwrap();
    assert_eq!(loaded.objects.len(), 1);

    let mut restored = pipeline_over(Arc::clone(&feed));
    restored.restore(loaded).unwrap();
    let report = restored.process().unwrap();
    assert_eq!(report.applied, 4);

    let mut replayed = pipeline_over(feed);
    replayed.process().unwrap();

    assert_eq!(restored.timeframe(), replayed.timeframe());
    assert_eq!(materialized(&restored), materialized(&replayed));
    assert!(restored.items().get(&second).unwrap().is_deleted());
}

#[test]
fn test_snapshot_store_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let feed: Arc<dyn FeedStore> = Arc::new(MemoryFeedStore::new());
    let peer = PeerId::from("a");
    let mut pipeline = pipeline_over(feed);
    let id = pipeline.create_object(&peer, KeyValueModel::TYPE).unwrap();
    pipeline
        .mutate(&peer, &id, KeyValueModel::set("title", json!("on disk")))
        .unwrap();

    let directory = Arc::new(NativeDirectory::open(dir.path().join("snapshots")).unwrap());
    let key = block_on(SnapshotStore::new(directory).store(&pipeline.snapshot())).unwrap();
    assert!(dir.path().join("snapshots").join(&key).exists());

    // A second store over the same directory sees it
    let directory = Arc::new(NativeDirectory::open(dir.path().join("snapshots")).unwrap());
    let loaded = block_on(SnapshotStore::new(directory).load(&key))
        .unwrap()
        .unwrap();
    assert_eq!(loaded, pipeline.snapshot());

    // Looking up a key that was never stored leaves no file behind
    let directory = Arc::new(NativeDirectory::open(dir.path().join("snapshots")).unwrap());
    let store = SnapshotStore::new(directory);
    assert_eq!(block_on(store.load("0123abcd")).unwrap(), None);
    assert!(!dir.path().join("snapshots").join("0123abcd").exists());
    assert_eq!(block_on(store.list()).unwrap(), vec![key]);
}

#[test]
fn test_monitor_snapshots_once_limit_reached() {
    let feed: Arc<dyn FeedStore> = Arc::new(MemoryFeedStore::new());
    let peer = PeerId::from("a");
    let mut pipeline = pipeline_over(feed);
    let store = SnapshotStore::new(Arc::new(MemoryDirectory::new()));
    let monitor = SnapshotMonitor::new(3);

    let id = pipeline.create_object(&peer, KeyValueModel::TYPE).unwrap();
    pipeline
        .mutate(&peer, &id, KeyValueModel::set("n", json!(1)))
        .unwrap();
    assert_eq!(block_on(snapshot_if_due(&monitor, &pipeline, &store)).unwrap(), None);

    // The third message reaches the limit
    pipeline
        .mutate(&peer, &id, KeyValueModel::set("n", json!(2)))
        .unwrap();
    let key = block_on(snapshot_if_due(&monitor, &pipeline, &store))
        .unwrap()
        .unwrap();
    assert_eq!(&monitor.epoch(), pipeline.timeframe());
    assert_eq!(block_on(snapshot_if_due(&monitor, &pipeline, &store)).unwrap(), None);
    assert_eq!(block_on(store.list()).unwrap(), vec![key]);
}
