//! Replay and notification behavior across full chains.

use proptest::prelude::*;
use relic::chain::{segment_dir_name, SegmentKind, SegmentWriter};
use relic::{
    CancelToken, ChangeCollector, ChangeEvent, ChangeSink, CollectionKind, CollectionOperation,
    EngineConfig, EngineError, EngineStatus, ItemChange, ParseOutcome, ReplayEngine, Timestamp,
    TransactionId, TransactionRecord, TypeRegistry, Value, ValueCodec,
};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

// --- Chain Builders ---

fn encode(type_name: &str, value: &Value) -> Vec<u8> {
    TypeRegistry::default().encode(type_name, value).unwrap()
}

fn create_dict(name: &str) -> CollectionOperation {
    CollectionOperation::CreateCollection {
        name: name.into(),
        kind: "dictionary".to_string(),
        key_type: Some("string".to_string()),
        value_type: "i64".to_string(),
    }
}

fn create_queue(name: &str) -> CollectionOperation {
    CollectionOperation::CreateCollection {
        name: name.into(),
        kind: "queue".to_string(),
        key_type: None,
        value_type: "string".to_string(),
    }
}

fn insert(name: &str, key: &str, value: i64) -> CollectionOperation {
    CollectionOperation::Insert {
        name: name.into(),
        key: encode("string", &Value::from(key)),
        value: encode("i64", &Value::I64(value)),
    }
}

fn update(name: &str, key: &str, value: i64) -> CollectionOperation {
    CollectionOperation::Update {
        name: name.into(),
        key: encode("string", &Value::from(key)),
        value: encode("i64", &Value::I64(value)),
    }
}

fn remove(name: &str, key: &str) -> CollectionOperation {
    CollectionOperation::Remove {
        name: name.into(),
        key: encode("string", &Value::from(key)),
    }
}

fn enqueue(name: &str, value: &str) -> CollectionOperation {
    CollectionOperation::Enqueue {
        name: name.into(),
        value: encode("string", &Value::from(value)),
    }
}

fn record(id: u64, operations: Vec<CollectionOperation>) -> TransactionRecord {
    TransactionRecord {
        id: TransactionId(id),
        timestamp: Timestamp::now(),
        operations,
    }
}

fn write_segment(chain: &Path, kind: SegmentKind, sequence: u64, records: &[TransactionRecord]) {
    let dir = chain.join(segment_dir_name(sequence));
    let mut writer = SegmentWriter::create(&dir, kind, sequence).unwrap();
    for r in records {
        writer.append(r).unwrap();
    }
    writer.finalize().unwrap();
}

fn open_engine(root: &TempDir) -> ReplayEngine {
    open_engine_with(root, TypeRegistry::default())
}

/// Route engine logs into the captured test output.
fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn open_engine_with(root: &TempDir, types: TypeRegistry) -> ReplayEngine {
    init_logging();
    ReplayEngine::open(EngineConfig {
        chain_path: root.path().join("chain"),
        backup_root: root.path().join("backups"),
        types,
        ..Default::default()
    })
    .unwrap()
}

fn chain_dir(root: &TempDir) -> std::path::PathBuf {
    let chain = root.path().join("chain");
    std::fs::create_dir_all(&chain).unwrap();
    chain
}

// --- Notification Delivery ---

#[test]
fn test_one_notification_per_transaction_in_chain_order() {
    let root = TempDir::new().unwrap();
    let chain = chain_dir(&root);
    write_segment(
        &chain,
        SegmentKind::Full,
        0,
        &[
            record(1, vec![create_dict("urn:orders"), insert("urn:orders", "a", 1)]),
            record(2, vec![insert("urn:orders", "b", 2)]),
        ],
    );
    write_segment(
        &chain,
        SegmentKind::Incremental,
        1,
        &[
            record(3, vec![update("urn:orders", "a", 10)]),
            record(4, vec![remove("urn:orders", "b")]),
        ],
    );

    let engine = open_engine(&root);
    let stream = engine.subscribe_stream(16).unwrap();
    let outcome = engine.parse(&CancelToken::new()).unwrap();
    assert!(matches!(outcome, ParseOutcome::Completed(stats) if stats.transactions == 4));

    let ids: Vec<_> = (0..4).map(|_| stream.try_recv().unwrap().transaction_id).collect();
    assert_eq!(
        ids,
        vec![TransactionId(1), TransactionId(2), TransactionId(3), TransactionId(4)]
    );
    assert!(stream.try_recv().is_err());
}

#[test]
fn test_multi_collection_changeset_first_touched_order() {
    let root = TempDir::new().unwrap();
    let chain = chain_dir(&root);
    write_segment(
        &chain,
        SegmentKind::Full,
        0,
        &[
            record(1, vec![create_dict("urn:a"), create_queue("urn:q")]),
            record(
                2,
                vec![
                    enqueue("urn:q", "first"),
                    insert("urn:a", "k1", 1),
                    enqueue("urn:q", "second"),
                    insert("urn:a", "k2", 2),
                ],
            ),
        ],
    );

    let engine = open_engine(&root);
    let stream = engine.subscribe_stream(16).unwrap();
    engine.parse(&CancelToken::new()).unwrap();

    // Transaction 1 only created collections: notification with no item
    // changes.
    let first = stream.try_recv().unwrap();
    assert_eq!(first.transaction_id, TransactionId(1));
    assert!(first.is_empty());

    // Transaction 2: exactly one entry per touched collection, queue
    // first because it was touched first.
    let second = stream.try_recv().unwrap();
    assert_eq!(second.collections.len(), 2);
    assert_eq!(second.collections[0].collection, "urn:q".into());
    assert_eq!(second.collections[0].kind, CollectionKind::Queue);
    assert_eq!(second.collections[0].changes.len(), 2);
    assert_eq!(second.collections[1].collection, "urn:a".into());
    assert_eq!(second.collections[1].changes.len(), 2);

    assert_eq!(
        second.collections[1].changes[0],
        ItemChange::Added {
            key: Some(Value::from("k1")),
            value: Value::I64(1),
        }
    );
}

#[test]
fn test_update_remove_clear_full_fidelity() {
    let root = TempDir::new().unwrap();
    let chain = chain_dir(&root);
    write_segment(
        &chain,
        SegmentKind::Full,
        0,
        &[
            record(1, vec![create_dict("urn:a"), insert("urn:a", "k", 1)]),
            record(
                2,
                vec![
                    update("urn:a", "k", 2),
                    remove("urn:a", "k"),
                    CollectionOperation::Clear { name: "urn:a".into() },
                ],
            ),
        ],
    );

    let engine = open_engine(&root);
    let stream = engine.subscribe_stream(16).unwrap();
    engine.parse(&CancelToken::new()).unwrap();

    stream.try_recv().unwrap();
    let changes = &stream.try_recv().unwrap().collections[0].changes;
    assert_eq!(
        changes[0],
        ItemChange::Updated {
            key: Value::from("k"),
            value: Value::I64(2),
        }
    );
    // The remove carries the value that was removed.
    assert_eq!(
        changes[1],
        ItemChange::Removed {
            key: Some(Value::from("k")),
            value: Some(Value::I64(2)),
        }
    );
    assert_eq!(changes[2], ItemChange::Cleared);
}

#[test]
fn test_observer_may_read_replayed_prefix() {
    let root = TempDir::new().unwrap();
    let chain = chain_dir(&root);
    write_segment(
        &chain,
        SegmentKind::Full,
        0,
        &[
            record(1, vec![create_dict("urn:a"), insert("urn:a", "k1", 1)]),
            record(2, vec![insert("urn:a", "k2", 2)]),
        ],
    );

    let engine = open_engine(&root);
    let state = engine.state();
    let observed = Arc::new(AtomicUsize::new(0));
    let lens = Arc::clone(&observed);
    engine
        .subscribe(move |set| {
            // The committed transaction is already visible to reads.
            let len = state.len(&"urn:a".into()).unwrap();
            lens.fetch_max(len, Ordering::SeqCst);
            assert_eq!(len as u64, set.transaction_id.0);
            true
        })
        .unwrap();

    engine.parse(&CancelToken::new()).unwrap();
    assert_eq!(observed.load(Ordering::SeqCst), 2);
}

// --- Cancellation ---

#[test]
fn test_cancel_mid_chain_stops_at_transaction_boundary() {
    let root = TempDir::new().unwrap();
    let chain = chain_dir(&root);
    let mut records = vec![record(1, vec![create_dict("urn:a")])];
    for id in 2..=6 {
        records.push(record(id, vec![insert("urn:a", &format!("k{}", id), id as i64)]));
    }
    write_segment(&chain, SegmentKind::Full, 0, &records);

    let engine = open_engine(&root);
    let token = CancelToken::new();
    let seen = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&seen);
    let cancel = token.clone();
    engine
        .subscribe(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                cancel.cancel();
            }
            true
        })
        .unwrap();

    let outcome = engine.parse(&token).unwrap();
    assert_eq!(outcome, ParseOutcome::Cancelled);
    assert_eq!(engine.status(), EngineStatus::Cancelled);
    // The third transaction's notification was delivered before the
    // cancellation took effect; nothing after it was.
    assert_eq!(seen.load(Ordering::SeqCst), 3);

    // Reads still see the replayed prefix; writes stay rejected.
    let state = engine.state();
    assert_eq!(state.len(&"urn:a".into()).unwrap(), 2);
    assert!(matches!(
        state.begin_transaction(),
        Err(EngineError::WriteBeforeParseComplete)
    ));
}

// --- Runtime Schema Discovery ---

#[test]
fn test_unknown_kind_collection_skipped_not_fatal() {
    let root = TempDir::new().unwrap();
    let chain = chain_dir(&root);
    write_segment(
        &chain,
        SegmentKind::Full,
        0,
        &[
            record(
                1,
                vec![
                    CollectionOperation::CreateCollection {
                        name: "urn:future".into(),
                        kind: "ring_buffer".to_string(),
                        key_type: None,
                        value_type: "bytes".to_string(),
                    },
                    CollectionOperation::Enqueue {
                        name: "urn:future".into(),
                        value: vec![1, 2, 3],
                    },
                    create_dict("urn:a"),
                    insert("urn:a", "k", 1),
                ],
            ),
        ],
    );

    let engine = open_engine(&root);
    let stream = engine.subscribe_stream(16).unwrap();
    engine.parse(&CancelToken::new()).unwrap();

    // The unknown-kind collection never appears in a changeset.
    let set = stream.try_recv().unwrap();
    assert_eq!(set.collections.len(), 1);
    assert_eq!(set.collections[0].collection, "urn:a".into());

    // Its schema is still introspectable, but reads and writes fail.
    let state = engine.state();
    assert_eq!(
        state.kind_of(&"urn:future".into()).unwrap(),
        Some(CollectionKind::Unknown)
    );
    assert!(matches!(
        state.len(&"urn:future".into()),
        Err(EngineError::UnsupportedCollectionKind { .. })
    ));
    let mut txn = state.begin_transaction().unwrap();
    assert!(matches!(
        txn.enqueue("urn:future", Value::Bytes(vec![9])),
        Err(EngineError::UnsupportedCollectionKind { .. })
    ));
}

#[test]
fn test_unregistered_value_type_surfaces_as_opaque() {
    let root = TempDir::new().unwrap();
    let chain = chain_dir(&root);
    write_segment(
        &chain,
        SegmentKind::Full,
        0,
        &[record(
            1,
            vec![
                CollectionOperation::CreateCollection {
                    name: "urn:sensors".into(),
                    kind: "dictionary".to_string(),
                    key_type: Some("string".to_string()),
                    value_type: "celsius".to_string(),
                },
                CollectionOperation::Insert {
                    name: "urn:sensors".into(),
                    key: encode("string", &Value::from("probe")),
                    value: 21.5f32.to_le_bytes().to_vec(),
                },
            ],
        )],
    );

    let engine = open_engine(&root);
    engine.parse(&CancelToken::new()).unwrap();

    let value = engine
        .state()
        .get(&"urn:sensors".into(), &Value::from("probe"))
        .unwrap()
        .unwrap();
    assert_eq!(
        value,
        Value::Opaque {
            type_name: "celsius".to_string(),
            bytes: 21.5f32.to_le_bytes().to_vec(),
        }
    );
}

#[test]
fn test_registered_codec_decodes_custom_type() {
    let root = TempDir::new().unwrap();
    let chain = chain_dir(&root);
    write_segment(
        &chain,
        SegmentKind::Full,
        0,
        &[record(
            1,
            vec![
                CollectionOperation::CreateCollection {
                    name: "urn:sensors".into(),
                    kind: "dictionary".to_string(),
                    key_type: Some("string".to_string()),
                    value_type: "celsius".to_string(),
                },
                CollectionOperation::Insert {
                    name: "urn:sensors".into(),
                    key: encode("string", &Value::from("probe")),
                    value: 21.5f32.to_le_bytes().to_vec(),
                },
            ],
        )],
    );

    let mut types = TypeRegistry::default();
    types.register(
        "celsius",
        ValueCodec::new(
            |bytes| {
                let arr: [u8; 4] = bytes
                    .try_into()
                    .map_err(|_| EngineError::Deserialization("celsius needs 4 bytes".into()))?;
                Ok(Value::F64(f32::from_le_bytes(arr) as f64))
            },
            |value| match value {
                Value::F64(n) => Ok((*n as f32).to_le_bytes().to_vec()),
                other => Err(EngineError::Serialization(format!(
                    "expected f64, got {}",
                    other.type_name()
                ))),
            },
        ),
    );

    let engine = open_engine_with(&root, types);
    engine.parse(&CancelToken::new()).unwrap();

    assert_eq!(
        engine
            .state()
            .get(&"urn:sensors".into(), &Value::from("probe"))
            .unwrap(),
        Some(Value::F64(21.5))
    );
}

// --- Post-Parse Writes ---

#[test]
fn test_live_writes_notify_like_replayed_transactions() {
    let root = TempDir::new().unwrap();
    let chain = chain_dir(&root);
    write_segment(
        &chain,
        SegmentKind::Full,
        0,
        &[record(1, vec![create_dict("urn:a"), insert("urn:a", "k", 1)])],
    );

    let engine = open_engine(&root);
    let stream = engine.subscribe_stream(16).unwrap();
    engine.parse(&CancelToken::new()).unwrap();
    stream.try_recv().unwrap();

    let state = engine.state();
    let mut txn = state.begin_transaction().unwrap();
    txn.update("urn:a", Value::from("k"), Value::I64(99)).unwrap();
    txn.commit().unwrap();

    // Live ids continue past the replayed ones.
    let live = stream.try_recv().unwrap();
    assert_eq!(live.transaction_id, TransactionId(2));
    assert_eq!(
        live.collections[0].changes[0],
        ItemChange::Updated {
            key: Value::from("k"),
            value: Value::I64(99),
        }
    );
    assert_eq!(
        state.get(&"urn:a".into(), &Value::from("k")).unwrap(),
        Some(Value::I64(99))
    );
}

// --- Collector Ordering Property ---

proptest! {
    /// For any interleaving of events across collections, the collector
    /// preserves per-collection event order and reports collections in
    /// first-touched order.
    #[test]
    fn prop_collector_preserves_order(events in prop::collection::vec((0u8..4, 0i64..1000), 0..64)) {
        let names = ["urn:a", "urn:b", "urn:c", "urn:d"];
        let mut collector = ChangeCollector::new();
        for (index, value) in &events {
            collector.record(ChangeEvent {
                collection: names[*index as usize].into(),
                kind: CollectionKind::Dictionary,
                change: ItemChange::Added {
                    key: None,
                    value: Value::I64(*value),
                },
            });
        }

        let drained = collector.drain();

        // First-touched order.
        let mut expected_order = Vec::new();
        for (index, _) in &events {
            let name = names[*index as usize];
            if !expected_order.contains(&name) {
                expected_order.push(name);
            }
        }
        let drained_order: Vec<&str> =
            drained.iter().map(|c| c.collection.as_str()).collect();
        prop_assert_eq!(
            drained_order,
            expected_order.iter().map(|s| *s).collect::<Vec<_>>()
        );

        // Per-collection order, no duplicates, no drops.
        for changes in &drained {
            let got: Vec<i64> = changes
                .changes
                .iter()
                .map(|c| match c {
                    ItemChange::Added { value: Value::I64(n), .. } => *n,
                    other => panic!("unexpected change {:?}", other),
                })
                .collect();
            let expected: Vec<i64> = events
                .iter()
                .filter(|(index, _)| names[*index as usize] == changes.collection.as_str())
                .map(|(_, value)| *value)
                .collect();
            prop_assert_eq!(got, expected);
        }
    }
}
