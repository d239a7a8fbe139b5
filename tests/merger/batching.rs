//! Merged Batch Tests
//!
//! Commands submitted concurrently to one shard are folded into shared
//! batches without losing isolation between them.

use crate::common::*;
use corvid::{BatchOperation, Command, CommandOutput, PutDocumentCommand};
use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn concurrent_submitters_all_commit() {
    let node = ephemeral_node();
    let shop = node.create_database("shop", 1).unwrap();
    let threads = 8;
    let per_thread = 50;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let shop = Arc::clone(&shop);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..per_thread {
                    shop.put(
                        id(&format!("events/{}-{}", t, i)),
                        json!({"t": t, "i": i}),
                        ConcurrencyCheck::None,
                    )
                    .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let total = (threads * per_thread) as u64;
    let stats = shop.partitions()[0].stats();
    assert_eq!(stats.commands_committed, total);
    assert!(stats.batches_committed >= 1 && stats.batches_committed <= total);
    assert!(stats.largest_batch >= 1);

    let etags: BTreeSet<u64> = all_documents(&shop).iter().map(|d| d.etag).collect();
    assert_eq!(etags, (1..=total).collect());
}

#[test]
fn uniqueness_race_has_one_winner() {
    let node = ephemeral_node();
    let shop = node.create_database("shop", 2).unwrap();
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let shop = Arc::clone(&shop);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                shop.put(id("users/ada"), json!({"by": t}), ConcurrencyCheck::MustNotExist)
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, CorvidError::ConstraintViolation { .. })));
}

#[test]
fn enqueued_commands_resolve_in_order() {
    let node = ephemeral_node();
    let shop = node.create_database("shop", 1).unwrap();
    let partition = &shop.partitions()[0];

    let pending: Vec<_> = (0..100)
        .map(|_| {
            partition
                .enqueue(Command::PutDocument(PutDocumentCommand::new(
                    id("orders|"),
                    json!({}),
                    ConcurrencyCheck::None,
                )))
                .unwrap()
        })
        .collect();

    for (i, handle) in pending.into_iter().enumerate() {
        match handle.wait().unwrap() {
            CommandOutput::Put(doc) => assert_eq!(doc.id.as_str(), format!("orders/{}", i + 1)),
            other => panic!("unexpected output {:?}", other),
        }
    }
}

#[test]
fn failing_command_does_not_poison_its_batch() {
    let node = ephemeral_node();
    let shop = node.create_database("shop", 1).unwrap();
    let first = shop.put(id("users/1"), json!({"v": 1}), ConcurrencyCheck::None).unwrap();
    let partition = &shop.partitions()[0];

    let stale = partition
        .enqueue(Command::PutDocument(PutDocumentCommand::new(
            id("users/1"),
            json!({"v": 2}),
            ConcurrencyCheck::Etag(first.etag + 10),
        )))
        .unwrap();
    let fresh = partition
        .enqueue(Command::PutDocument(PutDocumentCommand::new(
            id("users/2"),
            json!({}),
            ConcurrencyCheck::None,
        )))
        .unwrap();

    assert!(matches!(
        stale.wait(),
        Err(CorvidError::ConcurrencyViolation { .. })
    ));
    assert!(fresh.wait().is_ok());
    assert_eq!(shop.load(&id("users/1")).unwrap().body, json!({"v": 1}));
}

#[test]
fn client_batch_is_all_or_nothing() {
    let node = ephemeral_node();
    let shop = node.create_database("shop", 1).unwrap();
    shop.put(id("users/1"), json!({}), ConcurrencyCheck::None).unwrap();

    let err = shop
        .batch(vec![
            BatchOperation::put(id("users/2"), json!({}), ConcurrencyCheck::None),
            BatchOperation::put(id("users/1"), json!({}), ConcurrencyCheck::MustNotExist),
        ])
        .unwrap_err();
    assert!(matches!(err, CorvidError::ConstraintViolation { .. }));
    assert!(shop.load(&id("users/2")).is_none());

    let results = shop
        .batch(vec![
            BatchOperation::put(id("users/2"), json!({}), ConcurrencyCheck::MustNotExist),
            BatchOperation::delete(id("users/1"), ConcurrencyCheck::None),
        ])
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(shop.load(&id("users/1")).is_none());
}
