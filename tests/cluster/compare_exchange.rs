//! Compare-Exchange Tests
//!
//! Tests for the node-wide compare-exchange table:
//! - Racing reservations have exactly one winner
//! - Keys are scoped per database and case-insensitive
//! - Reads can inline compare-exchange values next to documents

use crate::common::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn seat_race_has_one_winner() {
    let node = Arc::new(ephemeral_node());
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let node = Arc::clone(&node);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                node.put_compare_exchange("theater", "seat/1", 0, json!(format!("guest-{}", t)))
                    .unwrap()
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let winners: Vec<_> = results.iter().filter(|r| r.successful).collect();
    assert_eq!(winners.len(), 1);
    let winner = winners[0];
    for loser in results.iter().filter(|r| !r.successful) {
        assert_eq!(loser.index, winner.index);
        assert_eq!(loser.value, winner.value);
    }
    let stored = node.get_compare_exchange("theater", "seat/1").unwrap().unwrap();
    assert_eq!(Some(stored.value), winner.value);
    assert_eq!(node.last_applied(), threads as u64);
}

#[test]
fn cluster_transactions_race_on_one_guard() {
    let node = Arc::new(ephemeral_node());
    node.create_database("theater", 2).unwrap();
    let threads = 6;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let node = Arc::clone(&node);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                node.execute_cluster_transaction(
                    "theater",
                    vec![put_doc(
                        &format!("tickets/{}", t),
                        json!({"seat": 1}),
                        guard("seat/1", 0),
                    )],
                )
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, CorvidError::CompareExchangeMismatch { .. })));

    let theater = node.database("theater").unwrap();
    assert_eq!(all_documents(&theater).len(), 1);
}

#[test]
fn keys_are_scoped_per_database() {
    let node = ephemeral_node();
    assert!(node.put_compare_exchange("shop", "Config/Main", 0, json!(1)).unwrap().successful);
    assert!(node.put_compare_exchange("blog", "config/main", 0, json!(2)).unwrap().successful);
    assert!(!node.put_compare_exchange("SHOP", "CONFIG/MAIN", 0, json!(3)).unwrap().successful);

    assert_eq!(
        node.get_compare_exchange("shop", "config/main").unwrap().unwrap().value,
        json!(1)
    );
    assert_eq!(
        node.get_compare_exchange("blog", "config/main").unwrap().unwrap().value,
        json!(2)
    );
    assert!(node.put_compare_exchange("shop", "  ", 0, json!(1)).is_err());
}

#[test]
fn load_with_includes_sees_one_point_in_time() {
    let node = ephemeral_node();
    let shop = node.create_database("shop", 3).unwrap();
    node.execute_cluster_transaction(
        "shop",
        vec![
            put_doc("users/1", json!({"email": "ada@example.com"}), guard("emails/ada@example.com", 0)),
            put_cmpxchg("usernames/ada", 0, json!("users/1")),
        ],
    )
    .unwrap();

    let result = shop.load_with_includes(
        &[id("users/1"), id("users/2")],
        &["emails/ada@example.com", "usernames/ADA", "usernames/nobody"],
    );
    assert!(result.documents[0].is_some());
    assert!(result.documents[1].is_none());
    assert_eq!(result.compare_exchange.len(), 2);
    assert_eq!(result.compare_exchange["usernames/ada"].value, json!("users/1"));
    assert_eq!(
        result.compare_exchange["emails/ada@example.com"].value,
        json!({"document": "users/1"})
    );
}

#[test]
fn includes_never_mix_before_and_after_on_one_shard() {
    let node = Arc::new(ephemeral_node());
    let profiles = node.create_database("profiles", 1).unwrap();
    let lock = node
        .put_compare_exchange("profiles", "lock/user", 0, json!("owner"))
        .unwrap();
    assert_eq!(lock.index, 1);
    let rounds = 200u64;
    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let node = Arc::clone(&node);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            // Round n is guarded by index n and lands at raft index n + 1
            for n in 1..=rounds {
                node.execute_cluster_transaction(
                    "profiles",
                    vec![put_doc("users/1", json!({"n": n}), guard("lock/user", n))],
                )
                .unwrap();
            }
            done.store(true, Ordering::Release);
        })
    };

    let mut reads = 0;
    while !done.load(Ordering::Acquire) || reads == 0 {
        let result = profiles.load_with_includes(&[id("users/1")], &["lock/user"]);
        let index = result.compare_exchange["lock/user"].index;
        match &result.documents[0] {
            None => assert_eq!(index, 1),
            Some(doc) => assert_eq!(doc.body["n"].as_u64().unwrap() + 1, index),
        }
        reads += 1;
    }
    writer.join().unwrap();

    let last = profiles.load_with_includes(&[id("users/1")], &["lock/user"]);
    assert_eq!(last.compare_exchange["lock/user"].index, rounds + 1);
    assert_eq!(last.documents[0].as_ref().unwrap().body, json!({"n": rounds}));
}
