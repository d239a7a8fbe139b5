//! Cluster Transaction Tests
//!
//! - Guards shared by several documents advance their key once
//! - Any stale guard rejects the whole transaction
//! - Compare-exchange operations and document writes commit together
//! - Transactions spanning shards commit everywhere or nowhere

use crate::common::*;
use corvid::{ClusterDocumentResult, CompareExchangeKey, DatabaseName, PartitionId};
use std::collections::BTreeSet;

fn committed(outcome: ClusterTransactionOutcome) -> (u64, Vec<ClusterDocumentResult>) {
    match outcome {
        ClusterTransactionOutcome::Committed {
            raft_index,
            documents,
        } => (raft_index, documents),
        other => panic!("expected commit, got {:?}", other),
    }
}

// ============================================================================
// Guards
// ============================================================================

#[test]
fn shared_guard_advances_once() {
    let node = ephemeral_node();
    let shop = node.create_database("shop", 1).unwrap();
    for i in 0..4 {
        node.put_compare_exchange("shop", &format!("filler/{}", i), 0, json!(i))
            .unwrap();
    }
    let lock = node
        .put_compare_exchange("shop", "lock/A", 0, json!("owner"))
        .unwrap();
    assert_eq!(lock.index, 5);

    let outcome = node
        .execute_cluster_transaction(
            "shop",
            vec![
                put_doc("orders/1", json!({"n": 1}), guard("lock/A", 5)),
                put_doc("orders/2", json!({"n": 2}), guard("lock/A", 5)),
            ],
        )
        .unwrap();
    let (raft_index, documents) = committed(outcome);
    assert_eq!(raft_index, 6);
    assert_eq!(documents.len(), 2);
    assert_eq!(documents[0].id.as_str(), "orders/1");
    assert_eq!(documents[1].id.as_str(), "orders/2");

    let lock = node.get_compare_exchange("shop", "lock/a").unwrap().unwrap();
    assert_eq!(lock.index, 6);
    assert_eq!(lock.value, json!("owner"));
    assert!(shop.load(&id("orders/1")).is_some());
    assert!(shop.load(&id("orders/2")).is_some());
}

#[test]
fn stale_guard_rejects_everything() {
    let node = ephemeral_node();
    let shop = node.create_database("shop", 2).unwrap();
    let lock = node
        .put_compare_exchange("shop", "lock/A", 0, json!("owner"))
        .unwrap();
    node.execute_cluster_transaction(
        "shop",
        vec![put_doc("orders/1", json!({}), guard("lock/A", lock.index))],
    )
    .unwrap();

    let err = node
        .execute_cluster_transaction(
            "shop",
            vec![
                put_doc("orders/2", json!({}), None),
                put_doc("orders/3", json!({}), guard("lock/A", lock.index)),
            ],
        )
        .unwrap_err();
    match err {
        CorvidError::CompareExchangeMismatch {
            key,
            expected,
            actual,
        } => {
            assert_eq!(key, "lock/a");
            assert_eq!(expected, lock.index);
            assert_eq!(actual, lock.index + 1);
        }
        other => panic!("expected mismatch, got {:?}", other),
    }
    assert!(shop.load(&id("orders/2")).is_none());
    assert!(shop.load(&id("orders/3")).is_none());
    assert_eq!(
        node.get_compare_exchange("shop", "lock/A").unwrap().unwrap().index,
        lock.index + 1
    );
}

#[test]
fn guard_on_missing_key_creates_it() {
    let node = ephemeral_node();
    node.create_database("shop", 1).unwrap();
    let (raft_index, _) = committed(
        node.execute_cluster_transaction(
            "shop",
            vec![put_doc("users/1", json!({}), guard("emails/ada@example.com", 0))],
        )
        .unwrap(),
    );
    let email = node
        .get_compare_exchange("shop", "emails/ada@example.com")
        .unwrap()
        .unwrap();
    assert_eq!(email.index, raft_index);
    assert_eq!(email.value, json!({"document": "users/1"}));
}

// ============================================================================
// Mixed operations
// ============================================================================

#[test]
fn unique_email_and_username_reserved_with_the_user() {
    let node = ephemeral_node();
    let shop = node.create_database("shop", 3).unwrap();
    shop.put(id("invites/ada"), json!({"from": "grace"}), ConcurrencyCheck::None)
        .unwrap();

    let (raft_index, documents) = committed(
        node.execute_cluster_transaction(
            "shop",
            vec![
                put_doc("users/1", json!({"name": "Ada"}), guard("emails/ada@example.com", 0)),
                put_cmpxchg("usernames/ada", 0, json!("users/1")),
                SingleClusterDatabaseCommand::DeleteDocument {
                    id: id("invites/ada"),
                    guard: None,
                },
            ],
        )
        .unwrap(),
    );
    assert_eq!(documents.len(), 2);
    assert_eq!(documents[1].command_index, 2);
    assert_eq!(documents[1].etag, None);

    assert!(shop.load(&id("users/1")).is_some());
    assert!(shop.load(&id("invites/ada")).is_none());
    let username = node.get_compare_exchange("shop", "usernames/ada").unwrap().unwrap();
    assert_eq!(username.index, raft_index);
    assert_eq!(username.value, json!("users/1"));

    let err = node
        .execute_cluster_transaction(
            "shop",
            vec![
                put_doc("users/2", json!({"name": "Ada"}), guard("emails/ada@example.com", 0)),
                put_cmpxchg("usernames/ada2", 0, json!("users/2")),
            ],
        )
        .unwrap_err();
    assert!(matches!(err, CorvidError::CompareExchangeMismatch { .. }));
    assert!(shop.load(&id("users/2")).is_none());
    assert!(node.get_compare_exchange("shop", "usernames/ada2").unwrap().is_none());
}

#[test]
fn delete_compare_exchange_requires_the_key() {
    let node = ephemeral_node();
    node.create_database("shop", 1).unwrap();
    let err = node
        .execute_cluster_transaction(
            "shop",
            vec![SingleClusterDatabaseCommand::DeleteCompareExchange {
                key: "missing".into(),
                expected_index: 0,
            }],
        )
        .unwrap_err();
    assert!(matches!(err, CorvidError::CompareExchangeMismatch { actual: 0, .. }));
}

// ============================================================================
// Sharding
// ============================================================================

#[test]
fn transaction_spanning_shards_commits_on_each() {
    let node = ephemeral_node();
    let shop = node.create_database("shop", 4).unwrap();
    let commands: Vec<_> = (0..12)
        .map(|i| put_doc(&format!("items/{}", i), json!({"i": i}), None))
        .collect();

    let (_, documents) = committed(node.execute_cluster_transaction("shop", commands).unwrap());
    assert_eq!(documents.len(), 12);
    let order: Vec<usize> = documents.iter().map(|d| d.command_index).collect();
    assert_eq!(order, (0..12).collect::<Vec<_>>());

    let shards: BTreeSet<PartitionId> = (0..12)
        .map(|i| corvid::shard_for(&id(&format!("items/{}", i)), 4))
        .collect();
    assert!(shards.len() > 1);
    for i in 0..12 {
        let doc = shop.load(&id(&format!("items/{}", i))).unwrap();
        assert_eq!(doc.body, json!({"i": i}));
    }
}

#[test]
fn rejected_transaction_spanning_shards_writes_nothing() {
    let node = ephemeral_node();
    let shop = node.create_database("shop", 4).unwrap();
    node.put_compare_exchange("shop", "lock", 0, json!(null)).unwrap();
    let mut commands: Vec<_> = (0..8)
        .map(|i| put_doc(&format!("items/{}", i), json!({}), None))
        .collect();
    commands.push(put_doc("items/last", json!({}), guard("lock", 0)));

    assert!(node.execute_cluster_transaction("shop", commands).is_err());
    assert!(all_documents(&shop).is_empty());
    let key = CompareExchangeKey::new(DatabaseName::new("shop").unwrap(), "lock");
    assert_eq!(node.compare_exchange_store().get(&key).unwrap().index, 1);
}
