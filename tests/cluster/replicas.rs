//! Replica Tests
//!
//! Nodes applying the same cluster log converge, whether or not they host
//! the database a transaction targets.

use crate::common::*;
use corvid::{BatchOperation, Command, PutDocumentCommand};
use std::sync::Arc;
use std::thread;

fn replica(log: &Arc<ClusterLog>, host_shop: bool) -> Node {
    let node = Node::ephemeral(Arc::clone(log)).unwrap();
    if host_shop {
        node.create_database("shop", 3).unwrap();
    }
    node
}

#[test]
fn replicas_converge_on_the_same_log() {
    let log = Arc::new(ClusterLog::in_memory());
    let leader = replica(&log, true);
    let follower = replica(&log, true);
    let bystander = replica(&log, false);

    let lock = leader.put_compare_exchange("shop", "lock/A", 0, json!("leader")).unwrap();
    leader
        .execute_cluster_transaction(
            "shop",
            vec![
                put_doc("orders/1", json!({"n": 1}), guard("lock/A", lock.index)),
                put_doc("orders/2", json!({"n": 2}), guard("lock/A", lock.index)),
                put_cmpxchg("orders/next", 0, json!(3)),
            ],
        )
        .unwrap();
    assert!(leader
        .execute_cluster_transaction(
            "shop",
            vec![put_doc("orders/3", json!({}), guard("lock/A", lock.index))],
        )
        .is_err());
    leader.delete_compare_exchange("shop", "orders/next", 2).unwrap();

    assert_eq!(follower.last_applied(), 0);
    assert_eq!(follower.catch_up().unwrap(), 4);
    assert_eq!(bystander.catch_up().unwrap(), 4);

    let table = leader.compare_exchange_store().snapshot();
    assert_eq!(follower.compare_exchange_store().snapshot(), table);
    assert_eq!(bystander.compare_exchange_store().snapshot(), table);

    let leader_docs = all_documents(&leader.database("shop").unwrap());
    let follower_docs = all_documents(&follower.database("shop").unwrap());
    assert_eq!(leader_docs.len(), 2);
    assert_eq!(follower_docs, leader_docs);
}

#[test]
fn catch_up_twice_changes_nothing() {
    let log = Arc::new(ClusterLog::in_memory());
    let leader = replica(&log, true);
    let follower = replica(&log, true);
    leader
        .execute_cluster_transaction("shop", vec![put_doc("users/1", json!({}), guard("u", 0))])
        .unwrap();

    follower.catch_up().unwrap();
    let shop = follower.database("shop").unwrap();
    let before = all_documents(&shop);
    assert_eq!(follower.catch_up().unwrap(), 1);
    assert_eq!(all_documents(&shop), before);
}

#[test]
fn full_merger_queue_does_not_skip_decided_entries() {
    let log = Arc::new(ClusterLog::in_memory());
    let dir = tempfile::tempdir().unwrap();
    let mut config = CorvidConfig::cache();
    config.merger.queue_capacity = 1;
    let leader = Node::with_cluster_log(dir.path(), config, Arc::clone(&log)).unwrap();
    let bystander = replica(&log, false);
    let shop = leader.create_database("shop", 1).unwrap();

    let bulk = {
        let shop = Arc::clone(&shop);
        thread::spawn(move || {
            let operations: Vec<BatchOperation> = (0..20_000)
                .map(|i| {
                    BatchOperation::put(
                        id(&format!("bulk/{}", i)),
                        json!({}),
                        ConcurrencyCheck::None,
                    )
                })
                .collect();
            loop {
                match shop.batch(operations.clone()) {
                    Err(CorvidError::Backpressure { .. }) => thread::yield_now(),
                    result => break result.unwrap(),
                }
            }
        })
    };
    // Keep the one queue slot occupied while the bulk batch runs
    let filler = loop {
        let put = Command::PutDocument(PutDocumentCommand::new(
            id("filler/1"),
            json!({}),
            ConcurrencyCheck::None,
        ));
        if let Ok(pending) = shop.partitions()[0].enqueue(put) {
            break pending;
        }
        thread::yield_now();
    };

    let outcome = leader
        .execute_cluster_transaction(
            "shop",
            vec![put_doc("orders/1", json!({}), guard("lock/A", 0))],
        )
        .unwrap();
    assert!(outcome.is_committed());
    assert_eq!(leader.last_applied(), log.last_index());

    let again = leader
        .execute_cluster_transaction(
            "shop",
            vec![put_doc("orders/2", json!({}), guard("lock/A", 0))],
        )
        .unwrap_err();
    assert!(matches!(again, CorvidError::CompareExchangeMismatch { .. }));

    bulk.join().unwrap();
    filler.wait().unwrap();
    bystander.catch_up().unwrap();
    assert_eq!(
        bystander.compare_exchange_store().snapshot(),
        leader.compare_exchange_store().snapshot()
    );
    assert_eq!(leader.get_compare_exchange("shop", "lock/A").unwrap().unwrap().index, 1);
    assert!(shop.load(&id("orders/1")).is_some());
    assert!(shop.load(&id("orders/2")).is_none());
}
