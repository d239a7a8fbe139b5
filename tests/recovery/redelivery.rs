//! Redelivery Tests
//!
//! A cluster transaction decided in the cluster log but never applied to
//! the partitions (the node stopped in between) is applied on restart,
//! with the decision the compare-exchange table recorded for it.

use crate::common::*;
use corvid::DatabaseName;

fn logged_only(node: &Node, commands: Vec<SingleClusterDatabaseCommand>) -> u64 {
    node.cluster_log()
        .propose(&ClusterLogEntry::ClusterTransaction {
            database: DatabaseName::new("shop").unwrap(),
            commands,
        })
        .unwrap()
}

#[test]
fn decided_but_unapplied_transaction_is_redelivered() {
    let mut test = TestNode::new();
    let index = {
        let node = test.node();
        node.create_database("shop", 2).unwrap();
        let lock = node.put_compare_exchange("shop", "lock/A", 0, json!("owner")).unwrap();
        let index = logged_only(
            node,
            vec![
                put_doc("orders/1", json!({"n": 1}), guard("lock/A", lock.index)),
                put_doc("orders/2", json!({"n": 2}), guard("lock/A", lock.index)),
            ],
        );
        assert!(node.database("shop").unwrap().load(&id("orders/1")).is_none());
        index
    };

    test.recover();
    let node = test.node();
    let shop = node.database("shop").unwrap();
    assert!(shop.load(&id("orders/1")).is_some());
    assert!(shop.load(&id("orders/2")).is_some());
    let lock = node.get_compare_exchange("shop", "lock/A").unwrap().unwrap();
    assert_eq!(lock.index, index);
    assert_eq!(node.last_applied(), index);
}

#[test]
fn rejected_transaction_stays_rejected_after_redelivery() {
    let mut test = TestNode::new();
    {
        let node = test.node();
        node.create_database("shop", 2).unwrap();
        node.put_compare_exchange("shop", "lock/A", 0, json!("owner")).unwrap();
        logged_only(node, vec![put_doc("orders/1", json!({}), guard("lock/A", 0))]);
    }

    test.recover();
    let node = test.node();
    assert!(node.database("shop").unwrap().load(&id("orders/1")).is_none());
    assert_eq!(node.get_compare_exchange("shop", "lock/A").unwrap().unwrap().index, 1);
}

#[test]
fn live_catch_up_applies_entries_from_other_proposers() {
    let test = TestNode::new();
    let node = test.node();
    let shop = node.create_database("shop", 2).unwrap();
    let index = logged_only(node, vec![put_doc("orders/1", json!({}), guard("k", 0))]);
    assert!(shop.load(&id("orders/1")).is_none());

    assert_eq!(node.catch_up().unwrap(), index);
    let doc = shop.load(&id("orders/1")).unwrap();
    let positions: Vec<u64> = shop.partitions().iter().map(|p| p.log_position()).collect();

    assert_eq!(node.catch_up().unwrap(), index);
    assert_eq!(shop.load(&id("orders/1")), Some(doc));
    let again: Vec<u64> = shop.partitions().iter().map(|p| p.log_position()).collect();
    assert_eq!(again, positions);
}
