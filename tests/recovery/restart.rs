//! Restart Tests
//!
//! A node reopened from its directory has the same documents, etags,
//! identity counters and compare-exchange table it had when it closed.

use crate::common::*;
use corvid::{CompareExchangeState, CONFIG_FILE_NAME};

struct Observed {
    documents: Vec<corvid::Document>,
    table: CompareExchangeState,
    positions: Vec<u64>,
}

fn observe(node: &Node) -> Observed {
    let shop = node.database("shop").unwrap();
    Observed {
        documents: all_documents(&shop),
        table: node.compare_exchange_store().snapshot(),
        positions: shop.partitions().iter().map(|p| p.log_position()).collect(),
    }
}

fn populate(node: &Node) {
    let shop = node.create_database("shop", 3).unwrap();
    for i in 0..10 {
        shop.put(id(&format!("users/{}", i)), json!({"i": i}), ConcurrencyCheck::None)
            .unwrap();
    }
    shop.delete(id("users/3"), ConcurrencyCheck::None).unwrap();
    let lock = node.put_compare_exchange("shop", "lock/A", 0, json!("owner")).unwrap();
    node.execute_cluster_transaction(
        "shop",
        vec![
            put_doc("orders/1", json!({"total": 5}), guard("lock/A", lock.index)),
            put_doc("orders/2", json!({"total": 7}), guard("lock/A", lock.index)),
        ],
    )
    .unwrap();
    assert!(node
        .execute_cluster_transaction(
            "shop",
            vec![put_doc("orders/3", json!({}), guard("lock/A", lock.index))],
        )
        .is_err());
}

#[test]
fn reopen_restores_state() {
    let mut test = TestNode::new();
    populate(test.node());
    let before = observe(test.node());

    test.reopen();
    let after = observe(test.node());
    assert_eq!(after.documents, before.documents);
    assert_eq!(after.table, before.table);
    assert_eq!(after.positions, before.positions);
    assert_eq!(test.node().last_applied(), 3);
    assert!(test.path().join(CONFIG_FILE_NAME).is_file());
    assert_eq!(test.node().config().durability, "always");
}

#[test]
fn recover_after_crash_restores_state() {
    let mut test = TestNode::new();
    populate(test.node());
    let before = observe(test.node());

    test.recover();
    let after = observe(test.node());
    assert_eq!(after.documents, before.documents);
    assert_eq!(after.table, before.table);
}

#[test]
fn writes_continue_after_reopen() {
    let mut test = TestNode::new();
    {
        let shop = test.node().create_database("shop", 1).unwrap();
        shop.put(id("orders|"), json!({}), ConcurrencyCheck::None).unwrap();
        shop.put(id("orders|"), json!({}), ConcurrencyCheck::None).unwrap();
    }
    test.reopen();

    let shop = test.node().database("shop").unwrap();
    let last = shop.partitions()[0].store().last_etag();
    let doc = shop.put(id("orders|"), json!({}), ConcurrencyCheck::None).unwrap();
    assert_eq!(doc.id.as_str(), "orders/3");
    assert_eq!(doc.etag, last + 1);

    let lock = test
        .node()
        .put_compare_exchange("shop", "after-restart", 0, json!(true))
        .unwrap();
    assert!(lock.successful);
    assert_eq!(lock.index, 1);
}

#[test]
fn reopen_twice_is_stable() {
    let mut test = TestNode::new();
    populate(test.node());
    test.reopen();
    let first = observe(test.node());
    test.reopen();
    let second = observe(test.node());
    assert_eq!(second.documents, first.documents);
    assert_eq!(second.table, first.table);
    assert_eq!(second.positions, first.positions);
}
