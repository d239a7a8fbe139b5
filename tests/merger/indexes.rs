//! Index Definition Tests

use crate::common::*;
use corvid::{IndexDefinition, IndexDeploymentMode};

fn rolling(name: &str) -> IndexDefinition {
    IndexDefinition::new(name, vec!["email".to_string()])
        .with_deployment(IndexDeploymentMode::Rolling)
}

#[test]
fn rolling_deployment_rejected_on_sharded_database() {
    let node = ephemeral_node();
    let sharded = node.create_database("sharded", 3).unwrap();
    let err = sharded.put_index(rolling("users/by-email")).unwrap_err();
    assert!(matches!(err, CorvidError::NotSupported { .. }));
    assert!(sharded.index("users/by-email").unwrap().is_none());
    for partition in sharded.partitions() {
        assert_eq!(partition.log_position(), 0);
    }
}

#[test]
fn rolling_deployment_allowed_on_single_shard() {
    let node = ephemeral_node();
    let single = node.create_database("single", 1).unwrap();
    single.put_index(rolling("users/by-email")).unwrap();
    assert_eq!(
        single.index("USERS/BY-EMAIL").unwrap(),
        Some(rolling("users/by-email"))
    );
}

#[test]
fn immediate_index_stored_on_every_shard_and_survives_restart() {
    let mut test = TestNode::new();
    let definition = IndexDefinition::new("orders/by-total", vec!["total".to_string()]);
    {
        let shop = test.node().create_database("shop", 3).unwrap();
        shop.put_index(definition.clone()).unwrap();
        for partition in shop.partitions() {
            assert_eq!(partition.log_position(), 1);
        }
    }
    test.reopen();
    let shop = test.node().database("shop").unwrap();
    assert_eq!(shop.index("orders/by-total").unwrap(), Some(definition));
}
