//! Shared test utilities for all integration test suites.
//!
//! Import via `mod common;` from any test's main.rs.

#![allow(dead_code)]
#![allow(unused_imports)]

pub use corvid::{
    ClusterLog, ClusterLogEntry, ClusterTransactionOutcome, CompareExchangeGuard,
    ConcurrencyCheck, CorvidConfig, CorvidError, Database, DocumentId, Node,
    SingleClusterDatabaseCommand,
};
pub use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

// ============================================================================
// Configs
// ============================================================================

/// Config with every append fsynced
pub fn always_config() -> CorvidConfig {
    CorvidConfig {
        durability: "always".to_string(),
        ..CorvidConfig::default()
    }
}

// ============================================================================
// Nodes
// ============================================================================

/// In-memory node with its own cluster log
pub fn ephemeral_node() -> Node {
    Node::ephemeral(Arc::new(ClusterLog::in_memory())).expect("Failed to open ephemeral node")
}

/// Durable node in a temp directory that can be reopened
pub struct TestNode {
    pub node: Option<Node>,
    pub dir: TempDir,
}

impl TestNode {
    /// Open a node with always durability
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let node = Node::open_with_config(dir.path(), always_config())
            .expect("Failed to open test node");
        TestNode {
            node: Some(node),
            dir,
        }
    }

    pub fn node(&self) -> &Node {
        self.node.as_ref().expect("node is open")
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Close and drop the node without flushing anything beyond what
    /// `always` durability already made durable
    pub fn crash(&mut self) {
        self.node.take();
    }

    /// Close cleanly, then open again from the same directory
    pub fn reopen(&mut self) {
        if let Some(node) = self.node.take() {
            node.close().expect("Failed to close node");
        }
        self.node = Some(Node::open(self.dir.path()).expect("Failed to reopen node"));
    }

    /// Open again after a crash
    pub fn recover(&mut self) {
        self.crash();
        self.node = Some(Node::open(self.dir.path()).expect("Failed to recover node"));
    }
}

// ============================================================================
// Builders
// ============================================================================

pub fn id(s: &str) -> DocumentId {
    DocumentId::new(s).expect("valid document id")
}

pub fn guard(key: &str, expected_index: u64) -> Option<CompareExchangeGuard> {
    Some(CompareExchangeGuard::new(key, expected_index))
}

pub fn put_doc(
    doc: &str,
    body: serde_json::Value,
    guard: Option<CompareExchangeGuard>,
) -> SingleClusterDatabaseCommand {
    SingleClusterDatabaseCommand::PutDocument {
        id: id(doc),
        body,
        guard,
    }
}

pub fn put_cmpxchg(key: &str, expected_index: u64, value: serde_json::Value) -> SingleClusterDatabaseCommand {
    SingleClusterDatabaseCommand::PutCompareExchange {
        key: key.to_string(),
        expected_index,
        value,
    }
}

/// Every document of every shard, keyed by storage key
pub fn all_documents(db: &Database) -> Vec<corvid::Document> {
    let mut docs: Vec<corvid::Document> = db
        .partitions()
        .iter()
        .flat_map(|p| p.store().with_read(|s| s.documents().cloned().collect::<Vec<_>>()))
        .collect();
    docs.sort_by_key(|d| d.id.storage_key());
    docs
}
