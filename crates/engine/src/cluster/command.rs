//! Cluster transaction command
//!
//! A cluster transaction is an ordered batch of [`SingleClusterDatabaseCommand`]s
//! decided by consensus at raft index N. Every shard owning one of its
//! documents runs a [`ClusterTransactionMergedCommand`] carrying the whole
//! batch; each shard writes only the documents it owns.
//!
//! ## Decision
//!
//! The first application of N evaluates every compare-exchange expectation
//! of the batch against the table as it was before N (so two guards on the
//! same key with the same expected index both see the same pre-state). If
//! all match, the compare-exchange effects are staged at index N; either
//! way the decision is recorded under N in the same storage transaction.
//! Every later application of N (other shards, replay, redelivery, replicas
//! rebuilding the table) reuses the recorded decision.
//!
//! ## Idempotence
//!
//! Each shard records its outcome in partition metadata under
//! `cluster/result/{N}` along with the highest index consumed
//! (`cluster/last-index`). Re-applying N returns the recorded outcome
//! without writing anything.

use crate::command::{Command, CommandOutput};
use crate::context::PartitionContext;
use crate::envelope::ReplayableEnvelope;
use corvid_core::{
    ClusterDecision, CompareExchangeConflict, CompareExchangeKey, CompareExchangeValue,
    CorvidError, CorvidResult, DatabaseName, DocumentId,
};
use corvid_storage::{CompareExchangeView, StorageTransaction};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Partition metadata key holding the highest consumed raft index
pub const LAST_INDEX_KEY: &str = "cluster/last-index";

/// Partition metadata key holding the outcome recorded for `raft_index`
pub fn result_key(raft_index: u64) -> String {
    format!("cluster/result/{:020}", raft_index)
}

/// Expected compare-exchange state attached to a document write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareExchangeGuard {
    /// Compare-exchange key (database-scoped)
    pub key: String,
    /// Index the key must have, 0 for "must not exist"
    pub expected_index: u64,
}

impl CompareExchangeGuard {
    /// New guard
    pub fn new(key: impl Into<String>, expected_index: u64) -> Self {
        Self {
            key: key.into(),
            expected_index,
        }
    }
}

/// One operation inside a cluster transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SingleClusterDatabaseCommand {
    /// Put a document, optionally guarded
    PutDocument {
        /// Document id
        id: DocumentId,
        /// Body
        body: serde_json::Value,
        /// Guard touched on commit
        guard: Option<CompareExchangeGuard>,
    },
    /// Delete a document, optionally guarded
    DeleteDocument {
        /// Document id
        id: DocumentId,
        /// Guard touched on commit
        guard: Option<CompareExchangeGuard>,
    },
    /// Conditional compare-exchange put
    PutCompareExchange {
        /// Key
        key: String,
        /// Expected index
        expected_index: u64,
        /// New value
        value: serde_json::Value,
    },
    /// Conditional compare-exchange delete (the key must exist)
    DeleteCompareExchange {
        /// Key
        key: String,
        /// Expected index
        expected_index: u64,
    },
}

impl SingleClusterDatabaseCommand {
    /// Document written by this operation, if any
    pub fn document_id(&self) -> Option<&DocumentId> {
        match self {
            SingleClusterDatabaseCommand::PutDocument { id, .. }
            | SingleClusterDatabaseCommand::DeleteDocument { id, .. } => Some(id),
            _ => None,
        }
    }

    /// (key, expected index) this operation depends on
    fn expectation(&self) -> Option<(&str, u64)> {
        match self {
            SingleClusterDatabaseCommand::PutDocument { guard, .. }
            | SingleClusterDatabaseCommand::DeleteDocument { guard, .. } => guard
                .as_ref()
                .map(|g| (g.key.as_str(), g.expected_index)),
            SingleClusterDatabaseCommand::PutCompareExchange {
                key, expected_index, ..
            }
            | SingleClusterDatabaseCommand::DeleteCompareExchange {
                key, expected_index, ..
            } => Some((key.as_str(), *expected_index)),
        }
    }
}

/// Evaluate every expectation of `commands` against the current table
pub fn evaluate_guards<V: CompareExchangeView + ?Sized>(
    view: &V,
    database: &DatabaseName,
    commands: &[SingleClusterDatabaseCommand],
) -> ClusterDecision {
    let mut conflicts = Vec::new();
    for command in commands {
        let Some((key, expected)) = command.expectation() else {
            continue;
        };
        let actual = view
            .read_compare_exchange(&CompareExchangeKey::new(database.clone(), key))
            .map_or(0, |v| v.index);
        let must_exist = matches!(
            command,
            SingleClusterDatabaseCommand::DeleteCompareExchange { .. }
        );
        if actual != expected || (must_exist && actual == 0) {
            conflicts.push(CompareExchangeConflict {
                key: key.to_lowercase(),
                expected,
                actual,
            });
        }
    }
    if conflicts.is_empty() {
        ClusterDecision::Committed
    } else {
        ClusterDecision::Rejected { conflicts }
    }
}

/// Stage the compare-exchange effects of a committed transaction at `raft_index`
///
/// Guards touch their key: the index becomes `raft_index` and the value is
/// kept, or created as `{"document": id}` when the key is absent.
fn stage_effects<V: CompareExchangeView + ?Sized>(
    view: &mut V,
    database: &DatabaseName,
    commands: &[SingleClusterDatabaseCommand],
    raft_index: u64,
) {
    for command in commands {
        match command {
            SingleClusterDatabaseCommand::PutDocument { id, guard, .. }
            | SingleClusterDatabaseCommand::DeleteDocument { id, guard } => {
                let Some(guard) = guard else { continue };
                let key = CompareExchangeKey::new(database.clone(), &guard.key);
                let value = view
                    .read_compare_exchange(&key)
                    .map(|v| v.value)
                    .unwrap_or_else(|| serde_json::json!({ "document": id.as_str() }));
                let stored = CompareExchangeValue {
                    key: key.key.clone(),
                    index: raft_index,
                    value,
                };
                view.stage_compare_exchange(key, Some(stored));
            }
            SingleClusterDatabaseCommand::PutCompareExchange { key, value, .. } => {
                let key = CompareExchangeKey::new(database.clone(), key);
                let stored = CompareExchangeValue {
                    key: key.key.clone(),
                    index: raft_index,
                    value: value.clone(),
                };
                view.stage_compare_exchange(key, Some(stored));
            }
            SingleClusterDatabaseCommand::DeleteCompareExchange { key, .. } => {
                view.stage_compare_exchange(CompareExchangeKey::new(database.clone(), key), None);
            }
        }
    }
}

/// Reject a cluster transaction no node can apply
///
/// Every node runs this on every entry before touching the table, so an
/// invalid entry is refused identically everywhere.
pub fn validate_transaction(commands: &[SingleClusterDatabaseCommand]) -> CorvidResult<()> {
    if commands.is_empty() {
        return Err(CorvidError::invalid_input("cluster transaction has no commands"));
    }
    for command in commands {
        if let Some(id) = command.document_id() {
            if id.is_identity_request() {
                return Err(CorvidError::invalid_input(format!(
                    "cluster transactions need explicit document ids, got '{}'",
                    id
                )));
            }
        }
    }
    Ok(())
}

/// Decision for `raft_index`: the recorded one, or a fresh evaluation
///
/// A fresh evaluation stages the compare-exchange effects (when committed)
/// and the decision itself into `view`. An index at or below the table's
/// applied index with no recorded decision was pruned: applying it again
/// could not reproduce the original verdict.
pub fn decide<V: CompareExchangeView + ?Sized>(
    view: &mut V,
    database: &DatabaseName,
    commands: &[SingleClusterDatabaseCommand],
    raft_index: u64,
) -> CorvidResult<ClusterDecision> {
    if let Some(decision) = view.cluster_decision(raft_index) {
        return Ok(decision);
    }
    if raft_index <= view.last_applied_index() {
        return Err(CorvidError::ReplayDiverged {
            position: raft_index,
            reason: "cluster transaction decision is no longer retained".into(),
        });
    }
    let decision = evaluate_guards(view, database, commands);
    if decision.is_committed() {
        stage_effects(view, database, commands, raft_index);
    }
    view.record_cluster_decision(raft_index, decision.clone());
    Ok(decision)
}

/// Document written by a committed cluster transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterDocumentResult {
    /// Position of the operation in the transaction
    pub command_index: usize,
    /// Document id
    pub id: DocumentId,
    /// New etag, `None` for deletes
    pub etag: Option<u64>,
}

/// Outcome of a cluster transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClusterTransactionOutcome {
    /// Every guard matched
    Committed {
        /// Consensus index the transaction was applied at
        raft_index: u64,
        /// Documents written (by this shard, or by all shards once merged)
        documents: Vec<ClusterDocumentResult>,
    },
    /// At least one guard failed; nothing was written
    Rejected {
        /// Failed expectations in command order
        conflicts: Vec<CompareExchangeConflict>,
    },
}

impl ClusterTransactionOutcome {
    /// True for `Committed`
    pub fn is_committed(&self) -> bool {
        matches!(self, ClusterTransactionOutcome::Committed { .. })
    }

    /// Decision this outcome was produced under
    pub fn decision(&self) -> ClusterDecision {
        match self {
            ClusterTransactionOutcome::Committed { .. } => ClusterDecision::Committed,
            ClusterTransactionOutcome::Rejected { conflicts } => ClusterDecision::Rejected {
                conflicts: conflicts.clone(),
            },
        }
    }

    /// Outcome without any document effects
    pub fn from_decision(raft_index: u64, decision: ClusterDecision) -> Self {
        match decision {
            ClusterDecision::Committed => ClusterTransactionOutcome::Committed {
                raft_index,
                documents: Vec::new(),
            },
            ClusterDecision::Rejected { conflicts } => {
                ClusterTransactionOutcome::Rejected { conflicts }
            }
        }
    }

    /// Combine per-shard outcomes of the same transaction
    pub fn merge(raft_index: u64, outcomes: Vec<ClusterTransactionOutcome>) -> Self {
        let mut documents = Vec::new();
        for outcome in outcomes {
            match outcome {
                rejected @ ClusterTransactionOutcome::Rejected { .. } => return rejected,
                ClusterTransactionOutcome::Committed { documents: d, .. } => documents.extend(d),
            }
        }
        documents.sort_by_key(|d| d.command_index);
        ClusterTransactionOutcome::Committed {
            raft_index,
            documents,
        }
    }

    /// Error reported to the proposer of a rejected transaction
    pub fn into_result(self) -> CorvidResult<Self> {
        match self {
            ClusterTransactionOutcome::Rejected { conflicts } => {
                let first = conflicts.first().cloned().unwrap_or(CompareExchangeConflict {
                    key: String::new(),
                    expected: 0,
                    actual: 0,
                });
                Err(CorvidError::CompareExchangeMismatch {
                    key: first.key,
                    expected: first.expected,
                    actual: first.actual,
                })
            }
            committed => Ok(committed),
        }
    }
}

/// One shard's part of the cluster transaction decided at `raft_index`
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterTransactionMergedCommand {
    raft_index: u64,
    database: DatabaseName,
    commands: Vec<SingleClusterDatabaseCommand>,
    decision: Option<ClusterDecision>,
}

impl ClusterTransactionMergedCommand {
    /// Command for the batch decided at `raft_index`
    pub fn new(
        raft_index: u64,
        database: DatabaseName,
        commands: Vec<SingleClusterDatabaseCommand>,
    ) -> Self {
        Self {
            raft_index,
            database,
            commands,
            decision: None,
        }
    }

    /// Consensus index
    pub fn raft_index(&self) -> u64 {
        self.raft_index
    }

    /// Target database
    pub fn database(&self) -> &DatabaseName {
        &self.database
    }

    /// The ordered batch
    pub fn commands(&self) -> &[SingleClusterDatabaseCommand] {
        &self.commands
    }

    /// Decision used, once the command ran
    pub fn decision(&self) -> Option<&ClusterDecision> {
        self.decision.as_ref()
    }

    pub(crate) fn apply(
        &mut self,
        context: &PartitionContext,
        txn: &mut StorageTransaction<'_>,
    ) -> CorvidResult<CommandOutput> {
        if &self.database != context.database() {
            return Err(CorvidError::invalid_input(format!(
                "cluster transaction for {} routed to {}",
                self.database,
                context.key()
            )));
        }

        let result_key = result_key(self.raft_index);
        if let Some(recorded) = txn.get_metadata(&result_key) {
            let outcome: ClusterTransactionOutcome = serde_json::from_value(recorded)?;
            debug!(
                target: "corvid::cluster",
                partition = %context.key(),
                raft_index = self.raft_index,
                "Cluster transaction already applied"
            );
            self.decision = Some(outcome.decision());
            return Ok(CommandOutput::Cluster(outcome));
        }

        let decision = match self.decision.clone() {
            Some(decision) => decision,
            None => decide(txn, &self.database, &self.commands, self.raft_index)?,
        };
        self.decision = Some(decision.clone());

        let outcome = match decision {
            ClusterDecision::Rejected { conflicts } => {
                ClusterTransactionOutcome::Rejected { conflicts }
            }
            ClusterDecision::Committed => {
                let mut documents = Vec::new();
                for (command_index, command) in self.commands.iter().enumerate() {
                    match command {
                        SingleClusterDatabaseCommand::PutDocument { id, body, .. }
                            if context.owns(id) =>
                        {
                            let doc = txn.put_document(id.clone(), body.clone());
                            documents.push(ClusterDocumentResult {
                                command_index,
                                id: id.clone(),
                                etag: Some(doc.etag),
                            });
                        }
                        SingleClusterDatabaseCommand::DeleteDocument { id, .. }
                            if context.owns(id) =>
                        {
                            txn.delete_document(id);
                            documents.push(ClusterDocumentResult {
                                command_index,
                                id: id.clone(),
                                etag: None,
                            });
                        }
                        _ => {}
                    }
                }
                ClusterTransactionOutcome::Committed {
                    raft_index: self.raft_index,
                    documents,
                }
            }
        };

        let last = txn
            .get_metadata(LAST_INDEX_KEY)
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        txn.put_metadata(
            LAST_INDEX_KEY,
            serde_json::Value::from(last.max(self.raft_index)),
        );
        txn.put_metadata(result_key, serde_json::to_value(&outcome)?);
        debug!(
            target: "corvid::cluster",
            partition = %context.key(),
            raft_index = self.raft_index,
            committed = outcome.is_committed(),
            "Applied cluster transaction"
        );
        Ok(CommandOutput::Cluster(outcome))
    }

    pub(crate) fn to_dto(&self) -> CorvidResult<ClusterTransactionEnvelope> {
        let decision = self.decision.clone().ok_or_else(|| {
            CorvidError::internal(format!(
                "cluster transaction {} has no decision yet",
                self.raft_index
            ))
        })?;
        Ok(ClusterTransactionEnvelope {
            raft_index: self.raft_index,
            database: self.database.clone(),
            commands: self.commands.clone(),
            decision,
        })
    }
}

/// Envelope of [`ClusterTransactionMergedCommand`]
///
/// Carries the decision so replay never consults the (possibly pruned)
/// decision table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterTransactionEnvelope {
    /// Consensus index
    pub raft_index: u64,
    /// Target database
    pub database: DatabaseName,
    /// The ordered batch
    pub commands: Vec<SingleClusterDatabaseCommand>,
    /// Decision the original application used
    pub decision: ClusterDecision,
}

impl ReplayableEnvelope for ClusterTransactionEnvelope {
    const KIND: &'static str = "ClusterTransaction";

    fn to_command(self, _: &PartitionContext, database: &DatabaseName) -> CorvidResult<Command> {
        if &self.database != database {
            return Err(CorvidError::malformed(
                Self::KIND,
                format!(
                    "transaction {} targets {}, not {}",
                    self.raft_index, self.database, database
                ),
            ));
        }
        Ok(Command::ClusterTransaction(ClusterTransactionMergedCommand {
            raft_index: self.raft_index,
            database: self.database,
            commands: self.commands,
            decision: Some(self.decision),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corvid_core::{PartitionId, PartitionKey};
    use corvid_storage::{try_compare_exchange, CompareExchangeStore, PartitionStore};
    use serde_json::json;

    fn db() -> DatabaseName {
        DatabaseName::new("shop").unwrap()
    }

    fn id(s: &str) -> DocumentId {
        DocumentId::new(s).unwrap()
    }

    fn put(doc: &str, guard: Option<(&str, u64)>) -> SingleClusterDatabaseCommand {
        SingleClusterDatabaseCommand::PutDocument {
            id: id(doc),
            body: json!({"doc": doc}),
            guard: guard.map(|(k, i)| CompareExchangeGuard::new(k, i)),
        }
    }

    /// Set `key` to `value` at consensus `index` through a standalone batch
    fn seed(store: &CompareExchangeStore, key: &str, index: u64) {
        let mut batch = store.batch(index);
        let result = try_compare_exchange(
            &mut batch,
            CompareExchangeKey::new(db(), key),
            0,
            json!("holder"),
            index,
        );
        assert!(result.successful);
        batch.commit();
    }

    fn unsharded() -> (PartitionContext, PartitionStore) {
        let key = PartitionKey::new(db(), PartitionId::FIRST);
        (PartitionContext::new(key.clone(), 1), PartitionStore::new(key))
    }

    fn run(
        command: &mut ClusterTransactionMergedCommand,
        ctx: &PartitionContext,
        partition: &PartitionStore,
        store: &CompareExchangeStore,
    ) -> ClusterTransactionOutcome {
        let mut txn = StorageTransaction::begin(partition, store);
        let output = command.apply(ctx, &mut txn).unwrap();
        txn.commit().unwrap();
        match output {
            CommandOutput::Cluster(outcome) => outcome,
            other => panic!("unexpected output {:?}", other),
        }
    }

    #[test]
    fn test_shared_guard_advances_once() {
        let store = CompareExchangeStore::default();
        seed(&store, "lock/A", 5);
        let (ctx, partition) = unsharded();

        let mut command = ClusterTransactionMergedCommand::new(
            9,
            db(),
            vec![put("orders/1", Some(("lock/A", 5))), put("orders/2", Some(("lock/A", 5)))],
        );
        let outcome = run(&mut command, &ctx, &partition, &store);
        assert!(outcome.is_committed());
        assert!(partition.get(&id("orders/1")).is_some());
        assert!(partition.get(&id("orders/2")).is_some());

        let lock = store.get(&CompareExchangeKey::new(db(), "lock/A")).unwrap();
        assert_eq!(lock.index, 9);
        assert_eq!(lock.value, json!("holder"));
        assert_eq!(store.decision(9), Some(ClusterDecision::Committed));
    }

    #[test]
    fn test_mismatch_rejects_whole_transaction() {
        let store = CompareExchangeStore::default();
        seed(&store, "lock/A", 5);
        let (ctx, partition) = unsharded();

        let mut command = ClusterTransactionMergedCommand::new(
            9,
            db(),
            vec![put("orders/1", None), put("orders/2", Some(("lock/A", 4)))],
        );
        let outcome = run(&mut command, &ctx, &partition, &store);
        assert_eq!(
            outcome,
            ClusterTransactionOutcome::Rejected {
                conflicts: vec![CompareExchangeConflict {
                    key: "lock/a".into(),
                    expected: 4,
                    actual: 5
                }]
            }
        );
        assert!(partition.is_empty());
        assert_eq!(
            store.get(&CompareExchangeKey::new(db(), "lock/A")).unwrap().index,
            5
        );
        assert!(matches!(
            outcome.into_result(),
            Err(CorvidError::CompareExchangeMismatch {
                expected: 4,
                actual: 5,
                ..
            })
        ));
    }

    #[test]
    fn test_guard_creates_missing_key() {
        let store = CompareExchangeStore::default();
        let (ctx, partition) = unsharded();
        let mut command = ClusterTransactionMergedCommand::new(
            3,
            db(),
            vec![put("users/1", Some(("emails/ada@example.com", 0)))],
        );
        run(&mut command, &ctx, &partition, &store);
        let unique = store
            .get(&CompareExchangeKey::new(db(), "emails/ada@example.com"))
            .unwrap();
        assert_eq!(unique.index, 3);
        assert_eq!(unique.value, json!({"document": "users/1"}));
    }

    #[test]
    fn test_reapply_is_a_noop() {
        let store = CompareExchangeStore::default();
        let (ctx, partition) = unsharded();
        let commands = vec![put("orders/1", Some(("lock/A", 0)))];

        let mut first = ClusterTransactionMergedCommand::new(4, db(), commands.clone());
        let outcome = run(&mut first, &ctx, &partition, &store);
        let before = partition.snapshot();

        let mut again = ClusterTransactionMergedCommand::new(4, db(), commands);
        assert_eq!(run(&mut again, &ctx, &partition, &store), outcome);
        assert_eq!(partition.snapshot(), before);
        assert_eq!(partition.metadata(LAST_INDEX_KEY), Some(json!(4)));
    }

    #[test]
    fn test_pruned_decision_is_divergence() {
        let store = CompareExchangeStore::new(2);
        seed(&store, "a", 10);
        let (ctx, partition) = unsharded();
        let mut stale = ClusterTransactionMergedCommand::new(7, db(), vec![put("x", None)]);
        let mut txn = StorageTransaction::begin(&partition, &store);
        assert!(matches!(
            stale.apply(&ctx, &mut txn),
            Err(CorvidError::ReplayDiverged { position: 7, .. })
        ));
    }

    #[test]
    fn test_sharded_transaction_splits_documents() {
        let store = CompareExchangeStore::default();
        let shards: Vec<_> = (0..2)
            .map(|p| {
                let key = PartitionKey::new(db(), PartitionId(p));
                (PartitionContext::new(key.clone(), 2), PartitionStore::new(key))
            })
            .collect();
        let ids: Vec<String> = (0..8).map(|i| format!("orders/{}", i)).collect();
        let commands: Vec<_> = ids
            .iter()
            .map(|d| put(d, Some(("lock/batch", 0))))
            .collect();

        let mut outcomes = Vec::new();
        for (ctx, partition) in &shards {
            let mut command = ClusterTransactionMergedCommand::new(1, db(), commands.clone());
            outcomes.push(run(&mut command, ctx, partition, &store));
            assert_eq!(command.decision(), Some(&ClusterDecision::Committed));
        }
        let merged = ClusterTransactionOutcome::merge(1, outcomes);
        match merged {
            ClusterTransactionOutcome::Committed { documents, .. } => {
                let order: Vec<_> = documents.iter().map(|d| d.command_index).collect();
                assert_eq!(order, (0..8).collect::<Vec<_>>());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        let total: usize = shards.iter().map(|(_, p)| p.len()).sum();
        assert_eq!(total, 8);
        assert_eq!(
            store.get(&CompareExchangeKey::new(db(), "lock/batch")).unwrap().index,
            1
        );
    }

    #[test]
    fn test_delete_compare_exchange_requires_existing_key() {
        let store = CompareExchangeStore::default();
        let mut batch = store.batch(1);
        let decision = decide(
            &mut batch,
            &db(),
            &[SingleClusterDatabaseCommand::DeleteCompareExchange {
                key: "ghost".into(),
                expected_index: 0,
            }],
            1,
        )
        .unwrap();
        assert!(!decision.is_committed());
    }

    #[test]
    fn test_envelope_carries_decision() {
        let store = CompareExchangeStore::default();
        let (ctx, partition) = unsharded();
        let mut command =
            ClusterTransactionMergedCommand::new(2, db(), vec![put("orders/1", Some(("l", 0)))]);
        assert!(command.to_dto().is_err());
        run(&mut command, &ctx, &partition, &store);
        let dto = command.to_dto().unwrap();
        assert_eq!(dto.decision, ClusterDecision::Committed);

        let other = DatabaseName::new("blog").unwrap();
        assert!(dto.clone().to_command(&ctx, &other).is_err());
        let rebuilt = dto.to_command(&ctx, &db()).unwrap();
        assert!(matches!(
            rebuilt,
            Command::ClusterTransaction(ClusterTransactionMergedCommand {
                decision: Some(ClusterDecision::Committed),
                ..
            })
        ));
    }
}
