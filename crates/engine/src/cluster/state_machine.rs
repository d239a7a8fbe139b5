//! Cluster state machine
//!
//! Applies decided cluster log entries in index order. Standalone
//! compare-exchange entries go straight to the node's table. Cluster
//! transactions go to every affected shard of the hosted database; a node
//! that does not host the database still applies the compare-exchange
//! effects so every node's table stays identical.
//!
//! Applying is idempotent: entries the table already covers are skipped
//! and shards answer a re-delivered transaction from their result
//! metadata.

use super::command::{decide, validate_transaction, ClusterTransactionOutcome};
use super::log::{ClusterLog, ClusterLogEntry};
use crate::database::Database;
use corvid_core::{
    CompareExchangeKey, CompareExchangeResult, CorvidError, CorvidResult, DatabaseName, ErrorClass,
};
use corvid_storage::{try_compare_exchange, try_delete_compare_exchange, CompareExchangeStore};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of applying one cluster log entry on this node
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterApplyOutcome {
    /// Standalone compare-exchange put or delete
    CompareExchange(CompareExchangeResult),
    /// Cluster transaction, merged across shards
    Transaction(ClusterTransactionOutcome),
    /// The entry itself is invalid; refused identically on every node
    Failed(CorvidError),
    /// Already covered by the compare-exchange table
    Skipped,
}

/// What the state machine needs from the node it runs on
pub trait DatabaseHost {
    /// Open database `name`, if this node hosts it
    fn hosted_database(&self, name: &DatabaseName) -> Option<Arc<Database>>;

    /// Node-wide compare-exchange table
    fn compare_exchange(&self) -> &CompareExchangeStore;
}

#[derive(Debug, Default)]
struct MachineState {
    last_applied: u64,
    outcomes: BTreeMap<u64, ClusterApplyOutcome>,
}

/// Applies the cluster log on one node
#[derive(Debug)]
pub struct ClusterStateMachine {
    state: Mutex<MachineState>,
    retention: u64,
}

impl ClusterStateMachine {
    /// State machine keeping the outcomes of the last `retention` entries
    pub fn new(retention: u64) -> Self {
        Self {
            state: Mutex::new(MachineState::default()),
            retention: retention.max(1),
        }
    }

    /// Highest index applied by this state machine
    pub fn last_applied(&self) -> u64 {
        self.state.lock().last_applied
    }

    /// Apply every entry up to and including `through`
    ///
    /// Entries are applied one at a time under the state lock. Only a
    /// command-level error (the entry's own input is invalid) is recorded
    /// as `Failed`. Any other failure depends on this node, not on the
    /// entry: the loop stops without advancing and the entry is retried by
    /// the next call. Returns the new applied index.
    pub fn apply_through(
        &self,
        log: &ClusterLog,
        host: &dyn DatabaseHost,
        through: u64,
    ) -> CorvidResult<u64> {
        let mut state = self.state.lock();
        if state.last_applied >= through {
            return Ok(state.last_applied);
        }

        for entry in log.read_from(state.last_applied + 1)? {
            let (index, entry) = entry?;
            if index > through {
                break;
            }
            let outcome = match apply_entry(index, &entry, host) {
                Ok(outcome) => outcome,
                Err(e) if e.class() == ErrorClass::CommandLevel => {
                    debug!(target: "corvid::cluster", index, error = %e, "Cluster entry refused");
                    ClusterApplyOutcome::Failed(e)
                }
                Err(e) => {
                    warn!(target: "corvid::cluster", index, error = %e, "Cluster apply halted");
                    return Err(e);
                }
            };
            state.outcomes.insert(index, outcome);
            state.last_applied = index;
        }

        let cutoff = state.last_applied.saturating_sub(self.retention);
        if cutoff > 0 {
            state.outcomes = state.outcomes.split_off(&(cutoff + 1));
        }
        Ok(state.last_applied)
    }

    /// Remove and return the outcome recorded for `index`
    pub fn take_outcome(&self, index: u64) -> Option<ClusterApplyOutcome> {
        self.state.lock().outcomes.remove(&index)
    }

    /// Rebuild a compare-exchange table from the whole cluster log
    ///
    /// Runs before any database opens, so partition replay and re-delivery
    /// see the table (and the recorded decisions) as of the last decided
    /// entry. Returns the number of entries applied.
    pub fn rebuild_compare_exchange(
        log: &ClusterLog,
        store: &CompareExchangeStore,
    ) -> CorvidResult<u64> {
        let mut applied = 0;
        for entry in log.read_from(store.last_applied_index() + 1)? {
            let (index, entry) = entry?;
            match apply_to_table(index, &entry, store) {
                Ok(_) => {}
                Err(e) if e.class() == ErrorClass::CommandLevel => {
                    debug!(target: "corvid::cluster", index, error = %e, "Skipped refused entry");
                }
                Err(e) => return Err(e),
            }
            applied += 1;
        }
        info!(
            target: "corvid::cluster",
            entries = applied,
            keys = store.len(),
            last_index = store.last_applied_index(),
            "Rebuilt compare-exchange table"
        );
        Ok(applied)
    }
}

/// Apply one entry to the table only
fn apply_to_table(
    index: u64,
    entry: &ClusterLogEntry,
    store: &CompareExchangeStore,
) -> CorvidResult<ClusterApplyOutcome> {
    let mut batch = store.batch(index);
    let outcome = match entry {
        ClusterLogEntry::CompareExchange {
            database,
            key,
            expected_index,
            value,
        } => ClusterApplyOutcome::CompareExchange(try_compare_exchange(
            &mut batch,
            CompareExchangeKey::new(database.clone(), key),
            *expected_index,
            value.clone(),
            index,
        )),
        ClusterLogEntry::DeleteCompareExchange {
            database,
            key,
            expected_index,
        } => ClusterApplyOutcome::CompareExchange(try_delete_compare_exchange(
            &mut batch,
            CompareExchangeKey::new(database.clone(), key),
            *expected_index,
        )),
        ClusterLogEntry::ClusterTransaction { database, commands } => {
            validate_transaction(commands)?;
            let decision = decide(&mut batch, database, commands, index)?;
            ClusterApplyOutcome::Transaction(ClusterTransactionOutcome::from_decision(
                index, decision,
            ))
        }
    };
    batch.commit();
    Ok(outcome)
}

fn apply_entry(
    index: u64,
    entry: &ClusterLogEntry,
    host: &dyn DatabaseHost,
) -> CorvidResult<ClusterApplyOutcome> {
    let store = host.compare_exchange();
    match entry {
        ClusterLogEntry::ClusterTransaction { database, commands } => {
            validate_transaction(commands)?;
            if let Some(db) = host.hosted_database(database) {
                return Ok(ClusterApplyOutcome::Transaction(
                    db.apply_cluster_transaction(index, commands)?,
                ));
            }
            if let Some(decision) = store.decision(index) {
                return Ok(ClusterApplyOutcome::Transaction(
                    ClusterTransactionOutcome::from_decision(index, decision),
                ));
            }
            if index <= store.last_applied_index() {
                return Ok(ClusterApplyOutcome::Skipped);
            }
            debug!(target: "corvid::cluster", index, database = %database, "Database not hosted; applying compare-exchange effects only");
            apply_to_table(index, entry, store)
        }
        _ if index <= store.last_applied_index() => Ok(ClusterApplyOutcome::Skipped),
        _ => apply_to_table(index, entry, store),
    }
}
