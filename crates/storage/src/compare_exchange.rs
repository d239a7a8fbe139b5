//! Compare-exchange store
//!
//! One store per node, shared by every database on it. Keys are scoped by
//! database. The store is the only linearizable structure in the system:
//! all mutations are applied by the cluster state machine in consensus
//! order, so the stored index of a key is the single arbiter of conflicts.
//!
//! # Write paths
//!
//! - Standalone entries (`TryCompareExchange` issued outside a cluster
//!   transaction) go through a [`CompareExchangeBatch`].
//! - Cluster transactions stage their changes in the shard's
//!   [`StorageTransaction`](crate::StorageTransaction); they become visible
//!   together with the documents when the shard commits.
//!
//! Both implement [`CompareExchangeView`], so the compare-and-swap logic in
//! [`try_compare_exchange`] is written once.
//!
//! # Lock order
//!
//! Compare-exchange store first, then partition. Reads that combine both
//! (document loads with includes) follow the same order.

use corvid_core::{
    ClusterDecision, CompareExchangeKey, CompareExchangeResult, CompareExchangeValue,
    DatabaseName,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

/// Default number of consensus indexes whose decisions are kept
pub const DEFAULT_DECISION_RETENTION: u64 = 10_000;

/// Committed state of the compare-exchange table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompareExchangeState {
    entries: BTreeMap<CompareExchangeKey, CompareExchangeValue>,
    decisions: BTreeMap<u64, ClusterDecision>,
    last_applied_index: u64,
}

impl CompareExchangeState {
    /// Current entry for a key
    pub fn get(&self, key: &CompareExchangeKey) -> Option<&CompareExchangeValue> {
        self.entries.get(key)
    }

    /// Recorded decision for a consensus index
    pub fn decision(&self, index: u64) -> Option<&ClusterDecision> {
        self.decisions.get(&index)
    }

    /// Highest consensus index applied to this table
    pub fn last_applied_index(&self) -> u64 {
        self.last_applied_index
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no key is stored
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Values of several keys of one database, keyed by lowercased key
    pub fn include_values<I, S>(
        &self,
        database: &DatabaseName,
        keys: I,
    ) -> BTreeMap<String, CompareExchangeValue>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        keys.into_iter()
            .filter_map(|k| {
                let key = CompareExchangeKey::new(database.clone(), k.as_ref());
                self.get(&key).map(|v| (key.key.clone(), v.clone()))
            })
            .collect()
    }

    pub(crate) fn apply(&mut self, write: CompareExchangeWrite) {
        match write {
            CompareExchangeWrite::Put(key, value) => {
                self.entries.insert(key, value);
            }
            CompareExchangeWrite::Delete(key) => {
                self.entries.remove(&key);
            }
            CompareExchangeWrite::Decision(index, decision) => {
                self.decisions.insert(index, decision);
            }
        }
    }

    pub(crate) fn advance(&mut self, index: u64, retention: u64) {
        self.last_applied_index = self.last_applied_index.max(index);
        let cutoff = self.last_applied_index.saturating_sub(retention);
        if cutoff > 0 {
            self.decisions = self.decisions.split_off(&cutoff);
        }
    }
}

/// One staged change to the table
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CompareExchangeWrite {
    Put(CompareExchangeKey, CompareExchangeValue),
    Delete(CompareExchangeKey),
    Decision(u64, ClusterDecision),
}

/// Node-wide compare-exchange table
#[derive(Debug)]
pub struct CompareExchangeStore {
    pub(crate) state: RwLock<CompareExchangeState>,
    decision_retention: u64,
}

impl Default for CompareExchangeStore {
    fn default() -> Self {
        Self::new(DEFAULT_DECISION_RETENTION)
    }
}

impl CompareExchangeStore {
    /// Create an empty store keeping `decision_retention` indexes of decisions
    pub fn new(decision_retention: u64) -> Self {
        Self {
            state: RwLock::new(CompareExchangeState::default()),
            decision_retention,
        }
    }

    /// Current value of a key
    pub fn get(&self, key: &CompareExchangeKey) -> Option<CompareExchangeValue> {
        self.state.read().get(key).cloned()
    }

    /// Values of several keys read at one point in time
    ///
    /// Missing keys are absent from the result.
    pub fn include_values<I, S>(
        &self,
        database: &DatabaseName,
        keys: I,
    ) -> BTreeMap<String, CompareExchangeValue>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.state.read().include_values(database, keys)
    }

    /// Run `f` against the committed state under the read lock
    pub fn with_read<R>(&self, f: impl FnOnce(&CompareExchangeState) -> R) -> R {
        f(&self.state.read())
    }

    /// Recorded decision for a consensus index
    pub fn decision(&self, index: u64) -> Option<ClusterDecision> {
        self.state.read().decision(index).cloned()
    }

    /// Highest consensus index applied
    pub fn last_applied_index(&self) -> u64 {
        self.state.read().last_applied_index
    }

    /// Decision retention window, in consensus indexes
    pub fn decision_retention(&self) -> u64 {
        self.decision_retention
    }

    /// Number of stored keys (all databases)
    pub fn len(&self) -> usize {
        self.state.read().len()
    }

    /// True if no key is stored
    pub fn is_empty(&self) -> bool {
        self.state.read().is_empty()
    }

    /// Copy of the committed state
    pub fn snapshot(&self) -> CompareExchangeState {
        self.state.read().clone()
    }

    /// Start a standalone batch applied at consensus `index`
    pub fn batch(&self, index: u64) -> CompareExchangeBatch<'_> {
        CompareExchangeBatch {
            store: self,
            index,
            writes: Vec::new(),
            overlay: HashMap::new(),
            decisions: HashMap::new(),
        }
    }

    /// Apply staged writes and advance the applied index
    pub(crate) fn apply_locked(
        &self,
        state: &mut CompareExchangeState,
        writes: Vec<CompareExchangeWrite>,
        index: u64,
    ) {
        for write in writes {
            state.apply(write);
        }
        state.advance(index, self.decision_retention);
    }
}

/// Read/stage access to the compare-exchange table inside one atomic unit
pub trait CompareExchangeView {
    /// Current value, staged changes included
    fn read_compare_exchange(&self, key: &CompareExchangeKey) -> Option<CompareExchangeValue>;

    /// Stage a put (`Some`) or delete (`None`)
    fn stage_compare_exchange(
        &mut self,
        key: CompareExchangeKey,
        value: Option<CompareExchangeValue>,
    );

    /// Decision recorded for a consensus index, staged ones included
    fn cluster_decision(&self, index: u64) -> Option<ClusterDecision>;

    /// Stage a decision for a consensus index
    fn record_cluster_decision(&mut self, index: u64, decision: ClusterDecision);

    /// Highest consensus index already applied to the committed table
    fn last_applied_index(&self) -> u64;
}

/// Compare-and-swap against a view
///
/// Succeeds iff `expected_index` equals the stored index (0 when the key is
/// absent). On success the key's index becomes `index`.
pub fn try_compare_exchange<V: CompareExchangeView + ?Sized>(
    view: &mut V,
    key: CompareExchangeKey,
    expected_index: u64,
    value: serde_json::Value,
    index: u64,
) -> CompareExchangeResult {
    let current = view.read_compare_exchange(&key);
    let current_index = current.as_ref().map_or(0, |c| c.index);

    if current_index != expected_index {
        trace!(target: "corvid::storage", key = %key, expected_index, current_index, "Compare-exchange mismatch");
        return CompareExchangeResult {
            successful: false,
            index: current_index,
            value: current.map(|c| c.value),
        };
    }

    let stored = CompareExchangeValue {
        key: key.key.clone(),
        index,
        value: value.clone(),
    };
    view.stage_compare_exchange(key, Some(stored));
    CompareExchangeResult {
        successful: true,
        index,
        value: Some(value),
    }
}

/// Conditional delete against a view
///
/// Deleting an absent key is never successful.
pub fn try_delete_compare_exchange<V: CompareExchangeView + ?Sized>(
    view: &mut V,
    key: CompareExchangeKey,
    expected_index: u64,
) -> CompareExchangeResult {
    match view.read_compare_exchange(&key) {
        Some(current) if current.index == expected_index => {
            view.stage_compare_exchange(key, None);
            CompareExchangeResult {
                successful: true,
                index: current.index,
                value: Some(current.value),
            }
        }
        Some(current) => CompareExchangeResult {
            successful: false,
            index: current.index,
            value: Some(current.value),
        },
        None => CompareExchangeResult {
            successful: false,
            index: 0,
            value: None,
        },
    }
}

/// Standalone batch of compare-exchange changes at one consensus index
pub struct CompareExchangeBatch<'a> {
    store: &'a CompareExchangeStore,
    index: u64,
    writes: Vec<CompareExchangeWrite>,
    overlay: HashMap<CompareExchangeKey, Option<CompareExchangeValue>>,
    decisions: HashMap<u64, ClusterDecision>,
}

impl CompareExchangeBatch<'_> {
    /// Consensus index this batch applies at
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Publish staged changes and advance the applied index
    pub fn commit(self) {
        let mut state = self.store.state.write();
        self.store.apply_locked(&mut state, self.writes, self.index);
    }
}

impl CompareExchangeView for CompareExchangeBatch<'_> {
    fn read_compare_exchange(&self, key: &CompareExchangeKey) -> Option<CompareExchangeValue> {
        match self.overlay.get(key) {
            Some(staged) => staged.clone(),
            None => self.store.get(key),
        }
    }

    fn stage_compare_exchange(
        &mut self,
        key: CompareExchangeKey,
        value: Option<CompareExchangeValue>,
    ) {
        self.overlay.insert(key.clone(), value.clone());
        self.writes.push(match value {
            Some(v) => CompareExchangeWrite::Put(key, v),
            None => CompareExchangeWrite::Delete(key),
        });
    }

    fn cluster_decision(&self, index: u64) -> Option<ClusterDecision> {
        self.decisions
            .get(&index)
            .cloned()
            .or_else(|| self.store.decision(index))
    }

    fn record_cluster_decision(&mut self, index: u64, decision: ClusterDecision) {
        self.decisions.insert(index, decision.clone());
        self.writes.push(CompareExchangeWrite::Decision(index, decision));
    }

    fn last_applied_index(&self) -> u64 {
        self.store.last_applied_index()
    }
}
