//! Nodes
//!
//! A node hosts databases, owns the node-wide compare-exchange table and
//! applies the cluster log through its state machine. Opening a node
//! restores state in three steps:
//!
//! 1. rebuild the compare-exchange table from the cluster log
//! 2. open every database; each partition replays its own log
//! 3. re-deliver the cluster log to the hosted databases
//!
//! Step 3 is idempotent: shards answer already-applied transactions from
//! their result metadata, so only entries whose application was cut short
//! by a crash change anything.

use crate::cluster::{
    validate_transaction, ClusterApplyOutcome, ClusterLog, ClusterLogEntry, ClusterStateMachine,
    ClusterTransactionOutcome, DatabaseHost, SingleClusterDatabaseCommand,
};
use crate::config::{CorvidConfig, CONFIG_FILE_NAME};
use crate::database::{Database, DatabaseRecord, StorageLayout, DATABASE_RECORD_FILE};
use crate::envelope::EnvelopeRegistry;
use corvid_core::{
    CompareExchangeKey, CompareExchangeResult, CompareExchangeValue, CorvidError, CorvidResult,
    DatabaseName,
};
use corvid_durability::DurabilityMode;
use corvid_storage::CompareExchangeStore;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Directory holding one sub-directory per database
const DATABASES_DIR: &str = "databases";

/// Directory of the node's own cluster log
const CLUSTER_LOG_DIR: &str = "cluster";

/// A node hosting databases
pub struct Node {
    data_dir: Option<PathBuf>,
    config: CorvidConfig,
    durability: DurabilityMode,
    databases: DashMap<DatabaseName, Arc<Database>>,
    compare_exchange: Arc<CompareExchangeStore>,
    cluster_log: Arc<ClusterLog>,
    state_machine: ClusterStateMachine,
    registry: EnvelopeRegistry,
}

impl Node {
    /// Open a node in `data_dir`, writing a default `corvid.toml` on first open
    ///
    /// The node keeps its own cluster log under `data_dir/cluster`.
    pub fn open<P: AsRef<Path>>(data_dir: P) -> CorvidResult<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;
        let config_path = data_dir.join(CONFIG_FILE_NAME);
        CorvidConfig::write_default_if_missing(&config_path)?;
        let config = CorvidConfig::from_file(&config_path)?;
        Self::open_with_config(data_dir, config)
    }

    /// Open a node with an explicit configuration
    ///
    /// The configuration is written to `corvid.toml` so later opens pick
    /// it up.
    pub fn open_with_config<P: AsRef<Path>>(data_dir: P, config: CorvidConfig) -> CorvidResult<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;
        let durability = config.durability_mode()?;
        let cluster_log = Arc::new(ClusterLog::open(&data_dir.join(CLUSTER_LOG_DIR), durability)?);
        Self::with_cluster_log(data_dir, config, cluster_log)
    }

    /// Open a node in `data_dir` that applies a shared cluster log
    pub fn with_cluster_log<P: AsRef<Path>>(
        data_dir: P,
        config: CorvidConfig,
        cluster_log: Arc<ClusterLog>,
    ) -> CorvidResult<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;
        config.validate()?;
        config.write_to_file(&data_dir.join(CONFIG_FILE_NAME))?;
        Self::start(Some(data_dir.to_path_buf()), config, cluster_log)
    }

    /// Node without files: every partition log lives in memory
    pub fn ephemeral(cluster_log: Arc<ClusterLog>) -> CorvidResult<Self> {
        Self::start(None, CorvidConfig::cache(), cluster_log)
    }

    fn start(
        data_dir: Option<PathBuf>,
        config: CorvidConfig,
        cluster_log: Arc<ClusterLog>,
    ) -> CorvidResult<Self> {
        config.validate()?;
        let durability = config.durability_mode()?;

        let compare_exchange = Arc::new(CompareExchangeStore::new(config.cluster.decision_retention));
        ClusterStateMachine::rebuild_compare_exchange(&cluster_log, &compare_exchange)?;

        let node = Self {
            data_dir,
            durability,
            databases: DashMap::new(),
            compare_exchange,
            state_machine: ClusterStateMachine::new(config.cluster.decision_retention),
            cluster_log,
            registry: EnvelopeRegistry::with_defaults(),
            config,
        };

        for record in node.database_records()? {
            let name = record.validate()?;
            let database = node.open_database(name.clone(), record.shard_count)?;
            node.databases.insert(name, Arc::new(database));
        }

        let applied = node.catch_up()?;
        info!(
            target: "corvid::cluster",
            databases = node.databases.len(),
            compare_exchange_keys = node.compare_exchange.len(),
            last_applied = applied,
            "Node opened"
        );
        Ok(node)
    }

    fn database_records(&self) -> CorvidResult<Vec<DatabaseRecord>> {
        let Some(dir) = self.data_dir.as_ref().map(|d| d.join(DATABASES_DIR)) else {
            return Ok(Vec::new());
        };
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path().join(DATABASE_RECORD_FILE);
            if path.is_file() {
                records.push(DatabaseRecord::from_file(&path)?);
            } else {
                warn!(target: "corvid::storage", path = %path.display(), "Skipping directory without a database record");
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    fn open_database(&self, name: DatabaseName, shard_count: u32) -> CorvidResult<Database> {
        let dir = self
            .data_dir
            .as_ref()
            .map(|d| d.join(DATABASES_DIR).join(name.as_str()));
        let layout = StorageLayout {
            dir: dir.as_deref(),
            durability: self.durability,
            log_config: self.config.log_config()?,
            merger_config: self.config.merger_config()?,
        };
        Database::open(
            name,
            shard_count,
            &layout,
            Arc::clone(&self.compare_exchange),
            &self.registry,
        )
    }

    /// Effective configuration
    pub fn config(&self) -> &CorvidConfig {
        &self.config
    }

    /// Node-wide compare-exchange table
    pub fn compare_exchange_store(&self) -> &Arc<CompareExchangeStore> {
        &self.compare_exchange
    }

    /// Cluster log this node applies
    pub fn cluster_log(&self) -> &Arc<ClusterLog> {
        &self.cluster_log
    }

    /// Highest cluster log index applied on this node
    pub fn last_applied(&self) -> u64 {
        self.state_machine.last_applied()
    }

    /// Create a database with `shard_count` shards
    pub fn create_database(&self, name: &str, shard_count: u32) -> CorvidResult<Arc<Database>> {
        let name = DatabaseName::new(name)?;
        let record = DatabaseRecord {
            name: name.as_str().to_string(),
            shard_count,
        };
        record.validate()?;

        match self.databases.entry(name.clone()) {
            Entry::Occupied(_) => Err(CorvidError::constraint(format!(
                "database '{}' already exists",
                name
            ))),
            Entry::Vacant(slot) => {
                if let Some(dir) = &self.data_dir {
                    let db_dir = dir.join(DATABASES_DIR).join(name.as_str());
                    std::fs::create_dir_all(&db_dir)?;
                    record.write_to_file(&db_dir.join(DATABASE_RECORD_FILE))?;
                }
                let database = Arc::new(self.open_database(name, shard_count)?);
                slot.insert(Arc::clone(&database));
                Ok(database)
            }
        }
    }

    /// Open database `name`
    pub fn database(&self, name: &str) -> CorvidResult<Arc<Database>> {
        let name = DatabaseName::new(name)?;
        self.hosted_database(&name)
            .ok_or_else(|| CorvidError::DatabaseNotFound {
                name: name.to_string(),
            })
    }

    /// Names of hosted databases, sorted
    pub fn database_names(&self) -> Vec<DatabaseName> {
        let mut names: Vec<DatabaseName> = self.databases.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Committed compare-exchange value
    pub fn get_compare_exchange(
        &self,
        database: &str,
        key: &str,
    ) -> CorvidResult<Option<CompareExchangeValue>> {
        let database = DatabaseName::new(database)?;
        Ok(self.compare_exchange.get(&CompareExchangeKey::new(database, key)))
    }

    /// Compare-and-swap through the cluster log
    ///
    /// `expected_index` 0 means the key must not exist. A lost race is a
    /// successful call returning `successful: false` and the winner.
    pub fn put_compare_exchange(
        &self,
        database: &str,
        key: &str,
        expected_index: u64,
        value: serde_json::Value,
    ) -> CorvidResult<CompareExchangeResult> {
        let entry = ClusterLogEntry::CompareExchange {
            database: DatabaseName::new(database)?,
            key: validate_key(key)?,
            expected_index,
            value,
        };
        match self.propose_and_apply(&entry)? {
            ClusterApplyOutcome::CompareExchange(result) => Ok(result),
            other => Err(unexpected(&other)),
        }
    }

    /// Conditional delete through the cluster log
    pub fn delete_compare_exchange(
        &self,
        database: &str,
        key: &str,
        expected_index: u64,
    ) -> CorvidResult<CompareExchangeResult> {
        let entry = ClusterLogEntry::DeleteCompareExchange {
            database: DatabaseName::new(database)?,
            key: validate_key(key)?,
            expected_index,
        };
        match self.propose_and_apply(&entry)? {
            ClusterApplyOutcome::CompareExchange(result) => Ok(result),
            other => Err(unexpected(&other)),
        }
    }

    /// Run a cluster transaction against a hosted database
    ///
    /// Returns the committed outcome, or `CompareExchangeMismatch` naming
    /// the first failed expectation.
    pub fn execute_cluster_transaction(
        &self,
        database: &str,
        commands: Vec<SingleClusterDatabaseCommand>,
    ) -> CorvidResult<ClusterTransactionOutcome> {
        let database = self.database(database)?;
        validate_transaction(&commands)?;

        let entry = ClusterLogEntry::ClusterTransaction {
            database: database.name().clone(),
            commands,
        };
        match self.propose_and_apply(&entry)? {
            ClusterApplyOutcome::Transaction(outcome) => outcome.into_result(),
            other => Err(unexpected(&other)),
        }
    }

    /// Apply every cluster log entry appended so far
    pub fn catch_up(&self) -> CorvidResult<u64> {
        self.state_machine
            .apply_through(&self.cluster_log, self, self.cluster_log.last_index())
    }

    fn propose_and_apply(&self, entry: &ClusterLogEntry) -> CorvidResult<ClusterApplyOutcome> {
        let index = self.cluster_log.propose(entry)?;
        self.state_machine.apply_through(&self.cluster_log, self, index)?;
        match self.state_machine.take_outcome(index) {
            Some(ClusterApplyOutcome::Failed(e)) => Err(e),
            Some(outcome) => Ok(outcome),
            None => Err(CorvidError::internal(format!(
                "outcome of cluster log index {} is no longer retained",
                index
            ))),
        }
    }

    /// Close every database and flush the cluster log
    pub fn close(&self) -> CorvidResult<()> {
        for entry in self.databases.iter() {
            entry.value().close();
        }
        self.cluster_log.flush()?;
        info!(target: "corvid::cluster", last_applied = self.last_applied(), "Node closed");
        Ok(())
    }
}

impl DatabaseHost for Node {
    fn hosted_database(&self, name: &DatabaseName) -> Option<Arc<Database>> {
        self.databases.get(name).map(|db| Arc::clone(db.value()))
    }

    fn compare_exchange(&self) -> &CompareExchangeStore {
        &self.compare_exchange
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("data_dir", &self.data_dir)
            .field("databases", &self.database_names())
            .field("last_applied", &self.last_applied())
            .finish()
    }
}

fn validate_key(key: &str) -> CorvidResult<String> {
    if key.trim().is_empty() {
        return Err(CorvidError::invalid_input("compare-exchange key must not be empty"));
    }
    Ok(key.to_string())
}

fn unexpected(outcome: &ClusterApplyOutcome) -> CorvidError {
    CorvidError::internal(format!("unexpected cluster apply outcome {:?}", outcome))
}
