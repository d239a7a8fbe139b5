//! The merger's view of a command
//!
//! The merger never looks inside a command. It needs three things: run it
//! against the open storage transaction, tell whether a failure is local
//! or fatal (via [`CorvidError::class`]), and turn the executed command
//! into a self-contained envelope for the replay log.
//!
//! [`CorvidError::class`]: corvid_core::CorvidError::class

use corvid_core::{CorvidError, CorvidResult, PartitionKey};
use corvid_storage::StorageTransaction;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Current [`LoggedBatch`] format version
pub const LOGGED_BATCH_VERSION: u32 = 1;

/// A command the merger can batch
pub trait MergedCommand: Send + 'static {
    /// Partition-owned execution context injected into every `execute`
    type Context: Send + Sync + 'static;

    /// Value delivered to the submitter on success
    type Output: Send + 'static;

    /// Serializable reconstruction recipe written to the replay log
    type Envelope: Serialize + DeserializeOwned + Send;

    /// Stable kind tag, used in logs and errors
    fn kind(&self) -> &'static str;

    /// Apply the command inside the open transaction
    ///
    /// The merger wraps each call in a savepoint: on a command-level error
    /// the command's writes are rolled back and its siblings keep going.
    /// The command must not commit or discard the transaction itself.
    fn execute(
        &mut self,
        context: &Self::Context,
        txn: &mut StorageTransaction<'_>,
    ) -> CorvidResult<Self::Output>;

    /// Envelope of the command as executed
    ///
    /// Called only after a successful `execute`, so values resolved during
    /// execution (generated ids, guard decisions) are captured.
    fn to_envelope(&self) -> CorvidResult<Self::Envelope>;
}

/// One committed batch as written to a partition's replay log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedBatch<E> {
    /// Format version
    pub version: u32,
    /// Partition the batch was committed on
    pub partition: PartitionKey,
    /// Envelopes of the successful commands, in execution order
    pub commands: Vec<E>,
}

impl<E> LoggedBatch<E> {
    /// Wrap envelopes for `partition`
    pub fn new(partition: PartitionKey, commands: Vec<E>) -> Self {
        Self {
            version: LOGGED_BATCH_VERSION,
            partition,
            commands,
        }
    }
}

impl<E: Serialize> LoggedBatch<E> {
    /// Encode as MessagePack with named fields
    pub fn to_bytes(&self) -> CorvidResult<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }
}

impl<E: DeserializeOwned> LoggedBatch<E> {
    /// Decode from MessagePack
    pub fn from_bytes(bytes: &[u8]) -> CorvidResult<Self> {
        let batch: Self = rmp_serde::from_slice(bytes)
            .map_err(|e| CorvidError::malformed("LoggedBatch", e.to_string()))?;
        if batch.version != LOGGED_BATCH_VERSION {
            return Err(CorvidError::malformed(
                "LoggedBatch",
                format!("unsupported batch version {}", batch.version),
            ));
        }
        Ok(batch)
    }
}
