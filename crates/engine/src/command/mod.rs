//! Commands executed by partition mergers
//!
//! The command set is closed: [`Command`] is a tagged union dispatching to
//! one struct per kind. Each kind has a stable tag and an envelope
//! registered under that tag in
//! [`EnvelopeRegistry::with_defaults`](crate::envelope::EnvelopeRegistry::with_defaults).
//!
//! | Tag | Command |
//! |-----|---------|
//! | `PutDocument` | [`PutDocumentCommand`] |
//! | `DeleteDocument` | [`DeleteDocumentCommand`] |
//! | `DocumentBatch` | [`DocumentBatchCommand`] |
//! | `PutIndex` | [`PutIndexCommand`] |
//! | `ClusterTransaction` | [`ClusterTransactionMergedCommand`] |

mod document;
mod index;

pub use document::{
    BatchOperation, BatchOperationEnvelope, DeleteDocumentCommand, DeleteDocumentEnvelope,
    DocumentBatchCommand, DocumentBatchEnvelope, IdentityAllocation, PutDocumentCommand,
    PutDocumentEnvelope,
};
pub use index::{PutIndexCommand, PutIndexEnvelope};

use crate::cluster::{ClusterTransactionMergedCommand, ClusterTransactionOutcome};
use crate::context::PartitionContext;
use crate::envelope::{CommandEnvelope, ReplayableEnvelope};
use corvid_concurrency::MergedCommand;
use corvid_core::{CorvidResult, Document};
use corvid_storage::StorageTransaction;

/// Any command a partition merger can run
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Put one document
    PutDocument(PutDocumentCommand),
    /// Delete one document
    DeleteDocument(DeleteDocumentCommand),
    /// All-or-nothing client batch
    DocumentBatch(DocumentBatchCommand),
    /// Store an index definition
    PutIndex(PutIndexCommand),
    /// This shard's part of a consensus-decided cluster transaction
    ClusterTransaction(ClusterTransactionMergedCommand),
}

/// Result delivered to the submitter
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutput {
    /// Stored document (etag assigned)
    Put(Document),
    /// Deleted document, `None` if it did not exist
    Deleted(Option<Document>),
    /// Per-operation results of a batch
    Batch(Vec<CommandOutput>),
    /// Name of the stored index
    IndexStored(String),
    /// This shard's outcome of a cluster transaction
    Cluster(ClusterTransactionOutcome),
}

impl MergedCommand for Command {
    type Context = PartitionContext;
    type Output = CommandOutput;
    type Envelope = CommandEnvelope;

    fn kind(&self) -> &'static str {
        match self {
            Command::PutDocument(_) => PutDocumentEnvelope::KIND,
            Command::DeleteDocument(_) => DeleteDocumentEnvelope::KIND,
            Command::DocumentBatch(_) => DocumentBatchEnvelope::KIND,
            Command::PutIndex(_) => PutIndexEnvelope::KIND,
            Command::ClusterTransaction(_) => crate::cluster::ClusterTransactionEnvelope::KIND,
        }
    }

    fn execute(
        &mut self,
        context: &PartitionContext,
        txn: &mut StorageTransaction<'_>,
    ) -> CorvidResult<CommandOutput> {
        match self {
            Command::PutDocument(put) => put.apply(context, txn),
            Command::DeleteDocument(delete) => delete.apply(context, txn),
            Command::DocumentBatch(batch) => batch.apply(context, txn),
            Command::PutIndex(index) => index.apply(context, txn),
            Command::ClusterTransaction(cluster) => cluster.apply(context, txn),
        }
    }

    fn to_envelope(&self) -> CorvidResult<CommandEnvelope> {
        match self {
            Command::PutDocument(put) => CommandEnvelope::wrap(&put.to_dto()?),
            Command::DeleteDocument(delete) => CommandEnvelope::wrap(delete),
            Command::DocumentBatch(batch) => CommandEnvelope::wrap(&batch.to_dto()?),
            Command::PutIndex(index) => CommandEnvelope::wrap(index),
            Command::ClusterTransaction(cluster) => CommandEnvelope::wrap(&cluster.to_dto()?),
        }
    }
}
