//! Document commands
//!
//! `PutDocument`, `DeleteDocument` and `DocumentBatch`. Ids ending in `|`
//! are completed from a per-prefix identity counter kept in partition
//! metadata (`orders|` becomes `orders/1`, `orders/2`, ...). The envelope
//! records the resolved id and counter value so replay never allocates.

use super::{Command, CommandOutput};
use crate::context::PartitionContext;
use crate::envelope::ReplayableEnvelope;
use corvid_core::{ConcurrencyCheck, CorvidError, CorvidResult, DatabaseName, DocumentId};
use corvid_storage::StorageTransaction;
use serde::{Deserialize, Serialize};

/// An identity counter value consumed by a put
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityAllocation {
    /// Collection prefix (lowercased)
    pub prefix: String,
    /// Counter value used for the id
    pub value: u64,
}

impl IdentityAllocation {
    fn metadata_key(prefix: &str) -> String {
        format!("identity/{}", prefix.to_lowercase())
    }
}

fn check_owner(context: &PartitionContext, id: &DocumentId) -> CorvidResult<()> {
    if context.owns(id) {
        Ok(())
    } else {
        Err(CorvidError::invalid_input(format!(
            "document '{}' does not belong to partition {}",
            id,
            context.key()
        )))
    }
}

/// Put a document, optionally guarded by a concurrency check
#[derive(Debug, Clone, PartialEq)]
pub struct PutDocumentCommand {
    id: DocumentId,
    body: serde_json::Value,
    concurrency: ConcurrencyCheck,
    identity: Option<IdentityAllocation>,
}

impl PutDocumentCommand {
    /// New put; `id` may be an identity request (`orders|`)
    pub fn new(id: DocumentId, body: serde_json::Value, concurrency: ConcurrencyCheck) -> Self {
        Self {
            id,
            body,
            concurrency,
            identity: None,
        }
    }

    /// Id as requested, or as resolved once the command ran
    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub(crate) fn apply(
        &mut self,
        context: &PartitionContext,
        txn: &mut StorageTransaction<'_>,
    ) -> CorvidResult<CommandOutput> {
        if let Some(prefix) = self.id.identity_prefix() {
            if context.is_sharded() {
                return Err(CorvidError::not_supported(format!(
                    "identity id '{}' on sharded database {}",
                    self.id,
                    context.database()
                )));
            }
            let key = IdentityAllocation::metadata_key(prefix);
            let value = txn.get_metadata(&key).and_then(|v| v.as_u64()).unwrap_or(0) + 1;
            let resolved = DocumentId::new(format!("{}/{}", prefix, value))?;
            txn.put_metadata(key, serde_json::Value::from(value));
            self.identity = Some(IdentityAllocation {
                prefix: prefix.to_lowercase(),
                value,
            });
            self.id = resolved;
        } else if let Some(identity) = &self.identity {
            // Replayed identity put: restore the counter, never allocate.
            let key = IdentityAllocation::metadata_key(&identity.prefix);
            let current = txn.get_metadata(&key).and_then(|v| v.as_u64()).unwrap_or(0);
            txn.put_metadata(key, serde_json::Value::from(current.max(identity.value)));
        }

        check_owner(context, &self.id)?;
        self.concurrency
            .verify(&self.id, txn.document_etag(&self.id))?;
        let document = txn.put_document(self.id.clone(), self.body.clone());
        Ok(CommandOutput::Put(document))
    }

    pub(crate) fn to_dto(&self) -> CorvidResult<PutDocumentEnvelope> {
        if self.id.is_identity_request() {
            return Err(CorvidError::internal(format!(
                "identity id '{}' was never resolved",
                self.id
            )));
        }
        Ok(PutDocumentEnvelope {
            id: self.id.clone(),
            body: self.body.clone(),
            concurrency: self.concurrency,
            identity: self.identity.clone(),
        })
    }
}

/// Envelope of [`PutDocumentCommand`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutDocumentEnvelope {
    /// Resolved id
    pub id: DocumentId,
    /// Body
    pub body: serde_json::Value,
    /// Concurrency check
    pub concurrency: ConcurrencyCheck,
    /// Identity value consumed, for identity puts
    pub identity: Option<IdentityAllocation>,
}

impl PutDocumentEnvelope {
    fn into_command(self) -> PutDocumentCommand {
        PutDocumentCommand {
            id: self.id,
            body: self.body,
            concurrency: self.concurrency,
            identity: self.identity,
        }
    }
}

impl ReplayableEnvelope for PutDocumentEnvelope {
    const KIND: &'static str = "PutDocument";

    fn to_command(self, _: &PartitionContext, _: &DatabaseName) -> CorvidResult<Command> {
        Ok(Command::PutDocument(self.into_command()))
    }
}

/// Delete a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteDocumentCommand {
    id: DocumentId,
    concurrency: ConcurrencyCheck,
}

impl DeleteDocumentCommand {
    /// New delete
    ///
    /// Deleting an absent document succeeds unless the check requires an etag.
    pub fn new(id: DocumentId, concurrency: ConcurrencyCheck) -> Self {
        Self { id, concurrency }
    }

    /// Target id
    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub(crate) fn apply(
        &mut self,
        context: &PartitionContext,
        txn: &mut StorageTransaction<'_>,
    ) -> CorvidResult<CommandOutput> {
        check_owner(context, &self.id)?;
        self.concurrency
            .verify(&self.id, txn.document_etag(&self.id))?;
        Ok(CommandOutput::Deleted(txn.delete_document(&self.id)))
    }
}

/// Envelope of [`DeleteDocumentCommand`]
pub type DeleteDocumentEnvelope = DeleteDocumentCommand;

impl ReplayableEnvelope for DeleteDocumentCommand {
    const KIND: &'static str = "DeleteDocument";

    fn to_command(self, _: &PartitionContext, _: &DatabaseName) -> CorvidResult<Command> {
        Ok(Command::DeleteDocument(self))
    }
}

/// One operation of a client batch
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOperation {
    /// Put
    Put(PutDocumentCommand),
    /// Delete
    Delete(DeleteDocumentCommand),
}

impl BatchOperation {
    /// Put operation
    pub fn put(id: DocumentId, body: serde_json::Value, concurrency: ConcurrencyCheck) -> Self {
        BatchOperation::Put(PutDocumentCommand::new(id, body, concurrency))
    }

    /// Delete operation
    pub fn delete(id: DocumentId, concurrency: ConcurrencyCheck) -> Self {
        BatchOperation::Delete(DeleteDocumentCommand::new(id, concurrency))
    }

    /// Target id (as requested)
    pub fn id(&self) -> &DocumentId {
        match self {
            BatchOperation::Put(put) => put.id(),
            BatchOperation::Delete(delete) => delete.id(),
        }
    }
}

/// A client batch applied all-or-nothing as one command
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentBatchCommand {
    operations: Vec<BatchOperation>,
}

impl DocumentBatchCommand {
    /// New batch
    pub fn new(operations: Vec<BatchOperation>) -> Self {
        Self { operations }
    }

    /// Operations in execution order
    pub fn operations(&self) -> &[BatchOperation] {
        &self.operations
    }

    pub(crate) fn apply(
        &mut self,
        context: &PartitionContext,
        txn: &mut StorageTransaction<'_>,
    ) -> CorvidResult<CommandOutput> {
        let savepoint = txn.savepoint();
        let mut results = Vec::with_capacity(self.operations.len());
        for operation in &mut self.operations {
            let result = match operation {
                BatchOperation::Put(put) => put.apply(context, txn),
                BatchOperation::Delete(delete) => delete.apply(context, txn),
            };
            match result {
                Ok(output) => results.push(output),
                Err(e) => {
                    txn.rollback_to(savepoint);
                    return Err(e);
                }
            }
        }
        Ok(CommandOutput::Batch(results))
    }

    pub(crate) fn to_dto(&self) -> CorvidResult<DocumentBatchEnvelope> {
        let operations = self
            .operations
            .iter()
            .map(|operation| {
                Ok(match operation {
                    BatchOperation::Put(put) => BatchOperationEnvelope::Put(put.to_dto()?),
                    BatchOperation::Delete(delete) => BatchOperationEnvelope::Delete(delete.clone()),
                })
            })
            .collect::<CorvidResult<Vec<_>>>()?;
        Ok(DocumentBatchEnvelope { operations })
    }
}

/// Envelope of one [`BatchOperation`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BatchOperationEnvelope {
    /// Put
    Put(PutDocumentEnvelope),
    /// Delete
    Delete(DeleteDocumentEnvelope),
}

/// Envelope of [`DocumentBatchCommand`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentBatchEnvelope {
    /// Operations with resolved ids
    pub operations: Vec<BatchOperationEnvelope>,
}

impl ReplayableEnvelope for DocumentBatchEnvelope {
    const KIND: &'static str = "DocumentBatch";

    fn to_command(self, _: &PartitionContext, _: &DatabaseName) -> CorvidResult<Command> {
        let operations = self
            .operations
            .into_iter()
            .map(|operation| match operation {
                BatchOperationEnvelope::Put(put) => BatchOperation::Put(put.into_command()),
                BatchOperationEnvelope::Delete(delete) => BatchOperation::Delete(delete),
            })
            .collect();
        Ok(Command::DocumentBatch(DocumentBatchCommand::new(operations)))
    }
}
