//! `PutIndex` command

use super::{Command, CommandOutput};
use crate::context::PartitionContext;
use crate::envelope::ReplayableEnvelope;
use crate::index::{validate_auto_index, IndexDefinition};
use corvid_core::{CorvidResult, DatabaseName};
use corvid_storage::StorageTransaction;
use serde::{Deserialize, Serialize};

/// Store an index definition on a partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutIndexCommand {
    definition: IndexDefinition,
}

impl PutIndexCommand {
    /// New index command
    pub fn new(definition: IndexDefinition) -> Self {
        Self { definition }
    }

    /// Definition to store
    pub fn definition(&self) -> &IndexDefinition {
        &self.definition
    }

    pub(crate) fn apply(
        &mut self,
        context: &PartitionContext,
        txn: &mut StorageTransaction<'_>,
    ) -> CorvidResult<CommandOutput> {
        validate_auto_index(&self.definition, context.is_sharded())?;
        txn.put_metadata(
            self.definition.metadata_key(),
            serde_json::to_value(&self.definition)?,
        );
        Ok(CommandOutput::IndexStored(self.definition.name.clone()))
    }
}

/// Envelope of [`PutIndexCommand`]
pub type PutIndexEnvelope = PutIndexCommand;

impl ReplayableEnvelope for PutIndexCommand {
    const KIND: &'static str = "PutIndex";

    fn to_command(self, _: &PartitionContext, _: &DatabaseName) -> CorvidResult<Command> {
        Ok(Command::PutIndex(self))
    }
}
