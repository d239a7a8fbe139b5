//! Replayable command envelopes
//!
//! An envelope is the serializable reconstruction recipe of a command: a
//! stable kind tag plus a MessagePack payload holding every value the
//! command resolved while it ran (generated ids, guard decisions). It holds
//! no live handles, so it can be written to a replay log or shipped to a
//! replica and turned back into an executable command later.
//!
//! ## Registry
//!
//! [`EnvelopeRegistry`] maps kind tags to reconstruction functions. Replay
//! feeds every logged envelope through it; an unknown tag fails with
//! `UnknownCommandKind` and recovery stops there.
//!
//! ```ignore
//! let registry = EnvelopeRegistry::with_defaults();
//! let command = registry.to_command(envelope, &context, &database)?;
//! ```

use crate::cluster::ClusterTransactionEnvelope;
use crate::command::{
    Command, DeleteDocumentEnvelope, DocumentBatchEnvelope, PutDocumentEnvelope, PutIndexEnvelope,
};
use crate::context::PartitionContext;
use corvid_core::{CorvidError, CorvidResult, DatabaseName};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Kind tag + encoded payload, as written to the replay log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Stable kind tag
    pub kind: String,
    /// MessagePack-encoded envelope DTO
    pub payload: Vec<u8>,
}

impl CommandEnvelope {
    /// Encode a DTO under its kind tag
    pub fn wrap<E: ReplayableEnvelope>(dto: &E) -> CorvidResult<Self> {
        Ok(Self {
            kind: E::KIND.to_string(),
            payload: rmp_serde::to_vec_named(dto)?,
        })
    }

    /// Decode the payload as `E`
    pub fn unwrap<E: ReplayableEnvelope>(&self) -> CorvidResult<E> {
        if self.kind != E::KIND {
            return Err(CorvidError::malformed(
                self.kind.as_str(),
                format!("expected a {} envelope", E::KIND),
            ));
        }
        rmp_serde::from_slice(&self.payload)
            .map_err(|e| CorvidError::malformed(self.kind.as_str(), e.to_string()))
    }
}

/// A DTO that can rebuild its command
///
/// `to_command(context, database)` must return a command whose execution
/// against the state the original saw has the same observable effect.
pub trait ReplayableEnvelope: Serialize + DeserializeOwned {
    /// Kind tag this envelope is registered under
    const KIND: &'static str;

    /// Rebuild the command for the partition described by `context`
    fn to_command(self, context: &PartitionContext, database: &DatabaseName)
        -> CorvidResult<Command>;
}

/// Reconstruction function stored in the registry
pub type EnvelopeBuilder =
    fn(&CommandEnvelope, &PartitionContext, &DatabaseName) -> CorvidResult<Command>;

fn build<E: ReplayableEnvelope>(
    envelope: &CommandEnvelope,
    context: &PartitionContext,
    database: &DatabaseName,
) -> CorvidResult<Command> {
    envelope.unwrap::<E>()?.to_command(context, database)
}

/// Kind tag → reconstruction function
#[derive(Clone, Default)]
pub struct EnvelopeRegistry {
    builders: HashMap<&'static str, EnvelopeBuilder>,
}

impl EnvelopeRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in command kind
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.insert::<PutDocumentEnvelope>();
        registry.insert::<DeleteDocumentEnvelope>();
        registry.insert::<DocumentBatchEnvelope>();
        registry.insert::<PutIndexEnvelope>();
        registry.insert::<ClusterTransactionEnvelope>();
        registry
    }

    fn insert<E: ReplayableEnvelope>(&mut self) {
        self.builders.insert(E::KIND, build::<E>);
    }

    /// Register an envelope kind
    ///
    /// Fails if the tag is already taken.
    pub fn register<E: ReplayableEnvelope>(&mut self) -> CorvidResult<()> {
        if self.builders.contains_key(E::KIND) {
            return Err(CorvidError::invalid_input(format!(
                "envelope kind '{}' is already registered",
                E::KIND
            )));
        }
        self.insert::<E>();
        Ok(())
    }

    /// True if `kind` has a reconstruction function
    pub fn is_registered(&self, kind: &str) -> bool {
        self.builders.contains_key(kind)
    }

    /// Registered kind tags, sorted
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.builders.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    /// Rebuild the command an envelope describes
    ///
    /// `database` is the database the envelope is replayed into; it must be
    /// the one the partition belongs to.
    pub fn to_command(
        &self,
        envelope: &CommandEnvelope,
        context: &PartitionContext,
        database: &DatabaseName,
    ) -> CorvidResult<Command> {
        let builder = self
            .builders
            .get(envelope.kind.as_str())
            .ok_or_else(|| CorvidError::UnknownCommandKind {
                tag: envelope.kind.clone(),
            })?;
        if database != context.database() {
            return Err(CorvidError::malformed(
                envelope.kind.as_str(),
                format!(
                    "replay target {} does not own partition {}",
                    database,
                    context.key()
                ),
            ));
        }
        builder(envelope, context, database)
    }
}

impl std::fmt::Debug for EnvelopeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
