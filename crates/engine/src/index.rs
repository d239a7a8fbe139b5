//! Index definitions and deployment validation
//!
//! Only the definition and its validation live here; index execution is
//! handled elsewhere. Definitions are stored in partition metadata under
//! `index/{name}` by the `PutIndex` command.

use corvid_core::{CorvidError, CorvidResult};
use serde::{Deserialize, Serialize};

/// How a new or changed index is deployed across the database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IndexDeploymentMode {
    /// Build on every node at once
    #[default]
    Immediate,
    /// Build node by node following a single progress counter
    Rolling,
}

/// A secondary index definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    /// Unique index name
    pub name: String,
    /// Indexed document fields
    pub fields: Vec<String>,
    /// Deployment mode
    #[serde(default)]
    pub deployment: IndexDeploymentMode,
}

impl IndexDefinition {
    /// Definition with the default deployment mode
    pub fn new(name: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            name: name.into(),
            fields,
            deployment: IndexDeploymentMode::default(),
        }
    }

    /// Set the deployment mode
    pub fn with_deployment(mut self, deployment: IndexDeploymentMode) -> Self {
        self.deployment = deployment;
        self
    }

    /// Metadata key the definition is stored under
    pub fn metadata_key(&self) -> String {
        format!("index/{}", self.name.to_lowercase())
    }
}

/// Validate an index definition for a database
///
/// Rolling deployment follows one linear progress counter, which
/// independently-progressing shards cannot provide; it is rejected for
/// sharded databases.
pub fn validate_auto_index(definition: &IndexDefinition, sharded: bool) -> CorvidResult<()> {
    if definition.name.trim().is_empty() {
        return Err(CorvidError::invalid_input("index name cannot be empty"));
    }
    if definition.fields.is_empty() {
        return Err(CorvidError::invalid_input(format!(
            "index '{}' has no fields",
            definition.name
        )));
    }
    if sharded && definition.deployment == IndexDeploymentMode::Rolling {
        return Err(CorvidError::not_supported(format!(
            "index '{}': rolling deployment is not supported on sharded databases",
            definition.name
        )));
    }
    Ok(())
}
