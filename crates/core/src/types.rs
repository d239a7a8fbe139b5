//! Core identifier types for Corvid
//!
//! This module defines the foundational identifiers:
//! - DatabaseName: Tenant database name (validated, case-insensitive)
//! - PartitionId: Shard number inside a database
//! - PartitionKey: Database + partition, the unit that owns a merger
//! - DocumentId: Document identifier with a case-insensitive storage key

use crate::error::{CorvidError, CorvidResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of a database name
pub const MAX_DATABASE_NAME_LENGTH: usize = 128;

/// Maximum length of a document id
pub const MAX_DOCUMENT_ID_LENGTH: usize = 512;

/// Name of a tenant database
///
/// Database names are compared case-insensitively; the stored form is
/// lowercased. Allowed characters: ASCII alphanumerics, `-`, `_`, `.`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatabaseName(String);

impl DatabaseName {
    /// Validate and create a database name
    pub fn new(name: impl AsRef<str>) -> CorvidResult<Self> {
        let name = name.as_ref();
        if name.is_empty() {
            return Err(CorvidError::invalid_input("database name cannot be empty"));
        }
        if name.len() > MAX_DATABASE_NAME_LENGTH {
            return Err(CorvidError::invalid_input(format!(
                "database name exceeds {} characters",
                MAX_DATABASE_NAME_LENGTH
            )));
        }
        if let Some(c) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(CorvidError::invalid_input(format!(
                "database name '{}' contains invalid character '{}'",
                name, c
            )));
        }
        Ok(Self(name.to_ascii_lowercase()))
    }

    /// Name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatabaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shard number inside a database
///
/// Unsharded databases have exactly one partition, `PartitionId(0)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct PartitionId(pub u32);

impl PartitionId {
    /// The only partition of an unsharded database
    pub const FIRST: PartitionId = PartitionId(0);

    /// Raw shard number
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.0)
    }
}

/// Database + partition: the unit that owns a merger and a replay log
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    /// Owning database
    pub database: DatabaseName,
    /// Shard number
    pub partition: PartitionId,
}

impl PartitionKey {
    /// Create a partition key
    pub fn new(database: DatabaseName, partition: PartitionId) -> Self {
        Self {
            database,
            partition,
        }
    }

    /// Directory name used for the partition's files
    pub fn dir_name(&self) -> String {
        format!("{}.{}", self.database, self.partition.0)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.database, self.partition)
    }
}

/// Document identifier
///
/// Ids keep the caller's casing for display but are matched
/// case-insensitively through [`DocumentId::storage_key`].
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    /// Validate and create a document id
    pub fn new(id: impl Into<String>) -> CorvidResult<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(CorvidError::invalid_input("document id cannot be empty"));
        }
        if id.len() > MAX_DOCUMENT_ID_LENGTH {
            return Err(CorvidError::invalid_input(format!(
                "document id exceeds {} bytes",
                MAX_DOCUMENT_ID_LENGTH
            )));
        }
        Ok(Self(id))
    }

    /// Id as given by the caller
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive key used by storage and shard routing
    pub fn storage_key(&self) -> String {
        self.0.to_lowercase()
    }

    /// True if the server must complete this id from an identity counter
    ///
    /// `orders|` becomes `orders/1`, `orders/2`, ...
    pub fn is_identity_request(&self) -> bool {
        self.0.ends_with('|')
    }

    /// Collection prefix of an identity request (`orders|` → `orders`)
    pub fn identity_prefix(&self) -> Option<&str> {
        self.0.strip_suffix('|')
    }
}

impl PartialEq for DocumentId {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0 || self.storage_key() == other.storage_key()
    }
}

impl std::hash::Hash for DocumentId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.storage_key().hash(state)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
