//! Destination-store collaborator contracts.
//!
//! The engine never talks to a concrete CMS; it consumes these traits
//! and receives implementations through its constructor. The bundled
//! [`SqliteDestination`] backs both contracts for the CLI and the test
//! suite.

mod sqlite;

pub use sqlite::SqliteDestination;

use serde_json::Value;

use crate::error::Result;
use crate::mapping::EntityKind;

/// Field bag for entity create/update/load calls.
pub type Fields = serde_json::Map<String, Value>;

/// Read a string field out of a loaded entity.
pub fn field_str<'a>(fields: &'a Fields, name: &str) -> Option<&'a str> {
    fields.get(name).and_then(Value::as_str)
}

/// Read an integer field out of a loaded entity.
pub fn field_i64(fields: &Fields, name: &str) -> Option<i64> {
    fields.get(name).and_then(Value::as_i64)
}

/// Read an id-list field out of a loaded entity.
pub fn field_ids(fields: &Fields, name: &str) -> Vec<i64> {
    fields
        .get(name)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_i64).collect())
        .unwrap_or_default()
}

/// Destination entity persistence.
///
/// `has_field` probes schema capabilities: destination deployments vary
/// (a site without domain scoping simply lacks those columns), and the
/// migrator degrades gracefully instead of failing.
pub trait EntityStore {
    fn create(&self, kind: EntityKind, fields: &Fields) -> Result<i64>;
    fn load(&self, kind: EntityKind, id: i64) -> Result<Option<Fields>>;
    fn update(&self, kind: EntityKind, id: i64, fields: &Fields) -> Result<()>;
    fn delete(&self, kind: EntityKind, id: i64) -> Result<()>;
    fn has_field(&self, kind: EntityKind, name: &str) -> Result<bool>;

    /// Natural-key term lookup: identical name within a vocabulary.
    fn find_term(&self, name: &str, vocabulary: &str) -> Result<Option<i64>>;

    /// Reverse lookup of a file entity by its stored URI.
    fn find_file_by_uri(&self, uri: &str) -> Result<Option<i64>>;

    /// Whether a destination account with this id exists. Backs the
    /// run-scoped author validity cache.
    fn user_exists(&self, uid: i64) -> Result<bool>;
}

/// A destination URL alias row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasEntry {
    pub path: String,
    pub alias: String,
    pub langcode: String,
}

/// Destination alias persistence.
pub trait AliasStore {
    fn find_by_path(&self, path: &str) -> Result<Option<AliasEntry>>;
    fn find_by_alias(&self, alias: &str) -> Result<Option<AliasEntry>>;
    fn create(&self, path: &str, alias: &str, langcode: &str) -> Result<()>;
    fn delete_by_path(&self, path: &str) -> Result<usize>;
}
