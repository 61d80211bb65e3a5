//! Legacy source connections.
//!
//! Two schema generations are supported behind one contract: the flat
//! shared-field-table layout and the newer per-field normalized layout.
//! The migrator only ever sees the [`SourceArticleReader`] trait and the
//! projection types it returns; which tables those come from is the
//! reader's business.

mod flat;
mod normalized;

pub use flat::FlatSourceReader;
pub use normalized::NormalizedSourceReader;

use std::path::Path;

use rusqlite::{Connection, OpenFlags};

use crate::config::SchemaVariant;
use crate::error::{MigrateError, Result};
use crate::mapping::EntityKind;

/// Enumeration row for one eligible source article.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleHead {
    pub nid: i64,
    pub title: String,
    pub created: i64,
    pub changed: i64,
    /// Source author uid, when the schema carries one.
    pub author: Option<i64>,
}

/// Rich-text body value plus its input format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyField {
    pub value: String,
    pub format: String,
}

/// Source taxonomy term projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTerm {
    pub tid: i64,
    pub name: String,
    /// Numeric vocabulary id (flat schema only; drives eligibility).
    pub numeric_vocabulary: Option<i64>,
    /// Vocabulary bundle name (normalized schema only).
    pub bundle: Option<String>,
    pub description: Option<String>,
    pub weight: i64,
    pub langcode: Option<String>,
}

/// Source managed-file projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub fid: i64,
    pub filename: String,
    pub uri: String,
}

/// Source URL alias row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceAlias {
    pub alias: String,
    pub langcode: Option<String>,
}

/// Read-only access to one legacy source connection.
pub trait SourceArticleReader {
    /// Published articles, source id ascending. `limit` of 0 means all.
    fn list_articles(&self, limit: usize) -> Result<Vec<ArticleHead>>;

    /// Whether the article sits on the schema's exclusion list.
    fn is_excluded(&self, nid: i64) -> Result<bool>;

    fn body(&self, nid: i64) -> Result<Option<BodyField>>;

    /// Tag ids in field delta order.
    fn tag_ids(&self, nid: i64) -> Result<Vec<i64>>;

    /// Image file ids in field delta order.
    fn image_ids(&self, nid: i64) -> Result<Vec<i64>>;

    fn video_url(&self, nid: i64) -> Result<Option<String>>;

    fn term(&self, tid: i64) -> Result<Option<SourceTerm>>;

    fn file(&self, fid: i64) -> Result<Option<SourceFile>>;

    fn find_alias(&self, kind: EntityKind, source_id: i64) -> Result<Option<SourceAlias>>;

    /// Whether bodies from this schema get the markup normalize pass.
    fn cleans_markup(&self) -> bool;
}

/// Open the reader for a schema variant over the SQLite database at
/// `path`. The connection is read-only; the engine never writes to a
/// source.
pub fn open_reader(variant: SchemaVariant, path: impl AsRef<Path>) -> Result<Box<dyn SourceArticleReader>> {
    let conn = Connection::open_with_flags(
        path.as_ref(),
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| MigrateError::Database {
        message: format!(
            "failed to open {} source at {}: {e}",
            variant,
            path.as_ref().display()
        ),
        source: Some(e),
    })?;
    Ok(match variant {
        SchemaVariant::Flat => Box::new(FlatSourceReader::new(conn)?),
        SchemaVariant::Normalized => Box::new(NormalizedSourceReader::new(conn)),
    })
}
