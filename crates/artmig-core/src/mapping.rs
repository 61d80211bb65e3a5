//! Persistent source→destination identifier ledger.
//!
//! The mapping table is the idempotency backbone: once an entry exists
//! for a `(kind, source_id)` pair, re-running the engine never creates a
//! second destination entity for it. Entries are written once and only
//! read afterwards, until a reversal wipes the whole scope.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::debug;

use crate::error::{MigrateError, Result};

/// Kind of entity a mapping entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// An article node.
    Node,
    /// A taxonomy term.
    Term,
    /// A binary asset.
    File,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Node => "node",
            EntityKind::Term => "term",
            EntityKind::File => "file",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One recorded correspondence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappingEntry {
    pub kind: EntityKind,
    pub source_id: String,
    pub dest_id: i64,
}

/// SQLite-backed mapping ledger for one source connection.
///
/// Each source connection gets its own physical table
/// (`id_map_<scope>`), so two legacy systems migrated into the same
/// destination never cross-contaminate.
pub struct MappingStore {
    conn: Connection,
    table: String,
}

impl MappingStore {
    /// Open (and create if needed) the ledger for `scope` in the
    /// database at `db_path`.
    pub fn open(db_path: impl AsRef<Path>, scope: &str) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(|e| MigrateError::Database {
            message: format!("failed to open mapping database: {e}"),
            source: Some(e),
        })?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::with_connection(conn, scope)
    }

    /// Build the ledger over an existing connection. Used by tests and
    /// callers that share one destination database handle.
    pub fn with_connection(conn: Connection, scope: &str) -> Result<Self> {
        let table = format!("id_map_{}", sanitize_scope(scope)?);
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                kind TEXT NOT NULL,
                source_id TEXT NOT NULL,
                dest_id INTEGER NOT NULL,
                PRIMARY KEY (kind, source_id)
            );
            "#
        ))?;
        Ok(Self { conn, table })
    }

    /// Look up the destination id recorded for `(kind, source_id)`.
    pub fn lookup(&self, kind: EntityKind, source_id: &str) -> Result<Option<i64>> {
        let dest = self
            .conn
            .query_row(
                &format!(
                    "SELECT dest_id FROM {} WHERE kind = ?1 AND source_id = ?2",
                    self.table
                ),
                params![kind.as_str(), source_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(dest)
    }

    /// Record a correspondence. A duplicate `(kind, source_id)` insert is
    /// a programming-invariant violation and surfaces as
    /// [`MigrateError::MappingConflict`].
    pub fn record(&self, kind: EntityKind, source_id: &str, dest_id: i64) -> Result<()> {
        let inserted = self.conn.execute(
            &format!(
                "INSERT INTO {} (kind, source_id, dest_id) VALUES (?1, ?2, ?3)",
                self.table
            ),
            params![kind.as_str(), source_id, dest_id],
        );
        match inserted {
            Ok(_) => {
                debug!(kind = kind.as_str(), source_id, dest_id, "recorded mapping");
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(MigrateError::MappingConflict {
                    kind,
                    source_id: source_id.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// All entries of one kind, source id ascending.
    pub fn entries(&self, kind: EntityKind) -> Result<Vec<MappingEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT source_id, dest_id FROM {} WHERE kind = ?1 ORDER BY CAST(source_id AS INTEGER) ASC",
            self.table
        ))?;
        let entries = stmt
            .query_map(params![kind.as_str()], |row| {
                Ok(MappingEntry {
                    kind,
                    source_id: row.get(0)?,
                    dest_id: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Destination ids of every entry of one kind.
    pub fn all_dest_ids(&self, kind: EntityKind) -> Result<Vec<i64>> {
        Ok(self
            .entries(kind)?
            .into_iter()
            .map(|entry| entry.dest_id)
            .collect())
    }

    /// Wipe every entry for this scope. Returns the number removed.
    pub fn delete_all(&self) -> Result<usize> {
        let deleted = self
            .conn
            .execute(&format!("DELETE FROM {}", self.table), [])?;
        debug!(deleted, "cleared mapping ledger");
        Ok(deleted)
    }
}

/// Scope keys become part of a table name; anything outside
/// `[a-z0-9_]` is rejected rather than quoted.
fn sanitize_scope(scope: &str) -> Result<String> {
    if scope.is_empty()
        || !scope
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(MigrateError::Config {
            message: format!("invalid mapping scope {scope:?}: use [a-z0-9_]"),
        });
    }
    Ok(scope.to_string())
}
