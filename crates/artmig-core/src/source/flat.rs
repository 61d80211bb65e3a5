//! Flat shared-field-table source layout.
//!
//! Field values live in wide shared tables (`field_data_body`,
//! `field_data_field_tags`, …) keyed by entity id, with revision tables
//! as fallback. Articles listed in the site's `parser_map` table were
//! produced by an import pipeline and are excluded from migration.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use super::{ArticleHead, BodyField, SourceAlias, SourceArticleReader, SourceFile, SourceTerm};
use crate::error::Result;
use crate::mapping::EntityKind;

pub struct FlatSourceReader {
    conn: Connection,
    /// Whether the optional `parser_map` exclusion table exists.
    has_exclusion_table: bool,
}

impl FlatSourceReader {
    pub fn new(conn: Connection) -> Result<Self> {
        let has_exclusion_table: bool = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'parser_map'",
                [],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if !has_exclusion_table {
            warn!("source has no parser_map table; exclusion filter disabled");
        }
        Ok(Self {
            conn,
            has_exclusion_table,
        })
    }
}

impl SourceArticleReader for FlatSourceReader {
    fn list_articles(&self, limit: usize) -> Result<Vec<ArticleHead>> {
        let mut stmt = self.conn.prepare(
            "SELECT nid, title, created, changed FROM node
             WHERE type = 'article' AND status = 1
             ORDER BY nid ASC
             LIMIT ?1",
        )?;
        let limit = if limit == 0 { -1i64 } else { limit as i64 };
        let heads = stmt
            .query_map(params![limit], |row| {
                Ok(ArticleHead {
                    nid: row.get(0)?,
                    title: row.get(1)?,
                    created: row.get(2)?,
                    changed: row.get(3)?,
                    author: None,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(heads)
    }

    fn is_excluded(&self, nid: i64) -> Result<bool> {
        if !self.has_exclusion_table {
            return Ok(false);
        }
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM parser_map WHERE entity_id = ?1",
            params![nid],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn body(&self, nid: i64) -> Result<Option<BodyField>> {
        // Current data first, revision table as fallback.
        for table in ["field_data_body", "field_revision_body"] {
            let row = self
                .conn
                .query_row(
                    &format!(
                        "SELECT body_value, body_format FROM {table}
                         WHERE entity_id = ?1 LIMIT 1"
                    ),
                    params![nid],
                    |row| {
                        Ok(BodyField {
                            value: row.get(0)?,
                            format: row
                                .get::<_, Option<String>>(1)?
                                .unwrap_or_else(|| "full_html".into()),
                        })
                    },
                )
                .optional()?;
            if row.is_some() {
                return Ok(row);
            }
        }
        Ok(None)
    }

    fn tag_ids(&self, nid: i64) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT field_tags_tid FROM field_data_field_tags
             WHERE entity_id = ?1 ORDER BY delta ASC",
        )?;
        let ids = stmt
            .query_map(params![nid], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn image_ids(&self, nid: i64) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT field_image_fid FROM field_data_field_image
             WHERE entity_id = ?1 ORDER BY delta ASC",
        )?;
        let ids = stmt
            .query_map(params![nid], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn video_url(&self, _nid: i64) -> Result<Option<String>> {
        // The flat schema never carried a video field.
        Ok(None)
    }

    fn term(&self, tid: i64) -> Result<Option<SourceTerm>> {
        let term = self
            .conn
            .query_row(
                "SELECT tid, name, vid FROM taxonomy_term_data WHERE tid = ?1",
                params![tid],
                |row| {
                    Ok(SourceTerm {
                        tid: row.get(0)?,
                        name: row.get(1)?,
                        numeric_vocabulary: Some(row.get(2)?),
                        bundle: None,
                        description: None,
                        weight: 0,
                        langcode: None,
                    })
                },
            )
            .optional()?;
        Ok(term)
    }

    fn file(&self, fid: i64) -> Result<Option<SourceFile>> {
        let file = self
            .conn
            .query_row(
                "SELECT fid, filename, uri FROM file_managed WHERE fid = ?1",
                params![fid],
                |row| {
                    Ok(SourceFile {
                        fid: row.get(0)?,
                        filename: row.get(1)?,
                        uri: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(file)
    }

    fn find_alias(&self, kind: EntityKind, source_id: i64) -> Result<Option<SourceAlias>> {
        // Flat-schema alias sources are stored without a leading slash.
        let path = match kind {
            EntityKind::Node => format!("node/{source_id}"),
            EntityKind::Term => format!("taxonomy/term/{source_id}"),
            EntityKind::File => return Ok(None),
        };
        let alias = self
            .conn
            .query_row(
                "SELECT alias, language FROM url_alias WHERE source = ?1 LIMIT 1",
                params![path],
                |row| {
                    Ok(SourceAlias {
                        alias: row.get(0)?,
                        langcode: row.get::<_, Option<String>>(1)?.filter(|l| l != "und"),
                    })
                },
            )
            .optional()?;
        Ok(alias)
    }

    fn cleans_markup(&self) -> bool {
        // Legacy bodies are full of presentational markup; scrub them.
        true
    }
}
