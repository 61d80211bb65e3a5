//! Normalized per-field-table source layout.
//!
//! Every field gets its own `node__*` table, node metadata lives in
//! `node_field_data`, and aliases in `path_alias` with slash-prefixed
//! paths. Bodies in this layout were already cleaned at authoring time,
//! so the markup normalization pass is skipped for them.

use rusqlite::{params, Connection, OptionalExtension};

use super::{ArticleHead, BodyField, SourceAlias, SourceArticleReader, SourceFile, SourceTerm};
use crate::error::Result;
use crate::mapping::EntityKind;

pub struct NormalizedSourceReader {
    conn: Connection,
}

impl NormalizedSourceReader {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }
}

impl SourceArticleReader for NormalizedSourceReader {
    fn list_articles(&self, limit: usize) -> Result<Vec<ArticleHead>> {
        let mut stmt = self.conn.prepare(
            "SELECT nid, title, created, changed, uid FROM node_field_data
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
                    author: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(heads)
    }

    fn is_excluded(&self, _nid: i64) -> Result<bool> {
        Ok(false)
    }

    fn body(&self, nid: i64) -> Result<Option<BodyField>> {
        let row = self
            .conn
            .query_row(
                "SELECT body_value, body_format FROM node__body
                 WHERE entity_id = ?1 LIMIT 1",
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
        Ok(row)
    }

    fn tag_ids(&self, nid: i64) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT field_tags_target_id FROM node__field_tags
             WHERE entity_id = ?1 ORDER BY delta ASC",
        )?;
        let ids = stmt
            .query_map(params![nid], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn image_ids(&self, nid: i64) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT field_image_target_id FROM node__field_image
             WHERE entity_id = ?1 ORDER BY delta ASC",
        )?;
        let ids = stmt
            .query_map(params![nid], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn video_url(&self, nid: i64) -> Result<Option<String>> {
        let url = self
            .conn
            .query_row(
                "SELECT field_video_value FROM node__field_video
                 WHERE entity_id = ?1 LIMIT 1",
                params![nid],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten()
            .filter(|u| !u.trim().is_empty());
        Ok(url)
    }

    fn term(&self, tid: i64) -> Result<Option<SourceTerm>> {
        let term = self
            .conn
            .query_row(
                "SELECT d.tid, d.name, d.description__value, d.weight, d.langcode, p.bundle
                 FROM taxonomy_term_field_data d
                 LEFT JOIN taxonomy_term__parent p ON p.entity_id = d.tid
                 WHERE d.tid = ?1",
                params![tid],
                |row| {
                    Ok(SourceTerm {
                        tid: row.get(0)?,
                        name: row.get(1)?,
                        numeric_vocabulary: None,
                        bundle: row.get(5)?,
                        description: row.get(2)?,
                        weight: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                        langcode: row.get(4)?,
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
        let path = match kind {
            EntityKind::Node => format!("/node/{source_id}"),
            EntityKind::Term => format!("/taxonomy/term/{source_id}"),
            EntityKind::File => return Ok(None),
        };
        let alias = self
            .conn
            .query_row(
                "SELECT alias, langcode FROM path_alias WHERE path = ?1 LIMIT 1",
                params![path],
                |row| {
                    Ok(SourceAlias {
                        alias: row
                            .get::<_, String>(0)?
                            .trim_start_matches('/')
                            .to_string(),
                        langcode: row.get::<_, Option<String>>(1)?.filter(|l| l != "und"),
                    })
                },
            )
            .optional()?;
        Ok(alias)
    }

    fn cleans_markup(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn fixture_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE node_field_data (nid INTEGER, type TEXT, title TEXT, status INTEGER,
                                          created INTEGER, changed INTEGER, uid INTEGER);
            CREATE TABLE node__body (entity_id INTEGER, body_value TEXT, body_format TEXT);
            CREATE TABLE node__field_tags (entity_id INTEGER, delta INTEGER, field_tags_target_id INTEGER);
            CREATE TABLE node__field_image (entity_id INTEGER, delta INTEGER, field_image_target_id INTEGER);
            CREATE TABLE node__field_video (entity_id INTEGER, field_video_value TEXT);
            CREATE TABLE taxonomy_term_field_data (tid INTEGER, name TEXT, description__value TEXT,
                                                   weight INTEGER, langcode TEXT);
            CREATE TABLE taxonomy_term__parent (entity_id INTEGER, bundle TEXT);
            CREATE TABLE file_managed (fid INTEGER, filename TEXT, uri TEXT);
            CREATE TABLE path_alias (path TEXT, alias TEXT, langcode TEXT);

            INSERT INTO node_field_data VALUES (10, 'article', 'Modern', 1, 500, 600, 7);
            INSERT INTO node_field_data VALUES (11, 'article', 'Hidden', 0, 500, 600, 7);
            INSERT INTO node__body VALUES (10, '<p>clean</p>', 'full_html');
            INSERT INTO node__field_tags VALUES (10, 0, 40);
            INSERT INTO node__field_image VALUES (10, 0, 50);
            INSERT INTO node__field_video VALUES (10, 'https://www.youtube.com/watch?v=abc123DEF45');
            INSERT INTO taxonomy_term_field_data VALUES (40, 'Science', 'About science', 2, 'en');
            INSERT INTO taxonomy_term__parent VALUES (40, 'topics');
            INSERT INTO file_managed VALUES (50, 'b.png', 'public://b.png');
            INSERT INTO path_alias VALUES ('/node/10', '/science/modern', 'en');
            "#,
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_lists_articles_with_author() {
        let reader = NormalizedSourceReader::new(fixture_conn());
        let heads = reader.list_articles(0).unwrap();
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].nid, 10);
        assert_eq!(heads[0].author, Some(7));
    }

    #[test]
    fn test_video_url_present() {
        let reader = NormalizedSourceReader::new(fixture_conn());
        assert_eq!(
            reader.video_url(10).unwrap().as_deref(),
            Some("https://www.youtube.com/watch?v=abc123DEF45")
        );
        assert_eq!(reader.video_url(11).unwrap(), None);
    }

    #[test]
    fn test_term_carries_bundle_and_description() {
        let reader = NormalizedSourceReader::new(fixture_conn());
        let term = reader.term(40).unwrap().unwrap();
        assert_eq!(term.name, "Science");
        assert_eq!(term.bundle.as_deref(), Some("topics"));
        assert_eq!(term.description.as_deref(), Some("About science"));
        assert_eq!(term.weight, 2);
        assert_eq!(term.numeric_vocabulary, None);
    }

    #[test]
    fn test_alias_paths_are_slash_prefixed() {
        let reader = NormalizedSourceReader::new(fixture_conn());
        let alias = reader.find_alias(EntityKind::Node, 10).unwrap().unwrap();
        assert_eq!(alias.alias, "science/modern");
        assert_eq!(alias.langcode.as_deref(), Some("en"));
    }

    #[test]
    fn test_never_excludes_and_preserves_markup() {
        let reader = NormalizedSourceReader::new(fixture_conn());
        assert!(!reader.is_excluded(10).unwrap());
        assert!(!reader.cleans_markup());
    }
}
