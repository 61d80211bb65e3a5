//! SQLite-backed destination store.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::debug;

use super::{field_i64, field_ids, field_str, AliasEntry, AliasStore, EntityStore, Fields};
use crate::error::{MigrateError, Result};
use crate::mapping::EntityKind;

/// Destination content store over a single SQLite database.
///
/// Domain-scope support is a deployment capability: stores opened with
/// it carry an `article_domains` table and a `canonical_domain` column,
/// stores opened without fail the corresponding `has_field` probes.
pub struct SqliteDestination {
    conn: Connection,
    domain_support: bool,
}

impl SqliteDestination {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_domains(db_path, false)
    }

    pub fn open_with_domains(db_path: impl AsRef<Path>, domain_support: bool) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(|e| MigrateError::Database {
            message: format!("failed to open destination database: {e}"),
            source: Some(e),
        })?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::with_connection(conn, domain_support)
    }

    pub fn with_connection(conn: Connection, domain_support: bool) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                body_value TEXT NOT NULL DEFAULT '',
                body_format TEXT NOT NULL DEFAULT 'full_html',
                status INTEGER NOT NULL DEFAULT 1,
                author INTEGER,
                created INTEGER NOT NULL DEFAULT 0,
                changed INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS article_tags (
                article_id INTEGER NOT NULL,
                term_id INTEGER NOT NULL,
                PRIMARY KEY (article_id, term_id)
            );

            -- weight preserves the source image order
            CREATE TABLE IF NOT EXISTS article_images (
                article_id INTEGER NOT NULL,
                weight INTEGER NOT NULL,
                file_id INTEGER NOT NULL,
                PRIMARY KEY (article_id, weight)
            );

            CREATE TABLE IF NOT EXISTS terms (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                vocabulary TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                weight INTEGER NOT NULL DEFAULT 0,
                langcode TEXT NOT NULL DEFAULT 'en'
            );
            CREATE INDEX IF NOT EXISTS idx_terms_name_vocab ON terms(name, vocabulary);

            CREATE TABLE IF NOT EXISTS files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uri TEXT NOT NULL,
                filename TEXT NOT NULL DEFAULT '',
                mime TEXT NOT NULL DEFAULT '',
                permanent INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_files_uri ON files(uri);

            CREATE TABLE IF NOT EXISTS aliases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL,
                alias TEXT NOT NULL,
                langcode TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_aliases_path ON aliases(path);
            CREATE INDEX IF NOT EXISTS idx_aliases_alias ON aliases(alias);

            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL DEFAULT ''
            );
            "#,
        )?;

        if domain_support {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS article_domains (
                    article_id INTEGER NOT NULL,
                    domain_id TEXT NOT NULL,
                    PRIMARY KEY (article_id, domain_id)
                );
                "#,
            )?;
            // Older databases may predate the column.
            let has_column: bool = conn
                .prepare("SELECT 1 FROM pragma_table_info('articles') WHERE name = 'canonical_domain'")?
                .query_row([], |_| Ok(true))
                .optional()?
                .unwrap_or(false);
            if !has_column {
                conn.execute("ALTER TABLE articles ADD COLUMN canonical_domain TEXT", [])?;
            }
        }

        Ok(Self {
            conn,
            domain_support,
        })
    }

    /// Seed a destination account. Used by fixtures and deployments that
    /// pre-provision authors.
    pub fn add_user(&self, uid: i64, name: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO users (id, name) VALUES (?1, ?2)",
            params![uid, name],
        )?;
        Ok(())
    }

    fn create_article(&self, fields: &Fields) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO articles (title, body_value, body_format, status, author, created, changed)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                field_str(fields, "title").unwrap_or_default(),
                field_str(fields, "body_value").unwrap_or_default(),
                field_str(fields, "body_format").unwrap_or("full_html"),
                field_i64(fields, "status").unwrap_or(1),
                field_i64(fields, "author"),
                field_i64(fields, "created").unwrap_or(0),
                field_i64(fields, "changed").unwrap_or(0),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.write_article_refs(id, fields)?;
        self.write_article_domains(id, fields)?;
        Ok(id)
    }

    fn update_article(&self, id: i64, fields: &Fields) -> Result<()> {
        let updated = self.conn.execute(
            r#"
            UPDATE articles SET
                title = COALESCE(?2, title),
                body_value = COALESCE(?3, body_value),
                body_format = COALESCE(?4, body_format),
                status = COALESCE(?5, status),
                author = COALESCE(?6, author),
                created = COALESCE(?7, created),
                changed = COALESCE(?8, changed)
            WHERE id = ?1
            "#,
            params![
                id,
                field_str(fields, "title"),
                field_str(fields, "body_value"),
                field_str(fields, "body_format"),
                field_i64(fields, "status"),
                field_i64(fields, "author"),
                field_i64(fields, "created"),
                field_i64(fields, "changed"),
            ],
        )?;
        if updated == 0 {
            return Err(MigrateError::EntityNotFound {
                kind: "node".into(),
                id,
            });
        }
        self.write_article_refs(id, fields)?;
        self.write_article_domains(id, fields)?;
        Ok(())
    }

    /// Replace the tag/image reference lists when the field bag carries
    /// them; absent keys leave the stored references alone.
    fn write_article_refs(&self, id: i64, fields: &Fields) -> Result<()> {
        if fields.contains_key("tags") {
            self.conn
                .execute("DELETE FROM article_tags WHERE article_id = ?1", params![id])?;
            for term_id in field_ids(fields, "tags") {
                self.conn.execute(
                    "INSERT OR IGNORE INTO article_tags (article_id, term_id) VALUES (?1, ?2)",
                    params![id, term_id],
                )?;
            }
        }
        if fields.contains_key("images") {
            self.conn.execute(
                "DELETE FROM article_images WHERE article_id = ?1",
                params![id],
            )?;
            for (weight, file_id) in field_ids(fields, "images").into_iter().enumerate() {
                self.conn.execute(
                    "INSERT INTO article_images (article_id, weight, file_id) VALUES (?1, ?2, ?3)",
                    params![id, weight as i64, file_id],
                )?;
            }
        }
        Ok(())
    }

    fn write_article_domains(&self, id: i64, fields: &Fields) -> Result<()> {
        if !self.domain_support {
            return Ok(());
        }
        if let Some(domains) = fields.get("domain_access").and_then(Value::as_array) {
            self.conn.execute(
                "DELETE FROM article_domains WHERE article_id = ?1",
                params![id],
            )?;
            for domain in domains.iter().filter_map(Value::as_str) {
                self.conn.execute(
                    "INSERT OR IGNORE INTO article_domains (article_id, domain_id) VALUES (?1, ?2)",
                    params![id, domain],
                )?;
            }
        }
        if let Some(canonical) = field_str(fields, "domain_source") {
            self.conn.execute(
                "UPDATE articles SET canonical_domain = ?2 WHERE id = ?1",
                params![id, canonical],
            )?;
        }
        Ok(())
    }

    fn load_article(&self, id: i64) -> Result<Option<Fields>> {
        let row = self
            .conn
            .query_row(
                "SELECT title, body_value, body_format, status, author, created, changed
                 FROM articles WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                },
            )
            .optional()?;
        let Some((title, body_value, body_format, status, author, created, changed)) = row else {
            return Ok(None);
        };

        let mut tags_stmt = self.conn.prepare(
            "SELECT term_id FROM article_tags WHERE article_id = ?1 ORDER BY term_id",
        )?;
        let tags: Vec<i64> = tags_stmt
            .query_map(params![id], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;

        let mut images_stmt = self.conn.prepare(
            "SELECT file_id FROM article_images WHERE article_id = ?1 ORDER BY weight",
        )?;
        let images: Vec<i64> = images_stmt
            .query_map(params![id], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;

        let mut fields = Fields::new();
        fields.insert("id".into(), id.into());
        fields.insert("title".into(), title.into());
        fields.insert("body_value".into(), body_value.into());
        fields.insert("body_format".into(), body_format.into());
        fields.insert("status".into(), status.into());
        if let Some(author) = author {
            fields.insert("author".into(), author.into());
        }
        fields.insert("created".into(), created.into());
        fields.insert("changed".into(), changed.into());
        fields.insert("tags".into(), tags.into());
        fields.insert("images".into(), images.into());
        Ok(Some(fields))
    }

    fn load_term(&self, id: i64) -> Result<Option<Fields>> {
        let row = self
            .conn
            .query_row(
                "SELECT name, vocabulary, description, weight, langcode FROM terms WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(name, vocabulary, description, weight, langcode)| {
            let mut fields = Fields::new();
            fields.insert("id".into(), id.into());
            fields.insert("name".into(), name.into());
            fields.insert("vocabulary".into(), vocabulary.into());
            fields.insert("description".into(), description.into());
            fields.insert("weight".into(), weight.into());
            fields.insert("langcode".into(), langcode.into());
            fields
        }))
    }

    fn load_file(&self, id: i64) -> Result<Option<Fields>> {
        let row = self
            .conn
            .query_row(
                "SELECT uri, filename, mime, permanent FROM files WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(uri, filename, mime, permanent)| {
            let mut fields = Fields::new();
            fields.insert("id".into(), id.into());
            fields.insert("uri".into(), uri.into());
            fields.insert("filename".into(), filename.into());
            fields.insert("mime".into(), mime.into());
            fields.insert("permanent".into(), (permanent != 0).into());
            fields
        }))
    }
}

impl EntityStore for SqliteDestination {
    fn create(&self, kind: EntityKind, fields: &Fields) -> Result<i64> {
        let id = match kind {
            EntityKind::Node => self.create_article(fields)?,
            EntityKind::Term => {
                self.conn.execute(
                    "INSERT INTO terms (name, vocabulary, description, weight, langcode)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        field_str(fields, "name").unwrap_or_default(),
                        field_str(fields, "vocabulary").unwrap_or("tags"),
                        field_str(fields, "description").unwrap_or_default(),
                        field_i64(fields, "weight").unwrap_or(0),
                        field_str(fields, "langcode").unwrap_or("en"),
                    ],
                )?;
                self.conn.last_insert_rowid()
            }
            EntityKind::File => {
                self.conn.execute(
                    "INSERT INTO files (uri, filename, mime, permanent) VALUES (?1, ?2, ?3, ?4)",
                    params![
                        field_str(fields, "uri").unwrap_or_default(),
                        field_str(fields, "filename").unwrap_or_default(),
                        field_str(fields, "mime").unwrap_or_default(),
                        fields
                            .get("permanent")
                            .and_then(Value::as_bool)
                            .unwrap_or(false) as i64,
                    ],
                )?;
                self.conn.last_insert_rowid()
            }
        };
        debug!(kind = kind.as_str(), id, "created destination entity");
        Ok(id)
    }

    fn load(&self, kind: EntityKind, id: i64) -> Result<Option<Fields>> {
        match kind {
            EntityKind::Node => self.load_article(id),
            EntityKind::Term => self.load_term(id),
            EntityKind::File => self.load_file(id),
        }
    }

    fn update(&self, kind: EntityKind, id: i64, fields: &Fields) -> Result<()> {
        match kind {
            EntityKind::Node => self.update_article(id, fields),
            EntityKind::Term => {
                self.conn.execute(
                    "UPDATE terms SET
                        name = COALESCE(?2, name),
                        vocabulary = COALESCE(?3, vocabulary),
                        description = COALESCE(?4, description)
                     WHERE id = ?1",
                    params![
                        id,
                        field_str(fields, "name"),
                        field_str(fields, "vocabulary"),
                        field_str(fields, "description"),
                    ],
                )?;
                Ok(())
            }
            EntityKind::File => {
                self.conn.execute(
                    "UPDATE files SET permanent = COALESCE(?2, permanent) WHERE id = ?1",
                    params![
                        id,
                        fields
                            .get("permanent")
                            .and_then(Value::as_bool)
                            .map(|b| b as i64)
                    ],
                )?;
                Ok(())
            }
        }
    }

    fn delete(&self, kind: EntityKind, id: i64) -> Result<()> {
        match kind {
            EntityKind::Node => {
                self.conn
                    .execute("DELETE FROM article_tags WHERE article_id = ?1", params![id])?;
                self.conn.execute(
                    "DELETE FROM article_images WHERE article_id = ?1",
                    params![id],
                )?;
                if self.domain_support {
                    self.conn.execute(
                        "DELETE FROM article_domains WHERE article_id = ?1",
                        params![id],
                    )?;
                }
                self.conn
                    .execute("DELETE FROM articles WHERE id = ?1", params![id])?;
            }
            EntityKind::Term => {
                self.conn
                    .execute("DELETE FROM terms WHERE id = ?1", params![id])?;
            }
            EntityKind::File => {
                self.conn
                    .execute("DELETE FROM files WHERE id = ?1", params![id])?;
            }
        }
        Ok(())
    }

    fn has_field(&self, kind: EntityKind, name: &str) -> Result<bool> {
        if kind != EntityKind::Node {
            return Ok(false);
        }
        match name {
            "domain_access" | "domain_source" => Ok(self.domain_support),
            "tags" | "images" => Ok(true),
            other => {
                let present: bool = self
                    .conn
                    .prepare("SELECT 1 FROM pragma_table_info('articles') WHERE name = ?1")?
                    .query_row(params![other], |_| Ok(true))
                    .optional()?
                    .unwrap_or(false);
                Ok(present)
            }
        }
    }

    fn find_term(&self, name: &str, vocabulary: &str) -> Result<Option<i64>> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM terms WHERE name = ?1 AND vocabulary = ?2 ORDER BY id LIMIT 1",
                params![name, vocabulary],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    fn find_file_by_uri(&self, uri: &str) -> Result<Option<i64>> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM files WHERE uri = ?1 ORDER BY id LIMIT 1",
                params![uri],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    fn user_exists(&self, uid: i64) -> Result<bool> {
        let exists: bool = self
            .conn
            .query_row("SELECT 1 FROM users WHERE id = ?1", params![uid], |_| {
                Ok(true)
            })
            .optional()?
            .unwrap_or(false);
        Ok(exists)
    }
}

impl AliasStore for SqliteDestination {
    fn find_by_path(&self, path: &str) -> Result<Option<AliasEntry>> {
        let entry = self
            .conn
            .query_row(
                "SELECT path, alias, langcode FROM aliases WHERE path = ?1 LIMIT 1",
                params![path],
                |row| {
                    Ok(AliasEntry {
                        path: row.get(0)?,
                        alias: row.get(1)?,
                        langcode: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    fn find_by_alias(&self, alias: &str) -> Result<Option<AliasEntry>> {
        let entry = self
            .conn
            .query_row(
                "SELECT path, alias, langcode FROM aliases WHERE alias = ?1 LIMIT 1",
                params![alias],
                |row| {
                    Ok(AliasEntry {
                        path: row.get(0)?,
                        alias: row.get(1)?,
                        langcode: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    fn create(&self, path: &str, alias: &str, langcode: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO aliases (path, alias, langcode) VALUES (?1, ?2, ?3)",
            params![path, alias, langcode],
        )?;
        Ok(())
    }

    fn delete_by_path(&self, path: &str) -> Result<usize> {
        Ok(self
            .conn
            .execute("DELETE FROM aliases WHERE path = ?1", params![path])?)
    }
}
