//! The article migration engine.
//!
//! One [`ArticleMigrator`] drives one run: it enumerates published
//! source articles, migrates each one's body, terms, images, video and
//! alias, and records every created entity in the mapping table so the
//! next run converges on the same destination state.

use std::cell::RefCell;
use std::collections::HashMap;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::assets::{AssetTransfer, CollisionPolicy};
use crate::config::MigrationConfig;
use crate::error::Result;
use crate::fetch::{strip_known_prefixes, ResourceFetcher};
use crate::html;
use crate::mapping::{EntityKind, MappingStore};
use crate::source::{ArticleHead, SourceArticleReader};
use crate::store::{AliasStore, EntityStore, Fields};
use crate::terms::TermResolver;
use crate::video;

/// What happened to one source article.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    SkippedExisting,
    SkippedExcluded,
    SkippedNotEligible,
}

/// Tally of one migration run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct MigrationReport {
    pub created: usize,
    pub updated: usize,
    pub skipped_existing: usize,
    pub skipped_excluded: usize,
    pub skipped_not_eligible: usize,
    pub failed: usize,
}

impl MigrationReport {
    pub fn processed(&self) -> usize {
        self.created
            + self.updated
            + self.skipped_existing
            + self.skipped_excluded
            + self.skipped_not_eligible
            + self.failed
    }

    fn tally(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Created => self.created += 1,
            Outcome::Updated => self.updated += 1,
            Outcome::SkippedExisting => self.skipped_existing += 1,
            Outcome::SkippedExcluded => self.skipped_excluded += 1,
            Outcome::SkippedNotEligible => self.skipped_not_eligible += 1,
        }
    }
}

/// Run-scoped memo of destination author probes, so a run with ten
/// thousand articles by the same handful of authors does not issue ten
/// thousand identical lookups.
struct RunCache {
    valid_authors: RefCell<HashMap<i64, bool>>,
}

impl RunCache {
    fn new() -> Self {
        Self {
            valid_authors: RefCell::new(HashMap::new()),
        }
    }

    fn author_exists(&self, entities: &dyn EntityStore, uid: i64) -> Result<bool> {
        if let Some(&known) = self.valid_authors.borrow().get(&uid) {
            return Ok(known);
        }
        let exists = entities.user_exists(uid)?;
        self.valid_authors.borrow_mut().insert(uid, exists);
        Ok(exists)
    }
}

pub struct ArticleMigrator<'a> {
    config: &'a MigrationConfig,
    reader: &'a dyn SourceArticleReader,
    mapping: &'a MappingStore,
    entities: &'a dyn EntityStore,
    aliases: &'a dyn AliasStore,
    assets: AssetTransfer<'a>,
    cache: RunCache,
}

impl<'a> ArticleMigrator<'a> {
    pub fn new(
        config: &'a MigrationConfig,
        reader: &'a dyn SourceArticleReader,
        mapping: &'a MappingStore,
        entities: &'a dyn EntityStore,
        aliases: &'a dyn AliasStore,
        fetcher: &'a ResourceFetcher,
    ) -> Self {
        let assets = AssetTransfer::new(
            fetcher,
            entities,
            &config.files_root,
            &config.public_base_url,
        );
        Self {
            config,
            reader,
            mapping,
            entities,
            aliases,
            assets,
            cache: RunCache::new(),
        }
    }

    /// Migrates every eligible source article once. A failure in one
    /// article is logged and counted; the run carries on.
    pub fn run(&self) -> Result<MigrationReport> {
        let domains_active = self.domain_assignment_active()?;
        let heads = self.reader.list_articles(self.config.limit)?;
        info!(count = heads.len(), "enumerated source articles");

        let mut report = MigrationReport::default();
        for head in &heads {
            match self.process(head, domains_active) {
                Ok(outcome) => {
                    debug!(nid = head.nid, ?outcome, "article processed");
                    report.tally(outcome);
                }
                Err(err) => {
                    warn!(nid = head.nid, error = %err, "article migration failed");
                    report.failed += 1;
                }
            }
        }
        info!(
            created = report.created,
            updated = report.updated,
            skipped_existing = report.skipped_existing,
            skipped_excluded = report.skipped_excluded,
            skipped_not_eligible = report.skipped_not_eligible,
            failed = report.failed,
            "migration run finished"
        );
        Ok(report)
    }

    /// Domain scopes only apply when the destination actually carries
    /// the domain fields; otherwise the configuration is ignored with a
    /// warning rather than failing the run.
    fn domain_assignment_active(&self) -> Result<bool> {
        if self.config.domains.is_empty() {
            return Ok(false);
        }
        if !self.entities.has_field(EntityKind::Node, "domain_access")? {
            warn!("domains configured but destination has no domain fields, skipping assignment");
            return Ok(false);
        }
        Ok(true)
    }

    fn process(&self, head: &ArticleHead, domains_active: bool) -> Result<Outcome> {
        let nid = head.nid;
        if self.reader.is_excluded(nid)? {
            return Ok(Outcome::SkippedExcluded);
        }
        if head.title.trim().is_empty() {
            debug!(nid, "blank title, article cannot be stored");
            return Ok(Outcome::SkippedNotEligible);
        }
        let existing = self.mapping.lookup(EntityKind::Node, &nid.to_string())?;
        if existing.is_some() && !self.config.update_existing {
            return Ok(Outcome::SkippedExisting);
        }

        let mut fields = self.build_fields(head, domains_active)?;
        match existing {
            Some(dest_id) => {
                if !self.config.refresh_references {
                    fields.remove("tags");
                    fields.remove("images");
                }
                self.entities.update(EntityKind::Node, dest_id, &fields)?;
                self.migrate_alias(nid, dest_id)?;
                Ok(Outcome::Updated)
            }
            None => {
                let dest_id = self.entities.create(EntityKind::Node, &fields)?;
                self.mapping
                    .record(EntityKind::Node, &nid.to_string(), dest_id)?;
                self.migrate_alias(nid, dest_id)?;
                Ok(Outcome::Created)
            }
        }
    }

    fn build_fields(&self, head: &ArticleHead, domains_active: bool) -> Result<Fields> {
        let nid = head.nid;
        let (mut body, format) = match self.reader.body(nid)? {
            Some(body) => (body.value, body.format),
            None => (String::new(), "full_html".to_string()),
        };

        // The video embed joins the body before the markup passes so it
        // is carried through image rewriting and cleanup like any other
        // authored fragment.
        if let Some(url) = self.reader.video_url(nid)? {
            match video::translate(&url) {
                Some(embed) => body.push_str(&embed),
                None => warn!(nid, url = %url, "unrecognized video URL, dropping"),
            }
        }

        body = html::rewrite_images(&body, nid, &self.assets)?;
        if self.reader.cleans_markup() {
            body = html::normalize(&body);
        }

        let resolver = TermResolver::new(self.config, self.mapping, self.entities, self.aliases);
        let mut tags: Vec<i64> = Vec::new();
        for tid in self.reader.tag_ids(nid)? {
            if let Some(dest) = resolver.resolve(self.reader, tid)? {
                // Two source terms may collapse to one destination term.
                if !tags.contains(&dest) {
                    tags.push(dest);
                }
            }
        }

        let mut images: Vec<i64> = Vec::new();
        for fid in self.reader.image_ids(nid)? {
            if let Some(dest) = self.migrate_file(fid)? {
                images.push(dest);
            }
        }

        let mut fields = Fields::new();
        fields.insert("title".into(), json!(head.title));
        fields.insert("body_value".into(), json!(body));
        fields.insert("body_format".into(), json!(format));
        fields.insert("status".into(), json!(1));
        fields.insert("created".into(), json!(head.created));
        fields.insert("changed".into(), json!(head.changed));
        fields.insert("tags".into(), json!(tags));
        fields.insert("images".into(), json!(images));

        if let Some(uid) = head.author {
            if self.cache.author_exists(self.entities, uid)? {
                fields.insert("author".into(), json!(uid));
            } else {
                debug!(nid, uid, "source author absent at destination, leaving unset");
            }
        }

        if domains_active {
            fields.insert("domain_access".into(), json!(self.config.domains));
            if !self.config.skip_canonical_domain {
                fields.insert("domain_source".into(), json!(self.config.domains[0]));
            }
        }
        Ok(fields)
    }

    /// Migrates one attached file, deduplicated through the mapping
    /// table. Attached files keep their source-relative path, so a
    /// repeat transfer overwrites in place.
    fn migrate_file(&self, fid: i64) -> Result<Option<i64>> {
        let source_id = fid.to_string();
        if let Some(dest) = self.mapping.lookup(EntityKind::File, &source_id)? {
            return Ok(Some(dest));
        }
        let Some(file) = self.reader.file(fid)? else {
            warn!(fid, "referenced file missing at source, dropping reference");
            return Ok(None);
        };
        let rel = strip_known_prefixes(&file.uri);
        match self.assets.store_relative(rel, rel, CollisionPolicy::Replace) {
            Ok(handle) => {
                self.mapping.record(EntityKind::File, &source_id, handle.id)?;
                Ok(Some(handle.id))
            }
            Err(err) if err.is_recoverable() => {
                warn!(fid, uri = %file.uri, error = %err, "file transfer failed, dropping reference");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Best effort: an alias that cannot be carried over never fails
    /// the article.
    fn migrate_alias(&self, nid: i64, dest_id: i64) -> Result<()> {
        let Some(alias) = self.reader.find_alias(EntityKind::Node, nid)? else {
            return Ok(());
        };
        let path = format!("/node/{dest_id}");
        let alias_text = format!("/{}", alias.alias.trim_start_matches('/'));
        if self.aliases.find_by_path(&path)?.is_some()
            || self.aliases.find_by_alias(&alias_text)?.is_some()
        {
            return Ok(());
        }
        let langcode = alias
            .langcode
            .unwrap_or_else(|| self.config.default_langcode.clone());
        if let Err(err) = self.aliases.create(&path, &alias_text, &langcode) {
            warn!(nid, dest_id, error = %err, "alias migration failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FilesBase, MigrationConfig, SchemaVariant};
    use crate::source::open_reader;
    use crate::store::SqliteDestination;
    use crate::store::{field_i64, field_ids, field_str};
    use rusqlite::Connection;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        source_files: TempDir,
        dest_files: TempDir,
        source_db: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let fx = Self {
                source_files: TempDir::new().unwrap(),
                dest_files: TempDir::new().unwrap(),
                source_db: TempDir::new().unwrap(),
            };
            fs::create_dir_all(fx.source_files.path().join("2021")).unwrap();
            fs::write(fx.source_files.path().join("2021/photo.jpg"), b"jpegbytes").unwrap();
            fs::write(fx.source_files.path().join("inline.png"), b"pngbytes").unwrap();

            let conn = Connection::open(fx.source_db.path().join("source.db")).unwrap();
            conn.execute_batch(
                r#"
                CREATE TABLE node (nid INTEGER, type TEXT, title TEXT, status INTEGER,
                                   created INTEGER, changed INTEGER);
                CREATE TABLE field_data_body (entity_id INTEGER, body_value TEXT, body_format TEXT);
                CREATE TABLE field_revision_body (entity_id INTEGER, body_value TEXT, body_format TEXT);
                CREATE TABLE field_data_field_tags (entity_id INTEGER, delta INTEGER, field_tags_tid INTEGER);
                CREATE TABLE field_data_field_image (entity_id INTEGER, delta INTEGER, field_image_fid INTEGER);
                CREATE TABLE taxonomy_term_data (tid INTEGER, name TEXT, vid INTEGER);
                CREATE TABLE file_managed (fid INTEGER, filename TEXT, uri TEXT);
                CREATE TABLE url_alias (source TEXT, alias TEXT, language TEXT);
                CREATE TABLE parser_map (entity_id INTEGER);

                INSERT INTO node VALUES (1, 'article', 'Hello', 1, 100, 200);
                INSERT INTO node VALUES (2, 'article', 'Imported', 1, 100, 200);
                INSERT INTO field_data_body VALUES
                    (1, '<div><img src="public://inline.png"></div>', 'full_html');
                INSERT INTO field_data_field_tags VALUES (1, 0, 20);
                INSERT INTO field_data_field_image VALUES (1, 0, 31), (1, 1, 32);
                INSERT INTO taxonomy_term_data VALUES (20, 'News', 3);
                INSERT INTO file_managed VALUES
                    (31, 'photo.jpg', 'public://2021/photo.jpg'),
                    (32, 'gone.jpg', 'public://2021/gone.jpg');
                INSERT INTO url_alias VALUES ('node/1', 'news/hello', 'und');
                INSERT INTO parser_map VALUES (2);
                "#,
            )
            .unwrap();
            fx
        }

        fn config(&self) -> MigrationConfig {
            MigrationConfig::new(
                FilesBase::Local(self.source_files.path().to_path_buf()),
                self.dest_files.path(),
                "https://new.example.org/files",
            )
        }

        fn run(
            &self,
            config: &MigrationConfig,
            mapping: &MappingStore,
            store: &SqliteDestination,
        ) -> MigrationReport {
            let reader =
                open_reader(SchemaVariant::Flat, self.source_db.path().join("source.db")).unwrap();
            let fetcher = ResourceFetcher::new(config.files_base.clone()).unwrap();
            let migrator =
                ArticleMigrator::new(config, reader.as_ref(), mapping, store, store, &fetcher);
            migrator.run().unwrap()
        }
    }

    fn mapping_store() -> MappingStore {
        MappingStore::with_connection(Connection::open_in_memory().unwrap(), "test").unwrap()
    }

    #[test]
    fn test_blank_title_is_not_eligible() {
        let fx = Fixture::new();
        let src = Connection::open(fx.source_db.path().join("source.db")).unwrap();
        src.execute(
            "INSERT INTO node VALUES (5, 'article', '  ', 1, 100, 200)",
            [],
        )
        .unwrap();
        drop(src);

        let config = fx.config();
        let mapping = mapping_store();
        let store =
            SqliteDestination::with_connection(Connection::open_in_memory().unwrap(), false)
                .unwrap();
        let report = fx.run(&config, &mapping, &store);

        assert_eq!(report.skipped_not_eligible, 1);
        assert_eq!(report.failed, 0);
        assert!(mapping.lookup(EntityKind::Node, "5").unwrap().is_none());
    }

    #[test]
    fn test_first_run_creates_everything() {
        let fx = Fixture::new();
        let config = fx.config();
        let mapping = mapping_store();
        let store =
            SqliteDestination::with_connection(Connection::open_in_memory().unwrap(), false)
                .unwrap();
        let report = fx.run(&config, &mapping, &store);

        assert_eq!(report.created, 1);
        assert_eq!(report.skipped_excluded, 1);
        assert_eq!(report.failed, 0);

        let dest_id = mapping.lookup(EntityKind::Node, "1").unwrap().unwrap();
        let article = EntityStore::load(&store, EntityKind::Node, dest_id)
            .unwrap()
            .unwrap();
        assert_eq!(field_str(&article, "title"), Some("Hello"));
        assert_eq!(field_i64(&article, "created"), Some(100));

        // Inline image rewritten to its new home, wrapper div promoted.
        let body = field_str(&article, "body_value").unwrap();
        assert!(body.contains("body_images/1/inline.png"), "body: {body}");
        assert!(!body.contains("public://"), "body: {body}");
        assert!(body.starts_with("<p>"), "body: {body}");
        assert!(fx
            .dest_files
            .path()
            .join("body_images/1/inline.png")
            .exists());

        // One tag, one surviving attached image (the missing one drops).
        assert_eq!(field_ids(&article, "tags").len(), 1);
        assert_eq!(field_ids(&article, "images").len(), 1);
        assert!(fx.dest_files.path().join("2021/photo.jpg").exists());

        // Alias carried over onto the destination id.
        let alias = AliasStore::find_by_path(&store, &format!("/node/{dest_id}"))
            .unwrap()
            .unwrap();
        assert_eq!(alias.alias, "/news/hello");
        assert_eq!(alias.langcode, "en");
    }

    #[test]
    fn test_second_run_skips_migrated_articles() {
        let fx = Fixture::new();
        let config = fx.config();
        let mapping = mapping_store();
        let store =
            SqliteDestination::with_connection(Connection::open_in_memory().unwrap(), false)
                .unwrap();
        fx.run(&config, &mapping, &store);
        let second = fx.run(&config, &mapping, &store);

        assert_eq!(second.created, 0);
        assert_eq!(second.skipped_existing, 1);
        // No duplicate article appeared.
        assert_eq!(mapping.all_dest_ids(EntityKind::Node).unwrap().len(), 1);
    }

    #[test]
    fn test_update_mode_rewrites_in_place() {
        let fx = Fixture::new();
        let mut config = fx.config();
        let mapping = mapping_store();
        let store =
            SqliteDestination::with_connection(Connection::open_in_memory().unwrap(), false)
                .unwrap();
        fx.run(&config, &mapping, &store);
        let dest_id = mapping.lookup(EntityKind::Node, "1").unwrap().unwrap();

        // Source title changes between runs.
        let conn = Connection::open(fx.source_db.path().join("source.db")).unwrap();
        conn.execute("UPDATE node SET title = 'Hello again' WHERE nid = 1", [])
            .unwrap();

        config.update_existing = true;
        let report = fx.run(&config, &mapping, &store);
        assert_eq!(report.updated, 1);
        assert_eq!(report.created, 0);

        let article = EntityStore::load(&store, EntityKind::Node, dest_id)
            .unwrap()
            .unwrap();
        assert_eq!(field_str(&article, "title"), Some("Hello again"));
        // Still exactly one destination article.
        assert_eq!(mapping.all_dest_ids(EntityKind::Node).unwrap().len(), 1);
    }

    #[test]
    fn test_update_mode_can_preserve_destination_references() {
        let fx = Fixture::new();
        let mut config = fx.config();
        let mapping = mapping_store();
        let store =
            SqliteDestination::with_connection(Connection::open_in_memory().unwrap(), false)
                .unwrap();
        fx.run(&config, &mapping, &store);
        let dest_id = mapping.lookup(EntityKind::Node, "1").unwrap().unwrap();

        // An editor retagged the article at the destination.
        let patch = serde_json::json!({"tags": [777]}).as_object().unwrap().clone();
        EntityStore::update(&store, EntityKind::Node, dest_id, &patch).unwrap();

        config.update_existing = true;
        config.refresh_references = false;
        fx.run(&config, &mapping, &store);

        let article = EntityStore::load(&store, EntityKind::Node, dest_id)
            .unwrap()
            .unwrap();
        assert_eq!(field_ids(&article, "tags"), vec![777]);
    }

    #[test]
    fn test_unknown_author_left_unset() {
        let fx = Fixture::new();
        // Normalized layout so articles carry an author uid.
        let conn = Connection::open(fx.source_db.path().join("normalized.db")).unwrap();
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

            INSERT INTO node_field_data VALUES (10, 'article', 'By 7', 1, 1, 2, 7);
            INSERT INTO node_field_data VALUES (11, 'article', 'By ghost', 1, 1, 2, 999);
            INSERT INTO node__field_video VALUES
                (10, 'https://vimeo.com/123456');
            "#,
        )
        .unwrap();
        drop(conn);

        let config = fx.config();
        let mapping = mapping_store();
        let store =
            SqliteDestination::with_connection(Connection::open_in_memory().unwrap(), false)
                .unwrap();
        store.add_user(7, "editor").unwrap();

        let reader = open_reader(
            SchemaVariant::Normalized,
            fx.source_db.path().join("normalized.db"),
        )
        .unwrap();
        let fetcher = ResourceFetcher::new(config.files_base.clone()).unwrap();
        let migrator =
            ArticleMigrator::new(&config, reader.as_ref(), &mapping, &store, &store, &fetcher);
        let report = migrator.run().unwrap();
        assert_eq!(report.created, 2);

        let by_seven = mapping.lookup(EntityKind::Node, "10").unwrap().unwrap();
        let by_ghost = mapping.lookup(EntityKind::Node, "11").unwrap().unwrap();
        let a = EntityStore::load(&store, EntityKind::Node, by_seven)
            .unwrap()
            .unwrap();
        let b = EntityStore::load(&store, EntityKind::Node, by_ghost)
            .unwrap()
            .unwrap();
        assert_eq!(field_i64(&a, "author"), Some(7));
        assert_eq!(field_i64(&b, "author"), None);

        // The video embed landed in the body, untouched by cleanup.
        let body = field_str(&a, "body_value").unwrap();
        assert!(body.contains("player.vimeo.com/video/123456"), "body: {body}");
    }

    #[test]
    fn test_domain_assignment_requires_destination_support() {
        let fx = Fixture::new();
        let mut config = fx.config();
        config.domains = vec!["site_a".into(), "site_b".into()];

        // Plain destination: configuration ignored, run still succeeds.
        let mapping = mapping_store();
        let plain =
            SqliteDestination::with_connection(Connection::open_in_memory().unwrap(), false)
                .unwrap();
        let report = fx.run(&config, &mapping, &plain);
        assert_eq!(report.created, 1);

        // Domain-capable destination: scopes and canonical assigned.
        let mapping = mapping_store();
        let scoped =
            SqliteDestination::with_connection(Connection::open_in_memory().unwrap(), true)
                .unwrap();
        fx.run(&config, &mapping, &scoped);
        let dest_id = mapping.lookup(EntityKind::Node, "1").unwrap().unwrap();
        let article = EntityStore::load(&scoped, EntityKind::Node, dest_id)
            .unwrap()
            .unwrap();
        assert_eq!(field_str(&article, "title"), Some("Hello"));
    }
}
