//! Migration reversal.
//!
//! Walks the mapping table backwards and deletes everything a previous
//! run created: articles, terms, file entities, aliases, transferred
//! bytes on disk, and finally the mapping rows themselves. Content the
//! migration never touched is left alone.

use std::fs;

use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{MigrationConfig, PathsConfig};
use crate::error::Result;
use crate::mapping::{EntityKind, MappingEntry, MappingStore};
use crate::store::{field_str, AliasStore, EntityStore};

/// Tally of one reversal run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ClearReport {
    pub articles: usize,
    pub terms: usize,
    pub files: usize,
    pub aliases: usize,
    pub body_images: usize,
}

pub struct MigrationReverser<'a> {
    config: &'a MigrationConfig,
    mapping: &'a MappingStore,
    entities: &'a dyn EntityStore,
    aliases: &'a dyn AliasStore,
}

impl<'a> MigrationReverser<'a> {
    pub fn new(
        config: &'a MigrationConfig,
        mapping: &'a MappingStore,
        entities: &'a dyn EntityStore,
        aliases: &'a dyn AliasStore,
    ) -> Self {
        Self {
            config,
            mapping,
            entities,
            aliases,
        }
    }

    pub fn clear(&self) -> Result<ClearReport> {
        let mut report = ClearReport::default();

        for entry in self.mapping.entries(EntityKind::Node)? {
            report.body_images += self.clear_body_images(&entry)?;
            report.aliases += self
                .aliases
                .delete_by_path(&format!("/node/{}", entry.dest_id))?;
            self.entities.delete(EntityKind::Node, entry.dest_id)?;
            report.articles += 1;
        }

        for entry in self.mapping.entries(EntityKind::Term)? {
            report.aliases += self
                .aliases
                .delete_by_path(&format!("/taxonomy/term/{}", entry.dest_id))?;
            self.entities.delete(EntityKind::Term, entry.dest_id)?;
            report.terms += 1;
        }

        for entry in self.mapping.entries(EntityKind::File)? {
            self.remove_transferred_file(&entry)?;
            self.entities.delete(EntityKind::File, entry.dest_id)?;
            report.files += 1;
        }

        let mapping_rows = self.mapping.delete_all()?;
        debug!(mapping_rows, "mapping table cleared");
        info!(
            articles = report.articles,
            terms = report.terms,
            files = report.files,
            aliases = report.aliases,
            body_images = report.body_images,
            "reversal finished"
        );
        Ok(report)
    }

    /// Inline body images are keyed by source article id on disk, so
    /// the sweep uses the mapping entry's source side. Rename-policy
    /// siblings (`photo_1.jpg`) live in the same directory and go with
    /// it.
    fn clear_body_images(&self, entry: &MappingEntry) -> Result<usize> {
        let dir = self
            .config
            .files_root
            .join(PathsConfig::BODY_IMAGES_DIR)
            .join(&entry.source_id);
        if !dir.is_dir() {
            return Ok(0);
        }

        let mut removed = 0;
        for item in WalkDir::new(&dir).into_iter().filter_map(|e| e.ok()) {
            if !item.file_type().is_file() {
                continue;
            }
            if let Ok(rel) = item.path().strip_prefix(&self.config.files_root) {
                let uri = format!("{}{}", PathsConfig::PUBLIC_SCHEME, rel.display());
                if let Some(fid) = self.entities.find_file_by_uri(&uri)? {
                    self.entities.delete(EntityKind::File, fid)?;
                }
            }
            if let Err(err) = fs::remove_file(item.path()) {
                warn!(path = %item.path().display(), error = %err, "could not remove body image");
                continue;
            }
            removed += 1;
        }
        if let Err(err) = fs::remove_dir_all(&dir) {
            warn!(path = %dir.display(), error = %err, "could not remove body image directory");
        }
        Ok(removed)
    }

    /// Removes the transferred bytes of a mapped attached file. Entity
    /// deletion proceeds even when the bytes are already gone.
    fn remove_transferred_file(&self, entry: &MappingEntry) -> Result<()> {
        let Some(fields) = self.entities.load(EntityKind::File, entry.dest_id)? else {
            return Ok(());
        };
        let Some(uri) = field_str(&fields, "uri") else {
            return Ok(());
        };
        let rel = uri.strip_prefix(PathsConfig::PUBLIC_SCHEME).unwrap_or(uri);
        let path = self.config.files_root.join(rel);
        if path.is_file() {
            if let Err(err) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %err, "could not remove transferred file");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FilesBase, MigrationConfig};
    use crate::store::SqliteDestination;
    use rusqlite::Connection;
    use serde_json::json;
    use std::path::Path;
    use tempfile::TempDir;

    fn seed_file(store: &SqliteDestination, uri: &str) -> i64 {
        let fields = json!({"uri": uri, "permanent": true})
            .as_object()
            .unwrap()
            .clone();
        EntityStore::create(store, EntityKind::File, &fields).unwrap()
    }

    fn write_disk(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"bytes").unwrap();
    }

    #[test]
    fn test_clear_removes_migrated_state_only() {
        let files = TempDir::new().unwrap();
        let root = files.path().to_path_buf();
        let config = MigrationConfig::new(FilesBase::Local("/unused".into()), &root, "https://n/f");
        let mapping =
            MappingStore::with_connection(Connection::open_in_memory().unwrap(), "test").unwrap();
        let store =
            SqliteDestination::with_connection(Connection::open_in_memory().unwrap(), false)
                .unwrap();

        // Migrated article with an attached file, a body image and an alias.
        let article = json!({"title": "Migrated", "tags": [], "images": []})
            .as_object()
            .unwrap()
            .clone();
        let article_id = EntityStore::create(&store, EntityKind::Node, &article).unwrap();
        mapping
            .record(EntityKind::Node, "41", article_id)
            .unwrap();
        AliasStore::create(&store, &format!("/node/{article_id}"), "/news/migrated", "en").unwrap();

        let term = json!({"name": "News", "vocabulary": "tags"})
            .as_object()
            .unwrap()
            .clone();
        let term_id = EntityStore::create(&store, EntityKind::Term, &term).unwrap();
        mapping.record(EntityKind::Term, "20", term_id).unwrap();

        let attached = seed_file(&store, "public://2021/photo.jpg");
        mapping.record(EntityKind::File, "31", attached).unwrap();
        write_disk(&root, "2021/photo.jpg");

        let inline = seed_file(&store, "public://body_images/41/inline.png");
        write_disk(&root, "body_images/41/inline.png");
        // Inline images are swept by directory, never mapped.
        let _ = inline;

        // Hand-authored content that must survive.
        let native = json!({"title": "Native"}).as_object().unwrap().clone();
        let native_id = EntityStore::create(&store, EntityKind::Node, &native).unwrap();
        AliasStore::create(&store, &format!("/node/{native_id}"), "/native", "en").unwrap();
        write_disk(&root, "untouched/manual.jpg");

        let reverser = MigrationReverser::new(&config, &mapping, &store, &store);
        let report = reverser.clear().unwrap();
        assert_eq!(report.articles, 1);
        assert_eq!(report.terms, 1);
        assert_eq!(report.files, 1);
        assert_eq!(report.body_images, 1);
        assert_eq!(report.aliases, 1);

        assert!(EntityStore::load(&store, EntityKind::Node, article_id)
            .unwrap()
            .is_none());
        assert!(EntityStore::load(&store, EntityKind::Term, term_id)
            .unwrap()
            .is_none());
        assert!(EntityStore::load(&store, EntityKind::File, attached)
            .unwrap()
            .is_none());
        assert!(EntityStore::load(&store, EntityKind::File, inline)
            .unwrap()
            .is_none());
        assert!(store
            .find_by_path(&format!("/node/{article_id}"))
            .unwrap()
            .is_none());
        assert!(!root.join("2021/photo.jpg").exists());
        assert!(!root.join("body_images/41").exists());

        // Untouched content survives in full.
        assert!(EntityStore::load(&store, EntityKind::Node, native_id)
            .unwrap()
            .is_some());
        assert!(store
            .find_by_path(&format!("/node/{native_id}"))
            .unwrap()
            .is_some());
        assert!(root.join("untouched/manual.jpg").exists());

        // Mapping emptied: a fresh clear is a no-op.
        let empty = reverser.clear().unwrap();
        assert_eq!(empty.articles, 0);
        assert_eq!(empty.files, 0);
    }

    #[test]
    fn test_clear_tolerates_already_missing_bytes() {
        let files = TempDir::new().unwrap();
        let config = MigrationConfig::new(
            FilesBase::Local("/unused".into()),
            files.path(),
            "https://n/f",
        );
        let mapping =
            MappingStore::with_connection(Connection::open_in_memory().unwrap(), "test").unwrap();
        let store =
            SqliteDestination::with_connection(Connection::open_in_memory().unwrap(), false)
                .unwrap();

        let attached = seed_file(&store, "public://gone/file.pdf");
        mapping.record(EntityKind::File, "31", attached).unwrap();

        let reverser = MigrationReverser::new(&config, &mapping, &store, &store);
        let report = reverser.clear().unwrap();
        assert_eq!(report.files, 1);
        assert!(EntityStore::load(&store, EntityKind::File, attached)
            .unwrap()
            .is_none());
    }
}
