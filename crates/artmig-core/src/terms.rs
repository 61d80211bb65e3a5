//! Taxonomy term migration.
//!
//! Terms are resolved lazily while articles migrate: a source term id
//! comes in, a destination term id comes out, and the mapping table
//! remembers the pair so repeat references and repeat runs collapse to
//! the same destination term.

use serde_json::json;
use tracing::{debug, warn};

use crate::config::MigrationConfig;
use crate::error::Result;
use crate::mapping::{EntityKind, MappingStore};
use crate::source::{SourceArticleReader, SourceTerm};
use crate::store::{AliasStore, EntityStore, Fields};

pub struct TermResolver<'a> {
    config: &'a MigrationConfig,
    mapping: &'a MappingStore,
    entities: &'a dyn EntityStore,
    aliases: &'a dyn AliasStore,
}

impl<'a> TermResolver<'a> {
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

    /// Resolves a source term id to a destination term id, creating the
    /// destination term if needed. Returns `None` for terms that are
    /// missing at the source or filtered out by configuration.
    pub fn resolve(&self, reader: &dyn SourceArticleReader, tid: i64) -> Result<Option<i64>> {
        let source_id = tid.to_string();
        if let Some(dest) = self.mapping.lookup(EntityKind::Term, &source_id)? {
            return Ok(Some(dest));
        }

        let Some(term) = reader.term(tid)? else {
            warn!(tid, "referenced term missing at source, dropping reference");
            return Ok(None);
        };
        if !self.eligible(&term) {
            debug!(tid, name = %term.name, "term filtered out");
            return Ok(None);
        }

        let vocabulary = term
            .bundle
            .clone()
            .unwrap_or_else(|| self.config.target_vocabulary.clone());

        // Reuse an existing destination term with the same name rather
        // than minting a duplicate.
        let dest_id = match self.entities.find_term(&term.name, &vocabulary)? {
            Some(existing) => {
                debug!(tid, dest_id = existing, name = %term.name, "reusing destination term");
                existing
            }
            None => {
                let fields = self.term_fields(&term, &vocabulary);
                let created = self.entities.create(EntityKind::Term, &fields)?;
                debug!(tid, dest_id = created, name = %term.name, "created destination term");
                created
            }
        };
        self.mapping.record(EntityKind::Term, &source_id, dest_id)?;
        self.migrate_alias(reader, tid, dest_id)?;
        Ok(Some(dest_id))
    }

    fn eligible(&self, term: &SourceTerm) -> bool {
        if let (Some(want), Some(have)) = (self.config.source_vocabulary, term.numeric_vocabulary) {
            if want != have {
                return false;
            }
        }
        !self
            .config
            .excluded_term_names
            .iter()
            .any(|n| n.eq_ignore_ascii_case(&term.name))
    }

    fn term_fields(&self, term: &SourceTerm, vocabulary: &str) -> Fields {
        let mut fields = Fields::new();
        fields.insert("name".into(), json!(term.name));
        fields.insert("vocabulary".into(), json!(vocabulary));
        if let Some(desc) = &term.description {
            fields.insert("description".into(), json!(desc));
        }
        fields.insert("weight".into(), json!(term.weight));
        let langcode = term
            .langcode
            .clone()
            .unwrap_or_else(|| self.config.default_langcode.clone());
        fields.insert("langcode".into(), json!(langcode));
        fields
    }

    /// Carries the source term's alias over. Alias failures never fail
    /// the term itself.
    fn migrate_alias(
        &self,
        reader: &dyn SourceArticleReader,
        tid: i64,
        dest_id: i64,
    ) -> Result<()> {
        let Some(alias) = reader.find_alias(EntityKind::Term, tid)? else {
            return Ok(());
        };
        let path = format!("/taxonomy/term/{dest_id}");
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
            warn!(tid, dest_id, error = %err, "term alias migration failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FilesBase, MigrationConfig};
    use crate::mapping::MappingStore;
    use crate::source::FlatSourceReader;
    use crate::store::SqliteDestination;
    use rusqlite::Connection;

    fn test_config() -> MigrationConfig {
        MigrationConfig::new(
            FilesBase::Local("/tmp/src-files".into()),
            "/tmp/dest-files",
            "https://example.org",
        )
    }

    fn flat_reader() -> FlatSourceReader {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE taxonomy_term_data (tid INTEGER, name TEXT, vid INTEGER);
            CREATE TABLE url_alias (source TEXT, alias TEXT, language TEXT);
            INSERT INTO taxonomy_term_data VALUES
                (20, 'News', 3),
                (21, 'Wrong Vocab', 5),
                (22, 'Uncategorized', 3),
                (23, 'Sports', 3);
            INSERT INTO url_alias VALUES ('taxonomy/term/20', 'topics/news', 'und');
            "#,
        )
        .unwrap();
        FlatSourceReader::new(conn).unwrap()
    }

    #[test]
    fn test_creates_term_and_records_mapping() {
        let config = test_config();
        let mapping =
            MappingStore::with_connection(Connection::open_in_memory().unwrap(), "test").unwrap();
        let store = SqliteDestination::with_connection(Connection::open_in_memory().unwrap(), false)
            .unwrap();
        let reader = flat_reader();
        let resolver = TermResolver::new(&config, &mapping, &store, &store);

        let dest = resolver.resolve(&reader, 20).unwrap().unwrap();
        assert_eq!(mapping.lookup(EntityKind::Term, "20").unwrap(), Some(dest));

        let fields = EntityStore::load(&store, EntityKind::Term, dest)
            .unwrap()
            .unwrap();
        assert_eq!(crate::store::field_str(&fields, "name"), Some("News"));
        assert_eq!(crate::store::field_str(&fields, "vocabulary"), Some("tags"));

        // Alias came along.
        let alias = resolver
            .aliases
            .find_by_path(&format!("/taxonomy/term/{dest}"))
            .unwrap()
            .unwrap();
        assert_eq!(alias.alias, "/topics/news");
    }

    #[test]
    fn test_collapses_duplicate_names() {
        let config = test_config();
        let mapping =
            MappingStore::with_connection(Connection::open_in_memory().unwrap(), "test").unwrap();
        let store = SqliteDestination::with_connection(Connection::open_in_memory().unwrap(), false)
            .unwrap();
        let reader = flat_reader();
        let resolver = TermResolver::new(&config, &mapping, &store, &store);

        let first = resolver.resolve(&reader, 20).unwrap().unwrap();
        // Pre-seed a same-named term at a different source id.
        let conn2 = Connection::open_in_memory().unwrap();
        conn2
            .execute_batch(
                r#"
                CREATE TABLE taxonomy_term_data (tid INTEGER, name TEXT, vid INTEGER);
                CREATE TABLE url_alias (source TEXT, alias TEXT, language TEXT);
                INSERT INTO taxonomy_term_data VALUES (99, 'News', 3);
                "#,
            )
            .unwrap();
        let other_reader = FlatSourceReader::new(conn2).unwrap();
        let second = resolver.resolve(&other_reader, 99).unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(mapping.lookup(EntityKind::Term, "99").unwrap(), Some(first));
    }

    #[test]
    fn test_resolve_is_idempotent_via_mapping() {
        let config = test_config();
        let mapping =
            MappingStore::with_connection(Connection::open_in_memory().unwrap(), "test").unwrap();
        let store = SqliteDestination::with_connection(Connection::open_in_memory().unwrap(), false)
            .unwrap();
        let reader = flat_reader();
        let resolver = TermResolver::new(&config, &mapping, &store, &store);

        let a = resolver.resolve(&reader, 23).unwrap().unwrap();
        let b = resolver.resolve(&reader, 23).unwrap().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_filters_wrong_vocabulary_and_excluded_names() {
        let mut config = test_config();
        config.excluded_term_names = vec!["uncategorized".into()];
        let mapping =
            MappingStore::with_connection(Connection::open_in_memory().unwrap(), "test").unwrap();
        let store = SqliteDestination::with_connection(Connection::open_in_memory().unwrap(), false)
            .unwrap();
        let reader = flat_reader();
        let resolver = TermResolver::new(&config, &mapping, &store, &store);

        assert_eq!(resolver.resolve(&reader, 21).unwrap(), None);
        assert_eq!(resolver.resolve(&reader, 22).unwrap(), None);
        // Missing terms drop silently too.
        assert_eq!(resolver.resolve(&reader, 404).unwrap(), None);
    }
}
