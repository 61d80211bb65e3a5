//! Run configuration and shared constants.

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::{MigrateError, Result};

/// Network-related constants.
pub struct NetworkConfig;

impl NetworkConfig {
    /// Per-request timeout for asset fetches. Fetches are not retried;
    /// a timed-out fetch degrades that one image/file to "skipped".
    pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
    pub const USER_AGENT: &'static str = "artmig/0.3";
}

/// Destination path conventions.
pub struct PathsConfig;

impl PathsConfig {
    /// Scheme prefix recorded on destination file entity URIs.
    pub const PUBLIC_SCHEME: &'static str = "public://";
    /// Directory (under the files root) holding inline body images,
    /// one subdirectory per source article id.
    pub const BODY_IMAGES_DIR: &'static str = "body_images";
}

/// Source path prefixes stripped before resolving a file against the
/// files base.
pub const KNOWN_URI_PREFIXES: &[&str] = &["public://", "private://", "sites/default/files/"];

/// Base location the source files are fetched from: either a directory
/// on the local filesystem or an HTTP(S) origin.
#[derive(Debug, Clone)]
pub enum FilesBase {
    Local(PathBuf),
    Http(Url),
}

impl FilesBase {
    /// Parse an operator-supplied location. An `http://`/`https://`
    /// prefix selects HTTP transfer; anything else is a local directory.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(MigrateError::Config {
                message: "files base location must not be empty".into(),
            });
        }
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            let url = Url::parse(trimmed).map_err(|e| MigrateError::Config {
                message: format!("invalid files base URL {trimmed}: {e}"),
            })?;
            Ok(FilesBase::Http(url))
        } else {
            Ok(FilesBase::Local(PathBuf::from(trimmed)))
        }
    }
}

/// Which legacy schema generation the source connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaVariant {
    /// Flat shared field tables (`node`, `field_data_*`).
    Flat,
    /// Per-field normalized tables (`node_field_data`, `node__*`).
    Normalized,
}

impl SchemaVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaVariant::Flat => "flat",
            SchemaVariant::Normalized => "normalized",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "flat" => Some(SchemaVariant::Flat),
            "normalized" => Some(SchemaVariant::Normalized),
            _ => None,
        }
    }
}

impl std::fmt::Display for SchemaVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Everything one migration run needs to know. Handed to the migrator
/// explicitly; no component reads ambient global state.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Where source file bytes live.
    pub files_base: FilesBase,
    /// Destination public files root on the local filesystem.
    pub files_root: PathBuf,
    /// Public URL prefix resolving paths under `files_root`.
    pub public_base_url: String,
    /// Maximum articles to process; 0 means all.
    pub limit: usize,
    /// Mutate already-migrated articles in place instead of skipping.
    pub update_existing: bool,
    /// In update mode, replace tag/image reference lists from the latest
    /// source state. Off preserves destination-side edits.
    pub refresh_references: bool,
    /// Domain scopes to assign each article to.
    pub domains: Vec<String>,
    /// Do not mark the first domain as canonical.
    pub skip_canonical_domain: bool,
    /// Flat-schema only: numeric source vocabulary that is eligible for
    /// migration. `None` disables the filter.
    pub source_vocabulary: Option<i64>,
    /// Destination vocabulary used when the source does not carry one.
    pub target_vocabulary: String,
    /// Term names excluded from migration outright.
    pub excluded_term_names: Vec<String>,
    /// Language code used when the source alias row has none.
    pub default_langcode: String,
}

impl MigrationConfig {
    pub fn new(
        files_base: FilesBase,
        files_root: impl Into<PathBuf>,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            files_base,
            files_root: files_root.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            limit: 0,
            update_existing: false,
            refresh_references: true,
            domains: Vec::new(),
            skip_canonical_domain: false,
            source_vocabulary: Some(3),
            target_vocabulary: "tags".to_string(),
            excluded_term_names: Vec::new(),
            default_langcode: "en".to_string(),
        }
    }
}
