//! Binary asset transfer into the destination files area.
//!
//! Bytes come from the [`ResourceFetcher`]; persistence writes them
//! under the destination files root and registers a `file` entity so the
//! content store knows about them. Every transferred asset is marked
//! permanent — the engine must never leave orphan entries behind for a
//! garbage collector to reap.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::PathsConfig;
use crate::error::{MigrateError, Result};
use crate::fetch::ResourceFetcher;
use crate::mapping::EntityKind;
use crate::store::{EntityStore, Fields};

/// What to do when the destination path already holds a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionPolicy {
    /// Overwrite in place. Used for field images, whose destination path
    /// is stable and where reuse is desired.
    Replace,
    /// Probe `stem_0.ext`, `stem_1.ext`, … until a free slot is found.
    /// Used for inline body images, where unrelated articles may carry
    /// identically named files that must not clobber each other.
    Rename,
}

/// Handle to a persisted destination asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetHandle {
    /// Destination file entity id.
    pub id: i64,
    /// Stored URI (`public://<relative>`).
    pub uri: String,
    /// Publicly resolvable URL.
    pub url: String,
}

/// Fetch-and-persist service for one migration run.
pub struct AssetTransfer<'a> {
    fetcher: &'a ResourceFetcher,
    entities: &'a dyn EntityStore,
    files_root: &'a Path,
    public_base_url: &'a str,
}

impl<'a> AssetTransfer<'a> {
    pub fn new(
        fetcher: &'a ResourceFetcher,
        entities: &'a dyn EntityStore,
        files_root: &'a Path,
        public_base_url: &'a str,
    ) -> Self {
        Self {
            fetcher,
            entities,
            files_root,
            public_base_url: public_base_url.trim_end_matches('/'),
        }
    }

    /// Transfer a resource addressed relative to the files base.
    pub fn store_relative(
        &self,
        source_rel: &str,
        dest_rel: &str,
        policy: CollisionPolicy,
    ) -> Result<AssetHandle> {
        let bytes = self.fetcher.fetch_relative(source_rel)?;
        self.persist(&bytes, dest_rel, policy)
    }

    /// Transfer a resource addressed by an absolute URL.
    pub fn store_url(
        &self,
        url: &str,
        dest_rel: &str,
        policy: CollisionPolicy,
    ) -> Result<AssetHandle> {
        let bytes = self.fetcher.fetch_url(url)?;
        self.persist(&bytes, dest_rel, policy)
    }

    /// Destination path for an inline body image of one source article.
    pub fn body_image_dest(nid: i64, basename: &str) -> String {
        format!("{}/{}/{}", PathsConfig::BODY_IMAGES_DIR, nid, basename)
    }

    fn persist(&self, bytes: &[u8], dest_rel: &str, policy: CollisionPolicy) -> Result<AssetHandle> {
        let dest_rel = dest_rel.trim_start_matches('/');
        if dest_rel.is_empty() || dest_rel.split('/').any(|seg| seg == "..") {
            return Err(MigrateError::Other(format!(
                "refusing unsafe destination path {dest_rel:?}"
            )));
        }

        let final_rel = match policy {
            CollisionPolicy::Replace => dest_rel.to_string(),
            CollisionPolicy::Rename => self.free_slot(dest_rel),
        };
        let path: PathBuf = self.files_root.join(&final_rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MigrateError::io_with_path(e, parent))?;
        }
        std::fs::write(&path, bytes).map_err(|e| MigrateError::io_with_path(e, &path))?;

        let basename = final_rel.rsplit('/').next().unwrap_or(&final_rel);
        let uri = format!("{}{}", PathsConfig::PUBLIC_SCHEME, final_rel);
        let mut fields = Fields::new();
        fields.insert("uri".into(), uri.clone().into());
        fields.insert("filename".into(), basename.into());
        fields.insert("mime".into(), mime_for(basename).into());
        fields.insert("permanent".into(), true.into());
        let id = self.entities.create(EntityKind::File, &fields)?;

        let url = format!("{}/{}", self.public_base_url, final_rel);
        debug!(uri, id, "persisted asset");
        Ok(AssetHandle { id, uri, url })
    }

    /// First non-colliding variant of `dest_rel`.
    fn free_slot(&self, dest_rel: &str) -> String {
        if !self.files_root.join(dest_rel).exists() {
            return dest_rel.to_string();
        }
        let (dir, name) = match dest_rel.rsplit_once('/') {
            Some((dir, name)) => (Some(dir), name),
            None => (None, dest_rel),
        };
        let (stem, ext) = match name.rsplit_once('.') {
            Some((stem, ext)) => (stem, Some(ext)),
            None => (name, None),
        };
        for n in 0u32.. {
            let candidate_name = match ext {
                Some(ext) => format!("{stem}_{n}.{ext}"),
                None => format!("{stem}_{n}"),
            };
            let candidate = match dir {
                Some(dir) => format!("{dir}/{candidate_name}"),
                None => candidate_name,
            };
            if !self.files_root.join(&candidate).exists() {
                return candidate;
            }
        }
        unreachable!("u32 slot space exhausted");
    }
}

/// Minimal extension-based MIME sniff for file entity metadata.
fn mime_for(filename: &str) -> &'static str {
    let ext = filename
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}
