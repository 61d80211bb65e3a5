//! artmig-core - Idempotent CMS article migration engine.
//!
//! This crate moves published articles, their taxonomy terms, attached
//! and inline files, and URL aliases from a legacy site database into a
//! destination content store, tracking every created entity in a
//! mapping table so repeat runs converge instead of duplicating.
//!
//! For the operator-facing command line, see the `artmig-cli` crate.
//!
//! # Example
//!
//! ```rust,ignore
//! use artmig_core::{
//!     ArticleMigrator, FilesBase, MappingStore, MigrationConfig,
//!     ResourceFetcher, SchemaVariant, SqliteDestination,
//! };
//!
//! fn main() -> artmig_core::Result<()> {
//!     let config = MigrationConfig::new(
//!         FilesBase::parse("https://old.example.org/sites/default/files")?,
//!         "/var/www/files",
//!         "https://new.example.org/files",
//!     );
//!     let reader = artmig_core::open_reader(SchemaVariant::Flat, "legacy.db")?;
//!     let mapping = MappingStore::open("mapping.db", "default")?;
//!     let store = SqliteDestination::open("dest.db")?;
//!     let fetcher = ResourceFetcher::new(config.files_base.clone())?;
//!
//!     let migrator =
//!         ArticleMigrator::new(&config, reader.as_ref(), &mapping, &store, &store, &fetcher);
//!     let report = migrator.run()?;
//!     println!("created {} articles", report.created);
//!     Ok(())
//! }
//! ```

pub mod assets;
pub mod config;
pub mod error;
pub mod fetch;
pub mod html;
pub mod mapping;
pub mod migrator;
pub mod reversal;
pub mod source;
pub mod store;
pub mod terms;
pub mod video;

// Re-export commonly used types
pub use assets::{AssetHandle, AssetTransfer, CollisionPolicy};
pub use config::{FilesBase, MigrationConfig, SchemaVariant};
pub use error::{MigrateError, Result};
pub use fetch::ResourceFetcher;
pub use mapping::{EntityKind, MappingEntry, MappingStore};
pub use migrator::{ArticleMigrator, MigrationReport, Outcome};
pub use reversal::{ClearReport, MigrationReverser};
pub use source::{open_reader, SourceArticleReader};
pub use store::{AliasEntry, AliasStore, EntityStore, Fields, SqliteDestination};
pub use terms::TermResolver;
