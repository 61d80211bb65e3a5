//! artmig - article migration command line.
//!
//! `artmig migrate` runs one idempotent migration pass from a legacy
//! site database into the destination store; `artmig clear` reverses a
//! previous migration using its mapping table.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use artmig_core::{
    open_reader, ArticleMigrator, FilesBase, MappingStore, MigrationConfig, MigrationReverser,
    ResourceFetcher, SchemaVariant, SqliteDestination,
};

#[derive(Parser, Debug)]
#[command(name = "artmig")]
#[command(about = "Idempotent CMS article migration")]
struct Cli {
    /// Enable debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Migrate source articles into the destination store
    Migrate(MigrateArgs),
    /// Delete everything a previous migration created
    Clear(ClearArgs),
}

#[derive(Args, Debug)]
struct MigrateArgs {
    /// Source schema layout
    #[arg(long, value_name = "flat|normalized")]
    schema: String,

    /// Source site SQLite database
    #[arg(long)]
    source: PathBuf,

    /// Destination store SQLite database
    #[arg(long)]
    dest: PathBuf,

    /// Mapping database path
    #[arg(long)]
    mapping: PathBuf,

    /// Mapping scope, one per source site
    #[arg(long, default_value = "default")]
    scope: String,

    /// Source files location: local directory or http(s) origin
    #[arg(long)]
    files_base: String,

    /// Destination public files root
    #[arg(long)]
    files_root: PathBuf,

    /// Public URL prefix for the destination files root
    #[arg(long)]
    public_url: String,

    /// Maximum articles to process (0 = all)
    #[arg(long, default_value = "0")]
    limit: usize,

    /// Update already-migrated articles instead of skipping them
    #[arg(long)]
    update_existing: bool,

    /// In update mode, keep destination-side tag/image edits
    #[arg(long)]
    keep_references: bool,

    /// Domain scopes to assign, comma separated; first becomes canonical
    #[arg(long, value_delimiter = ',')]
    domains: Vec<String>,

    /// Do not mark the first domain as canonical
    #[arg(long)]
    skip_canonical: bool,

    /// Flat schema: numeric source vocabulary eligible for migration
    #[arg(long)]
    source_vocabulary: Option<i64>,

    /// Disable the source vocabulary filter
    #[arg(long, conflicts_with = "source_vocabulary")]
    any_vocabulary: bool,

    /// Destination vocabulary when the source carries none
    #[arg(long, default_value = "tags")]
    target_vocabulary: String,

    /// Term name excluded from migration, repeatable
    #[arg(long = "exclude-term")]
    excluded_terms: Vec<String>,

    /// Language code used when the source has none
    #[arg(long, default_value = "en")]
    langcode: String,
}

#[derive(Args, Debug)]
struct ClearArgs {
    /// Destination store SQLite database
    #[arg(long)]
    dest: PathBuf,

    /// Mapping database path
    #[arg(long)]
    mapping: PathBuf,

    /// Mapping scope to clear
    #[arg(long, default_value = "default")]
    scope: String,

    /// Destination public files root
    #[arg(long)]
    files_root: PathBuf,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    yes: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.debug { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    match cli.command {
        Command::Migrate(args) => migrate(args),
        Command::Clear(args) => clear(args),
    }
}

fn migrate(args: MigrateArgs) -> Result<()> {
    let Some(schema) = SchemaVariant::from_str(&args.schema) else {
        bail!("unknown schema {:?}, expected flat or normalized", args.schema);
    };

    let mut config = MigrationConfig::new(
        FilesBase::parse(&args.files_base)?,
        args.files_root,
        args.public_url,
    );
    config.limit = args.limit;
    config.update_existing = args.update_existing;
    config.refresh_references = !args.keep_references;
    config.domains = args.domains;
    config.skip_canonical_domain = args.skip_canonical;
    if args.any_vocabulary {
        config.source_vocabulary = None;
    } else if let Some(vid) = args.source_vocabulary {
        config.source_vocabulary = Some(vid);
    }
    config.target_vocabulary = args.target_vocabulary;
    config.excluded_term_names = args.excluded_terms;
    config.default_langcode = args.langcode;

    let reader = open_reader(schema, &args.source)
        .with_context(|| format!("opening source database {}", args.source.display()))?;
    let mapping = MappingStore::open(&args.mapping, &args.scope)?;
    let store = SqliteDestination::open_with_domains(&args.dest, !config.domains.is_empty())?;
    let fetcher = ResourceFetcher::new(config.files_base.clone())?;

    info!(schema = %schema, source = %args.source.display(), "starting migration");
    let migrator =
        ArticleMigrator::new(&config, reader.as_ref(), &mapping, &store, &store, &fetcher);
    let report = migrator.run()?;

    println!(
        "migrated: {} created, {} updated, {} already migrated, {} excluded, {} not eligible, {} failed",
        report.created,
        report.updated,
        report.skipped_existing,
        report.skipped_excluded,
        report.skipped_not_eligible,
        report.failed
    );
    if report.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn clear(args: ClearArgs) -> Result<()> {
    if !args.yes && !confirm(&args.scope)? {
        println!("aborted");
        std::process::exit(1);
    }

    let mapping = MappingStore::open(&args.mapping, &args.scope)?;
    let store = SqliteDestination::open(&args.dest)?;
    // Reversal only needs the files root out of the run configuration.
    let config = MigrationConfig::new(
        FilesBase::Local(PathBuf::from(".")),
        args.files_root,
        "http://unused.invalid",
    );

    let reverser = MigrationReverser::new(&config, &mapping, &store, &store);
    let report = reverser.clear()?;
    println!(
        "cleared: {} articles, {} terms, {} files, {} aliases, {} body images",
        report.articles, report.terms, report.files, report.aliases, report.body_images
    );
    Ok(())
}

fn confirm(scope: &str) -> Result<bool> {
    print!("delete all content migrated under scope {scope:?}? [y/N] ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}
