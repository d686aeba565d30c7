//! repograph - build and maintain a knowledge graph from source trees.
//!
//! Subcommands:
//! - `build`: incremental ingestion of one or more source directories
//! - `merge`: standalone document/code entity merge pass
//! - `status`: manifest and graph statistics

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use repograph_core::LineChunker;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use repograph_daemon::build::{BuildPipeline, BuildReport, BuildStatus, Collaborators};
use repograph_daemon::config::BuildConfig;
use repograph_daemon::embeddings::EmbeddingClient;
use repograph_daemon::error::BuildError;
use repograph_daemon::merge::{merges_by_survivor, MergeEngine, MergeReport};
use repograph_daemon::providers::{OpenAiEmbeddings, OpenAiExtractor};
use repograph_daemon::storage::{
    normalize_source_dirs, GraphBase, GraphStore, JsonManifest, ManifestStore, StorageLock, StorageSettings,
};

/// Incremental knowledge-graph builder for code and documentation.
#[derive(Parser, Debug)]
#[command(name = "repograph")]
#[command(author, version)]
#[command(about = "Incremental knowledge-graph builder for code and documentation")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ingest added and modified files, retract deleted ones
    Build {
        /// Source directories, comma separated. Defaults to the ones
        /// remembered in the storage settings.
        #[arg(long, value_delimiter = ',')]
        source_dir: Vec<String>,

        /// Directory holding the graph, manifest and configuration
        #[arg(long)]
        storage_dir: PathBuf,

        /// Skip the entity merge pass
        #[arg(long)]
        no_merge: bool,
    },

    /// Merge document entities with matching code entities
    Merge {
        #[arg(long)]
        storage_dir: PathBuf,
    },

    /// Show manifest and graph statistics
    Status {
        #[arg(long)]
        storage_dir: PathBuf,
    },
}

fn setup_logging(verbose: bool) {
    let filter = if verbose { "debug" } else { "info" };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false).compact())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();
}

/// Source directories as given on the command line, with `\` turned into `/`.
fn source_roots(dirs: &[String]) -> Vec<PathBuf> {
    normalize_source_dirs(dirs).into_iter().map(PathBuf::from).collect()
}

/// Command line directories win; otherwise fall back to the stored ones.
fn resolve_source_dirs(cli_dirs: &[String], stored: Option<&StorageSettings>) -> Result<Vec<String>> {
    let dirs = normalize_source_dirs(cli_dirs);
    if !dirs.is_empty() {
        return Ok(dirs);
    }
    match stored {
        Some(settings) if !settings.source_dirs.is_empty() => Ok(settings.source_dirs.clone()),
        _ => anyhow::bail!("No --source-dir given and none stored in the storage settings"),
    }
}

/// Remember `dirs` for later builds, keeping the stored name and description.
fn remember_source_dirs(storage_dir: &Path, stored: Option<StorageSettings>, dirs: &[String]) -> Result<()> {
    let settings = match stored {
        Some(settings) if settings.source_dirs == dirs => return Ok(()),
        Some(settings) => settings.with_source_dirs(dirs),
        None => StorageSettings::new(storage_dir, dirs),
    };
    settings
        .save(storage_dir)
        .with_context(|| format!("Failed to save settings in {:?}", storage_dir))
}

fn api_key(env_var: &str) -> Option<String> {
    match std::env::var(env_var) {
        Ok(key) if !key.trim().is_empty() => Some(key),
        _ => {
            warn!("{} is not set, requests are sent without credentials", env_var);
            None
        }
    }
}

fn embedding_client(config: &BuildConfig) -> Result<Arc<dyn EmbeddingClient>> {
    let client = OpenAiEmbeddings::new(&config.embedding, api_key(&config.embedding.api_key_env))
        .context("Failed to create embedding client")?;
    Ok(Arc::new(client))
}

fn collaborators(config: &BuildConfig) -> Result<Collaborators> {
    let mut collaborators = Collaborators::new(Arc::new(LineChunker::new(config.build.chunk_size)))
        .with_embeddings(embedding_client(config)?);
    if config.llm.enabled {
        let llm = OpenAiExtractor::new(&config.llm, api_key(&config.llm.api_key_env))
            .context("Failed to create LLM client")?;
        collaborators = collaborators.with_llm(Arc::new(llm));
    }
    Ok(collaborators)
}

fn open_storage(storage_dir: &Path) -> Result<(Arc<GraphBase>, Arc<JsonManifest>)> {
    std::fs::create_dir_all(storage_dir)
        .with_context(|| format!("Failed to create storage directory {:?}", storage_dir))?;
    let store = GraphBase::open_in_dir(storage_dir)
        .with_context(|| format!("Failed to open graph in {:?}", storage_dir))?;
    let manifest = JsonManifest::open_in_dir(storage_dir)
        .with_context(|| format!("Failed to open manifest in {:?}", storage_dir))?;
    Ok((Arc::new(store), Arc::new(manifest)))
}

fn load_config(storage_dir: &Path) -> Result<BuildConfig> {
    BuildConfig::load_strict(storage_dir).context("Invalid configuration")
}

async fn run_build(source_dir: &[String], storage_dir: &Path, no_merge: bool) -> Result<()> {
    let mut config = load_config(storage_dir)?;
    if no_merge {
        config.merge.enabled = false;
    }

    std::fs::create_dir_all(storage_dir)
        .with_context(|| format!("Failed to create storage directory {:?}", storage_dir))?;
    let _lock = StorageLock::acquire(storage_dir, "build").context("Storage directory is busy")?;
    let (store, manifest) = open_storage(storage_dir)?;

    let stored = StorageSettings::load(storage_dir).context("Failed to read storage settings")?;
    let dirs = resolve_source_dirs(source_dir, stored.as_ref())?;
    remember_source_dirs(storage_dir, stored, &dirs)?;

    let roots = source_roots(&dirs);
    info!("Building from {:?} into {:?}", roots, storage_dir);

    let pipeline = BuildPipeline::new(config.clone(), store, manifest, collaborators(&config)?);
    match pipeline.build_from_roots(&roots).await {
        Ok(report) => {
            print_build_report(&report);
            Ok(())
        }
        Err(BuildError::Aborted {
            cause,
            unresolved,
            committed,
            forced,
        }) => {
            eprintln!("Build aborted: {}", cause);
            eprintln!(
                "  {} file(s) committed, {} unresolved{}",
                committed.len(),
                unresolved.len(),
                if forced { " (forced shutdown)" } else { "" }
            );
            for path in &unresolved {
                eprintln!("  unresolved: {}", path);
            }
            anyhow::bail!("build aborted")
        }
        Err(e) => Err(e).context("Build failed"),
    }
}

async fn run_merge(storage_dir: &Path) -> Result<()> {
    let config = load_config(storage_dir)?;
    let _lock = StorageLock::acquire(storage_dir, "merge").context("Storage directory is busy")?;
    let (store, _) = open_storage(storage_dir)?;

    let engine = MergeEngine::from_config(&config)
        .context("Invalid merge exclusion rules")?
        .with_embeddings(embedding_client(&config)?);
    let cancel = CancellationToken::new();
    let store: Arc<dyn GraphStore> = store;
    let report = engine
        .run(store, None, &cancel)
        .await
        .context("Merge pass failed")?;
    print_merge_report(&report);
    Ok(())
}

fn run_status(storage_dir: &Path) -> Result<()> {
    let (store, manifest) = open_storage(storage_dir)?;
    let entries = manifest.load().context("Failed to read manifest")?;
    let stats = store.stats().context("Failed to read graph statistics")?;

    println!("Storage: {}", storage_dir.display());
    match StorageSettings::load(storage_dir).context("Failed to read storage settings")? {
        Some(settings) => {
            println!("  name:               {}", settings.name);
            if !settings.description.is_empty() {
                println!("  description:        {}", settings.description);
            }
            println!("  source directories: {}", settings.source_dirs.join(", "));
        }
        None => println!("  no stored settings"),
    }
    println!("  files in manifest:  {}", entries.len());
    println!("  files in graph:     {}", stats.file_count);
    println!("  entities:           {}", stats.entity_count);
    println!("  embedded entities:  {}", stats.embedded_entities);
    println!("  relations:          {}", stats.relation_count);
    println!("  chunks:             {}", stats.chunk_count);
    Ok(())
}

fn print_build_report(report: &BuildReport) {
    let label = match report.status {
        BuildStatus::Completed => "Build completed",
        BuildStatus::CompletedWithSkips => "Build completed with skipped files",
    };
    println!("{} in {:.1}s", label, report.duration.as_secs_f64());
    println!(
        "  added {}, modified {}, deleted {}, unchanged {}",
        report.added, report.modified, report.deleted, report.unchanged
    );
    println!(
        "  committed {}, removed {}, skipped {}",
        report.committed.len(),
        report.removed.len(),
        report.skipped.len()
    );
    for skipped in &report.skipped {
        println!("  skipped {} ({}): {}", skipped.path, skipped.class.as_str(), skipped.reason);
    }
    if let Some(merge) = &report.merge {
        print_merge_report(merge);
    }
    if let Some(error) = &report.merge_error {
        println!("  merge pass failed: {}", error);
    }
}

fn print_merge_report(report: &MergeReport) {
    println!(
        "Merge: {} document / {} code candidates, {} excluded, {} merged",
        report.document_candidates,
        report.code_candidates,
        report.excluded,
        report.merged.len()
    );
    for (survivor, superseded) in merges_by_survivor(report) {
        println!("  {} <- {}", survivor, superseded.join(", "));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Build {
            source_dir,
            storage_dir,
            no_merge,
        } => run_build(&source_dir, &storage_dir, no_merge).await,
        Commands::Merge { storage_dir } => run_merge(&storage_dir).await,
        Commands::Status { storage_dir } => run_status(&storage_dir),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_roots_normalize_separators() {
        let roots = source_roots(&["src\\app".into(), " docs ".into(), "".into()]);
        assert_eq!(roots, vec![PathBuf::from("src/app"), PathBuf::from("docs")]);
    }

    #[test]
    fn test_cli_parses_comma_separated_sources() {
        let cli = Cli::try_parse_from([
            "repograph",
            "build",
            "--source-dir",
            "a,b",
            "--storage-dir",
            "out",
            "--no-merge",
        ])
        .unwrap();
        match cli.command {
            Commands::Build {
                source_dir,
                no_merge,
                ..
            } => {
                assert_eq!(source_dir, vec!["a", "b"]);
                assert!(no_merge);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_source_dir_is_optional() {
        let cli = Cli::try_parse_from(["repograph", "build", "--storage-dir", "out"]).unwrap();
        match cli.command {
            Commands::Build { source_dir, .. } => assert!(source_dir.is_empty()),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_stored_source_dirs_are_the_fallback() {
        let stored = StorageSettings::new(Path::new("graphs/app"), &["src".into(), "docs".into()]);

        let dirs = resolve_source_dirs(&[], Some(&stored)).unwrap();
        assert_eq!(dirs, vec!["src", "docs"]);

        let dirs = resolve_source_dirs(&["lib\\core".into()], Some(&stored)).unwrap();
        assert_eq!(dirs, vec!["lib/core"]);

        assert!(resolve_source_dirs(&[], None).is_err());
        assert!(resolve_source_dirs(&[" ".into()], Some(&stored.clone().with_source_dirs(&[]))).is_err());
    }

    #[test]
    fn test_remembered_source_dirs_keep_the_name() {
        let dir = tempfile::TempDir::new().unwrap();
        remember_source_dirs(dir.path(), None, &["src".into()]).unwrap();

        let mut stored = StorageSettings::load(dir.path()).unwrap().unwrap();
        stored.name = "renamed".into();
        remember_source_dirs(dir.path(), Some(stored), &["src".into(), "docs".into()]).unwrap();

        let reloaded = StorageSettings::load(dir.path()).unwrap().unwrap();
        assert_eq!(reloaded.name, "renamed");
        assert_eq!(reloaded.source_dirs, vec!["src", "docs"]);
    }
}
