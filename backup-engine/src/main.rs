//! Backup Engine - Main entry point
//!
//! Deduplicating block-level backups to pluggable, optionally encrypted
//! backends.

use anyhow::Result;
use backup_engine::backend::{BackendPair, BackendUri, Destination};
use backup_engine::config::{Config, MaterializeOptions, PersistOptions};
use backup_engine::{commands, report, utils, EngineError};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Block size in bytes (overrides config)
    #[arg(long, global = true)]
    block_size: Option<usize>,

    /// Concurrent backend operations (overrides config)
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Shared secret for content and name encryption (overrides config)
    #[arg(long, global = true, env = "BACKUP_ENGINE_CRYPTO_KEY", hide_env_values = true)]
    crypto_key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up a directory tree under a new manifest label
    Persist {
        source: PathBuf,
        /// manifest-uri,label,data-uri
        destination: Destination,
        /// File listing blocks known to be stored already
        #[arg(long, value_name = "FILE")]
        skip_blocks: Option<PathBuf>,
        /// Do not seed known blocks from existing manifests
        #[arg(long)]
        no_scan_manifests: bool,
        /// Seed known blocks by listing the data backend
        #[arg(long = "continue")]
        continue_from_backend: bool,
    },
    /// Restore a manifest into a local directory
    Materialize {
        /// manifest-uri,label,data-uri
        source: Destination,
        destination: PathBuf,
        /// Restore only these paths
        filters: Vec<String>,
        /// Re-apply permissions, timestamps and ownership
        #[arg(long)]
        metadata: bool,
    },
    /// Compare a local tree with a manifest
    Verify {
        source: PathBuf,
        /// manifest-uri,label,data-uri
        descriptor: Destination,
        /// Also check that every referenced block is stored
        #[arg(long)]
        check_blocks: bool,
    },
    /// Delete blocks no manifest references
    GarbageCollect {
        /// manifest-uri,data-uri
        backends: BackendPair,
        #[arg(long)]
        dry_run: bool,
    },
    /// Summarize every manifest on a backend
    ListManifests { backend: BackendUri },
    /// List every object name on a backend
    ListFiles { backend: BackendUri },
    /// List blocks stored on a data backend
    ListBlocks { backend: BackendUri },
    /// List blocks no manifest references
    ListOrphans {
        /// manifest-uri,data-uri
        backends: BackendPair,
    },
    /// Count blocks shared by manifests
    CommonBlocks {
        backend: BackendUri,
        #[arg(required = true)]
        labels: Vec<String>,
    },
    /// Copy one stored block to a local file
    GetBlock {
        backend: BackendUri,
        name: String,
        local: Option<PathBuf>,
    },
    /// Print the entries of one manifest
    ShowManifest { backend: BackendUri, label: String },
    /// Exercise the storage contract against a backend
    TestBackend { backend: BackendUri },
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(block_size) = args.block_size {
        config.engine.block_size = block_size;
    }
    if let Some(concurrency) = args.concurrency {
        config.engine.concurrency = concurrency;
    }
    if let Some(key) = &args.crypto_key {
        config.crypto.key = Some(key.clone());
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::debug!("Starting backup-engine v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Persist {
            source,
            destination,
            skip_blocks,
            no_scan_manifests,
            continue_from_backend,
        } => {
            let mut options = PersistOptions::from_config(&config)?;
            // An explicit skip list replaces the manifest scan.
            options.scan_manifests = !no_scan_manifests && skip_blocks.is_none();
            options.skip_blocks_file = skip_blocks;
            options.continue_from_backend = continue_from_backend;
            let result = commands::persist(&config, &source, &destination, &options).await?;
            println!("{}", report::persist_summary(&result));
        }
        Command::Materialize {
            source,
            destination,
            filters,
            metadata,
        } => {
            let options = MaterializeOptions {
                filters,
                apply_metadata: metadata,
            };
            let result = commands::materialize(&config, &source, &destination, &options).await?;
            println!("{}", report::materialize_summary(&result));
        }
        Command::Verify {
            source,
            descriptor,
            check_blocks,
        } => {
            let result = commands::verify(&config, &source, &descriptor, check_blocks).await?;
            println!("{}", report::verify_summary(&result));
            if !result.is_clean() {
                return Err(EngineError::VerifyMismatch(result.differences.len()).into());
            }
        }
        Command::GarbageCollect { backends, dry_run } => {
            let result = commands::garbage_collect(&config, &backends, dry_run).await?;
            println!("{}", report::gc_summary(&result));
        }
        Command::ListManifests { backend } => {
            let (summaries, totals) = commands::list_manifests(&config, &backend).await?;
            println!("{}", report::manifest_table(&summaries, &totals));
        }
        Command::ListFiles { backend } => {
            for name in commands::list_files(&config, &backend).await? {
                println!("{name}");
            }
        }
        Command::ListBlocks { backend } => {
            for fp in commands::list_blocks(&config, &backend).await? {
                println!("{fp}");
            }
        }
        Command::ListOrphans { backends } => {
            for name in commands::list_orphans(&config, &backends).await? {
                println!("{name}");
            }
        }
        Command::CommonBlocks { backend, labels } => {
            let result = commands::common_blocks(&config, &backend, &labels).await?;
            println!("{}", report::common_blocks_summary(&result));
        }
        Command::GetBlock {
            backend,
            name,
            local,
        } => {
            let (path, bytes) =
                commands::get_block(&config, &backend, &name, local.as_deref()).await?;
            println!("Wrote {} to {}", report::format_bytes(bytes), path.display());
        }
        Command::ShowManifest { backend, label } => {
            let manifest = commands::show_manifest(&config, &backend, &label).await?;
            println!("{}", report::show_manifest_table(&manifest));
        }
        Command::TestBackend { backend } => {
            let result = commands::test_backend(&config, &backend).await?;
            println!("{}", report::backend_test_summary(&result));
            if !result.passed() {
                anyhow::bail!("{} backend check(s) failed", result.failures());
            }
        }
    }

    Ok(())
}
