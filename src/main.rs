//! # deck-sync CLI (`decksync`)
//!
//! The `decksync` binary reconciles a vocabulary spreadsheet with a local
//! Anki collection and produces a portable `.apkg` package on every run.
//!
//! ## Usage
//!
//! ```bash
//! decksync --config ./config/decksync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `decksync sync` | Fetch records, reconcile, package, write guids back |
//! | `decksync stats` | Print a summary of the local collection |
//!
//! ## Environment
//!
//! | Variable | Used for |
//! |----------|----------|
//! | `SHEETS_API_TOKEN` | Bearer token for the spreadsheet API |
//! | `ELEVENLABS_API_KEY` | Text-to-speech API key (when audio is enabled) |
//!
//! Exit status is non-zero when the collection is missing, when the run
//! fails fatally (transaction rolled back, no artifact), or when the guid
//! write-back batch fails after the artifact is already durable.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use deck_sync::audio::{AudioCache, HttpSynthesizer};
use deck_sync::config::{self, Config};
use deck_sync::engine::Engine;
use deck_sync::identity::IdAllocator;
use deck_sync::models::SourceRecord;
use deck_sync::record;
use deck_sync::sheets::{RecordSource, SheetsClient};
use deck_sync::stats;
use deck_sync::store::Collection;

/// deck-sync — reconcile a vocabulary spreadsheet with a local Anki
/// collection and produce a portable package.
#[derive(Parser)]
#[command(
    name = "decksync",
    about = "Sync spreadsheet vocabulary into an Anki package, preserving review history",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/decksync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one reconciliation: fetch, resolve, merge, synthesize, package,
    /// and write new guids back to the sheet.
    Sync {
        /// Fetch and validate records, then report counts without touching
        /// the store, the audio cache, or the sheet.
        #[arg(long)]
        dry_run: bool,
    },

    /// Print note/card/review counts for the local collection.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Sync { dry_run } => run_sync(&cfg, dry_run).await,
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
            Ok(())
        }
    }
}

async fn run_sync(cfg: &Config, dry_run: bool) -> Result<()> {
    let token = std::env::var("SHEETS_API_TOKEN")
        .context("SHEETS_API_TOKEN must be set to reach the spreadsheet API")?;
    let source = SheetsClient::new(cfg.source.sheet_id.clone(), token)?;

    let mut records: Vec<SourceRecord> = Vec::new();
    for tab in &cfg.source.tabs {
        let fetched = source.fetch(&tab.name, tab.kind).await?;
        records.extend(fetched);
    }

    if dry_run {
        let valid = records
            .iter()
            .filter(|r| record::normalize(r, &cfg.validation).is_ok())
            .count();
        println!("sync (dry-run)");
        println!("  records fetched: {}", records.len());
        println!("  records valid: {}", valid);
        println!("  records invalid: {}", records.len() - valid);
        return Ok(());
    }

    let audio = if cfg.audio.is_enabled() {
        let api_key = std::env::var("ELEVENLABS_API_KEY")
            .context("ELEVENLABS_API_KEY must be set when audio synthesis is enabled")?;
        let voice_id = cfg
            .audio
            .voice_id
            .clone()
            .expect("validated by load_config");
        let synthesizer =
            HttpSynthesizer::new(api_key, voice_id, cfg.audio.model_id.clone(), cfg.audio.timeout_secs)?;
        Arc::new(AudioCache::new(
            cfg.audio.media_dir.clone(),
            Arc::new(synthesizer),
            cfg.audio.concurrency,
        ))
    } else {
        Arc::new(AudioCache::disabled())
    };

    let mut store = Collection::open(&cfg.store.path).await?;

    let allocator = IdAllocator::new(chrono::Utc::now().timestamp_millis());
    let mut engine = Engine::new(allocator, audio);
    let outcome = engine.run(&mut store, cfg, records).await?;
    store.close().await?;

    outcome.stats.print_summary(&outcome.drift);
    println!("  package: {}", cfg.package.output.display());

    // The store commit and the package are durable at this point; a failed
    // write-back only means the next run re-resolves the same guids and
    // re-attempts the same batch.
    if let Err(e) = source.batch_write(&outcome.pending_writes).await {
        eprintln!("warning: local package and store are up to date, but the guid write-back failed");
        return Err(e).context("guid write-back batch failed");
    }

    println!("ok");
    Ok(())
}
