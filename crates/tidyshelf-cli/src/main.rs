//! tidyshelf - migrate an unorganized comic collection into a normalized
//! library, driven by metadata confidence.
//!
//! Runs are dry by default and record their plan in a separate ledger;
//! `--apply` performs the copies.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tidyshelf_core::atomic::read_json;
use tidyshelf_core::ledger::short_id;
use tidyshelf_core::{
    scan_source, verify_library, BatchCoordinator, ComicInfoEnricher, Confidence, Defaults,
    EnrichmentSource, FilenameEnricher, Ledger, LibraryLayout, MigrationConfig, MigrationReport,
    Phase, RunMode, RunSummary, StaticEnrichment,
};
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "tidyshelf")]
#[command(about = "Confidence-driven migration for comic libraries")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan the source, then plan (default) or perform the migration
    Run(RunArgs),
    /// Show ledger contents by phase and confidence
    Status(StatusArgs),
    /// Write a JSON report for a ledger
    Report(ReportArgs),
    /// Rewrite a ledger with one line per item
    Compact(CompactArgs),
    /// Re-hash migrated copies and list files the ledger does not know
    Verify(VerifyArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Unorganized source tree (overrides the config file)
    source: Option<PathBuf>,

    /// Library root that receives Comics/, Manga/, Hentai/ and the holding areas
    target: Option<PathBuf>,

    /// Copy files; without this flag the run only records its plan
    #[arg(long)]
    apply: bool,

    /// Ledger file (default: <target>/.tidyshelf/ledger[.dry-run].jsonl)
    #[arg(long)]
    ledger: Option<PathBuf>,

    /// JSON migration config (default: <config dir>/tidyshelf/config.json if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON table of precomputed enrichment keyed by identity or file name
    #[arg(long)]
    enrichment: Option<PathBuf>,

    /// Do not read ComicInfo.xml tags from CBZ archives
    #[arg(long)]
    ignore_comicinfo: bool,

    /// Write a JSON report here when the run ends
    #[arg(long)]
    report: Option<PathBuf>,

    #[arg(long)]
    max_retries: Option<u32>,

    /// Concurrent enrich/score/resolve units
    #[arg(long)]
    eval_concurrency: Option<usize>,

    /// Concurrent copies
    #[arg(long)]
    copy_concurrency: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Send MEDIUM items to the best-guess folder
    #[arg(long)]
    best_guess_folder: bool,

    /// Extra free space (bytes) to keep on the target volume
    #[arg(long)]
    min_free_space: Option<u64>,
}

#[derive(Args, Debug)]
struct StatusArgs {
    /// Ledger file
    ledger: PathBuf,

    /// Only list items in this phase (e.g. mapped, failed)
    #[arg(long, value_parser = parse_phase)]
    phase: Option<Phase>,

    /// Only list items with this confidence (e.g. low)
    #[arg(long, value_parser = parse_confidence)]
    confidence: Option<Confidence>,

    /// Print matching records as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct ReportArgs {
    /// Ledger file
    ledger: PathBuf,

    /// Output path
    output: PathBuf,
}

#[derive(Args, Debug)]
struct CompactArgs {
    /// Ledger file
    ledger: PathBuf,

    /// Drop records produced by dry runs
    #[arg(long)]
    prune_simulated: bool,
}

#[derive(Args, Debug)]
struct VerifyArgs {
    /// Ledger file
    ledger: PathBuf,

    /// Library root the ledger migrated into
    target: PathBuf,

    /// Print the full result as JSON
    #[arg(long)]
    json: bool,
}

fn parse_phase(value: &str) -> std::result::Result<Phase, String> {
    let name = value.trim().to_uppercase().replace('-', "_");
    serde_json::from_value(serde_json::Value::String(name))
        .map_err(|_| format!("unknown phase `{}`", value))
}

fn parse_confidence(value: &str) -> std::result::Result<Confidence, String> {
    serde_json::from_value(serde_json::Value::String(value.trim().to_uppercase()))
        .map_err(|_| format!("unknown confidence `{}`", value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Status(args) => status(args),
        Command::Report(args) => report(args),
        Command::Compact(args) => compact(args),
        Command::Verify(args) => verify(args).await,
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join("tidyshelf").join("config.json"))
        .filter(|path| path.is_file())
}

/// Config file first, then positional paths, then flags.
fn build_config(args: &RunArgs) -> Result<MigrationConfig> {
    let config_path = args.config.clone().or_else(default_config_path);
    let from_file: Option<MigrationConfig> = match &config_path {
        Some(path) => {
            let config = read_json::<MigrationConfig>(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            if config.is_none() {
                bail!("Config file {} does not exist", path.display());
            }
            info!("Loaded config from {}", path.display());
            config
        }
        None => None,
    };

    let mut config = match (from_file, &args.source, &args.target) {
        (Some(mut config), source, target) => {
            if let Some(source) = source {
                config.source_root = source.clone();
            }
            if let Some(target) = target {
                config.layout = LibraryLayout::under(target);
            }
            config
        }
        (None, Some(source), Some(target)) => MigrationConfig::new(source, target),
        (None, _, _) => bail!("SOURCE and TARGET are required when no config file is given"),
    };

    config.mode = if args.apply {
        RunMode::Apply
    } else {
        RunMode::DryRun
    };
    if let Some(max_retries) = args.max_retries {
        config.max_retries = max_retries;
    }
    if let Some(evaluation) = args.eval_concurrency {
        config.concurrency.evaluation = evaluation;
    }
    if let Some(execution) = args.copy_concurrency {
        config.concurrency.execution = execution;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if args.best_guess_folder {
        config.best_guess_separate_folder = true;
    }
    if let Some(bytes) = args.min_free_space {
        config.min_free_space_bytes = bytes;
    }

    config.validate()?;
    Ok(config)
}

fn default_ledger_path(args: &RunArgs, config: &MigrationConfig) -> PathBuf {
    let target = args
        .target
        .clone()
        .or_else(|| config.layout.quarantine_root.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));
    let name = if config.mode.is_apply() {
        Defaults::LEDGER_FILE_NAME
    } else {
        Defaults::DRY_RUN_LEDGER_FILE_NAME
    };
    target.join(".tidyshelf").join(name)
}

async fn run(args: RunArgs) -> Result<()> {
    let config = build_config(&args)?;
    let ledger_path = args
        .ledger
        .clone()
        .unwrap_or_else(|| default_ledger_path(&args, &config));
    let ledger = Arc::new(Ledger::open(&ledger_path)?);
    if ledger.skipped_lines() > 0 {
        warn!(
            "{} unreadable ledger lines were skipped in {}",
            ledger.skipped_lines(),
            ledger_path.display()
        );
    }

    let fallback: Arc<dyn EnrichmentSource> = match &args.enrichment {
        Some(path) => {
            let table = StaticEnrichment::from_json_file(path)
                .with_context(|| format!("Failed to load enrichment {}", path.display()))?;
            info!("Loaded {} enrichment entries", table.len());
            Arc::new(table)
        }
        None => Arc::new(FilenameEnricher),
    };
    let enrichment: Arc<dyn EnrichmentSource> = if args.ignore_comicinfo {
        fallback
    } else {
        Arc::new(ComicInfoEnricher::new(fallback))
    };

    info!("Scanning {}", config.source_root.display());
    let root = config.source_root.clone();
    let entries =
        tokio::task::spawn_blocking(move || scan_source(&root, &Defaults::COMIC_EXTENSIONS))
            .await??;
    let discovery = ledger.discover(&config.source_root, &entries)?;
    for duplicate in &discovery.duplicates {
        warn!(
            "Duplicate content: {} is identical to {}",
            duplicate.path.display(),
            duplicate.original_path.display()
        );
    }

    let (progress_tx, mut progress_rx) = mpsc::channel::<tidyshelf_core::BatchProgress>(32);
    let progress = tokio::spawn(async move {
        while let Some(update) = progress_rx.recv().await {
            info!(
                "Batch {}/{} {:?}: {}/{} items done",
                update.batch, update.total_batches, update.stage, update.items_done, update.items_total
            );
        }
    });

    let coordinator =
        BatchCoordinator::new(config, ledger.clone(), enrichment).with_progress(progress_tx);
    let cancel = coordinator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight copies");
            cancel.cancel();
        }
    });

    let summary = coordinator.run().await;
    drop(coordinator);
    let _ = progress.await;
    let summary = summary?;

    println!("{}", summary);
    if let Some(path) = &args.report {
        MigrationReport::build(&ledger, summary)?.write(path)?;
    }
    Ok(())
}

fn status(args: StatusArgs) -> Result<()> {
    let ledger = Ledger::open(&args.ledger)?;
    let records = ledger.load()?;
    let mode = if records.iter().any(|r| r.simulated) {
        RunMode::DryRun
    } else {
        RunMode::Apply
    };
    println!("{}", RunSummary::snapshot(mode, &records));

    if args.phase.is_none() && args.confidence.is_none() {
        return Ok(());
    }
    let matching = ledger.filter(args.phase, args.confidence)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&matching)?);
        return Ok(());
    }
    for record in &matching {
        let target = record
            .final_target_path
            .as_ref()
            .or(record.planned_target_path.as_ref())
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<16} {:<8} {} -> {}",
            short_id(&record.identity),
            record.phase_state.as_str(),
            record.confidence.as_str(),
            record.relative_path.display(),
            target
        );
        if let Some(error) = record.last_error() {
            println!("              {}: {}", error.class, error.message);
        }
    }
    Ok(())
}

fn report(args: ReportArgs) -> Result<()> {
    let ledger = Ledger::open(&args.ledger)?;
    let records = ledger.load()?;
    let mode = if records.iter().any(|r| r.simulated) {
        RunMode::DryRun
    } else {
        RunMode::Apply
    };
    MigrationReport::build(&ledger, RunSummary::snapshot(mode, &records))?.write(&args.output)?;
    Ok(())
}

fn compact(args: CompactArgs) -> Result<()> {
    let ledger = Ledger::open(&args.ledger)?;
    let prune = args.prune_simulated;
    let stats = ledger.compact(|record| !(prune && record.simulated))?;
    println!(
        "Compacted {}: {} lines -> {} records ({} dropped)",
        args.ledger.display(),
        stats.lines_before,
        stats.records_kept,
        stats.records_dropped
    );
    Ok(())
}

async fn verify(args: VerifyArgs) -> Result<()> {
    let ledger = Ledger::open(&args.ledger)?;
    let records = ledger.load()?;
    let layout = LibraryLayout::under(&args.target);
    let report =
        tokio::task::spawn_blocking(move || verify_library(&records, &layout)).await??;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report);
        for item in &report.missing {
            println!("  missing    {}  {}", short_id(&item.identity), item.path.display());
        }
        for item in &report.corrupted {
            println!("  corrupted  {}  {}", short_id(&item.identity), item.path.display());
        }
        for path in &report.extra {
            println!("  extra      {}", path.display());
        }
    }
    if !report.is_clean() {
        bail!("Library does not match {}", args.ledger.display());
    }
    Ok(())
}
