//! sweep CLI: run, inspect and manage resumable benchmark sweeps.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use benchsweep::{Ranking, ResultStore, SweepConfig, SweepEngine, SweepSummary};

/// Spaces above this size get a warning from `size` and `run`.
const LARGE_SPACE: u64 = 10_000;
/// Rows of the ranking printed after a run.
const RUN_REPORT_ROWS: usize = 5;

#[derive(Parser)]
#[command(
    name = "sweep",
    about = "Resumable parameter sweeps over benchmark binaries",
    version,
    author
)]
struct Cli {
    /// Also write JSON logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run (or resume) the sweep described by a YAML file
    Run {
        /// Sweep configuration file
        config: PathBuf,
        /// Result store (overrides `store` from the file)
        #[arg(long)]
        store: Option<PathBuf>,
        /// Benchmark binary (overrides `binary` from the file)
        #[arg(long)]
        binary: Option<String>,
        /// Extra flag passed to every invocation; repeatable
        #[arg(long = "extra-flag", allow_hyphen_values = true)]
        extra_flags: Vec<String>,
        /// Milliseconds between output scans
        #[arg(long)]
        scan_interval_ms: Option<u64>,
        /// Scans before a silent run is abandoned
        #[arg(long)]
        max_scans: Option<u32>,
        /// Markers needed before a run counts as measured
        #[arg(long)]
        required_samples: Option<usize>,
        /// Discard stored results and start over
        #[arg(long)]
        fresh: bool,
    },
    /// Show stored results ranked by aggregate throughput
    Report {
        /// Result store
        store: PathBuf,
        /// Best first
        #[arg(long, short)]
        reverse: bool,
        /// Only show the first N rows
        #[arg(long, short)]
        limit: Option<usize>,
        /// Output format
        #[arg(long, short, default_value = "table", value_parser = ["table", "json"])]
        format: String,
    },
    /// Merge all results of a store into another store
    Export {
        /// Source store
        store: PathBuf,
        /// Destination store (created if missing)
        target: PathBuf,
    },
    /// Remove every stored result
    Clear {
        /// Result store
        store: PathBuf,
        /// Actually delete (default: dry run)
        #[arg(long)]
        force: bool,
    },
    /// Count configurations and estimate the worst-case duration
    Size {
        /// Sweep configuration file
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_guard = init_tracing(cli.log_file.as_deref())?;

    let mut interrupted = false;
    match cli.command {
        Commands::Run {
            config,
            store,
            binary,
            extra_flags,
            scan_interval_ms,
            max_scans,
            required_samples,
            fresh,
        } => {
            let mut config = SweepConfig::load(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            if let Some(store) = store {
                config.store = store;
            }
            if let Some(binary) = binary {
                config.binary = binary;
            }
            config.extra_flags.extend(extra_flags);
            if let Some(ms) = scan_interval_ms {
                config.scan_interval_ms = ms;
            }
            if let Some(n) = max_scans {
                config.max_scans = n;
            }
            if let Some(n) = required_samples {
                config.required_samples = n;
            }
            config.validate()?;
            interrupted = cmd_run(config, fresh).await?;
        }
        Commands::Report {
            store,
            reverse,
            limit,
            format,
        } => {
            cmd_report(store, reverse, limit, format)?;
        }
        Commands::Export { store, target } => {
            cmd_export(store, target)?;
        }
        Commands::Clear { store, force } => {
            cmd_clear(store, force)?;
        }
        Commands::Size { config } => {
            cmd_size(config)?;
        }
    }

    if interrupted {
        drop(log_guard);
        std::process::exit(130);
    }
    Ok(())
}

fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact();

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("invalid log file path: {}", path.display()))?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            (Some(fmt::layer().json().with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .init();
    Ok(guard)
}

// ─── Command implementations ──────────────────────────────────────────────────

/// Returns whether the sweep was interrupted.
async fn cmd_run(config: SweepConfig, fresh: bool) -> Result<bool> {
    let space = config.space()?;
    let monitor = config.monitor()?;
    let store = ResultStore::open(&config.store)?;

    if fresh {
        let removed = store.clear()?;
        info!(removed, "Discarded previous results");
    }

    let total = space.total();
    let tested = store.size()?;
    if total > LARGE_SPACE {
        warn!(total, "Large configuration space; this sweep may take a very long time");
    }

    println!("Sweep");
    println!("   Binary:          {}", config.binary);
    println!("   Store:           {}", config.store.display());
    println!("   Configurations:  {}", total);
    println!("   Already tested:  {}", tested);
    println!();

    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} {msg}")?
            .progress_chars("=> "),
    );
    bar.set_position(tested.min(total));
    bar.enable_steady_tick(Duration::from_millis(200));

    let progress_bar = bar.clone();
    let engine = SweepEngine::start(space, store, monitor, move |p| {
        progress_bar.set_position(p.tested.min(p.total));
        progress_bar.set_message(format!("{:.0}%", p.fraction() * 100.0));
    })?;

    let cancel = engine.cancel_flag();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping the current benchmark");
            cancel.cancel();
        }
    });

    let completed = tokio::task::spawn_blocking(move || engine.wait()).await??;
    interrupt.abort();
    bar.finish_and_clear();

    print_summary(&completed.summary);
    let ranking = Ranking::from_store(&completed.store)?.reversed();
    if !ranking.is_empty() {
        println!();
        println!("── Best {} ──────────────────────────────", RUN_REPORT_ROWS.min(ranking.len()));
        println!("{}", ranking_table(&ranking, Some(RUN_REPORT_ROWS)));
    }
    let cancelled = completed.summary.cancelled;
    completed.store.close()?;

    if cancelled {
        println!("\nInterrupted. Run the same command again to resume.");
    }
    Ok(cancelled)
}

fn cmd_report(store: PathBuf, reverse: bool, limit: Option<usize>, format: String) -> Result<()> {
    if !store.exists() {
        bail!("Result store not found: {}", store.display());
    }
    let store = ResultStore::open(&store)?;
    let mut ranking = Ranking::from_store(&store)?;
    if reverse {
        ranking = ranking.reversed();
    }

    match format.as_str() {
        "json" => {
            let rows = &ranking.rows()[..limit.unwrap_or(usize::MAX).min(ranking.len())];
            println!("{}", serde_json::to_string_pretty(rows)?);
        }
        "table" => {
            if ranking.is_empty() {
                println!("No successful results in '{}'", store_label(&store));
            } else {
                println!("{}", ranking_table(&ranking, limit));
            }
            println!(
                "{} ranked, {} failed entries",
                ranking.len(),
                ranking.failed_entries()
            );
        }
        _ => bail!("Unknown format: {}", format),
    }

    store.close()?;
    Ok(())
}

fn cmd_export(store: PathBuf, target: PathBuf) -> Result<()> {
    if !store.exists() {
        bail!("Result store not found: {}", store.display());
    }
    let source = ResultStore::open(&store)?;
    let copied = source.export(&target)?;
    source.close()?;
    println!("Exported {} results to {}", copied, target.display());
    Ok(())
}

fn cmd_clear(store: PathBuf, force: bool) -> Result<()> {
    if !store.exists() {
        bail!("Result store not found: {}", store.display());
    }
    let handle = ResultStore::open(&store)?;
    let size = handle.size()?;

    if size == 0 {
        println!("Nothing to clear: {} is empty", store.display());
        return Ok(());
    }
    println!("Will remove {} result(s) from {}", size, store.display());
    if !force {
        println!("\nDry run. Use --force to actually delete.");
        return Ok(());
    }

    let removed = handle.clear()?;
    handle.close()?;
    println!("  ✓ Removed {}", removed);
    Ok(())
}

fn cmd_size(config: PathBuf) -> Result<()> {
    let config =
        SweepConfig::load(&config).with_context(|| format!("loading {}", config.display()))?;
    let space = config.space()?;
    let worst = config.worst_case_duration()?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["Axis", "Values"]);
    for axis in space.axes() {
        table.add_row([axis.name.as_str(), &axis.values.len().to_string()]);
    }
    println!("{}", table);
    println!("Configurations: {}", space.total());
    println!(
        "Worst case:     {} ({} per configuration)",
        format_duration(worst.as_secs_f64()),
        format_duration(config.worst_case_per_configuration().as_secs_f64())
    );
    if space.total() > LARGE_SPACE {
        warn!(total = space.total(), "Large configuration space");
    }
    Ok(())
}

// ─── Utilities ────────────────────────────────────────────────────────────────

fn print_summary(summary: &SweepSummary) {
    println!("── Summary ─────────────────────────────");
    println!("   Tested:     {}/{}", summary.tested, summary.total);
    println!("   New:        {}", summary.succeeded);
    println!("   Resumed:    {}", summary.resumed);
    println!(
        "   Failed:     {} (spawn {}, parse {}, early-exit {}, timeout {}, monitor {})",
        summary.failed(),
        summary.spawn_failures,
        summary.parse_failures,
        summary.early_exits,
        summary.timeouts,
        summary.monitor_failures
    );
    if !summary.failures.is_empty() {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(["Configuration", "Failure", "Reason"]);
        for failure in &summary.failures {
            table.add_row([
                failure.configuration.to_string(),
                failure.kind.to_string(),
                failure.reason.clone(),
            ]);
        }
        println!("{}", table);
    }
}

fn ranking_table(ranking: &Ranking, limit: Option<usize>) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["#", "Aggregate", "Samples", "Configuration", "Recorded"]);
    for (i, row) in ranking
        .rows()
        .iter()
        .take(limit.unwrap_or(usize::MAX))
        .enumerate()
    {
        let samples: Vec<String> = row.samples.iter().map(|s| s.to_string()).collect();
        table.add_row([
            (i + 1).to_string(),
            format!("{:.2}", row.aggregate),
            samples.join(", "),
            row.configuration.to_string(),
            row.recorded_at.format("%Y-%m-%d %H:%M").to_string(),
        ]);
    }
    table
}

fn store_label(store: &ResultStore) -> String {
    store
        .path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| ":memory:".to_string())
}

fn format_duration(secs: f64) -> String {
    let secs = secs as u64;
    let d = secs / 86_400;
    let h = (secs % 86_400) / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if d > 0 {
        format!("{}d {}h", d, h)
    } else if h > 0 {
        format!("{}h {}m", h, m)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}
