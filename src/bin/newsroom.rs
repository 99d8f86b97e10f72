//! newsroom CLI — multi-source article ingestion with MCP server.
//!
//! Usage:
//!   newsroom run --from 2026-02-20 [--to 2026-02-21] --source hackernews [--all-feeds]
//!   newsroom status|tasks|cancel|retry <run-id>
//!   newsroom runs [--limit 20]
//!   newsroom enrich-pending|retry-enrichment [--from D] [--to D]
//!   newsroom reconcile
//!   newsroom mcp

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use newsroom::config::Config;
use newsroom::pipeline::{Orchestrator, RunObserver};
use newsroom::run::{FeedSelection, Run, RunId, RunStatus, SourceSelection, TaskUnit};
use newsroom::storage::{DateRange, OpenStore, RunStore, SqliteStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "newsroom",
    version,
    about = "Multi-source article ingestion with deduplication and AI enrichment"
)]
struct Cli {
    /// Path to the YAML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Path to SQLite database file (overrides the config)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a date range and wait for it to finish
    Run {
        /// First digest date (YYYY-MM-DD)
        #[arg(long)]
        from: NaiveDate,
        /// Last digest date (defaults to --from)
        #[arg(long)]
        to: Option<NaiveDate>,
        /// Source id to ingest from (repeatable)
        #[arg(long = "source")]
        sources: Vec<String>,
        /// Include every configured feed
        #[arg(long)]
        all_feeds: bool,
        /// Include one configured feed (repeatable)
        #[arg(long = "feed", conflicts_with = "all_feeds")]
        feeds: Vec<String>,
    },
    /// Show a run's status and progress
    Status {
        run_id: RunId,
        /// Print the raw run record as JSON
        #[arg(long)]
        json: bool,
    },
    /// List a run's task units
    Tasks { run_id: RunId },
    /// List recent runs
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Request cancellation of a run
    Cancel { run_id: RunId },
    /// Re-run failed task units of a finished run
    Retry {
        run_id: RunId,
        /// Retry only the unit for this source (requires --date)
        #[arg(long, requires = "date")]
        source: Option<String>,
        #[arg(long, requires = "source")]
        date: Option<NaiveDate>,
    },
    /// Enrich articles still pending
    EnrichPending(RangeArgs),
    /// Retry articles whose enrichment failed
    RetryEnrichment(RangeArgs),
    /// Close out runs left queued/running by a process that exited
    Reconcile,
    /// Start the MCP (Model Context Protocol) server
    Mcp {
        /// Transport type (currently only stdio)
        #[arg(long, default_value = "stdio")]
        transport: String,
    },
}

#[derive(Args)]
struct RangeArgs {
    #[arg(long)]
    from: Option<NaiveDate>,
    #[arg(long, requires = "from")]
    to: Option<NaiveDate>,
}

impl RangeArgs {
    fn range(&self) -> Option<DateRange> {
        self.from
            .map(|from| DateRange::new(from, self.to.unwrap_or(from)))
    }
}

/// Prints one line per finished unit.
struct ProgressPrinter;

impl RunObserver for ProgressPrinter {
    fn on_task_finished(&self, task: &TaskUnit) {
        match &task.error_message {
            Some(err) => eprintln!("  {} {} {}: {}", task.date, task.source, task.status, err),
            None => eprintln!(
                "  {} {} {} ({} saved)",
                task.date, task.source, task.status, task.articles_saved
            ),
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_store(config: &Config) -> Result<Arc<SqliteStore>, String> {
    let path = config.db_path();
    SqliteStore::open(&path)
        .map(Arc::new)
        .map_err(|e| format!("failed to open database at {}: {}", path.display(), e))
}

fn build_orchestrator(config: &Config, observer: Option<Arc<dyn RunObserver>>) -> Result<Orchestrator, String> {
    let store = open_store(config)?;
    let mut builder = Orchestrator::from_config(config, store).map_err(|e| e.to_string())?;
    if let Some(observer) = observer {
        builder = builder.observer(observer);
    }
    Ok(builder.build())
}

fn runtime() -> Result<tokio::runtime::Runtime, String> {
    tokio::runtime::Runtime::new().map_err(|e| format!("failed to create tokio runtime: {}", e))
}

fn print_run(run: &Run) {
    let p = &run.progress;
    println!("run       {}", run.id);
    println!("status    {}", run.status);
    println!("dates     {} .. {}", run.date_from, run.date_to);
    if let Some(stage) = p.stage {
        println!("stage     {:?}", stage);
    }
    println!("units     {}/{}  dates {}/{}", p.tasks_completed, p.tasks_total, p.dates_completed, p.dates_total);
    println!(
        "articles  fetched {}  new {}  deduped {}  saved {}  enriched {}  enrich-failed {}",
        p.fetched, p.new, p.deduped, p.saved, p.enriched, p.enrichment_failed
    );
    if let Some(result) = &run.result {
        println!("duration  {:.1}s", result.duration_seconds);
    }
    if let Some(err) = &run.error_message {
        println!("error     {}", err);
    }
}

fn exit_code_for(run: &Run) -> i32 {
    match run.status {
        RunStatus::Success => 0,
        _ => 1,
    }
}

fn cmd_run(
    config: &Config,
    from: NaiveDate,
    to: Option<NaiveDate>,
    sources: Vec<String>,
    all_feeds: bool,
    feeds: Vec<String>,
) -> i32 {
    let rt = match runtime() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let feeds = if all_feeds {
        FeedSelection::All
    } else if feeds.is_empty() {
        FeedSelection::None
    } else {
        FeedSelection::Only(feeds)
    };
    let selection = SourceSelection::new(sources).with_feeds(feeds);

    rt.block_on(async {
        let orch = match build_orchestrator(config, Some(Arc::new(ProgressPrinter))) {
            Ok(o) => o,
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        };
        let run_id = match orch.start_run(from, to.unwrap_or(from), selection) {
            Ok(id) => id,
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        };
        eprintln!("started run {}", run_id);

        let finished = tokio::select! {
            run = orch.wait(&run_id) => run,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("interrupt: cancelling run {} (units in flight will finish)", run_id);
                if let Err(e) = orch.cancel_run(&run_id) {
                    eprintln!("Error: {}", e);
                }
                orch.wait(&run_id).await
            }
        };
        match finished {
            Ok(run) => {
                print_run(&run);
                exit_code_for(&run)
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                1
            }
        }
    })
}

fn cmd_status(store: &SqliteStore, run_id: &RunId, json: bool) -> i32 {
    match store.get_run(run_id) {
        Ok(Some(run)) if json => match serde_json::to_string_pretty(&run) {
            Ok(text) => {
                println!("{}", text);
                0
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                1
            }
        },
        Ok(Some(run)) => {
            print_run(&run);
            0
        }
        Ok(None) => {
            eprintln!("Error: run {} not found", run_id);
            1
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn cmd_tasks(store: &SqliteStore, run_id: &RunId) -> i32 {
    let tasks = match store.list_tasks(run_id) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    if tasks.is_empty() {
        println!("No task units for run {}.", run_id);
        return 0;
    }
    println!("{:<10}  {:<20}  {:<9}  {:>5}  {:>8}  ERROR", "DATE", "SOURCE", "STATUS", "SAVED", "ATTEMPTS");
    println!("{}", "-".repeat(80));
    for t in tasks {
        println!(
            "{:<10}  {:<20}  {:<9}  {:>5}  {:>8}  {}",
            t.date,
            t.source,
            t.status,
            t.articles_saved,
            t.attempts,
            t.error_message.unwrap_or_default()
        );
    }
    0
}

fn cmd_runs(store: &SqliteStore, limit: usize) -> i32 {
    let runs = match store.list_runs(limit) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    if runs.is_empty() {
        println!("No runs recorded.");
        return 0;
    }
    println!("{:<36}  {:<9}  {:<23}  {:>5}  {:>5}", "ID", "STATUS", "DATES", "UNITS", "SAVED");
    println!("{}", "-".repeat(86));
    for run in runs {
        println!(
            "{:<36}  {:<9}  {:<23}  {:>5}  {:>5}",
            run.id,
            run.status,
            format!("{}..{}", run.date_from, run.date_to),
            run.progress.tasks_total,
            run.progress.saved
        );
    }
    0
}

fn cmd_cancel(config: &Config, run_id: &RunId) -> i32 {
    let orch = match build_orchestrator(config, None) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    match orch.cancel_run(run_id) {
        Ok(true) => {
            println!("Cancellation requested for run {}", run_id);
            0
        }
        Ok(false) => {
            eprintln!("Run {} already finished", run_id);
            1
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn cmd_retry(config: &Config, run_id: &RunId, unit: Option<(String, NaiveDate)>) -> i32 {
    let rt = match runtime() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    rt.block_on(async {
        let orch = match build_orchestrator(config, Some(Arc::new(ProgressPrinter))) {
            Ok(o) => o,
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        };
        let started = match unit {
            Some((source, date)) => orch.retry_task(run_id, &source, date).map(|_| 1),
            None => orch.retry_failed_tasks(run_id),
        };
        match started {
            Ok(0) => {
                println!("No failed units in run {}", run_id);
                return 0;
            }
            Ok(n) => eprintln!("retrying {} unit(s) of run {}", n, run_id),
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        }
        match orch.wait(run_id).await {
            Ok(run) => {
                print_run(&run);
                exit_code_for(&run)
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                1
            }
        }
    })
}

fn cmd_enrich(config: &Config, range: Option<DateRange>, retry_failed: bool) -> i32 {
    let rt = match runtime() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    rt.block_on(async {
        let orch = match build_orchestrator(config, None) {
            Ok(o) => o,
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        };
        let summary = if retry_failed {
            orch.retry_failed_enrichment(range).await
        } else {
            orch.enrich_pending(range).await
        };
        match summary {
            Ok(s) => {
                println!(
                    "requested {}  enriched {}  failed {}  skipped {}{}",
                    s.requested,
                    s.enriched,
                    s.failed,
                    s.skipped,
                    if s.aborted { "  (aborted on fatal error)" } else { "" }
                );
                if s.aborted || s.failed > 0 {
                    1
                } else {
                    0
                }
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                1
            }
        }
    })
}

fn cmd_reconcile(config: &Config) -> i32 {
    let orch = match build_orchestrator(config, None) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    match orch.recover_interrupted() {
        Ok(runs) if runs.is_empty() => {
            println!("No interrupted runs.");
            0
        }
        Ok(runs) => {
            for run in runs {
                println!("{}  {}", run.id, run.status);
            }
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging();

    let mut config = match Config::load_or_default(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(db) = cli.db {
        config.database = Some(db);
    }

    let code = match cli.command {
        Commands::Run {
            from,
            to,
            sources,
            all_feeds,
            feeds,
        } => cmd_run(&config, from, to, sources, all_feeds, feeds),
        Commands::Status { run_id, json } => match open_store(&config) {
            Ok(store) => cmd_status(&store, &run_id, json),
            Err(e) => {
                eprintln!("Error: {}", e);
                1
            }
        },
        Commands::Tasks { run_id } => match open_store(&config) {
            Ok(store) => cmd_tasks(&store, &run_id),
            Err(e) => {
                eprintln!("Error: {}", e);
                1
            }
        },
        Commands::Runs { limit } => match open_store(&config) {
            Ok(store) => cmd_runs(&store, limit),
            Err(e) => {
                eprintln!("Error: {}", e);
                1
            }
        },
        Commands::Cancel { run_id } => cmd_cancel(&config, &run_id),
        Commands::Retry { run_id, source, date } => {
            let unit = source.zip(date);
            cmd_retry(&config, &run_id, unit)
        }
        Commands::EnrichPending(range) => cmd_enrich(&config, range.range(), false),
        Commands::RetryEnrichment(range) => cmd_enrich(&config, range.range(), true),
        Commands::Reconcile => cmd_reconcile(&config),
        Commands::Mcp { transport } => {
            if transport != "stdio" {
                eprintln!("error: only 'stdio' transport is currently supported");
                std::process::exit(1);
            }
            newsroom::mcp::run_mcp_server(&config, &config.db_path())
        }
    };
    std::process::exit(code);
}
