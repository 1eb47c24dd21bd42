//! ParcelSync CLI - local edits, sync and maintenance from the command line.
//!
//! Records live in a SQLite database under the data directory. Edits are
//! queued locally; `sync` pushes them to a server and pulls remote changes.

use anyhow::{bail, Context, Result};
use chrono::DateTime;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use parcelsync_reclaim::{
    CacheProbe, CleanupPriority, CleanupRegistry, CleanupReport, ResourceMonitor, ResourceThresholds,
};
use parcelsync_storage::{Filter, LocalStore, MemoryStore, Record, SqliteStore};
use parcelsync_sync::{
    Connectivity, EventBus, HttpRemote, ManualChoice, MemoryRemote, RemoteApi, SchedulerConfig,
    SyncConfig, SyncEngine, SyncReport, SyncScheduler, TokioBackground,
};

#[derive(Parser)]
#[command(name = "parcelsync")]
#[command(about = "ParcelSync - offline-first record sync")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Data directory (default: platform data dir).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Configuration file (default: <data-dir>/config.json if present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or replace a record.
    Put {
        collection: String,
        id: String,
        /// Document as a JSON object.
        data: String,
    },

    /// Delete a record.
    Delete { collection: String, id: String },

    /// Print a record.
    Get { collection: String, id: String },

    /// List the records of a collection.
    List {
        collection: String,

        /// Only records whose document field equals a value (`field=value`).
        #[arg(short, long = "where")]
        filter: Option<String>,
    },

    /// Exempt a record from eviction.
    Essential {
        collection: String,
        id: String,

        /// Make the record evictable again.
        #[arg(long)]
        off: bool,
    },

    /// Show queue, conflict and storage status.
    Status,

    /// Push pending changes to a server.
    Sync {
        /// Server base URL (overrides the configuration file).
        #[arg(short, long)]
        server: Option<String>,

        /// Collections to sync (default: configured or all with pending work).
        #[arg(short, long)]
        collection: Vec<String>,

        /// Also pull remote changes of the synced collections.
        #[arg(long)]
        pull: bool,
    },

    /// List conflicts awaiting manual review.
    Conflicts,

    /// Settle a conflict under manual review.
    Resolve {
        conflict_id: String,

        #[arg(value_enum)]
        choice: Choice,

        /// Replacement document for `replace`, as a JSON object.
        #[arg(short, long)]
        data: Option<String>,
    },

    /// Give entries that exhausted their retries another round.
    RetryFailed {
        #[arg(short, long)]
        collection: Option<String>,
    },

    /// Reclaim local storage.
    Cleanup {
        /// Run the aggressive cleanup instead of the routine one.
        #[arg(long)]
        aggressive: bool,
    },

    /// Run an offline/online scenario against an in-memory server.
    Simulate {
        /// Documents edited while offline.
        #[arg(short, long, default_value_t = 5)]
        edits: usize,

        /// Simulated server latency in milliseconds.
        #[arg(long, default_value_t = 50)]
        latency_ms: u64,
    },

    /// Print the effective configuration.
    Config,

    /// Generate shell completions.
    Completions { shell: Shell },
}

#[derive(Clone, Copy, ValueEnum)]
enum Choice {
    KeepLocal,
    KeepServer,
    Replace,
}

/// Settings file layout.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    server: Option<String>,
    sync: SyncConfig,
    scheduler: SchedulerConfig,
    resources: ResourceThresholds,
}

struct Env {
    data_dir: PathBuf,
    config: AppConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "parcelsync", &mut std::io::stdout());
        return Ok(());
    }

    let env = load_env(cli.data_dir, cli.config)?;

    match cli.command {
        Commands::Put {
            collection,
            id,
            data,
        } => cmd_put(&env, &collection, &id, &data).await,

        Commands::Delete { collection, id } => cmd_delete(&env, &collection, &id).await,

        Commands::Get { collection, id } => cmd_get(&env, &collection, &id).await,

        Commands::List { collection, filter } => cmd_list(&env, &collection, filter.as_deref()).await,

        Commands::Essential {
            collection,
            id,
            off,
        } => cmd_essential(&env, &collection, &id, !off).await,

        Commands::Status => cmd_status(&env).await,

        Commands::Sync {
            server,
            collection,
            pull,
        } => cmd_sync(&env, server, collection, pull).await,

        Commands::Conflicts => cmd_conflicts(&env).await,

        Commands::Resolve {
            conflict_id,
            choice,
            data,
        } => cmd_resolve(&env, &conflict_id, choice, data.as_deref()).await,

        Commands::RetryFailed { collection } => cmd_retry_failed(&env, collection.as_deref()).await,

        Commands::Cleanup { aggressive } => cmd_cleanup(&env, aggressive).await,

        Commands::Simulate { edits, latency_ms } => {
            cmd_simulate(&env, edits, Duration::from_millis(latency_ms)).await
        }

        Commands::Config => cmd_config(&env),

        Commands::Completions { .. } => Ok(()),
    }
}

fn load_env(data_dir: Option<PathBuf>, config_path: Option<PathBuf>) -> Result<Env> {
    let data_dir = match data_dir {
        Some(dir) => dir,
        None => dirs::data_dir()
            .context("No platform data directory, pass --data-dir")?
            .join("parcelsync"),
    };

    let config_path = config_path.or_else(|| {
        let default = data_dir.join("config.json");
        default.exists().then_some(default)
    });
    let config = match config_path {
        Some(path) => read_config(&path)?,
        None => AppConfig::default(),
    };

    config.sync.validate().context("Invalid sync configuration")?;
    config.resources.validate().context("Invalid resource thresholds")?;
    Ok(Env { data_dir, config })
}

fn read_config(path: &Path) -> Result<AppConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid config {}", path.display()))
}

fn open_store(env: &Env) -> Result<Arc<dyn LocalStore>> {
    std::fs::create_dir_all(&env.data_dir)
        .with_context(|| format!("Failed to create {}", env.data_dir.display()))?;
    let store = SqliteStore::open(env.data_dir.join("parcelsync.db")).context("Failed to open local store")?;
    Ok(Arc::new(store))
}

/// Engine for local operations; it never talks to a server.
async fn open_local(env: &Env) -> Result<SyncEngine> {
    open_engine(env, Arc::new(MemoryRemote::new()), Connectivity::new(false)).await
}

async fn open_engine(env: &Env, remote: Arc<dyn RemoteApi>, connectivity: Connectivity) -> Result<SyncEngine> {
    let engine = SyncEngine::new(
        open_store(env)?,
        remote,
        connectivity,
        EventBus::default(),
        env.config.sync.clone(),
    )
    .await
    .context("Failed to open sync engine")?;
    Ok(engine)
}

fn parse_document(data: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(data).context("Document is not valid JSON")?;
    if !value.is_object() {
        bail!("Document must be a JSON object");
    }
    Ok(value)
}

fn format_millis(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis)
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}

fn print_record(record: &Record) -> Result<()> {
    let mut flags = Vec::new();
    if record.dirty {
        flags.push("dirty");
    }
    if record.essential {
        flags.push("essential");
    }
    if record.conflicted {
        flags.push("conflicted");
    }

    println!(
        "{}/{} (v{}{}{})",
        record.collection,
        record.id,
        record.sync_version,
        if flags.is_empty() { "" } else { ", " },
        flags.join(", ")
    );
    println!("{}", serde_json::to_string_pretty(&record.data)?);
    if let Some(failure) = &record.failure {
        println!(
            "  last sync failed after {} attempt(s) at {}: {}",
            failure.attempts,
            format_millis(failure.at),
            failure.error
        );
    }
    Ok(())
}

fn print_report(report: &SyncReport) {
    if let Some(reason) = report.skipped {
        println!("Sync skipped: {:?}", reason);
        return;
    }
    for (collection, tally) in &report.collections {
        println!(
            "  {}: {} sent, {} applied, {} conflicts, {} errors, {} deferred",
            collection, tally.sent, tally.applied, tally.conflicts, tally.errors, tally.skipped
        );
    }
    let totals = report.totals();
    println!(
        "Sync finished in {:?}: {} sent, {} conflicts, {} errors{}",
        report.duration,
        totals.sent,
        totals.conflicts,
        totals.errors,
        if report.more_work { " (more work pending)" } else { "" }
    );
}

fn print_cleanup(report: &CleanupReport) {
    println!(
        "{} cleanup: {} records evicted ({} expired, {} over capacity, {} orphans)",
        if report.aggressive { "Aggressive" } else { "Routine" },
        report.records_evicted(),
        report.expired,
        report.over_capacity,
        report.orphans
    );
    println!(
        "  {} queue entries, {} resolved conflicts, {} hot entries released",
        report.queue_entries, report.conflicts, report.hot_entries
    );
    for participant in &report.participants {
        match &participant.error {
            Some(error) => println!("  participant {} failed: {}", participant.name, error),
            None => println!("  participant {}: {} reclaimed", participant.name, participant.reclaimed),
        }
    }
}

/// Create or replace a record.
async fn cmd_put(env: &Env, collection: &str, id: &str, data: &str) -> Result<()> {
    let document = parse_document(data)?;
    let engine = open_local(env).await?;
    let record = engine
        .write(collection, id, document)
        .await
        .context("Failed to write record")?;

    println!("Record saved: {}/{} (queued for sync)", record.collection, record.id);
    Ok(())
}

/// Delete a record.
async fn cmd_delete(env: &Env, collection: &str, id: &str) -> Result<()> {
    let engine = open_local(env).await?;
    if engine.delete(collection, id).await.context("Failed to delete record")? {
        println!("Record deleted: {}/{} (queued for sync)", collection, id);
    } else {
        println!("No such record: {}/{}", collection, id);
    }
    Ok(())
}

/// Print a record.
async fn cmd_get(env: &Env, collection: &str, id: &str) -> Result<()> {
    let engine = open_local(env).await?;
    match engine.get(collection, id).await.context("Failed to read record")? {
        Some(record) => print_record(&record),
        None => bail!("No such record: {}/{}", collection, id),
    }
}

/// List records, optionally filtered on one document field.
async fn cmd_list(env: &Env, collection: &str, filter: Option<&str>) -> Result<()> {
    let filter = match filter {
        Some(expr) => {
            let (field, raw) = expr
                .split_once('=')
                .context("Filter must look like field=value")?;
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            Filter::eq(format!("data.{}", field), value)
        }
        None => Filter::All,
    };

    let engine = open_local(env).await?;
    let records = engine
        .get_all(collection, &filter)
        .await
        .context("Failed to list records")?;

    if records.is_empty() {
        println!("No records.");
    } else {
        for record in &records {
            print_record(record)?;
        }
        println!("{} record(s)", records.len());
    }
    Ok(())
}

/// Toggle eviction exemption.
async fn cmd_essential(env: &Env, collection: &str, id: &str, essential: bool) -> Result<()> {
    let engine = open_local(env).await?;
    engine
        .set_essential(collection, id, essential)
        .await
        .context("Failed to update record")?;
    println!(
        "{}/{} is {}",
        collection,
        id,
        if essential { "essential" } else { "evictable" }
    );
    Ok(())
}

/// Show status.
async fn cmd_status(env: &Env) -> Result<()> {
    let engine = open_local(env).await?;
    let summary = engine.queue_summary().await?;
    let conflicts = engine.conflicts().await?;
    let stats = engine.store().stats().await?;

    println!("ParcelSync Status:");
    println!("  Client: {}", engine.client_id());
    println!("  Data: {}", env.data_dir.display());
    println!("  Server: {}", env.config.server.as_deref().unwrap_or("(not configured)"));
    println!("  Queue:");
    println!("    Pending: {}", summary.pending);
    println!("    Synced: {}", summary.synced);
    println!("    Failed: {}", summary.failed);
    println!("  Open conflicts: {}", conflicts.len());
    println!("  Store: {} documents, ~{} bytes", stats.documents, stats.approx_bytes);
    Ok(())
}

/// Push pending changes and optionally pull remote ones.
async fn cmd_sync(env: &Env, server: Option<String>, collections: Vec<String>, pull: bool) -> Result<()> {
    let Some(server) = server.or_else(|| env.config.server.clone()) else {
        bail!("No server configured, pass --server or set \"server\" in the config file");
    };
    let remote = HttpRemote::new(&server, env.config.sync.request_timeout).context("Invalid server")?;

    let engine = open_engine(env, Arc::new(remote), Connectivity::new(true)).await?;
    info!("Syncing with {}", server);

    let targets = (!collections.is_empty()).then_some(collections.as_slice());
    let report = engine
        .perform_incremental_sync(targets)
        .await
        .context("Sync failed")?;
    print_report(&report);

    if pull {
        let pulled: Vec<String> = if collections.is_empty() {
            engine.cache().collections().await?
        } else {
            collections
        };
        for collection in pulled {
            match engine.pull_remote_changes(&collection).await {
                Ok(applied) => println!("  {}: {} remote change(s) applied", collection, applied),
                Err(e) => warn!("Pulling {} failed: {}", collection, e),
            }
        }
    }
    Ok(())
}

/// List open conflicts.
async fn cmd_conflicts(env: &Env) -> Result<()> {
    let engine = open_local(env).await?;
    let conflicts = engine.conflicts().await?;

    if conflicts.is_empty() {
        println!("No conflicts awaiting review.");
        return Ok(());
    }
    for conflict in conflicts {
        println!("{}", conflict.id);
        println!("  Record: {}/{}", conflict.collection, conflict.document_id);
        println!("  Reason: {}", conflict.reason);
        println!("  Detected: {}", format_millis(conflict.detected_at));
        println!("  Server version: {}", conflict.remote_sync_version);
    }
    Ok(())
}

/// Settle a conflict.
async fn cmd_resolve(env: &Env, conflict_id: &str, choice: Choice, data: Option<&str>) -> Result<()> {
    let choice = match (choice, data) {
        (Choice::KeepLocal, _) => ManualChoice::KeepLocal,
        (Choice::KeepServer, _) => ManualChoice::KeepServer,
        (Choice::Replace, Some(data)) => ManualChoice::Replace(parse_document(data)?),
        (Choice::Replace, None) => bail!("replace needs --data"),
    };

    let engine = open_local(env).await?;
    match engine
        .resolve_manually(conflict_id, choice)
        .await
        .context("Failed to resolve conflict")?
    {
        Some(record) => print_record(&record)?,
        None => println!("Conflict resolved; the record is deleted."),
    }
    Ok(())
}

/// Reset failed queue entries.
async fn cmd_retry_failed(env: &Env, collection: Option<&str>) -> Result<()> {
    let engine = open_local(env).await?;
    let reset = engine.retry_failed(collection).await?;
    println!("{} entr{} will be retried on the next sync", reset, if reset == 1 { "y" } else { "ies" });
    Ok(())
}

/// Run a cleanup now.
async fn cmd_cleanup(env: &Env, aggressive: bool) -> Result<()> {
    let engine = open_local(env).await?;
    let registry = Arc::new(CleanupRegistry::new());
    registry.register("sync-queue", CleanupPriority::Normal, engine.cleanup_participant())?;

    let monitor = ResourceMonitor::new(
        engine.cache(),
        engine.queue(),
        Arc::new(CacheProbe::new(engine.cache())),
        registry,
        env.config.resources.clone(),
    )?;

    let report = if aggressive {
        monitor.aggressive_cleanup().await?
    } else {
        monitor.routine_cleanup().await?
    };
    print_cleanup(&report);
    Ok(())
}

/// Offline edits, a concurrent server edit, then reconnect.
async fn cmd_simulate(env: &Env, edits: usize, latency: Duration) -> Result<()> {
    let remote = Arc::new(MemoryRemote::new().with_latency(latency));
    let connectivity = Connectivity::new(false);
    let engine = Arc::new(
        SyncEngine::new(
            Arc::new(MemoryStore::new()),
            remote.clone(),
            connectivity.clone(),
            EventBus::default(),
            env.config.sync.clone(),
        )
        .await?,
    );

    let scheduler_config = SchedulerConfig::default()
        .with_debounce(Duration::from_millis(200))
        .with_reconnect_settle(Duration::from_millis(500));
    let (scheduler, handle) = SyncScheduler::new(engine.clone(), scheduler_config);
    let executor = Arc::new(TokioBackground::current()?);
    let runner = tokio::spawn(handle.with_executor(executor).run());

    println!("Offline: editing {} parcel(s)", edits);
    for i in 0..edits {
        let id = format!("P-{}", i + 1);
        engine
            .write("parcels", &id, serde_json::json!({"zone": "R1", "area": 100 + i}))
            .await?;
        engine
            .write("parcels", &id, serde_json::json!({"zone": "R2", "area": 100 + i}))
            .await?;
    }
    println!("  queue: {:?}", engine.queue_summary().await?);

    println!("Online: waiting for the connection to settle");
    connectivity.set_online(true);
    tokio::time::sleep(Duration::from_millis(800) + latency * 2).await;

    if edits > 0 {
        println!("Server edits P-1 while the client edits it too");
        remote.server_edit("parcels", "P-1", Some(serde_json::json!({"zone": "C3", "area": 100})))?;
        engine
            .write("parcels", "P-1", serde_json::json!({"zone": "R4", "area": 100}))
            .await?;
        tokio::time::sleep(Duration::from_millis(500) + latency * 4).await;
    }

    scheduler.shutdown().await;
    let _ = runner.await;

    let stats = engine.stats();
    println!("Result:");
    println!("  queue: {:?}", engine.queue_summary().await?);
    println!("  passes: {}, sent: {}, conflicts: {}, errors: {}", stats.passes, stats.sent, stats.conflicts, stats.errors);
    if let Some(record) = engine.get("parcels", "P-1").await? {
        print_record(&record)?;
    }
    Ok(())
}

/// Print the effective configuration.
fn cmd_config(env: &Env) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&env.config)?);
    Ok(())
}
