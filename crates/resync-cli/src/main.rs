use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use dotenvy::dotenv;
use futures::stream::{self, StreamExt};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use resync::{Command, Config};
use resync_client::{ODataClient, PlatformRegistry};
use resync_core::{
    default_config_path, default_data_dir, load_sources_config, BatchStore, DbConfig, DoneMode,
    HttpConfig, Operation, RunSummary, Scheduler, SourcePipeline, SourceRunResult, SourcesConfig,
};
use resync_db::DestinationRegistry;

/// Sources run side by side by one-shot commands.
const CONCURRENT_SOURCES: usize = 4;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv().ok();

    // Setup logging (stderr to keep stdout clean for reports)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to install tracing subscriber")?;

    let config = Config::parse();

    let config_path = match config.config.clone() {
        Some(path) => path,
        None => default_config_path().context("Cannot determine the default config directory")?,
    };
    info!("Loading sources from {}", config_path.display());
    let sources = load_sources_config(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    let data_dir = config
        .data_dir
        .clone()
        .or_else(|| sources.data_dir.clone())
        .unwrap_or_else(default_data_dir);
    let done_mode = if sources.keep_done_batches {
        DoneMode::Move
    } else {
        DoneMode::Delete
    };
    let store = BatchStore::new(data_dir, done_mode);
    let db = DbConfig {
        max_connections: config.db_max_connections,
        ..DbConfig::default()
    };

    match config.command {
        Command::Daemon => {
            let pipelines = build_pipelines(&sources, None, &store, &db).await?;
            daemon(pipelines).await?;
        }
        Command::Sync { source } => {
            let pipelines = build_pipelines(&sources, source.as_deref(), &store, &db).await?;
            run_once(pipelines, Operation::Sync).await?;
        }
        Command::Purge { source } => {
            let pipelines = build_pipelines(&sources, source.as_deref(), &store, &db).await?;
            run_once(pipelines, Operation::Purge).await?;
        }
        Command::Reconcile { source } => {
            let pipelines = build_pipelines(&sources, source.as_deref(), &store, &db).await?;
            run_once(pipelines, Operation::Reconcile).await?;
        }
        Command::Stats { source } => {
            let pipelines = build_pipelines(&sources, source.as_deref(), &store, &db).await?;
            show_stats(&pipelines).await?;
            close_all(&pipelines).await;
        }
        Command::Check { source } => {
            let pipelines = build_pipelines(&sources, source.as_deref(), &store, &db).await?;
            check(&pipelines, store.root().to_path_buf()).await?;
            close_all(&pipelines).await;
        }
    }

    Ok(())
}

/// Builds one pipeline per selected source. Every platform and destination
/// tag is checked before any connection is opened.
async fn build_pipelines(
    sources: &SourcesConfig,
    only: Option<&str>,
    store: &BatchStore,
    db: &DbConfig,
) -> anyhow::Result<Vec<Arc<SourcePipeline>>> {
    let selected: Vec<_> = match only {
        Some(name) => match sources.find(name) {
            Some(source) => vec![source.clone()],
            None => bail!("No source named '{}' in config", name),
        },
        None => sources.sources.clone(),
    };
    if selected.is_empty() {
        bail!("No sources configured");
    }

    let http = HttpConfig::default();
    let platform_registry = PlatformRegistry::with_builtins();
    let registry = DestinationRegistry::with_builtins();
    let mut platforms = Vec::with_capacity(selected.len());
    for source in &selected {
        let platform = platform_registry
            .build(&source.platform, &http)
            .with_context(|| format!("Source {}", source.name))?;
        platform
            .check_credentials(&source.credentials)
            .with_context(|| format!("Source {}: missing credentials", source.name))?;
        registry
            .validate(&source.destinations)
            .with_context(|| format!("Source {}", source.name))?;
        platforms.push(platform);
    }

    let client = Arc::new(ODataClient::new(http).context("Failed to build HTTP client")?);
    let mut pipelines = Vec::with_capacity(selected.len());
    for (source, platform) in selected.into_iter().zip(platforms) {
        if source.destinations.is_empty() {
            warn!("Source {} has no destinations", source.name);
        }
        let destinations = registry
            .build_all(&source.destinations, platform.clone(), db)
            .await
            .with_context(|| format!("Failed to set up destinations of {}", source.name))?;
        let name = source.name.clone();
        let pipeline = SourcePipeline::new(source, client.clone(), platform, destinations, store.clone())
            .with_context(|| format!("Source {}", name))?;
        pipelines.push(Arc::new(pipeline));
    }
    Ok(pipelines)
}

/// Runs one operation on every pipeline and prints the summary.
async fn run_once(pipelines: Vec<Arc<SourcePipeline>>, op: Operation) -> anyhow::Result<()> {
    info!("Running {} for {} source(s)", op, pipelines.len());

    let results: Vec<SourceRunResult> = stream::iter(pipelines.iter().cloned())
        .map(|pipeline| async move {
            let name = pipeline.name().to_string();
            match pipeline.run(op).await {
                Ok(stats) => SourceRunResult::success(name, op, stats),
                Err(e) => {
                    error!("[{}] {} failed: {}", name, op, e.user_message());
                    SourceRunResult::failure(name, op, e.to_string())
                }
            }
        })
        .buffer_unordered(CONCURRENT_SOURCES)
        .collect()
        .await;

    let mut summary = RunSummary::new();
    for result in results {
        summary.add(result);
    }
    print_summary(&summary, op);
    close_all(&pipelines).await;

    if summary.failed_count() > 0 {
        bail!(
            "{} of {} source(s) failed",
            summary.failed_count(),
            summary.results.len()
        );
    }
    Ok(())
}

fn print_summary(summary: &RunSummary, op: Operation) {
    println!("\n{} summary\n", op);
    for result in &summary.results {
        match &result.error {
            Some(e) => println!("  {:<20} FAILED  {}", result.source, e),
            None => {
                let total = result.stats.total();
                println!(
                    "  {:<20} ok      batches={} records={} purged={} flagged={}",
                    result.source,
                    total.batches_applied,
                    total.records_loaded,
                    total.ids_purged,
                    total.ids_flagged
                );
                for (resource, stats) in &result.stats.resources {
                    if stats.is_idle() {
                        continue;
                    }
                    println!(
                        "    {:<18} pages={} batches={} records={} purged={} flagged={}",
                        resource,
                        stats.pages_fetched,
                        stats.batches_applied,
                        stats.records_loaded,
                        stats.ids_purged,
                        stats.ids_flagged
                    );
                }
            }
        }
    }
    println!(
        "\n  {} successful, {} failed\n",
        summary.successful_count(),
        summary.failed_count()
    );
}

/// Schedules every enabled operation and waits for Ctrl+C.
async fn daemon(pipelines: Vec<Arc<SourcePipeline>>) -> anyhow::Result<()> {
    let mut scheduler = Scheduler::new().await?;
    for pipeline in &pipelines {
        let jobs = scheduler
            .schedule(pipeline.clone())
            .await
            .with_context(|| format!("Failed to schedule source {}", pipeline.name()))?;
        if jobs == 0 {
            warn!("Source {} has no enabled cron schedules", pipeline.name());
        }
    }
    if scheduler.job_count() == 0 {
        close_all(&pipelines).await;
        bail!("Nothing to schedule: no source has an enabled cron entry");
    }

    scheduler.start().await?;
    info!(
        "Scheduler running with {} job(s), press Ctrl+C to stop",
        scheduler.job_count()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");

    scheduler.shutdown().await?;
    close_all(&pipelines).await;
    Ok(())
}

async fn show_stats(pipelines: &[Arc<SourcePipeline>]) -> anyhow::Result<()> {
    println!("\nReplication Statistics\n");
    for pipeline in pipelines {
        println!("  {}", pipeline.name());
        let snapshot = pipeline
            .snapshot()
            .await
            .with_context(|| format!("Failed to read stats of {}", pipeline.name()))?;
        for row in snapshot {
            let most_recent = row
                .most_recent
                .map(|t| t.format("%Y-%m-%dT%H:%M:%SZ").to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "    {:<12} {:<20} {:>10}  {}",
                row.destination, row.resource, row.count, most_recent
            );
        }
        for resource in &pipeline.source().resources {
            let pending = pipeline.pending_reconcile_ids(&resource.name).await;
            if !pending.is_empty() {
                println!("    {:<33} {} key(s) awaiting sync", resource.name, pending.len());
            }
        }
        println!();
    }
    Ok(())
}

async fn check(pipelines: &[Arc<SourcePipeline>], data_dir: PathBuf) -> anyhow::Result<()> {
    println!("\nConfiguration check\n");
    println!("  Batch store: {}\n", data_dir.display());
    let mut problems = 0;
    for pipeline in pipelines {
        println!("  {} ({} destination(s))", pipeline.name(), pipeline.destinations().len());
        match pipeline.check().await {
            Ok(found) => {
                for (resource, present) in found {
                    let mark = if present { "ok" } else { "MISSING" };
                    println!("    {:<20} {}", resource, mark);
                    if !present {
                        problems += 1;
                    }
                }
            }
            Err(e) => {
                println!("    FAILED  {}", e.user_message());
                problems += 1;
            }
        }
        println!();
    }
    if problems > 0 {
        bail!("{} problem(s) found", problems);
    }
    Ok(())
}

async fn close_all(pipelines: &[Arc<SourcePipeline>]) {
    for pipeline in pipelines {
        if let Err(e) = pipeline.close().await {
            warn!("Failed to close destinations of {}: {}", pipeline.name(), e);
        }
    }
}
