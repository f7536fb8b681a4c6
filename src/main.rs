//! dagrun - run DAG pipelines defined in YAML.
//!
//! Usage:
//!   dagrun run <pipelines-dir>       Run the scheduler over every pipeline in the directory
//!   dagrun trigger <pipeline-file>   Execute one run of a pipeline and exit
//!   dagrun validate <pipelines-dir>  Validate pipeline files without running
//!   dagrun list <pipelines-dir>      List pipelines and their tasks

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use dagrun::{
    EventBus, LoggingHandler, RunScheduler, Scheduler, load_pipeline,
    load_pipelines_from_directory,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// dagrun - a small DAG execution engine
#[derive(Parser)]
#[command(name = "dagrun")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler with pipelines from a directory
    Run {
        /// Directory containing pipeline YAML files
        #[arg(value_name = "PIPELINES_DIR")]
        pipelines_dir: PathBuf,

        /// Scheduler tick interval in seconds
        #[arg(long, default_value = "1")]
        tick_interval: u64,

        /// Seconds to wait for active runs on shutdown before cancelling them
        #[arg(long, default_value = "30")]
        shutdown_timeout: u64,
    },

    /// Execute a single run of a pipeline and exit
    Trigger {
        /// Pipeline YAML file
        #[arg(value_name = "PIPELINE_FILE")]
        pipeline_file: PathBuf,

        /// Logical date of the run (YYYY-MM-DD or RFC 3339); defaults to now
        #[arg(long, value_parser = parse_logical_date)]
        logical_date: Option<DateTime<Utc>>,
    },

    /// Validate pipeline files without running
    Validate {
        #[arg(value_name = "PIPELINES_DIR")]
        pipelines_dir: PathBuf,
    },

    /// List pipelines and their tasks in execution order
    List {
        #[arg(value_name = "PIPELINES_DIR")]
        pipelines_dir: PathBuf,
    },
}

fn parse_logical_date(value: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(date) = DateTime::parse_from_rfc3339(value) {
        return Ok(date.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc())
        .ok_or_else(|| format!("'{value}' is neither YYYY-MM-DD nor RFC 3339"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            pipelines_dir,
            tick_interval,
            shutdown_timeout,
        } => {
            run_scheduler(pipelines_dir, tick_interval, shutdown_timeout).await?;
        }
        Commands::Trigger {
            pipeline_file,
            logical_date,
        } => {
            trigger_pipeline(pipeline_file, logical_date).await?;
        }
        Commands::Validate { pipelines_dir } => {
            validate_pipelines(pipelines_dir)?;
        }
        Commands::List { pipelines_dir } => {
            list_pipelines(pipelines_dir)?;
        }
    }

    Ok(())
}

async fn run_scheduler(
    pipelines_dir: PathBuf,
    tick_interval: u64,
    shutdown_timeout: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Loading pipelines from: {}", pipelines_dir.display());
    let pipelines = load_pipelines_from_directory(&pipelines_dir)?;

    if pipelines.is_empty() {
        warn!("No pipeline files found in {}", pipelines_dir.display());
        return Ok(());
    }

    let event_bus = Arc::new(EventBus::new());
    event_bus.register(Arc::new(LoggingHandler)).await;

    let mut scheduler = Scheduler::new()
        .with_event_bus(event_bus)
        .with_tick_interval(Duration::from_secs(tick_interval.max(1)))
        .with_shutdown_timeout(Duration::from_secs(shutdown_timeout));

    for pipeline in pipelines {
        info!(
            "  - {} ({}){}: {} task(s)",
            pipeline.id(),
            pipeline
                .schedule()
                .map(|s| s.expression().to_string())
                .unwrap_or_else(|| "manual only".to_string()),
            if pipeline.is_enabled() { "" } else { " (disabled)" },
            pipeline.graph().len()
        );
        scheduler.register(pipeline);
    }

    info!("Starting scheduler, press Ctrl+C to stop");
    let (handle, scheduler_task) = scheduler.start();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            handle.shutdown().await?;
        }
        _ = scheduler_task => {
            info!("Scheduler stopped");
        }
    }

    Ok(())
}

/// Execute one run of the pipeline in `pipeline_file`; Ctrl+C cancels it.
async fn trigger_pipeline(
    pipeline_file: PathBuf,
    logical_date: Option<DateTime<Utc>>,
) -> Result<(), Box<dyn std::error::Error>> {
    let pipeline = load_pipeline(&pipeline_file)?;

    let event_bus = Arc::new(EventBus::new());
    event_bus.register(Arc::new(LoggingHandler)).await;
    let runner =
        RunScheduler::with_concurrency(pipeline.max_active_tasks()).with_event_bus(event_bus);

    let run = Arc::new(dagrun::Run::new(
        Arc::clone(pipeline.graph()),
        logical_date.unwrap_or_else(Utc::now),
    ));
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            on_interrupt.cancel();
        }
    });

    let report = runner.execute_run(run, cancel).await;
    if report.succeeded() {
        info!("Run {} succeeded", report.run_id);
        Ok(())
    } else {
        for failure in &report.failures {
            error!("  {} ({}): {}", failure.task_id, failure.state, failure.reason);
        }
        Err(format!("run {} of '{}' ended {}", report.run_id, pipeline.id(), report.status).into())
    }
}

fn validate_pipelines(pipelines_dir: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    info!("Validating pipelines in: {}", pipelines_dir.display());

    match load_pipelines_from_directory(&pipelines_dir) {
        Ok(pipelines) => {
            info!("All {} pipeline(s) are valid:", pipelines.len());
            for pipeline in &pipelines {
                info!("  - {} ({}): OK", pipeline.id(), pipeline.name());
            }
            Ok(())
        }
        Err(e) => {
            error!("Validation failed: {}", e);
            Err(e.into())
        }
    }
}

fn list_pipelines(pipelines_dir: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let pipelines = load_pipelines_from_directory(&pipelines_dir)?;

    if pipelines.is_empty() {
        println!("No pipelines found in {}", pipelines_dir.display());
        return Ok(());
    }

    println!("Pipelines in {}:", pipelines_dir.display());
    println!();

    for pipeline in &pipelines {
        println!("ID: {}", pipeline.id());
        println!("  Name: {}", pipeline.name());
        if let Some(owner) = pipeline.owner() {
            println!("  Owner: {}", owner);
        }
        println!("  Enabled: {}", pipeline.is_enabled());
        println!(
            "  Schedule: {}",
            pipeline
                .schedule()
                .map(|s| format!("{} ({})", s.expression(), s.timezone()))
                .unwrap_or_else(|| "manual only".to_string())
        );
        println!("  Catchup: {}", pipeline.catchup());
        println!("  Tasks: {}", pipeline.graph().len());

        let graph = pipeline.graph();
        for task_id in graph.topological_order() {
            let deps: Vec<&str> = graph.upstream(task_id).map(|d| d.as_str()).collect();
            let kind = graph
                .task(task_id)
                .map(|t| t.action().kind())
                .unwrap_or("unknown");
            if deps.is_empty() {
                println!("    - {} [{}]", task_id, kind);
            } else {
                println!("    - {} [{}] (depends on: {})", task_id, kind, deps.join(", "));
            }
        }

        println!();
    }

    Ok(())
}
