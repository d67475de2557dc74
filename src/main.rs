use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use uuid::Uuid;

use loan_pipeline::config::Config;
use loan_pipeline::pipeline::{load_timestamp, Pipeline};
use loan_pipeline::storage::{FsObjectStore, ObjectStore};
use loan_pipeline::types::{StagedBatch, SystemClock};
use loan_pipeline::warehouse::{LoadStrategy, SqliteWarehouse, Warehouse};
use loan_pipeline::{logging, metrics};

#[derive(Parser)]
#[command(name = "loan-pipeline")]
#[command(about = "Stage, load and refresh loan-application CSV batches")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Expose Prometheus metrics on this port
    #[arg(long, env = "LOAN_METRICS_PORT")]
    metrics_port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the warehouse tables and views
    Init,
    /// Upload inbox files to the object store and archive them
    Stage {
        /// Write the staged batch as JSON here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Copy staged objects into the raw table
    Load {
        /// Staged batch JSON produced by `stage`
        #[arg(long)]
        input: Option<PathBuf>,
        /// per_key or batch; defaults to the configured strategy
        #[arg(long)]
        strategy: Option<LoadStrategy>,
    },
    /// Append new raw rows, minus outliers, to the semantic table
    Refresh,
    /// Stage, load and refresh once
    Run,
    /// Run the pipeline on a fixed interval until interrupted
    Daemon {
        #[arg(long)]
        interval_secs: Option<u64>,
    },
}

fn read_batch(path: &Path) -> Result<StagedBatch> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    StagedBatch::from_json(&raw).with_context(|| format!("Failed to parse staged batch in {}", path.display()))
}

fn build_pipeline(config: &Config) -> Result<Pipeline> {
    let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(
        &config.object_store.root,
        config.object_store.bucket.clone(),
    ));

    let w = &config.warehouse;
    info!(
        "Connecting to warehouse {} as {} (account {}, database {}, schema {})",
        w.warehouse, w.user, w.account, w.database, w.schema
    );
    if w.password.is_empty() {
        warn!("WAREHOUSE_PASSWORD is not set");
    }
    let warehouse: Arc<dyn Warehouse> = Arc::new(
        SqliteWarehouse::open(&w.path, &w.database, w.tables())
            .with_context(|| format!("Failed to open warehouse at {}", w.path.display()))?,
    );
    Ok(Pipeline::new(config, store, warehouse))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    let _log_guard = logging::init_logging(&config.paths.log_dir);

    if let Some(port) = cli.metrics_port {
        metrics::init_metrics(port);
    }

    let mut pipeline = build_pipeline(&config)?;
    let clock = SystemClock;

    match cli.command {
        Commands::Init => {
            pipeline.bootstrap().await?;
            println!("✅ Warehouse initialized");
        }
        Commands::Stage { output } => {
            let batch = pipeline.stager.stage_inbox(&clock, Uuid::new_v4()).await?;
            let json = batch.to_json()?;
            match output {
                Some(path) => {
                    fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("📤 Staged {} file(s); batch written to {}", batch.keys.len(), path.display());
                }
                None => println!("{json}"),
            }
        }
        Commands::Load { input, strategy } => {
            if let Some(strategy) = strategy {
                pipeline = pipeline.with_strategy(strategy);
            }
            let batch = match input {
                Some(path) => read_batch(&path)?,
                None => StagedBatch::new(Uuid::new_v4(), chrono::Utc::now()),
            };
            let report = pipeline.loader.load_staged(&batch, load_timestamp(&clock)).await?;
            println!(
                "✅ Loaded {} object(s), {} row(s); {} skipped",
                report.objects_loaded, report.rows_loaded, report.objects_skipped
            );
        }
        Commands::Refresh => {
            let report = pipeline.semantic.refresh_semantic().await?;
            println!(
                "✨ Watermark {}: {} selected, {} rejected, {} inserted",
                report.watermark, report.selected, report.rejected, report.inserted
            );
        }
        Commands::Run => {
            pipeline.bootstrap().await?;
            let report = pipeline.run_once(&clock).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Daemon { interval_secs } => {
            pipeline.bootstrap().await?;
            let secs = interval_secs.unwrap_or(config.schedule.interval_secs).max(1);
            info!("⏱️ Running every {}s; Ctrl-C to stop", secs);

            let mut ticker = tokio::time::interval(Duration::from_secs(secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = pipeline.run_once(&clock).await {
                            error!("Scheduled run failed: {}", e);
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutting down");
                        break;
                    }
                }
            }
        }
    }
    Ok(())
}
