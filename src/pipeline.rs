//! Stage -> load -> refresh, run strictly in sequence.

pub mod loader;
pub mod outliers;
pub mod semantic;
pub mod stager;

pub use loader::{LoadReport, Loader};
pub use semantic::{SemanticProcessor, SemanticReport};
pub use stager::Stager;

use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::storage::ObjectStore;
use crate::types::{Clock, StagedBatch};
use crate::warehouse::{LoadStrategy, Warehouse};
use chrono::{NaiveDateTime, Timelike};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

/// Result of a complete pipeline run
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub staged: StagedBatch,
    pub load: LoadReport,
    pub semantic: SemanticReport,
}

/// Owns the injected clients for the three stages. Handles are shared
/// (`Arc`) and live as long as the process; warehouse sessions are opened per
/// stage and released when the stage returns.
pub struct Pipeline {
    pub stager: Stager,
    pub loader: Loader,
    pub semantic: SemanticProcessor,
    warehouse: Arc<dyn Warehouse>,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        store: Arc<dyn ObjectStore>,
        warehouse: Arc<dyn Warehouse>,
    ) -> Self {
        Self {
            stager: Stager::new(config, store.clone()),
            loader: Loader::new(config, store, warehouse.clone()),
            semantic: SemanticProcessor::new(config, warehouse.clone()),
            warehouse,
        }
    }

    pub fn with_strategy(mut self, strategy: LoadStrategy) -> Self {
        self.loader = self.loader.with_strategy(strategy);
        self
    }

    /// Create the warehouse objects the stages write to.
    pub async fn bootstrap(&self) -> Result<()> {
        let bootstrap_err = |e| PipelineError::Load {
            target: "bootstrap".to_string(),
            source: e,
        };
        let mut session = self.warehouse.open_session().await.map_err(bootstrap_err)?;
        session.ensure_schema().map_err(bootstrap_err)?;
        info!("🏗️ Warehouse objects ready");
        Ok(())
    }

    /// Run all three stages once. Any stage error aborts the run. `_load_ts`
    /// is read from `clock` once the stager has finished.
    pub async fn run_once(&self, clock: &dyn Clock) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", run_id = %run_id);
        let started = std::time::Instant::now();

        let result = async {
            info!("🚀 Starting pipeline run");
            let staged = self.stager.stage_inbox(clock, run_id).await?;
            let load = if staged.is_empty() && self.loader.strategy() == LoadStrategy::PerKey {
                info!("Nothing staged; skipping load");
                LoadReport::default()
            } else {
                let load_ts = load_timestamp(clock);
                self.loader.load_staged(&staged, load_ts).await?
            };
            let semantic = self.semantic.refresh_semantic().await?;
            Ok::<_, PipelineError>(RunReport {
                run_id,
                staged,
                load,
                semantic,
            })
        }
        .instrument(span)
        .await;

        match &result {
            Ok(report) => {
                crate::metrics::pipeline::run_finished(started.elapsed().as_secs_f64());
                info!(
                    run_id = %run_id,
                    staged = report.staged.keys.len(),
                    rows_loaded = report.load.rows_loaded,
                    inserted = report.semantic.inserted,
                    "✅ Pipeline run finished"
                );
            }
            Err(e) => {
                crate::metrics::pipeline::run_failed();
                error!(run_id = %run_id, "❌ Pipeline run failed: {}", e);
            }
        }
        result
    }
}

/// Current time truncated to whole seconds, matching the stored precision.
pub fn load_timestamp(clock: &dyn Clock) -> NaiveDateTime {
    let now = clock.now().naive_utc();
    now.with_nanosecond(0).unwrap_or(now)
}
