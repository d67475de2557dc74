use super::outliers::ZScoreFilter;
use crate::config::Config;
use crate::constants::DEFAULT_WATERMARK;
use crate::error::{PipelineError, Result};
use crate::warehouse::Warehouse;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SemanticReport {
    pub watermark: NaiveDateTime,
    pub selected: usize,
    pub rejected: usize,
    pub inserted: u64,
}

fn semantic_err<E>(phase: &'static str) -> impl FnOnce(E) -> PipelineError
where
    E: std::error::Error + Send + Sync + 'static,
{
    move |e| PipelineError::Semantic {
        phase,
        source: Box::new(e),
    }
}

/// Appends newly loaded raw rows, minus outliers, to the semantic table.
pub struct SemanticProcessor {
    warehouse: Arc<dyn Warehouse>,
    filter: ZScoreFilter,
    semantic_table: String,
}

impl SemanticProcessor {
    pub fn new(config: &Config, warehouse: Arc<dyn Warehouse>) -> Self {
        Self {
            warehouse,
            filter: ZScoreFilter::new(
                config.semantic.z_threshold,
                config.semantic.outlier_columns.clone(),
            ),
            semantic_table: config.warehouse.tables().semantic(),
        }
    }

    #[instrument(skip(self), fields(table = %self.semantic_table))]
    pub async fn refresh_semantic(&self) -> Result<SemanticReport> {
        let result = self.refresh().await;
        if result.is_err() {
            crate::metrics::semantic::refresh_error();
        }
        result
    }

    async fn refresh(&self) -> Result<SemanticReport> {
        let mut session = self
            .warehouse
            .open_session()
            .await
            .map_err(semantic_err("connect"))?;
        debug!("Refreshing {} in warehouse session {}", self.semantic_table, session.session_id());

        let watermark = session
            .semantic_watermark()
            .map_err(semantic_err("watermark"))?
            .unwrap_or(*DEFAULT_WATERMARK);
        info!("Semantic watermark is {}", watermark);

        let fresh = session
            .select_raw_since(watermark)
            .map_err(semantic_err("select"))?;
        let selected = fresh.len();
        if selected == 0 {
            info!("No raw rows newer than the watermark");
            crate::metrics::semantic::refreshed(0, 0, 0);
            return Ok(SemanticReport {
                watermark,
                selected: 0,
                rejected: 0,
                inserted: 0,
            });
        }

        let outcome = self.filter.apply(fresh);
        let rejected = outcome.rejected.len();
        let inserted = session
            .append_semantic(&outcome.kept, &outcome.rejected)
            .map_err(semantic_err("insert"))?;

        crate::metrics::semantic::refreshed(selected, rejected, inserted);
        info!(
            "✨ Appended {} of {} new row(s) to {} ({} outlier(s) dropped)",
            inserted, selected, self.semantic_table, rejected
        );
        Ok(SemanticReport {
            watermark,
            selected,
            rejected,
            inserted,
        })
    }
}
