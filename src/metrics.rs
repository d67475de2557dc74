//! Pipeline metrics, recorded through the `metrics` facade.
//!
//! Nothing is exported unless `init_metrics` installs the Prometheus
//! exporter; recording without an installed recorder is a no-op.

use std::fmt;
use std::net::SocketAddr;

/// Enum representing all metric names used in the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    // Stager
    StagerFilesStaged,
    StagerBytesUploaded,
    StagerUploadErrors,

    // Loader
    LoaderObjectsLoaded,
    LoaderObjectsSkipped,
    LoaderRowsLoaded,
    LoaderErrors,

    // Semantic processor
    SemanticRowsSelected,
    SemanticRowsRejected,
    SemanticRowsInserted,
    SemanticErrors,

    // Warehouse
    WarehouseSessionsOpen,

    // Pipeline
    PipelineRuns,
    PipelineRunErrors,
    PipelineRunDuration,
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricName::StagerFilesStaged => "loan_stager_files_staged_total",
            MetricName::StagerBytesUploaded => "loan_stager_bytes_uploaded_total",
            MetricName::StagerUploadErrors => "loan_stager_upload_errors_total",

            MetricName::LoaderObjectsLoaded => "loan_loader_objects_loaded_total",
            MetricName::LoaderObjectsSkipped => "loan_loader_objects_skipped_total",
            MetricName::LoaderRowsLoaded => "loan_loader_rows_loaded_total",
            MetricName::LoaderErrors => "loan_loader_errors_total",

            MetricName::SemanticRowsSelected => "loan_semantic_rows_selected_total",
            MetricName::SemanticRowsRejected => "loan_semantic_rows_rejected_total",
            MetricName::SemanticRowsInserted => "loan_semantic_rows_inserted_total",
            MetricName::SemanticErrors => "loan_semantic_errors_total",

            MetricName::WarehouseSessionsOpen => "loan_warehouse_sessions_open",

            MetricName::PipelineRuns => "loan_pipeline_runs_total",
            MetricName::PipelineRunErrors => "loan_pipeline_run_errors_total",
            MetricName::PipelineRunDuration => "loan_pipeline_run_duration_seconds",
        };
        f.write_str(name)
    }
}

/// Install the Prometheus exporter on `0.0.0.0:{port}`.
pub fn init_metrics(port: u16) {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr);
    match builder.install() {
        Ok(()) => {
            tracing::info!("Prometheus exporter listening on http://{}/metrics", addr);
        }
        Err(e) => {
            tracing::warn!("Prometheus exporter install failed (possibly already installed): {}", e);
        }
    }
}

pub mod stager {
    use super::MetricName;

    pub fn file_staged(bytes: usize) {
        ::metrics::counter!(MetricName::StagerFilesStaged.to_string()).increment(1);
        ::metrics::counter!(MetricName::StagerBytesUploaded.to_string()).increment(bytes as u64);
    }

    pub fn upload_error() {
        ::metrics::counter!(MetricName::StagerUploadErrors.to_string()).increment(1);
    }
}

pub mod loader {
    use super::MetricName;

    pub fn objects_loaded(objects: usize, rows: u64) {
        ::metrics::counter!(MetricName::LoaderObjectsLoaded.to_string()).increment(objects as u64);
        ::metrics::counter!(MetricName::LoaderRowsLoaded.to_string()).increment(rows);
    }

    pub fn objects_skipped(objects: usize) {
        ::metrics::counter!(MetricName::LoaderObjectsSkipped.to_string()).increment(objects as u64);
    }

    pub fn load_error() {
        ::metrics::counter!(MetricName::LoaderErrors.to_string()).increment(1);
    }
}

pub mod semantic {
    use super::MetricName;

    pub fn refreshed(selected: usize, rejected: usize, inserted: u64) {
        ::metrics::counter!(MetricName::SemanticRowsSelected.to_string()).increment(selected as u64);
        ::metrics::counter!(MetricName::SemanticRowsRejected.to_string()).increment(rejected as u64);
        ::metrics::counter!(MetricName::SemanticRowsInserted.to_string()).increment(inserted);
    }

    pub fn refresh_error() {
        ::metrics::counter!(MetricName::SemanticErrors.to_string()).increment(1);
    }
}

pub mod warehouse {
    use super::MetricName;

    pub fn session_opened() {
        ::metrics::gauge!(MetricName::WarehouseSessionsOpen.to_string()).increment(1.0);
    }

    pub fn session_closed() {
        ::metrics::gauge!(MetricName::WarehouseSessionsOpen.to_string()).decrement(1.0);
    }
}

pub mod pipeline {
    use super::MetricName;

    pub fn run_finished(duration_secs: f64) {
        ::metrics::counter!(MetricName::PipelineRuns.to_string()).increment(1);
        ::metrics::histogram!(MetricName::PipelineRunDuration.to_string()).record(duration_secs);
    }

    pub fn run_failed() {
        ::metrics::counter!(MetricName::PipelineRunErrors.to_string()).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_follow_prometheus_conventions() {
        let all = [
            MetricName::StagerFilesStaged,
            MetricName::LoaderRowsLoaded,
            MetricName::SemanticRowsRejected,
            MetricName::PipelineRunDuration,
        ];
        for m in all {
            let name = m.to_string();
            assert!(name.starts_with("loan_"));
            assert!(name.chars().all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }
}
