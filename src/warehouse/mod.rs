//! Warehouse boundary: sessions, bulk copy from staged objects, and the
//! semantic-table operations the pipeline needs.

pub mod file_format;
pub mod sqlite;

pub use file_format::FileFormat;
pub use sqlite::SqliteWarehouse;

use crate::error::WarehouseError;
use crate::types::{LoanRow, ObjectKey};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub type WarehouseResult<T> = std::result::Result<T, WarehouseError>;

/// How the loader addresses staged objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategy {
    /// One copy statement per key handed over by the stager.
    #[default]
    PerKey,
    /// One copy statement over the whole stage prefix.
    Batch,
}

impl LoadStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStrategy::PerKey => "per_key",
            LoadStrategy::Batch => "batch",
        }
    }
}

impl std::str::FromStr for LoadStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "per_key" => Ok(LoadStrategy::PerKey),
            "batch" => Ok(LoadStrategy::Batch),
            other => Err(format!("unknown load strategy '{other}'")),
        }
    }
}

/// Named external stage bound to an object-store prefix.
#[derive(Debug, Clone)]
pub struct ExternalStage {
    pub name: String,
    pub prefix: String,
}

impl ExternalStage {
    pub fn new(name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    /// `@stage/relative-path` for a key inside this stage.
    pub fn location(&self, key: &ObjectKey) -> String {
        let raw = key.as_str();
        let relative = if self.prefix.is_empty() {
            raw
        } else {
            raw.strip_prefix(&format!("{}/", self.prefix)).unwrap_or(raw)
        };
        format!("@{}/{}", self.name, relative)
    }
}

/// Fully qualified names of the tables the pipeline touches.
#[derive(Debug, Clone)]
pub struct TableNames {
    pub schema: String,
    pub raw_table: String,
    pub raw_view: String,
    pub semantic_table: String,
}

impl TableNames {
    pub fn raw(&self) -> String {
        format!("{}.{}", self.schema, self.raw_table)
    }

    pub fn view(&self) -> String {
        format!("{}.{}", self.schema, self.raw_view)
    }

    pub fn semantic(&self) -> String {
        format!("{}.{}", self.schema, self.semantic_table)
    }

    /// Audit table for rows the outlier filter rejected.
    pub fn outliers(&self) -> String {
        format!("{}.{}_outliers", self.schema, self.semantic_table)
    }

    pub fn load_history(&self) -> String {
        format!("{}.{}", self.schema, crate::constants::LOAD_HISTORY_TABLE)
    }
}

/// Staged object contents fetched for a copy.
#[derive(Debug, Clone)]
pub struct StagedFile {
    pub key: ObjectKey,
    pub bytes: Vec<u8>,
}

impl StagedFile {
    pub fn checksum(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(&self.bytes);
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchCopyReport {
    pub objects_loaded: usize,
    pub objects_skipped: usize,
    pub rows_loaded: u64,
}

/// A raw row the outlier filter rejected, kept for audit.
#[derive(Debug, Clone)]
pub struct OutlierRejection {
    pub row: LoanRow,
    pub column: &'static str,
    pub z_score: f64,
}

/// Acquire-per-stage connection scope. Dropping the session releases it on
/// every path, including early returns with `?`.
pub trait WarehouseSession: Send {
    fn session_id(&self) -> &str;

    /// Create raw table, raw view, semantic table, load history and outlier
    /// audit table if missing.
    fn ensure_schema(&mut self) -> WarehouseResult<()>;

    /// Copy one staged object into the raw table. Atomic per object.
    fn copy_into_raw(
        &mut self,
        file: &StagedFile,
        format: &FileFormat,
        load_ts: NaiveDateTime,
    ) -> WarehouseResult<u64>;

    /// Copy every given object in one statement, skipping objects whose key
    /// and checksum are already in the load history.
    fn copy_batch_into_raw(
        &mut self,
        files: &[StagedFile],
        format: &FileFormat,
        load_ts: NaiveDateTime,
    ) -> WarehouseResult<BatchCopyReport>;

    /// `max(_load_ts)` over the semantic table and the outlier table, so rows
    /// the filter rejected also count as processed.
    fn semantic_watermark(&mut self) -> WarehouseResult<Option<NaiveDateTime>>;

    /// Raw-view rows with `_load_ts` strictly after `watermark`.
    fn select_raw_since(&mut self, watermark: NaiveDateTime) -> WarehouseResult<Vec<LoanRow>>;

    /// Append survivors to the semantic table and rejections to the outlier
    /// table in one transaction.
    fn append_semantic(
        &mut self,
        rows: &[LoanRow],
        rejected: &[OutlierRejection],
    ) -> WarehouseResult<u64>;

    fn raw_row_count(&mut self) -> WarehouseResult<u64>;
    fn semantic_row_count(&mut self) -> WarehouseResult<u64>;
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Waits until the connection is free; sessions never overlap.
    async fn open_session(&self) -> WarehouseResult<Box<dyn WarehouseSession>>;
}
