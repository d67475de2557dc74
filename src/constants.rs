//! Deployment defaults shared by the config layer and the warehouse schema.
use chrono::{NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;

pub const DEFAULT_BUCKET: &str = "TEST001";
pub const DEFAULT_PREFIX: &str = "loan-data/dump";

pub const DEFAULT_WAREHOUSE: &str = "TEST_WAREHOUSE";
pub const DEFAULT_DATABASE: &str = "TESTDB";
pub const DEFAULT_SCHEMA: &str = "CORE";
pub const DEFAULT_RAW_TABLE: &str = "tbl_loan_application";
pub const DEFAULT_SEMANTIC_TABLE: &str = "tbl_loan_application_semantic";
pub const DEFAULT_STAGE_NAME: &str = "stg_s3_loan_application";

pub const DEFAULT_INBOX_DIR: &str = "/inbox/loan-data";
pub const DEFAULT_ARCHIVE_DIR: &str = "/archive/loan-data";
pub const DEFAULT_LOG_DIR: &str = "logs";

pub const DEFAULT_Z_THRESHOLD: f64 = 3.0;
pub const DEFAULT_INTERVAL_SECS: u64 = 3600;

pub const INBOX_EXTENSION: &str = ".csv";

/// Provenance column names on the raw and semantic tables
pub const FILE_NAME_COLUMN: &str = "_file_name";
pub const LOAD_TS_COLUMN: &str = "_load_ts";
pub const LOAD_HISTORY_TABLE: &str = "_load_history";

/// Every timestamp stored in the warehouse uses this layout (second granularity)
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Source CSVs carry a leading row index plus the eleven business fields
pub const SOURCE_FIELD_COUNT: usize = 12;

/// Watermark used when the semantic table is still empty
pub static DEFAULT_WATERMARK: Lazy<NaiveDateTime> = Lazy::new(|| {
    NaiveDate::from_ymd_opt(1970, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
});

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}
