use crate::constants::*;
use crate::error::{PipelineError, Result};
use crate::types::OutlierColumn;
use crate::warehouse::{ExternalStage, LoadStrategy, TableNames};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub object_store: ObjectStoreConfig,
    pub warehouse: WarehouseConfig,
    pub paths: PathsConfig,
    pub semantic: SemanticConfig,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ObjectStoreConfig {
    /// Directory that holds one sub-directory per bucket
    pub root: PathBuf,
    pub bucket: String,
    pub prefix: String,
    pub append_csv_extension: bool,
    pub write_header: bool,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("object-store"),
            bucket: DEFAULT_BUCKET.to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
            append_csv_extension: false,
            write_header: true,
        }
    }
}

/// Credential that never shows up in logs or debug output.
#[derive(Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WarehouseConfig {
    pub account: String,
    pub user: String,
    pub password: Secret,
    pub warehouse: String,
    pub database: String,
    pub schema: String,
    /// Directory for the embedded warehouse files
    pub path: PathBuf,
    pub raw_table: String,
    pub raw_view: Option<String>,
    pub semantic_table: String,
    pub stage_name: String,
    pub strategy: LoadStrategy,
    pub skip_header: usize,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            account: String::new(),
            user: String::new(),
            password: Secret::default(),
            warehouse: DEFAULT_WAREHOUSE.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            schema: DEFAULT_SCHEMA.to_string(),
            path: PathBuf::from("warehouse"),
            raw_table: DEFAULT_RAW_TABLE.to_string(),
            raw_view: None,
            semantic_table: DEFAULT_SEMANTIC_TABLE.to_string(),
            stage_name: DEFAULT_STAGE_NAME.to_string(),
            strategy: LoadStrategy::PerKey,
            skip_header: 1,
        }
    }
}

impl WarehouseConfig {
    pub fn tables(&self) -> TableNames {
        TableNames {
            schema: self.schema.clone(),
            raw_table: self.raw_table.clone(),
            raw_view: self
                .raw_view
                .clone()
                .unwrap_or_else(|| format!("v_{}", self.raw_table)),
            semantic_table: self.semantic_table.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub inbox: PathBuf,
    pub archive: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            inbox: PathBuf::from(DEFAULT_INBOX_DIR),
            archive: PathBuf::from(DEFAULT_ARCHIVE_DIR),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SemanticConfig {
    pub z_threshold: f64,
    pub outlier_columns: Vec<OutlierColumn>,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            z_threshold: DEFAULT_Z_THRESHOLD,
            outlier_columns: vec![OutlierColumn::DebtRatio, OutlierColumn::RevolvingUtilization],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_INTERVAL_SECS,
        }
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Config {
    /// Load from a TOML file; a missing file falls back to defaults. Env
    /// overrides are applied afterwards.
    pub fn load<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let config_path = config_path.as_ref();
        let mut config = if config_path.exists() {
            let config_content = fs::read_to_string(config_path).map_err(|e| {
                PipelineError::Config(format!(
                    "Failed to read config file '{}': {}",
                    config_path.display(),
                    e
                ))
            })?;
            Self::from_toml_str(&config_content)?
        } else {
            Config::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw)?;
        Ok(config)
    }

    /// Credentials and deployment paths come from the environment when set.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("WAREHOUSE_ACCOUNT") {
            self.warehouse.account = v;
        }
        if let Some(v) = lookup("WAREHOUSE_USER") {
            self.warehouse.user = v;
        }
        if let Some(v) = lookup("WAREHOUSE_PASSWORD") {
            self.warehouse.password = Secret::new(v);
        }
        if let Some(v) = lookup("OBJECT_STORE_BUCKET") {
            self.object_store.bucket = v;
        }
        if let Some(v) = lookup("LOAN_INBOX_DIR") {
            self.paths.inbox = PathBuf::from(v);
        }
        if let Some(v) = lookup("LOAN_ARCHIVE_DIR") {
            self.paths.archive = PathBuf::from(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let w = &self.warehouse;
        let tables = w.tables();
        for (what, name) in [
            ("warehouse.schema", w.schema.as_str()),
            ("warehouse.raw_table", w.raw_table.as_str()),
            ("warehouse.raw_view", tables.raw_view.as_str()),
            ("warehouse.semantic_table", w.semantic_table.as_str()),
            ("warehouse.stage_name", w.stage_name.as_str()),
        ] {
            if !is_identifier(name) {
                return Err(PipelineError::Config(format!(
                    "{what} '{name}' is not a valid identifier"
                )));
            }
        }
        if w.database.is_empty() || w.database.contains(['/', '\\']) {
            return Err(PipelineError::Config(format!(
                "warehouse.database '{}' is not a valid database name",
                w.database
            )));
        }
        if self.object_store.bucket.is_empty() || self.object_store.bucket.contains('/') {
            return Err(PipelineError::Config(format!(
                "object_store.bucket '{}' is not a valid bucket name",
                self.object_store.bucket
            )));
        }
        if !(self.semantic.z_threshold.is_finite() && self.semantic.z_threshold > 0.0) {
            return Err(PipelineError::Config(format!(
                "semantic.z_threshold must be positive, got {}",
                self.semantic.z_threshold
            )));
        }
        if self.schedule.interval_secs == 0 {
            return Err(PipelineError::Config(
                "schedule.interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Header rows left in each staged object. The stager strips the first
    /// row when `write_header` is off, so the copy skips one row fewer.
    pub fn staged_header_rows(&self) -> usize {
        if self.object_store.write_header {
            self.warehouse.skip_header
        } else {
            self.warehouse.skip_header.saturating_sub(1)
        }
    }

    pub fn stage(&self) -> ExternalStage {
        ExternalStage::new(&self.warehouse.stage_name, &self.object_store.prefix)
    }
}
