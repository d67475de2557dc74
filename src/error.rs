use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Object store upload error for {file}: {source}")]
    Upload {
        file: String,
        #[source]
        source: ObjectStoreError,
    },

    #[error("{target} load error: {source}")]
    Load {
        target: String,
        #[source]
        source: WarehouseError,
    },

    #[error("Semantic refresh failed during {phase}: {source}")]
    Semantic {
        phase: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Failed to read inbox file {file}: {source}")]
    InboxRead {
        file: String,
        #[source]
        source: csv::Error,
    },

    #[error("Failed to archive {file}: {source}")]
    Archive {
        file: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum WarehouseError {
    #[error("SQL error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("line {line}: expected {expected} fields, found {found}")]
    ColumnCount {
        line: u64,
        expected: usize,
        found: usize,
    },

    #[error("line {line}: cannot parse {value:?} for column {column}")]
    Value {
        line: u64,
        column: &'static str,
        value: String,
    },

    #[error("invalid timestamp {0:?}")]
    Timestamp(String),

    #[error("stage error: {0}")]
    Stage(#[from] ObjectStoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
