use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use uuid::Uuid;

/// Business fields of one loan application, in source column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanApplication {
    pub serious_dlq_in_2yrs: i64,
    pub revolving_util_of_unsecured_lines: f64,
    pub age: i64,
    pub num_of_time_30_59_days_past_due_not_worse: i64,
    pub debt_ratio: f64,
    pub monthly_income: Option<f64>,
    pub num_of_open_cred_ln_n_loans: i64,
    pub num_of_times_90days_late: i64,
    pub num_real_estate_loans_or_lines: i64,
    pub num_of_time_60_89_day_past_due_nt_worse: i64,
    pub number_of_dependents: Option<i64>,
}

/// A warehouse row: business fields plus load provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanRow {
    pub application: LoanApplication,
    pub file_name: String,
    pub load_ts: NaiveDateTime,
}

/// Numeric columns the semantic outlier filter can screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlierColumn {
    DebtRatio,
    #[serde(rename = "revolving_util_of_unsecured_lines")]
    RevolvingUtilization,
    MonthlyIncome,
}

impl OutlierColumn {
    pub fn column_name(&self) -> &'static str {
        match self {
            OutlierColumn::DebtRatio => "debt_ratio",
            OutlierColumn::RevolvingUtilization => "revolving_util_of_unsecured_lines",
            OutlierColumn::MonthlyIncome => "monthly_income",
        }
    }

    pub fn value(&self, app: &LoanApplication) -> Option<f64> {
        match self {
            OutlierColumn::DebtRatio => Some(app.debt_ratio),
            OutlierColumn::RevolvingUtilization => Some(app.revolving_util_of_unsecured_lines),
            OutlierColumn::MonthlyIncome => app.monthly_income,
        }
    }
}

impl fmt::Display for OutlierColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column_name())
    }
}

/// Key of an object in the store, e.g. `loan-data/dump/loans.csv_1695254400`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Build a staging key: `{prefix}/{file_name}_{unix_ts}[.csv]`.
    pub fn staged(prefix: &str, file_name: &str, unix_ts: i64, csv_extension: bool) -> Self {
        let prefix = prefix.trim_matches('/');
        let suffix = if csv_extension { ".csv" } else { "" };
        if prefix.is_empty() {
            Self(format!("{file_name}_{unix_ts}{suffix}"))
        } else {
            Self(format!("{prefix}/{file_name}_{unix_ts}{suffix}"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hand-off from the stager to the loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedBatch {
    pub run_id: Uuid,
    pub staged_at: DateTime<Utc>,
    pub keys: Vec<ObjectKey>,
}

impl StagedBatch {
    pub fn new(run_id: Uuid, staged_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            staged_at,
            keys: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// Source of wall-clock time for key naming and load provenance.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to a settable instant; used by tests.
pub struct FixedClock {
    at: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { at: Mutex::new(at) }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        if let Ok(mut guard) = self.at.lock() {
            *guard = at;
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut guard) = self.at.lock() {
            *guard = *guard + by;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.at.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
