//! Z-score outlier screening for the semantic refresh.

use crate::types::{LoanRow, OutlierColumn};
use crate::warehouse::OutlierRejection;
use tracing::debug;

/// Mean and population standard deviation of a column.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColumnStats {
    pub count: usize,
    pub mean: f64,
    pub std: f64,
}

impl ColumnStats {
    pub fn compute(values: &[f64]) -> Option<Self> {
        let n = values.len();
        if n == 0 {
            return None;
        }
        let mean = values.iter().sum::<f64>() / n as f64;
        let variance = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
        Some(Self {
            count: n,
            mean,
            std: variance.sqrt(),
        })
    }

    /// No spread beyond the rounding error of summing identical values.
    pub fn is_degenerate(&self) -> bool {
        self.count < 2
            || !self.std.is_finite()
            || self.std <= f64::EPSILON * self.mean.abs().max(1.0)
    }

    /// `None` when the score is undefined: fewer than two values or no spread.
    pub fn z_score(&self, value: f64) -> Option<f64> {
        if self.is_degenerate() {
            return None;
        }
        Some((value - self.mean) / self.std)
    }
}

#[derive(Debug, Default)]
pub struct FilterOutcome {
    pub kept: Vec<LoanRow>,
    pub rejected: Vec<OutlierRejection>,
}

/// Drops rows whose `|z|` exceeds the threshold, one column at a time.
#[derive(Debug, Clone)]
pub struct ZScoreFilter {
    threshold: f64,
    columns: Vec<OutlierColumn>,
}

impl ZScoreFilter {
    pub fn new(threshold: f64, columns: Vec<OutlierColumn>) -> Self {
        Self { threshold, columns }
    }

    /// Each column's statistics are taken over the survivors of the previous
    /// column. Nulls are left out of the statistics and always kept.
    pub fn apply(&self, rows: Vec<LoanRow>) -> FilterOutcome {
        let mut outcome = FilterOutcome {
            kept: rows,
            rejected: Vec::new(),
        };
        for column in &self.columns {
            let values: Vec<f64> = outcome
                .kept
                .iter()
                .filter_map(|r| column.value(&r.application))
                .collect();
            let Some(stats) = ColumnStats::compute(&values) else {
                continue;
            };
            debug!(
                column = column.column_name(),
                mean = stats.mean,
                std = stats.std,
                n = stats.count,
                "outlier screen"
            );

            let (kept, rejected): (Vec<_>, Vec<_>) = std::mem::take(&mut outcome.kept)
                .into_iter()
                .map(|row| {
                    let z = column
                        .value(&row.application)
                        .and_then(|v| stats.z_score(v));
                    (row, z)
                })
                .partition(|(_, z)| z.map_or(true, |z| z.abs() <= self.threshold));

            outcome.kept = kept.into_iter().map(|(row, _)| row).collect();
            outcome
                .rejected
                .extend(rejected.into_iter().map(|(row, z)| OutlierRejection {
                    row,
                    column: column.column_name(),
                    z_score: z.unwrap_or_default(),
                }));
        }
        outcome
    }
}
