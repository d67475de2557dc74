use crate::constants::SOURCE_FIELD_COUNT;
use crate::error::WarehouseError;
use crate::types::LoanApplication;
use csv::{ReaderBuilder, StringRecord, Trim};

/// CSV file format used by the bulk copy operator.
#[derive(Debug, Clone)]
pub struct FileFormat {
    pub skip_header: usize,
    pub trim_space: bool,
    pub null_if: Vec<String>,
}

impl Default for FileFormat {
    fn default() -> Self {
        Self {
            skip_header: 1,
            trim_space: false,
            null_if: vec![String::new(), "NA".to_string(), "NaN".to_string(), "\\N".to_string()],
        }
    }
}

impl FileFormat {
    pub fn with_trim(mut self, trim_space: bool) -> Self {
        self.trim_space = trim_space;
        self
    }

    /// Parse staged CSV bytes into applications, mapping source fields 2..=12
    /// positionally. Field 1 (row index) is discarded.
    pub fn parse(&self, bytes: &[u8]) -> Result<Vec<LoanApplication>, WarehouseError> {
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(if self.trim_space { Trim::All } else { Trim::None })
            .from_reader(bytes);

        let mut out = Vec::new();
        for (idx, record) in reader.records().enumerate() {
            let record = record?;
            if idx < self.skip_header {
                continue;
            }
            let line = record
                .position()
                .map(|p| p.line())
                .unwrap_or(idx as u64 + 1);
            out.push(self.parse_record(&record, line)?);
        }
        Ok(out)
    }

    fn parse_record(
        &self,
        record: &StringRecord,
        line: u64,
    ) -> Result<LoanApplication, WarehouseError> {
        if record.len() != SOURCE_FIELD_COUNT {
            return Err(WarehouseError::ColumnCount {
                line,
                expected: SOURCE_FIELD_COUNT,
                found: record.len(),
            });
        }
        let field = |i: usize| record.get(i).unwrap_or_default();
        let fp = FieldParser { format: self, line };

        Ok(LoanApplication {
            serious_dlq_in_2yrs: fp.int("serious_dlq_in_2yrs", field(1))?,
            revolving_util_of_unsecured_lines: fp
                .real("revolving_util_of_unsecured_lines", field(2))?,
            age: fp.int("age", field(3))?,
            num_of_time_30_59_days_past_due_not_worse: fp
                .int("num_of_time_30_59_days_past_due_not_worse", field(4))?,
            debt_ratio: fp.real("debt_ratio", field(5))?,
            monthly_income: fp.opt_real("monthly_income", field(6))?,
            num_of_open_cred_ln_n_loans: fp.int("num_of_open_cred_ln_n_loans", field(7))?,
            num_of_times_90days_late: fp.int("num_of_times_90days_late", field(8))?,
            num_real_estate_loans_or_lines: fp.int("num_real_estate_loans_or_lines", field(9))?,
            num_of_time_60_89_day_past_due_nt_worse: fp
                .int("num_of_time_60_89_day_past_due_nt_worse", field(10))?,
            number_of_dependents: fp.opt_int("number_of_dependents", field(11))?,
        })
    }

    fn is_null(&self, raw: &str) -> bool {
        self.null_if.iter().any(|n| n == raw)
    }
}

struct FieldParser<'a> {
    format: &'a FileFormat,
    line: u64,
}

impl FieldParser<'_> {
    fn bad(&self, column: &'static str, raw: &str) -> WarehouseError {
        WarehouseError::Value {
            line: self.line,
            column,
            value: raw.to_string(),
        }
    }

    fn opt_real(&self, column: &'static str, raw: &str) -> Result<Option<f64>, WarehouseError> {
        if self.format.is_null(raw) {
            return Ok(None);
        }
        match raw.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(Some(v)),
            _ => Err(self.bad(column, raw)),
        }
    }

    fn real(&self, column: &'static str, raw: &str) -> Result<f64, WarehouseError> {
        self.opt_real(column, raw)?
            .ok_or_else(|| self.bad(column, raw))
    }

    /// Integers may arrive as `2.0` when the writer used a float column.
    fn opt_int(&self, column: &'static str, raw: &str) -> Result<Option<i64>, WarehouseError> {
        if self.format.is_null(raw) {
            return Ok(None);
        }
        if let Ok(v) = raw.parse::<i64>() {
            return Ok(Some(v));
        }
        match raw.parse::<f64>() {
            Ok(v) if v.is_finite() && v.fract() == 0.0 => Ok(Some(v as i64)),
            _ => Err(self.bad(column, raw)),
        }
    }

    fn int(&self, column: &'static str, raw: &str) -> Result<i64, WarehouseError> {
        self.opt_int(column, raw)?
            .ok_or_else(|| self.bad(column, raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
,SeriousDlqin2yrs,RevolvingUtilizationOfUnsecuredLines,age,NumberOfTime30-59DaysPastDueNotWorse,DebtRatio,MonthlyIncome,NumberOfOpenCreditLinesAndLoans,NumberOfTimes90DaysLate,NumberRealEstateLoansOrLines,NumberOfTime60-89DaysPastDueNotWorse,NumberOfDependents
1,1,0.766126609,45,2,0.802982129,9120,13,0,6,0,2
2,0,0.957151019,40,0,0.121876201,2600,4,0,0,0,1
3,0,0.65818014,38,1,0.085113375,,2,1,0,0,
";

    #[test]
    fn maps_fields_positionally_and_skips_header() {
        let rows = FileFormat::default().parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(rows.len(), 3);

        let first = &rows[0];
        assert_eq!(first.serious_dlq_in_2yrs, 1);
        assert!((first.revolving_util_of_unsecured_lines - 0.766126609).abs() < 1e-12);
        assert_eq!(first.age, 45);
        assert_eq!(first.num_of_time_30_59_days_past_due_not_worse, 2);
        assert!((first.debt_ratio - 0.802982129).abs() < 1e-12);
        assert_eq!(first.monthly_income, Some(9120.0));
        assert_eq!(first.num_of_open_cred_ln_n_loans, 13);
        assert_eq!(first.num_of_times_90days_late, 0);
        assert_eq!(first.num_real_estate_loans_or_lines, 6);
        assert_eq!(first.num_of_time_60_89_day_past_due_nt_worse, 0);
        assert_eq!(first.number_of_dependents, Some(2));

        assert_eq!(rows[2].monthly_income, None);
        assert_eq!(rows[2].number_of_dependents, None);
    }

    #[test]
    fn accepts_float_spelled_integers() {
        let csv = "1,0,0.5,30.0,0,0.2,1000.0,3,0,1,0,2.0\n";
        let format = FileFormat {
            skip_header: 0,
            ..FileFormat::default()
        };
        let rows = format.parse(csv.as_bytes()).unwrap();
        assert_eq!(rows[0].age, 30);
        assert_eq!(rows[0].number_of_dependents, Some(2));
    }

    #[test]
    fn rejects_wrong_field_count() {
        let csv = "h\n1,0,0.5,30\n";
        let err = FileFormat::default().parse(csv.as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            WarehouseError::ColumnCount { expected: 12, found: 4, .. }
        ));
    }

    #[test]
    fn padded_fields_need_trim() {
        let csv = "1, 0,0.5,30,0,0.2,1000,3,0,1,0,2\n";
        let strict = FileFormat {
            skip_header: 0,
            ..FileFormat::default()
        };
        let err = strict.parse(csv.as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            WarehouseError::Value { column: "serious_dlq_in_2yrs", .. }
        ));

        let trimmed = strict.with_trim(true);
        assert_eq!(trimmed.parse(csv.as_bytes()).unwrap().len(), 1);
    }
}
