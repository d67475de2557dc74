use super::{
    BatchCopyReport, FileFormat, OutlierRejection, StagedFile, TableNames, Warehouse,
    WarehouseResult, WarehouseSession,
};
use crate::constants::{format_timestamp, FILE_NAME_COLUMN, LOAD_TS_COLUMN, TIMESTAMP_FORMAT};
use crate::error::WarehouseError;
use crate::types::{LoanApplication, LoanRow};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

/// Business columns in source order; shared by every table the pipeline writes.
const BUSINESS_COLUMNS: [&str; 11] = [
    "serious_dlq_in_2yrs",
    "revolving_util_of_unsecured_lines",
    "age",
    "num_of_time_30_59_days_past_due_not_worse",
    "debt_ratio",
    "monthly_income",
    "num_of_open_cred_ln_n_loans",
    "num_of_times_90days_late",
    "num_real_estate_loans_or_lines",
    "num_of_time_60_89_day_past_due_nt_worse",
    "number_of_dependents",
];

const BUSINESS_DDL: &str = "
    serious_dlq_in_2yrs                        INTEGER NOT NULL,
    revolving_util_of_unsecured_lines          REAL    NOT NULL,
    age                                        INTEGER NOT NULL,
    num_of_time_30_59_days_past_due_not_worse  INTEGER NOT NULL,
    debt_ratio                                 REAL    NOT NULL,
    monthly_income                             REAL,
    num_of_open_cred_ln_n_loans                INTEGER NOT NULL,
    num_of_times_90days_late                   INTEGER NOT NULL,
    num_real_estate_loans_or_lines             INTEGER NOT NULL,
    num_of_time_60_89_day_past_due_nt_worse    INTEGER NOT NULL,
    number_of_dependents                       INTEGER,
    _file_name                                 TEXT    NOT NULL,
    _load_ts                                   TEXT    NOT NULL";

fn column_list() -> String {
    let mut cols: Vec<&str> = BUSINESS_COLUMNS.to_vec();
    cols.push(FILE_NAME_COLUMN);
    cols.push(LOAD_TS_COLUMN);
    cols.join(", ")
}

fn insert_sql(table: &str, extra: &[&str]) -> String {
    let mut cols = column_list();
    for c in extra {
        cols.push_str(", ");
        cols.push_str(c);
    }
    let n = BUSINESS_COLUMNS.len() + 2 + extra.len();
    let placeholders = (1..=n)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {table} ({cols}) VALUES ({placeholders})")
}

/// Embedded warehouse on SQLite. The configured schema is an attached
/// database, so tables read as `CORE.tbl_loan_application`.
pub struct SqliteWarehouse {
    conn: Arc<Mutex<Connection>>,
    tables: TableNames,
}

impl SqliteWarehouse {
    /// Open `{dir}/{database}.db` and attach `{dir}/{database}.{schema}.db`.
    pub fn open<P: AsRef<Path>>(dir: P, database: &str, tables: TableNames) -> WarehouseResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let main_path = dir.join(format!("{database}.db"));
        let schema_path = dir.join(format!("{}.{}.db", database, tables.schema));
        info!("Opening warehouse at {}", main_path.display());
        let conn = Connection::open(main_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute(
            &format!("ATTACH DATABASE ?1 AS {}", tables.schema),
            params![schema_path.to_string_lossy().into_owned()],
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            tables,
        })
    }

    pub fn open_in_memory(tables: TableNames) -> WarehouseResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(&format!("ATTACH DATABASE ':memory:' AS {};", tables.schema))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            tables,
        })
    }
}

#[async_trait]
impl Warehouse for SqliteWarehouse {
    async fn open_session(&self) -> WarehouseResult<Box<dyn WarehouseSession>> {
        let conn = self.conn.clone().lock_owned().await;
        let id = Uuid::new_v4().to_string();
        debug!("Opened warehouse session {}", id);
        crate::metrics::warehouse::session_opened();
        Ok(Box::new(SqliteSession {
            id,
            conn,
            tables: self.tables.clone(),
        }))
    }
}

pub struct SqliteSession {
    id: String,
    conn: OwnedMutexGuard<Connection>,
    tables: TableNames,
}

impl Drop for SqliteSession {
    fn drop(&mut self) {
        debug!("Closed warehouse session {}", self.id);
        crate::metrics::warehouse::session_closed();
    }
}

fn bind_row(a: &LoanApplication, file_name: &str, load_ts: &str) -> Vec<Box<dyn rusqlite::ToSql>> {
    vec![
        Box::new(a.serious_dlq_in_2yrs),
        Box::new(a.revolving_util_of_unsecured_lines),
        Box::new(a.age),
        Box::new(a.num_of_time_30_59_days_past_due_not_worse),
        Box::new(a.debt_ratio),
        Box::new(a.monthly_income),
        Box::new(a.num_of_open_cred_ln_n_loans),
        Box::new(a.num_of_times_90days_late),
        Box::new(a.num_real_estate_loans_or_lines),
        Box::new(a.num_of_time_60_89_day_past_due_nt_worse),
        Box::new(a.number_of_dependents),
        Box::new(file_name.to_string()),
        Box::new(load_ts.to_string()),
    ]
}

fn parse_ts(raw: &str) -> WarehouseResult<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map_err(|_| WarehouseError::Timestamp(raw.to_string()))
}

impl SqliteSession {
    /// Parse and insert one staged object inside `tx`; returns rows inserted.
    fn copy_file(
        tx: &Transaction<'_>,
        tables: &TableNames,
        file: &StagedFile,
        format: &FileFormat,
        load_ts: &str,
        strategy: &str,
    ) -> WarehouseResult<u64> {
        let applications = format.parse(&file.bytes)?;
        let mut stmt = tx.prepare_cached(&insert_sql(&tables.raw(), &[]))?;
        for application in &applications {
            let bound = bind_row(application, file.key.as_str(), load_ts);
            stmt.execute(rusqlite::params_from_iter(bound.iter()))?;
        }
        let rows = applications.len() as u64;
        tx.execute(
            &format!(
                "INSERT INTO {} (file_name, checksum, row_count, load_ts, strategy) VALUES (?1, ?2, ?3, ?4, ?5)",
                tables.load_history()
            ),
            params![file.key.as_str(), file.checksum(), rows as i64, load_ts, strategy],
        )?;
        Ok(rows)
    }

    fn count(&mut self, table: &str) -> WarehouseResult<u64> {
        let n: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?;
        Ok(n as u64)
    }
}

impl WarehouseSession for SqliteSession {
    fn session_id(&self) -> &str {
        &self.id
    }

    fn ensure_schema(&mut self) -> WarehouseResult<()> {
        let t = &self.tables;
        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {raw} ({cols});
            CREATE VIEW IF NOT EXISTS {view} AS SELECT * FROM {raw_bare};
            CREATE TABLE IF NOT EXISTS {semantic} ({cols});
            CREATE TABLE IF NOT EXISTS {outliers} ({cols},
                _outlier_column TEXT NOT NULL,
                _z_score        REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {history} (
                file_name  TEXT    NOT NULL,
                checksum   TEXT    NOT NULL,
                row_count  INTEGER NOT NULL,
                load_ts    TEXT    NOT NULL,
                strategy   TEXT    NOT NULL
            );
            CREATE INDEX IF NOT EXISTS {schema}.idx_load_history_file ON {history_bare} (file_name, checksum);
            "#,
            raw = t.raw(),
            raw_bare = t.raw_table,
            view = t.view(),
            semantic = t.semantic(),
            outliers = t.outliers(),
            history = t.load_history(),
            history_bare = crate::constants::LOAD_HISTORY_TABLE,
            schema = t.schema,
            cols = BUSINESS_DDL,
        );
        self.conn.execute_batch(&sql)?;
        info!("Warehouse schema {} ready", t.schema);
        Ok(())
    }

    fn copy_into_raw(
        &mut self,
        file: &StagedFile,
        format: &FileFormat,
        load_ts: NaiveDateTime,
    ) -> WarehouseResult<u64> {
        let ts = format_timestamp(&load_ts);
        let tables = self.tables.clone();
        let tx = self.conn.transaction()?;
        let rows = Self::copy_file(&tx, &tables, file, format, &ts, "per_key")?;
        tx.commit()?;
        Ok(rows)
    }

    fn copy_batch_into_raw(
        &mut self,
        files: &[StagedFile],
        format: &FileFormat,
        load_ts: NaiveDateTime,
    ) -> WarehouseResult<BatchCopyReport> {
        let ts = format_timestamp(&load_ts);
        let tables = self.tables.clone();
        let tx = self.conn.transaction()?;
        let mut report = BatchCopyReport::default();
        for file in files {
            let seen = tx
                .query_row(
                    &format!(
                        "SELECT 1 FROM {} WHERE file_name = ?1 AND checksum = ?2 LIMIT 1",
                        tables.load_history()
                    ),
                    params![file.key.as_str(), file.checksum()],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if seen {
                debug!("Skipping {}: already in load history", file.key);
                report.objects_skipped += 1;
                continue;
            }
            report.rows_loaded += Self::copy_file(&tx, &tables, file, format, &ts, "batch")?;
            report.objects_loaded += 1;
        }
        tx.commit()?;
        Ok(report)
    }

    fn semantic_watermark(&mut self) -> WarehouseResult<Option<NaiveDateTime>> {
        let raw: Option<String> = self.conn.query_row(
            &format!(
                "SELECT MAX(ts) FROM (SELECT MAX(_load_ts) AS ts FROM {} UNION ALL SELECT MAX(_load_ts) FROM {})",
                self.tables.semantic(),
                self.tables.outliers()
            ),
            [],
            |r| r.get(0),
        )?;
        raw.as_deref().map(parse_ts).transpose()
    }

    fn select_raw_since(&mut self, watermark: NaiveDateTime) -> WarehouseResult<Vec<LoanRow>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE _load_ts > ?1 ORDER BY _load_ts, _file_name",
            column_list(),
            self.tables.view()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let raw_rows = stmt
            .query_map(params![format_timestamp(&watermark)], |r| {
                let application = LoanApplication {
                    serious_dlq_in_2yrs: r.get(0)?,
                    revolving_util_of_unsecured_lines: r.get(1)?,
                    age: r.get(2)?,
                    num_of_time_30_59_days_past_due_not_worse: r.get(3)?,
                    debt_ratio: r.get(4)?,
                    monthly_income: r.get(5)?,
                    num_of_open_cred_ln_n_loans: r.get(6)?,
                    num_of_times_90days_late: r.get(7)?,
                    num_real_estate_loans_or_lines: r.get(8)?,
                    num_of_time_60_89_day_past_due_nt_worse: r.get(9)?,
                    number_of_dependents: r.get(10)?,
                };
                let file_name: String = r.get(11)?;
                let load_ts: String = r.get(12)?;
                Ok((application, file_name, load_ts))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw_rows
            .into_iter()
            .map(|(application, file_name, load_ts)| -> WarehouseResult<LoanRow> {
                Ok(LoanRow {
                    application,
                    file_name,
                    load_ts: parse_ts(&load_ts)?,
                })
            })
            .collect()
    }

    fn append_semantic(
        &mut self,
        rows: &[LoanRow],
        rejected: &[OutlierRejection],
    ) -> WarehouseResult<u64> {
        let tables = self.tables.clone();
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(&insert_sql(&tables.semantic(), &[]))?;
            for row in rows {
                let bound = bind_row(&row.application, &row.file_name, &format_timestamp(&row.load_ts));
                stmt.execute(rusqlite::params_from_iter(bound.iter()))?;
            }
            let mut audit = tx.prepare_cached(&insert_sql(
                &tables.outliers(),
                &["_outlier_column", "_z_score"],
            ))?;
            for r in rejected {
                let mut bound = bind_row(
                    &r.row.application,
                    &r.row.file_name,
                    &format_timestamp(&r.row.load_ts),
                );
                bound.push(Box::new(r.column.to_string()));
                bound.push(Box::new(r.z_score));
                audit.execute(rusqlite::params_from_iter(bound.iter()))?;
            }
        }
        tx.commit()?;
        Ok(rows.len() as u64)
    }

    fn raw_row_count(&mut self) -> WarehouseResult<u64> {
        let table = self.tables.raw();
        self.count(&table)
    }

    fn semantic_row_count(&mut self) -> WarehouseResult<u64> {
        let table = self.tables.semantic();
        self.count(&table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ObjectKey;
    use chrono::NaiveDate;

    fn tables() -> TableNames {
        TableNames {
            schema: "CORE".into(),
            raw_table: "tbl_loan_application".into(),
            raw_view: "v_tbl_loan_application".into(),
            semantic_table: "tbl_loan_application_semantic".into(),
        }
    }

    fn ts(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn staged(key: &str, body: &str) -> StagedFile {
        StagedFile {
            key: ObjectKey::new(key),
            bytes: body.as_bytes().to_vec(),
        }
    }

    const BODY: &str = "idx,a,b,c,d,e,f,g,h,i,j,k\n\
        1,0,0.5,30,0,0.2,1000,3,0,1,0,2\n\
        2,1,0.9,41,1,0.4,,5,0,0,0,\n";

    async fn ready() -> SqliteWarehouse {
        let wh = SqliteWarehouse::open_in_memory(tables()).unwrap();
        wh.open_session().await.unwrap().ensure_schema().unwrap();
        wh
    }

    #[tokio::test]
    async fn copy_tags_rows_with_key_and_load_ts() {
        let wh = ready().await;
        let mut session = wh.open_session().await.unwrap();
        let n = session
            .copy_into_raw(&staged("dump/a.csv_1", BODY), &FileFormat::default(), ts(1, 0, 0))
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(session.raw_row_count().unwrap(), 2);

        let rows = session.select_raw_since(ts(0, 0, 0)).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.file_name == "dump/a.csv_1"));
        assert!(rows.iter().all(|r| r.load_ts == ts(1, 0, 0)));
        assert_eq!(rows.iter().filter(|r| r.application.monthly_income.is_none()).count(), 1);

        assert!(session.select_raw_since(ts(1, 0, 0)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_copy_leaves_no_rows() {
        let wh = ready().await;
        let mut session = wh.open_session().await.unwrap();
        let bad = "h\n1,0,0.5,30,0,0.2,1000,3,0,1,0,2\n2,x,0.9,41,1,0.4,,5,0,0,0,\n";
        let err = session
            .copy_into_raw(&staged("dump/bad.csv_1", bad), &FileFormat::default(), ts(1, 0, 0))
            .unwrap_err();
        assert!(matches!(err, WarehouseError::Value { line: 3, .. }));
        assert_eq!(session.raw_row_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn batch_copy_skips_objects_in_load_history() {
        let wh = ready().await;
        let mut session = wh.open_session().await.unwrap();
        let files = vec![staged("dump/a.csv_1", BODY), staged("dump/b.csv_2", BODY)];
        let first = session
            .copy_batch_into_raw(&files, &FileFormat::default(), ts(1, 0, 0))
            .unwrap();
        assert_eq!(first.objects_loaded, 2);
        assert_eq!(first.rows_loaded, 4);

        let second = session
            .copy_batch_into_raw(&files, &FileFormat::default(), ts(2, 0, 0))
            .unwrap();
        assert_eq!(second.objects_loaded, 0);
        assert_eq!(second.objects_skipped, 2);
        assert_eq!(session.raw_row_count().unwrap(), 4);
    }

    #[tokio::test]
    async fn watermark_tracks_semantic_max_load_ts() {
        let wh = ready().await;
        let mut session = wh.open_session().await.unwrap();
        assert_eq!(session.semantic_watermark().unwrap(), None);

        session
            .copy_into_raw(&staged("dump/a.csv_1", BODY), &FileFormat::default(), ts(3, 0, 0))
            .unwrap();
        let rows = session.select_raw_since(ts(0, 0, 0)).unwrap();
        let inserted = session.append_semantic(&rows, &[]).unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(session.semantic_watermark().unwrap(), Some(ts(3, 0, 0)));
        assert_eq!(session.semantic_row_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn watermark_counts_rejected_rows() {
        let wh = ready().await;
        let mut session = wh.open_session().await.unwrap();
        session
            .copy_into_raw(&staged("dump/a.csv_1", BODY), &FileFormat::default(), ts(4, 0, 0))
            .unwrap();
        let rows = session.select_raw_since(ts(0, 0, 0)).unwrap();
        let rejected: Vec<OutlierRejection> = rows
            .into_iter()
            .map(|row| OutlierRejection {
                row,
                column: "debt_ratio",
                z_score: 5.0,
            })
            .collect();

        assert_eq!(session.append_semantic(&[], &rejected).unwrap(), 0);
        assert_eq!(session.semantic_row_count().unwrap(), 0);
        assert_eq!(session.semantic_watermark().unwrap(), Some(ts(4, 0, 0)));
        assert!(session.select_raw_since(ts(4, 0, 0)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn each_session_gets_its_own_id() {
        let wh = ready().await;
        let first = wh.open_session().await.unwrap().session_id().to_string();
        let second = wh.open_session().await.unwrap().session_id().to_string();
        assert!(!first.is_empty());
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn sessions_are_released_on_drop() {
        let wh = ready().await;
        {
            let _session = wh.open_session().await.unwrap();
        }
        // A leaked session would block here forever.
        let second = tokio::time::timeout(std::time::Duration::from_secs(1), wh.open_session())
            .await;
        assert!(second.is_ok());
    }
}
