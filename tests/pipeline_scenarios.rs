use anyhow::Result;
use chrono::{Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

use loan_pipeline::config::Config;
use loan_pipeline::pipeline::{Pipeline, SemanticProcessor};
use loan_pipeline::storage::{FsObjectStore, ObjectStore};
use loan_pipeline::types::{Clock, FixedClock, ObjectKey};
use loan_pipeline::warehouse::{
    FileFormat, LoadStrategy, SqliteWarehouse, StagedFile, Warehouse, WarehouseSession,
};

const LOANS_2023_09: &str = "\
,SeriousDlqin2yrs,RevolvingUtilizationOfUnsecuredLines,age,NumberOfTime30-59DaysPastDueNotWorse,DebtRatio,MonthlyIncome,NumberOfOpenCreditLinesAndLoans,NumberOfTimes90DaysLate,NumberRealEstateLoansOrLines,NumberOfTime60-89DaysPastDueNotWorse,NumberOfDependents
1,1,0.766126609,45,2,0.802982129,9120,13,0,6,0,2
2,0,0.957151019,40,0,0.121876201,2600,4,0,0,0,1
3,0,0.65818014,38,1,0.085113375,3042,2,1,0,0,0
";

fn config_in(root: &Path) -> Config {
    let mut config = Config::default();
    config.paths.inbox = root.join("inbox");
    config.paths.archive = root.join("archive");
    config.object_store.root = root.join("object-store");
    config.object_store.prefix = String::new();
    config.warehouse.path = root.join("warehouse");
    config
}

fn build(config: &Config) -> Result<(Arc<FsObjectStore>, Arc<SqliteWarehouse>, Pipeline)> {
    let store = Arc::new(FsObjectStore::new(
        &config.object_store.root,
        config.object_store.bucket.clone(),
    ));
    let warehouse = Arc::new(SqliteWarehouse::open(
        &config.warehouse.path,
        &config.warehouse.database,
        config.warehouse.tables(),
    )?);
    let pipeline = Pipeline::new(config, store.clone(), warehouse.clone());
    Ok((store, warehouse, pipeline))
}

fn at(y: i32, m: u32, d: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

#[tokio::test]
async fn september_file_flows_end_to_end() -> Result<()> {
    let dir = tempdir()?;
    let config = config_in(dir.path());
    fs::create_dir_all(&config.paths.inbox)?;
    fs::write(config.paths.inbox.join("loans_2023_09.csv"), LOANS_2023_09)?;

    let (store, warehouse, pipeline) = build(&config)?;
    pipeline.bootstrap().await?;

    let clock = FixedClock::new(Utc.with_ymd_and_hms(2023, 9, 21, 8, 30, 0).unwrap());
    let report = pipeline.run_once(&clock).await?;

    let expected_key = ObjectKey::new(format!("loans_2023_09.csv_{}", clock.now().timestamp()));
    assert_eq!(report.staged.keys, vec![expected_key.clone()]);
    assert!(store.exists(&expected_key).await?);
    assert!(!config.paths.inbox.join("loans_2023_09.csv").exists());
    assert!(config.paths.archive.join("loans_2023_09.csv").exists());

    assert_eq!(report.load.objects_loaded, 1);
    assert_eq!(report.load.rows_loaded, 3);
    assert_eq!(report.semantic.selected, 3);
    assert_eq!(report.semantic.inserted, 3);

    let mut session = warehouse.open_session().await?;
    let rows = session.select_raw_since(at(1970, 1, 1))?;
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.file_name == expected_key.as_str()));
    assert!(rows.iter().any(|r| r.application.age == 45));
    assert!(rows
        .iter()
        .any(|r| r.application.monthly_income == Some(2600.0) && r.application.number_of_dependents == Some(1)));
    assert_eq!(session.semantic_watermark()?, Some(clock.now().naive_utc()));
    Ok(())
}

#[tokio::test]
async fn refresh_only_considers_rows_after_processed_watermark() -> Result<()> {
    let dir = tempdir()?;
    let config = config_in(dir.path());
    let (_store, warehouse, pipeline) = build(&config)?;
    pipeline.bootstrap().await?;

    let format = FileFormat::default();
    let body = LOANS_2023_09.as_bytes().to_vec();
    let copy = |key: &str, ts: NaiveDateTime| {
        let file = StagedFile {
            key: ObjectKey::new(key),
            bytes: body.clone(),
        };
        (file, ts)
    };

    {
        let mut session = warehouse.open_session().await?;
        for (file, ts) in [
            copy("a.csv_1", at(2023, 12, 31)),
            copy("b.csv_2", at(2024, 1, 1)),
        ] {
            session.copy_into_raw(&file, &format, ts)?;
        }
    }

    let processor = SemanticProcessor::new(&config, warehouse.clone());
    let first = processor.refresh_semantic().await?;
    assert_eq!(first.inserted, 6);

    {
        let mut session = warehouse.open_session().await?;
        assert_eq!(session.semantic_watermark()?, Some(at(2024, 1, 1)));
        let (file, ts) = copy("c.csv_3", at(2024, 1, 1) + Duration::hours(6));
        session.copy_into_raw(&file, &format, ts)?;
    }

    let second = processor.refresh_semantic().await?;
    assert_eq!(second.watermark, at(2024, 1, 1));
    assert_eq!(second.selected, 3);
    assert_eq!(second.inserted, 3);
    assert_eq!(warehouse.open_session().await?.semantic_row_count()?, 9);
    Ok(())
}

#[tokio::test]
async fn batch_strategy_skips_objects_already_loaded() -> Result<()> {
    let dir = tempdir()?;
    let mut config = config_in(dir.path());
    config.object_store.prefix = "loan-data/dump".to_string();
    fs::create_dir_all(&config.paths.inbox)?;
    fs::write(config.paths.inbox.join("loans_2023_09.csv"), LOANS_2023_09)?;

    let (_store, warehouse, pipeline) = build(&config)?;
    let pipeline = pipeline.with_strategy(LoadStrategy::Batch);
    pipeline.bootstrap().await?;

    let clock = FixedClock::new(Utc.with_ymd_and_hms(2023, 9, 21, 0, 0, 0).unwrap());
    let first = pipeline.run_once(&clock).await?;
    assert_eq!(first.load.objects_loaded, 1);

    clock.advance(Duration::hours(1));
    fs::write(config.paths.inbox.join("loans_2023_10.csv"), LOANS_2023_09)?;
    let second = pipeline.run_once(&clock).await?;
    assert_eq!(second.load.objects_loaded, 1);
    assert_eq!(second.load.objects_skipped, 1);
    assert_eq!(second.semantic.inserted, 3);

    let mut session = warehouse.open_session().await?;
    assert_eq!(session.raw_row_count()?, 6);
    assert_eq!(session.semantic_row_count()?, 6);
    Ok(())
}

#[tokio::test]
async fn empty_inbox_run_changes_nothing() -> Result<()> {
    let dir = tempdir()?;
    let config = config_in(dir.path());
    fs::create_dir_all(&config.paths.inbox)?;
    let (store, warehouse, pipeline) = build(&config)?;
    pipeline.bootstrap().await?;

    let clock = FixedClock::new(Utc::now());
    let report = pipeline.run_once(&clock).await?;
    assert!(report.staged.is_empty());
    assert_eq!(report.load.rows_loaded, 0);
    assert!(store.list("").await?.is_empty());
    assert!(!config.paths.archive.exists());
    assert_eq!(warehouse.open_session().await?.raw_row_count()?, 0);
    Ok(())
}
