use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::storage::ObjectStore;
use crate::types::{ObjectKey, StagedBatch};
use crate::warehouse::{ExternalStage, LoadStrategy, StagedFile, Warehouse, WarehouseSession};
use chrono::NaiveDateTime;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub objects_loaded: usize,
    pub objects_skipped: usize,
    pub rows_loaded: u64,
}

/// Bulk-copies staged objects into the raw table.
pub struct Loader {
    store: Arc<dyn ObjectStore>,
    warehouse: Arc<dyn Warehouse>,
    stage: ExternalStage,
    strategy: LoadStrategy,
    raw_table: String,
    skip_header: usize,
}

impl Loader {
    pub fn new(config: &Config, store: Arc<dyn ObjectStore>, warehouse: Arc<dyn Warehouse>) -> Self {
        Self {
            store,
            warehouse,
            stage: config.stage(),
            strategy: config.warehouse.strategy,
            raw_table: config.warehouse.tables().raw(),
            skip_header: config.staged_header_rows(),
        }
    }

    pub fn with_strategy(mut self, strategy: LoadStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn strategy(&self) -> LoadStrategy {
        self.strategy
    }

    fn format(&self) -> crate::warehouse::FileFormat {
        crate::warehouse::FileFormat {
            skip_header: self.skip_header,
            ..Default::default()
        }
        .with_trim(self.strategy == LoadStrategy::Batch)
    }

    /// Load with the configured strategy. `load_ts` becomes `_load_ts` on
    /// every row written by this call.
    #[instrument(skip(self, batch), fields(strategy = self.strategy.as_str(), run_id = %batch.run_id))]
    pub async fn load_staged(&self, batch: &StagedBatch, load_ts: NaiveDateTime) -> Result<LoadReport> {
        let result = match self.strategy {
            LoadStrategy::PerKey => self.load_keys(&batch.keys, load_ts).await,
            LoadStrategy::Batch => self.load_stage(load_ts).await,
        };
        match &result {
            Ok(report) => {
                crate::metrics::loader::objects_loaded(report.objects_loaded, report.rows_loaded);
                crate::metrics::loader::objects_skipped(report.objects_skipped);
                info!(
                    "✅ Loaded {} object(s), {} row(s) into {} ({} skipped)",
                    report.objects_loaded, report.rows_loaded, self.raw_table, report.objects_skipped
                );
            }
            Err(_) => crate::metrics::loader::load_error(),
        }
        result
    }

    /// One copy per key; each object commits on its own.
    pub async fn load_keys(&self, keys: &[ObjectKey], load_ts: NaiveDateTime) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        if keys.is_empty() {
            info!("No staged keys to load");
            return Ok(report);
        }
        let mut session = self.open_session("batch of staged keys").await?;
        for key in keys {
            let location = self.stage.location(key);
            info!("Attempting to load file {}", location);
            let file = self.fetch(key).await?;
            let rows = session
                .copy_into_raw(&file, &self.format(), load_ts)
                .map_err(|e| PipelineError::Load {
                    target: key.to_string(),
                    source: e,
                })?;
            info!("Loaded {} row(s) from {} into {}", rows, location, self.raw_table);
            report.objects_loaded += 1;
            report.rows_loaded += rows;
        }
        Ok(report)
    }

    /// One copy over everything under the stage prefix, all or nothing.
    /// Objects already recorded in the load history are skipped.
    pub async fn load_stage(&self, load_ts: NaiveDateTime) -> Result<LoadReport> {
        let target = format!("@{}", self.stage.name);
        let keys = self
            .store
            .list(&self.stage.prefix)
            .await
            .map_err(|e| PipelineError::Load {
                target: target.clone(),
                source: e.into(),
            })?;
        info!("Stage {} holds {} object(s)", target, keys.len());

        let mut files = Vec::with_capacity(keys.len());
        for key in &keys {
            let bytes = self.store.get(key).await.map_err(|e| PipelineError::Load {
                target: target.clone(),
                source: e.into(),
            })?;
            files.push(StagedFile {
                key: key.clone(),
                bytes,
            });
        }

        let mut session = self.open_session(&target).await?;
        let copied = session
            .copy_batch_into_raw(&files, &self.format(), load_ts)
            .map_err(|e| PipelineError::Load { target, source: e })?;
        Ok(LoadReport {
            objects_loaded: copied.objects_loaded,
            objects_skipped: copied.objects_skipped,
            rows_loaded: copied.rows_loaded,
        })
    }

    async fn fetch(&self, key: &ObjectKey) -> Result<StagedFile> {
        let bytes = self.store.get(key).await.map_err(|e| PipelineError::Load {
            target: key.to_string(),
            source: e.into(),
        })?;
        Ok(StagedFile {
            key: key.clone(),
            bytes,
        })
    }

    async fn open_session(&self, target: &str) -> Result<Box<dyn WarehouseSession>> {
        let session = self
            .warehouse
            .open_session()
            .await
            .map_err(|e| PipelineError::Load {
                target: target.to_string(),
                source: e,
            })?;
        info!("Loading {} in warehouse session {}", target, session.session_id());
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryObjectStore;
    use crate::warehouse::SqliteWarehouse;
    use chrono::{NaiveDate, Utc};
    use uuid::Uuid;

    const BODY: &str = "idx,a,b,c,d,e,f,g,h,i,j,k\n\
        1,0,0.5,30,0,0.2,1000,3,0,1,0,2\n\
        2,1,0.9,41,1,0.4,,5,0,0,0,\n\
        3,0,0.1,52,0,0.3,4000,7,0,2,0,0\n";

    fn load_ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 9, 21)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
    }

    async fn setup() -> (Config, InMemoryObjectStore, Arc<SqliteWarehouse>) {
        let config = Config::default();
        let store = InMemoryObjectStore::new("TEST001");
        let wh = Arc::new(SqliteWarehouse::open_in_memory(config.warehouse.tables()).unwrap());
        wh.open_session().await.unwrap().ensure_schema().unwrap();
        (config, store, wh)
    }

    fn batch(keys: &[&str]) -> StagedBatch {
        let mut b = StagedBatch::new(Uuid::new_v4(), Utc::now());
        b.keys = keys.iter().map(|k| ObjectKey::new(*k)).collect();
        b
    }

    #[tokio::test]
    async fn per_key_load_counts_rows_and_tags_provenance() {
        let (config, store, wh) = setup().await;
        let key = ObjectKey::new("loan-data/dump/a.csv_1");
        store.put(&key, BODY.as_bytes().to_vec()).await.unwrap();

        let loader = Loader::new(&config, Arc::new(store.clone()), wh.clone());
        let report = loader
            .load_staged(&batch(&["loan-data/dump/a.csv_1"]), load_ts())
            .await
            .unwrap();
        assert_eq!(report.objects_loaded, 1);
        assert_eq!(report.rows_loaded, 3);

        let mut session = wh.open_session().await.unwrap();
        let rows = session
            .select_raw_since(*crate::constants::DEFAULT_WATERMARK)
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.file_name == key.as_str() && r.load_ts == load_ts()));
    }

    #[tokio::test]
    async fn reloading_a_key_duplicates_rows() {
        let (config, store, wh) = setup().await;
        store
            .put(&ObjectKey::new("loan-data/dump/a.csv_1"), BODY.as_bytes().to_vec())
            .await
            .unwrap();
        let loader = Loader::new(&config, Arc::new(store.clone()), wh.clone());
        let b = batch(&["loan-data/dump/a.csv_1"]);
        loader.load_staged(&b, load_ts()).await.unwrap();
        loader.load_staged(&b, load_ts()).await.unwrap();
        assert_eq!(wh.open_session().await.unwrap().raw_row_count().unwrap(), 6);
    }

    #[tokio::test]
    async fn missing_object_names_the_key() {
        let (config, store, wh) = setup().await;
        let loader = Loader::new(&config, Arc::new(store), wh.clone());
        let err = loader
            .load_staged(&batch(&["loan-data/dump/ghost.csv_9"]), load_ts())
            .await
            .unwrap_err();
        match err {
            PipelineError::Load { target, .. } => assert_eq!(target, "loan-data/dump/ghost.csv_9"),
            other => panic!("unexpected error: {other}"),
        }
        // The session from the failed load was released.
        assert_eq!(wh.open_session().await.unwrap().raw_row_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn per_key_failure_keeps_earlier_objects() {
        let (config, store, wh) = setup().await;
        store
            .put(&ObjectKey::new("loan-data/dump/a.csv_1"), BODY.as_bytes().to_vec())
            .await
            .unwrap();
        store
            .put(&ObjectKey::new("loan-data/dump/b.csv_2"), b"h\nnot,a,loan\n".to_vec())
            .await
            .unwrap();
        let loader = Loader::new(&config, Arc::new(store), wh.clone());
        let err = loader
            .load_staged(
                &batch(&["loan-data/dump/a.csv_1", "loan-data/dump/b.csv_2"]),
                load_ts(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Load { ref target, .. } if target == "loan-data/dump/b.csv_2"));
        assert_eq!(wh.open_session().await.unwrap().raw_row_count().unwrap(), 3);
    }

    #[tokio::test]
    async fn batch_strategy_loads_whole_prefix_once() {
        let (config, store, wh) = setup().await;
        store
            .put(&ObjectKey::new("loan-data/dump/a.csv_1"), BODY.as_bytes().to_vec())
            .await
            .unwrap();
        let padded = "idx,a,b,c,d,e,f,g,h,i,j,k\n1, 0 ,0.5,30,0,0.2,1000,3,0,1,0, 2\n";
        store
            .put(&ObjectKey::new("loan-data/dump/b.csv_2"), padded.as_bytes().to_vec())
            .await
            .unwrap();
        store
            .put(&ObjectKey::new("other/c.csv_3"), BODY.as_bytes().to_vec())
            .await
            .unwrap();

        let loader =
            Loader::new(&config, Arc::new(store.clone()), wh.clone()).with_strategy(LoadStrategy::Batch);
        let empty = batch(&[]);
        let first = loader.load_staged(&empty, load_ts()).await.unwrap();
        assert_eq!(first.objects_loaded, 2);
        assert_eq!(first.rows_loaded, 4);

        let second = loader.load_staged(&empty, load_ts()).await.unwrap();
        assert_eq!(second.objects_loaded, 0);
        assert_eq!(second.objects_skipped, 2);
        assert_eq!(wh.open_session().await.unwrap().raw_row_count().unwrap(), 4);
    }

    #[tokio::test]
    async fn batch_failure_is_all_or_nothing() {
        let (config, store, wh) = setup().await;
        store
            .put(&ObjectKey::new("loan-data/dump/a.csv_1"), BODY.as_bytes().to_vec())
            .await
            .unwrap();
        store
            .put(&ObjectKey::new("loan-data/dump/b.csv_2"), b"h\n1,2\n".to_vec())
            .await
            .unwrap();
        let loader =
            Loader::new(&config, Arc::new(store), wh.clone()).with_strategy(LoadStrategy::Batch);
        let err = loader.load_staged(&batch(&[]), load_ts()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Load { ref target, .. } if target == "@stg_s3_loan_application"));
        assert_eq!(wh.open_session().await.unwrap().raw_row_count().unwrap(), 0);
    }
}
