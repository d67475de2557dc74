use crate::config::Config;
use crate::constants::INBOX_EXTENSION;
use crate::error::{PipelineError, Result};
use crate::storage::ObjectStore;
use crate::types::{Clock, ObjectKey, StagedBatch};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use std::path::{Path, PathBuf};
use tokio::fs;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Moves inbox CSVs into object storage and archives the local copies.
pub struct Stager {
    store: Arc<dyn ObjectStore>,
    inbox: PathBuf,
    archive: PathBuf,
    prefix: String,
    append_csv_extension: bool,
    write_header: bool,
}

impl Stager {
    pub fn new(config: &Config, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            inbox: config.paths.inbox.clone(),
            archive: config.paths.archive.clone(),
            prefix: config.object_store.prefix.clone(),
            append_csv_extension: config.object_store.append_csv_extension,
            write_header: config.object_store.write_header,
        }
    }

    /// `.csv` files in the inbox, in filename order.
    pub async fn pending_files(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.inbox).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(INBOX_EXTENSION) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Upload every pending file, archiving each one right after its upload
    /// succeeds. The first failure aborts the run; files archived before it
    /// stay archived and the rest are retried next run.
    #[instrument(skip(self, clock), fields(inbox = %self.inbox.display()))]
    pub async fn stage_inbox(&self, clock: &dyn Clock, run_id: Uuid) -> Result<StagedBatch> {
        let mut batch = StagedBatch::new(run_id, clock.now());
        let files = self.pending_files().await?;
        if files.is_empty() {
            info!("No new files..");
            return Ok(batch);
        }
        fs::create_dir_all(&self.archive).await?;

        for file_name in files {
            let source = self.inbox.join(&file_name);
            let key = ObjectKey::staged(
                &self.prefix,
                &file_name,
                clock.now().timestamp(),
                self.append_csv_extension,
            );
            let raw = fs::read(&source).await.map_err(|e| PipelineError::InboxRead {
                file: file_name.clone(),
                source: e.into(),
            })?;
            let body = self.reserialize(&raw, &file_name)?;
            let bytes = body.len();

            if let Err(e) = self.store.put(&key, body).await {
                crate::metrics::stager::upload_error();
                return Err(PipelineError::Upload {
                    file: file_name,
                    source: e,
                });
            }
            crate::metrics::stager::file_staged(bytes);
            info!("📤 Uploaded {} to {}/{}", file_name, self.store.bucket(), key);

            move_file(&source, &self.archive.join(&file_name)).await.map_err(|e| {
                PipelineError::Archive {
                    file: file_name.clone(),
                    source: e,
                }
            })?;
            batch.keys.push(key);
        }

        info!("Staged {} file(s)", batch.keys.len());
        Ok(batch)
    }

    /// Parse the file as CSV and write it back out, so malformed files never
    /// reach the store.
    fn reserialize(&self, raw: &[u8], file_name: &str) -> Result<Vec<u8>> {
        let inbox_err = |e: csv::Error| PipelineError::InboxRead {
            file: file_name.to_string(),
            source: e,
        };
        let mut reader = ReaderBuilder::new().has_headers(false).from_reader(raw);
        let records = reader
            .records()
            .collect::<std::result::Result<Vec<StringRecord>, _>>()
            .map_err(inbox_err)?;
        if records.is_empty() {
            warn!("{} is empty", file_name);
        }

        let skip = usize::from(!self.write_header);
        let mut writer = WriterBuilder::new().from_writer(Vec::new());
        for record in records.iter().skip(skip) {
            writer.write_record(record).map_err(inbox_err)?;
        }
        writer
            .into_inner()
            .map_err(|e| PipelineError::Io(e.into_error()))
    }
}

/// Rename, falling back to copy-and-delete across filesystems.
async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            if fs::copy(from, to).await.is_err() {
                return Err(rename_err);
            }
            fs::remove_file(from).await
        }
    }
}
