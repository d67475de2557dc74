use crate::error::ObjectStoreError;
use crate::types::ObjectKey;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub type StoreResult<T> = std::result::Result<T, ObjectStoreError>;

/// Put/get-by-key object storage over a single bucket.
///
/// Objects are immutable: `put` refuses to replace an existing key.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn bucket(&self) -> &str;
    async fn put(&self, key: &ObjectKey, body: Vec<u8>) -> StoreResult<()>;
    async fn get(&self, key: &ObjectKey) -> StoreResult<Vec<u8>>;
    async fn exists(&self, key: &ObjectKey) -> StoreResult<bool>;
    /// Keys under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> StoreResult<Vec<ObjectKey>>;
}

fn validate_key(key: &ObjectKey) -> StoreResult<()> {
    let raw = key.as_str();
    if raw.is_empty()
        || raw.starts_with('/')
        || raw.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        return Err(ObjectStoreError::InvalidKey(raw.to_string()));
    }
    Ok(())
}

fn under_prefix(key: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_matches('/');
    prefix.is_empty() || key.starts_with(&format!("{prefix}/"))
}

/// In-memory object store for development/testing
#[derive(Clone)]
pub struct InMemoryObjectStore {
    bucket: String,
    objects: Arc<Mutex<BTreeMap<ObjectKey, Vec<u8>>>>,
    fail_puts: Arc<AtomicBool>,
}

impl InMemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: Arc::new(Mutex::new(BTreeMap::new())),
            fail_puts: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every subsequent `put` fail with an I/O error.
    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.objects().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Poisoning is ignored: every write leaves the map consistent.
    fn objects(&self) -> MutexGuard<'_, BTreeMap<ObjectKey, Vec<u8>>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put(&self, key: &ObjectKey, body: Vec<u8>) -> StoreResult<()> {
        validate_key(key)?;
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "simulated put failure",
            )));
        }
        let mut objects = self.objects();
        if objects.contains_key(key) {
            return Err(ObjectStoreError::AlreadyExists(key.to_string()));
        }
        debug!("Put object {} ({} bytes)", key, body.len());
        objects.insert(key.clone(), body);
        Ok(())
    }

    async fn get(&self, key: &ObjectKey) -> StoreResult<Vec<u8>> {
        let objects = self.objects();
        objects
            .get(key)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))
    }

    async fn exists(&self, key: &ObjectKey) -> StoreResult<bool> {
        Ok(self.objects().contains_key(key))
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<ObjectKey>> {
        let objects = self.objects();
        Ok(objects
            .keys()
            .filter(|k| under_prefix(k.as_str(), prefix))
            .cloned()
            .collect())
    }
}

/// Filesystem-backed bucket: object `k` lives at `{root}/{bucket}/{k}`.
pub struct FsObjectStore {
    bucket: String,
    bucket_dir: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl AsRef<Path>, bucket: impl Into<String>) -> Self {
        let bucket = bucket.into();
        let bucket_dir = root.as_ref().join(&bucket);
        Self { bucket, bucket_dir }
    }

    fn path_for(&self, key: &ObjectKey) -> StoreResult<PathBuf> {
        validate_key(key)?;
        Ok(self.bucket_dir.join(key.as_str()))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put(&self, key: &ObjectKey, body: Vec<u8>) -> StoreResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(ObjectStoreError::AlreadyExists(key.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(&body).await?;
        file.flush().await?;
        debug!("Wrote object {} to {}", key, path.display());
        Ok(())
    }

    async fn get(&self, key: &ObjectKey) -> StoreResult<Vec<u8>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ObjectStoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &ObjectKey) -> StoreResult<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<ObjectKey>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.bucket_dir.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(rel) = path.strip_prefix(&self.bucket_dir) else {
                    continue;
                };
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if under_prefix(&key, prefix) {
                    keys.push(ObjectKey::new(key));
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}
