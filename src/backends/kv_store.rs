//! Key-Value Store Implementations
//!
//! Two [`KeyValueStore`] backends:
//! - [`MemoryKeyValueStore`]: `DashMap`-backed, for tests and hosts that bridge
//!   their own platform storage by seeding/draining it
//! - [`FileKeyValueStore`]: one file per key inside an app-private directory

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use crate::traits::KeyValueStore;

/// Concurrent in-memory key-value store
#[derive(Default, Clone)]
pub struct MemoryKeyValueStore {
    map: Arc<DashMap<String, String>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryKeyValueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Make every subsequent write fail, to exercise storage-failure paths
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("key-value store is read-only");
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map.get(key).map(|v| v.value().clone()))
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.check_writable()?;
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        self.check_writable()?;
        self.map.remove(key);
        Ok(())
    }

    async fn get_all_keys(&self) -> Result<Vec<String>> {
        Ok(self.map.iter().map(|e| e.key().clone()).collect())
    }

    fn name(&self) -> &'static str {
        "MemoryKV"
    }
}

/// Directory-backed key-value store
///
/// Keys are hex-encoded into file names so any string is a valid key.
/// Writes go to a temporary file and are renamed into place.
pub struct FileKeyValueStore {
    dir: PathBuf,
}

impl FileKeyValueStore {
    /// Open (creating if needed) a store rooted at `dir`
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create key-value directory {}", dir.display()))?;
        info!(path = %dir.display(), "File key-value store opened");
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.kv", hex::encode(key.as_bytes())))
    }
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read key '{key}'")),
        }
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, value)
            .await
            .with_context(|| format!("Failed to write key '{key}'"))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to commit key '{key}'"))?;
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove key '{key}'")),
        }
    }

    async fn get_all_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to list {}", self.dir.display()))?;

        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".kv")) else {
                continue;
            };
            match hex::decode(stem).ok().and_then(|b| String::from_utf8(b).ok()) {
                Some(key) => keys.push(key),
                None => debug!(file = %stem, "Skipping foreign file in key-value directory"),
            }
        }
        Ok(keys)
    }

    fn name(&self) -> &'static str {
        "FileKV"
    }
}
