use std::collections::HashMap;
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;

use crate::codec::{BINCODE_CONFIG, zstd_compress, zstd_decompress};
use crate::config::LocalConfig;
use crate::error::StorageError;

/// Where a worker loads its partition from and writes its sorted slice to.
#[async_trait]
pub trait PartitionStore<T: Serialize + DeserializeOwned + Clone + Send + Sync>: Send + Sync {
    async fn read(&self, id: &str) -> Result<Vec<T>, StorageError>;
    async fn write(&self, id: &str, items: &[T]) -> Result<(), StorageError>;
    async fn delete(&self, id: &str) -> Result<(), StorageError>;
}

/// Partitions kept in process memory. Values are cloned when read.
pub struct MemoryPartitionStore<T> {
    partitions: RwLock<HashMap<String, Vec<T>>>,
}

impl<T> MemoryPartitionStore<T> {
    pub fn new() -> Self {
        MemoryPartitionStore {
            partitions: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> Default for MemoryPartitionStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> PartitionStore<T> for MemoryPartitionStore<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    async fn read(&self, id: &str) -> Result<Vec<T>, StorageError> {
        let partitions = self
            .partitions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        partitions
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    async fn write(&self, id: &str, items: &[T]) -> Result<(), StorageError> {
        self.partitions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id.to_string(), items.to_vec());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StorageError> {
        self.partitions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }
}

/// Partitions stored on disk as zstd-compressed bincode, one file per id at
/// `{root}/{prefix}{id}.bin.zst`.
pub struct LocalPartitionStore<T> {
    config: LocalConfig,
    _marker: PhantomData<T>,
}

impl<T> LocalPartitionStore<T> {
    pub fn new(config: &LocalConfig) -> Self {
        LocalPartitionStore {
            config: config.clone(),
            _marker: PhantomData,
        }
    }

    pub fn file_path(&self, id: &str) -> PathBuf {
        Path::new(&self.config.root).join(format!("{}{}.bin.zst", self.config.prefix, id))
    }
}

fn not_found(id: &str) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |e| match e.kind() {
        ErrorKind::NotFound => StorageError::NotFound(id.to_string()),
        _ => StorageError::Io(e),
    }
}

#[async_trait]
impl<T> PartitionStore<T> for LocalPartitionStore<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    async fn read(&self, id: &str) -> Result<Vec<T>, StorageError> {
        let bytes = fs::read(self.file_path(id)).await.map_err(not_found(id))?;
        let decompressed = zstd_decompress(&bytes).await?;
        let (items, _): (Vec<T>, _) =
            bincode::serde::decode_from_slice(&decompressed, BINCODE_CONFIG)?;
        Ok(items)
    }

    async fn write(&self, id: &str, items: &[T]) -> Result<(), StorageError> {
        let path = self.file_path(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let bytes = bincode::serde::encode_to_vec(items, BINCODE_CONFIG)?;
        let compressed = zstd_compress(&bytes).await?;
        fs::write(path, compressed).await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StorageError> {
        fs::remove_file(self.file_path(id))
            .await
            .map_err(not_found(id))
    }
}
