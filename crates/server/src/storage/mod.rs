//! Blob storage for certificates and ACME account data
//!
//! Every backend implements the same narrow contract: opaque bytes stored
//! under a string key, with `get`, `put` and `delete`. An absent key is
//! reported as [`StorageError::NotFound`] by all backends.
//!
//! # Backends
//!
//! - [`DirCache`] - one file per key under a local directory, single process
//! - [`RedisCache`] - one Redis string per key, safe across processes
//!
//! The backend is chosen once at startup by [`open_blob_store`].

mod dir_cache;
mod manager;
mod redis_cache;

use std::sync::Arc;

use async_trait::async_trait;
use ssl_cert_config::{StorageConfig, StorageKind};
use tracing::info;

pub use dir_cache::DirCache;
pub use manager::{parse_certificate, CertificateStore, LoadedCertificate, StorageManager};
pub use redis_cache::RedisCache;

use crate::error::StorageError;

/// Opaque key/value blob persistence.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch the blob stored under `key`
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Store `data` under `key`, replacing any previous blob
    async fn put(&self, key: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Remove the blob under `key`; removing an absent key succeeds
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Short backend name for logs
    fn backend(&self) -> &'static str;
}

/// Open the configured blob store backend
pub async fn open_blob_store(config: &StorageConfig) -> Result<Arc<dyn BlobStore>, StorageError> {
    let store: Arc<dyn BlobStore> = match config.kind {
        StorageKind::DirCache => Arc::new(DirCache::new(&config.dir_cache)?),
        StorageKind::Redis => Arc::new(RedisCache::connect(&config.redis).await?),
    };

    info!(backend = store.backend(), "Opened blob store");
    Ok(store)
}
