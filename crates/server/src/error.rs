//! Error types for certificate storage and the managed certificate cache.

use thiserror::Error;

/// Blob storage and certificate decoding errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// No blob is stored under the key
    #[error("blob not found: {0}")]
    NotFound(String),

    /// The key cannot be mapped onto the backend
    #[error("invalid blob key: {0:?}")]
    InvalidKey(String),

    /// Filesystem failure in the directory backend
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Redis command or connection failure
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Stored PEM material could not be turned into a usable certificate
    #[error("invalid certificate {key:?}: {reason}")]
    InvalidCertificate { key: String, reason: String },
}

impl StorageError {
    /// True for the shared "absent key" signal of every backend
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    pub(crate) fn invalid_certificate(key: &str, reason: impl Into<String>) -> Self {
        StorageError::InvalidCertificate {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Managed certificate cache errors
#[derive(Debug, Error)]
pub enum ManagedError {
    /// The first load of a certificate failed
    #[error("managed: {source}")]
    Load {
        cert_key: String,
        #[source]
        source: StorageError,
    },
}

impl ManagedError {
    /// Key whose load failed
    pub fn cert_key(&self) -> &str {
        match self {
            ManagedError::Load { cert_key, .. } => cert_key,
        }
    }
}
