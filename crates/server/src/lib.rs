//! SSL certificate server core
//!
//! Serves TLS certificates on demand to a handshake path. Operator-managed
//! certificates are loaded from a pluggable blob store, cached in memory and
//! reloaded in the background, and registered for OCSP staple refresh.
//!
//! # Components
//!
//! - [`storage`] - blob store backends and PEM decoding
//! - [`managed`] - the managed certificate cache
//! - [`ocsp`] - periodic OCSP staple refresh
//!
//! Configuration, the host authorization policy and the managed domain table
//! live in the `ssl-cert-config` crate.

pub mod error;
pub mod managed;
pub mod ocsp;
pub mod storage;

pub use error::{ManagedError, StorageError};
pub use managed::{ocsp_key_name, ManagedCertManager};
pub use ocsp::{DisabledFetcher, OcspFetcher, OcspManager, OcspRegistry, RefreshFn};
pub use storage::{
    open_blob_store, BlobStore, CertificateStore, DirCache, LoadedCertificate, RedisCache,
    StorageManager,
};
