//! Managed certificate cache.
//!
//! Certificates are loaded from storage on first use and then served from
//! memory. A cached certificate older than the reload interval is still
//! returned immediately while a single background task reloads it; if that
//! reload fails the cached copy keeps serving and the failure is only logged.
//!
//! # Concurrency
//!
//! - Entries are created exactly once per key in a sharded map
//! - The current certificate is an atomic snapshot, so the hot path never
//!   takes a lock or awaits
//! - Loads for one key are serialized by that key's lock; other keys proceed
//!   independently

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use rustls::sign::CertifiedKey;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::ManagedError;
use crate::ocsp::{OcspRegistry, RefreshFn};
use crate::storage::{CertificateStore, LoadedCertificate};

/// Default age after which a cached certificate is reloaded (5 minutes)
pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(300);

/// Default upper bound on a background reload
pub const DEFAULT_RELOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// OCSP registry key for a managed certificate
pub fn ocsp_key_name(cert_key: &str) -> String {
    format!("managed|{}", cert_key)
}

/// Certificate and timestamps published together
struct Snapshot {
    cert: Arc<CertifiedKey>,
    not_after: DateTime<Utc>,
    /// Last successful load
    loaded_at: Instant,
    /// Last load attempt, successful or not
    checked_at: Instant,
}

impl Snapshot {
    fn loaded(loaded: LoadedCertificate) -> Self {
        let now = Instant::now();
        Self {
            cert: loaded.certified_key,
            not_after: loaded.not_after,
            loaded_at: now,
            checked_at: now,
        }
    }

    fn checked(&self) -> Self {
        Self {
            cert: Arc::clone(&self.cert),
            not_after: self.not_after,
            loaded_at: self.loaded_at,
            checked_at: Instant::now(),
        }
    }
}

#[derive(Default)]
struct ManagedEntry {
    snapshot: ArcSwapOption<Snapshot>,
    lock: Mutex<()>,
    reloading: AtomicBool,
}

/// Clears the single-flight flag when a reload task ends
struct ReloadGuard<'a>(&'a AtomicBool);

impl Drop for ReloadGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Entry map and load path, shared with OCSP refresh callbacks.
///
/// Holds no reference to the OCSP registry, so a callback kept by the
/// registry never keeps the registry itself alive.
#[derive(Clone)]
struct ManagedLoader {
    entries: Arc<DashMap<String, Arc<ManagedEntry>>>,
    store: Arc<dyn CertificateStore>,
    reload_interval: Duration,
    reload_timeout: Duration,
}

impl ManagedLoader {
    async fn get_managed_certificate(
        &self,
        cert_key: &str,
    ) -> Result<Arc<CertifiedKey>, ManagedError> {
        let entry = self.entry(cert_key);

        if let Some(snapshot) = entry.snapshot.load_full() {
            if snapshot.checked_at.elapsed() > self.reload_interval {
                self.spawn_reload(cert_key, &entry);
            }
            return Ok(Arc::clone(&snapshot.cert));
        }

        let _guard = entry.lock.lock().await;

        // Another caller may have finished the load while we waited
        if let Some(snapshot) = entry.snapshot.load_full() {
            return Ok(Arc::clone(&snapshot.cert));
        }

        let loaded = self
            .store
            .load_certificate_from_store(cert_key)
            .await
            .map_err(|source| ManagedError::Load {
                cert_key: cert_key.to_string(),
                source,
            })?;

        let snapshot = Arc::new(Snapshot::loaded(loaded));
        let cert = Arc::clone(&snapshot.cert);
        info!(
            cert_key = %cert_key,
            expires = %snapshot.not_after,
            "Loaded managed certificate"
        );
        entry.snapshot.store(Some(snapshot));

        Ok(cert)
    }

    fn snapshot(&self, cert_key: &str) -> Option<Arc<Snapshot>> {
        self.entries
            .get(cert_key)
            .and_then(|entry| entry.snapshot.load_full())
    }

    /// Existing entry for `cert_key`, inserting an empty one exactly once
    fn entry(&self, cert_key: &str) -> Arc<ManagedEntry> {
        if let Some(entry) = self.entries.get(cert_key) {
            return Arc::clone(entry.value());
        }
        let entry = self.entries.entry(cert_key.to_string()).or_default();
        Arc::clone(entry.value())
    }

    fn spawn_reload(&self, cert_key: &str, entry: &Arc<ManagedEntry>) {
        if entry
            .reloading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!(cert_key = %cert_key, "Reload already in flight");
            return;
        }

        debug!(cert_key = %cert_key, "Managed certificate is stale, reloading in background");

        let loader = self.clone();
        let entry = Arc::clone(entry);
        let cert_key = cert_key.to_string();
        tokio::spawn(async move {
            let _reloading = ReloadGuard(&entry.reloading);
            loader.reload_managed_certificate(&cert_key, &entry).await;
        });
    }

    async fn reload_managed_certificate(&self, cert_key: &str, entry: &ManagedEntry) {
        let result = tokio::time::timeout(
            self.reload_timeout,
            self.store.load_certificate_from_store(cert_key),
        )
        .await;

        let _guard = entry.lock.lock().await;

        match result {
            Ok(Ok(loaded)) => {
                let snapshot = Snapshot::loaded(loaded);
                info!(
                    cert_key = %cert_key,
                    expires = %snapshot.not_after,
                    "Reloaded managed certificate"
                );
                entry.snapshot.store(Some(Arc::new(snapshot)));
            }
            Ok(Err(e)) => {
                Self::mark_checked(entry);
                warn!(
                    cert_key = %cert_key,
                    error = %e,
                    "Failed to reload managed certificate, serving cached copy"
                );
            }
            Err(_) => {
                Self::mark_checked(entry);
                warn!(
                    cert_key = %cert_key,
                    timeout_secs = self.reload_timeout.as_secs(),
                    "Managed certificate reload timed out, serving cached copy"
                );
            }
        }
    }

    /// Record a failed attempt so the next reload waits a full interval
    fn mark_checked(entry: &ManagedEntry) {
        if let Some(current) = entry.snapshot.load_full() {
            entry.snapshot.store(Some(Arc::new(current.checked())));
        }
    }
}

/// Process-wide cache of operator-managed certificates
#[derive(Clone)]
pub struct ManagedCertManager {
    loader: ManagedLoader,
    ocsp: Arc<dyn OcspRegistry>,
}

impl ManagedCertManager {
    pub fn new(store: Arc<dyn CertificateStore>, ocsp: Arc<dyn OcspRegistry>) -> Self {
        Self {
            loader: ManagedLoader {
                entries: Arc::new(DashMap::new()),
                store,
                reload_interval: DEFAULT_RELOAD_INTERVAL,
                reload_timeout: DEFAULT_RELOAD_TIMEOUT,
            },
            ocsp,
        }
    }

    /// Set the age after which cached certificates are reloaded
    pub fn with_reload_interval(mut self, interval: Duration) -> Self {
        self.loader.reload_interval = interval;
        self
    }

    /// Set the upper bound on a single background reload
    pub fn with_reload_timeout(mut self, timeout: Duration) -> Self {
        self.loader.reload_timeout = timeout;
        self
    }

    /// Certificate for `cert_key`, registering it for OCSP stapling.
    ///
    /// Only the first load of a key can fail; once a certificate is cached
    /// it keeps being served whatever happens to later reloads.
    pub async fn get(&self, cert_key: &str) -> Result<Arc<CertifiedKey>, ManagedError> {
        let cert = self.loader.get_managed_certificate(cert_key).await?;
        self.watch_ocsp(cert_key);
        Ok(cert)
    }

    /// Certificate for `cert_key` without touching the OCSP registry
    pub async fn get_managed_certificate(
        &self,
        cert_key: &str,
    ) -> Result<Arc<CertifiedKey>, ManagedError> {
        self.loader.get_managed_certificate(cert_key).await
    }

    /// Number of keys that have been requested
    pub fn len(&self) -> usize {
        self.loader.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loader.entries.is_empty()
    }

    /// Keys with a loaded certificate, sorted
    pub fn cached_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .loader
            .entries
            .iter()
            .filter(|entry| entry.value().snapshot.load().is_some())
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// When the certificate for `cert_key` was last loaded successfully
    pub fn loaded_at(&self, cert_key: &str) -> Option<Instant> {
        self.loader.snapshot(cert_key).map(|s| s.loaded_at)
    }

    /// Expiry of the cached certificate for `cert_key`
    pub fn not_after(&self, cert_key: &str) -> Option<DateTime<Utc>> {
        self.loader.snapshot(cert_key).map(|s| s.not_after)
    }

    fn watch_ocsp(&self, cert_key: &str) {
        let ocsp_key = ocsp_key_name(cert_key);
        if self.ocsp.is_watched(&ocsp_key) {
            return;
        }

        let loader = self.loader.clone();
        let key = cert_key.to_string();
        let refresh: RefreshFn = Arc::new(move || {
            let loader = loader.clone();
            let key = key.clone();
            async move {
                loader
                    .get_managed_certificate(&key)
                    .await
                    .map_err(anyhow::Error::from)
            }
            .boxed()
        });

        self.ocsp.watch(&ocsp_key, refresh);
    }
}

impl fmt::Debug for ManagedCertManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedCertManager")
            .field("entries", &self.loader.entries.len())
            .field("reload_interval", &self.loader.reload_interval)
            .field("reload_timeout", &self.loader.reload_timeout)
            .finish()
    }
}
