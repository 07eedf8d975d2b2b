//! OCSP staple refresh registry.
//!
//! The managed certificate cache registers every certificate it serves here.
//! Each watched key gets one background task that periodically re-obtains the
//! current certificate through its refresh callback, asks the configured
//! [`OcspFetcher`] for a fresh response, and keeps the latest good response
//! as the key's staple.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use rustls::sign::CertifiedKey;
use tokio::task::AbortHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Default staple refresh interval (1 hour)
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

/// Minimum staple refresh interval
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Future returned by a refresh callback
pub type RefreshFuture = BoxFuture<'static, anyhow::Result<Arc<CertifiedKey>>>;

/// Callback producing the current certificate for a watched key
pub type RefreshFn = Arc<dyn Fn() -> RefreshFuture + Send + Sync>;

/// Registry of certificates whose OCSP staples are kept fresh.
///
/// `watch` is idempotent per key: the first call starts the periodic
/// refresh, later calls for the same key are no-ops.
pub trait OcspRegistry: Send + Sync {
    fn watch(&self, key: &str, refresh: RefreshFn);

    /// True once `watch` has been called for `key`
    fn is_watched(&self, key: &str) -> bool;
}

/// Performs the OCSP exchange for a certificate.
///
/// `Ok(None)` means the certificate has no responder to ask.
#[async_trait]
pub trait OcspFetcher: Send + Sync {
    async fn fetch(&self, cert: &CertifiedKey) -> anyhow::Result<Option<Vec<u8>>>;
}

/// Fetcher that never produces a staple
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledFetcher;

#[async_trait]
impl OcspFetcher for DisabledFetcher {
    async fn fetch(&self, _cert: &CertifiedKey) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

struct WatchSlot {
    staple: Arc<ArcSwapOption<Vec<u8>>>,
    task: AbortHandle,
}

struct OcspInner {
    watches: DashMap<String, WatchSlot>,
    fetcher: Arc<dyn OcspFetcher>,
    refresh_interval: Duration,
}

impl Drop for OcspInner {
    fn drop(&mut self) {
        for slot in self.watches.iter() {
            slot.task.abort();
        }
    }
}

/// Task-per-key OCSP staple refresher
#[derive(Clone)]
pub struct OcspManager {
    inner: Arc<OcspInner>,
}

impl OcspManager {
    pub fn new(fetcher: Arc<dyn OcspFetcher>) -> Self {
        Self::with_interval(fetcher, DEFAULT_REFRESH_INTERVAL)
    }

    /// Create a manager refreshing staples every `refresh_interval`.
    ///
    /// The interval is clamped to a minimum of one second.
    pub fn with_interval(fetcher: Arc<dyn OcspFetcher>, refresh_interval: Duration) -> Self {
        Self {
            inner: Arc::new(OcspInner {
                watches: DashMap::new(),
                fetcher,
                refresh_interval: refresh_interval.max(MIN_REFRESH_INTERVAL),
            }),
        }
    }

    /// Latest staple for a watched key
    pub fn staple(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        self.inner
            .watches
            .get(key)
            .and_then(|slot| slot.staple.load_full())
    }

    /// Copy of `cert` carrying the latest staple for `key`, if there is one
    pub fn stapled(&self, key: &str, cert: &Arc<CertifiedKey>) -> Arc<CertifiedKey> {
        match self.staple(key) {
            Some(staple) => {
                let mut stapled = CertifiedKey::clone(cert);
                stapled.ocsp = Some(staple.as_ref().clone());
                Arc::new(stapled)
            }
            None => Arc::clone(cert),
        }
    }

    /// Keys currently watched, sorted
    pub fn watched_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .watches
            .iter()
            .map(|slot| slot.key().clone())
            .collect();
        keys.sort();
        keys
    }
}

impl OcspRegistry for OcspManager {
    fn is_watched(&self, key: &str) -> bool {
        self.inner.watches.contains_key(key)
    }

    fn watch(&self, key: &str, refresh: RefreshFn) {
        if self.is_watched(key) {
            return;
        }

        if let Entry::Vacant(vacant) = self.inner.watches.entry(key.to_string()) {
            let staple = Arc::new(ArcSwapOption::empty());
            let task = tokio::spawn(run_watch(
                key.to_string(),
                refresh,
                Arc::clone(&self.inner.fetcher),
                Arc::clone(&staple),
                self.inner.refresh_interval,
            ));

            vacant.insert(WatchSlot {
                staple,
                task: task.abort_handle(),
            });

            info!(
                key = %key,
                refresh_interval_secs = self.inner.refresh_interval.as_secs(),
                "Started OCSP watch"
            );
        }
    }
}

impl fmt::Debug for OcspManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OcspManager")
            .field("watches", &self.inner.watches.len())
            .field("refresh_interval", &self.inner.refresh_interval)
            .finish()
    }
}

async fn run_watch(
    key: String,
    refresh: RefreshFn,
    fetcher: Arc<dyn OcspFetcher>,
    staple: Arc<ArcSwapOption<Vec<u8>>>,
    period: Duration,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let cert = match refresh().await {
            Ok(cert) => cert,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to refresh certificate for OCSP, keeping previous staple");
                continue;
            }
        };

        match fetcher.fetch(&cert).await {
            Ok(Some(response)) => {
                debug!(key = %key, size = response.len(), "Updated OCSP staple");
                staple.store(Some(Arc::new(response)));
            }
            Ok(None) => {
                trace!(key = %key, "No OCSP response available");
            }
            Err(e) => {
                warn!(key = %key, error = %e, "OCSP fetch failed, keeping previous staple");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::certified_key;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fetcher answering with a staple derived from the call count
    #[derive(Default)]
    struct CountingFetcher {
        calls: AtomicUsize,
        fail_after_first: bool,
    }

    #[async_trait]
    impl OcspFetcher for CountingFetcher {
        async fn fetch(&self, _cert: &CertifiedKey) -> anyhow::Result<Option<Vec<u8>>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_after_first && n > 0 {
                anyhow::bail!("responder unavailable");
            }
            Ok(Some(vec![n as u8]))
        }
    }

    fn counting_refresh(host: &str) -> (RefreshFn, Arc<AtomicUsize>) {
        let cert = certified_key(host);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let refresh: RefreshFn = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let cert = Arc::clone(&cert);
            async move { Ok(cert) }.boxed()
        });
        (refresh, calls)
    }

    /// Let spawned watch tasks run until they wait on their next tick
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_is_idempotent() {
        let fetcher = Arc::new(CountingFetcher::default());
        let manager = OcspManager::new(fetcher.clone());
        let (refresh, calls) = counting_refresh("ocsp.example.com");

        manager.watch("managed|ocsp", Arc::clone(&refresh));
        manager.watch("managed|ocsp", Arc::clone(&refresh));
        manager.watch("managed|ocsp", refresh);
        settle().await;

        assert_eq!(manager.watched_keys(), vec!["managed|ocsp".to_string()]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.staple("managed|ocsp").unwrap().as_slice(), &[0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_staple_refreshed_each_interval() {
        let fetcher = Arc::new(CountingFetcher::default());
        let manager = OcspManager::with_interval(fetcher.clone(), Duration::from_secs(60));
        let (refresh, calls) = counting_refresh("tick.example.com");

        manager.watch("tick", refresh);
        settle().await;
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(manager.staple("tick").unwrap().as_slice(), &[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_fetch_keeps_previous_staple() {
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            fail_after_first: true,
        });
        let manager = OcspManager::with_interval(fetcher.clone(), Duration::from_secs(60));
        let (refresh, _calls) = counting_refresh("flaky.example.com");

        manager.watch("flaky", refresh);
        settle().await;
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(manager.staple("flaky").unwrap().as_slice(), &[0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_manager_stops_watches() {
        let manager = OcspManager::with_interval(
            Arc::new(CountingFetcher::default()),
            Duration::from_secs(60),
        );
        let (refresh, calls) = counting_refresh("gone.example.com");

        manager.watch("gone", Arc::clone(&refresh));
        settle().await;
        assert!(manager.is_watched("gone"));
        assert!(!manager.is_watched("other"));

        drop(manager);
        settle().await;
        tokio::time::advance(Duration::from_secs(300)).await;
        settle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // The aborted task released its copy of the callback
        assert_eq!(Arc::strong_count(&refresh), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stapled_attaches_response() {
        let manager = OcspManager::new(Arc::new(CountingFetcher::default()));
        let (refresh, _calls) = counting_refresh("staple.example.com");
        let cert = certified_key("staple.example.com");

        assert!(Arc::ptr_eq(&manager.stapled("staple", &cert), &cert));

        manager.watch("staple", refresh);
        settle().await;

        let stapled = manager.stapled("staple", &cert);
        assert_eq!(stapled.ocsp.as_deref(), Some(&[0u8][..]));
        assert!(cert.ocsp.is_none());
    }

    #[tokio::test]
    async fn test_disabled_fetcher() {
        let cert = certified_key("off.example.com");
        assert!(DisabledFetcher.fetch(&cert).await.unwrap().is_none());
    }
}
