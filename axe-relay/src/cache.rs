//! Short-lived per-device snapshot cache.
//!
//! Bounds how often a device is asked for its status: a snapshot younger
//! than the TTL is handed out again instead of issuing a new request.
//! Failures are never stored, so a device that just came back is seen
//! on the very next call.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::device::{DeviceSnapshot, FetchError};

/// Maximum age of a snapshot that is still served from the cache.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct CacheEntry {
    snapshot: DeviceSnapshot,
    captured_at: Instant,
}

type Slot = Arc<tokio::sync::Mutex<Option<CacheEntry>>>;

/// Snapshot cache keyed by device name.
///
/// The outer map lock is held only long enough to find or create a
/// device's slot. Each slot has its own async mutex, held across the
/// fetch, so concurrent callers for the same device share one upstream
/// request while other devices proceed independently.
#[derive(Debug)]
pub struct StatusCache {
    ttl: Duration,
    slots: parking_lot::Mutex<HashMap<String, Slot>>,
}

impl StatusCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn slot(&self, device: &str) -> Slot {
        self.slots
            .lock()
            .entry(device.to_string())
            .or_default()
            .clone()
    }

    /// Return the cached snapshot for `device` if it is fresh, otherwise
    /// run `fetch` and cache a successful result.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        device: &str,
        fetch: F,
    ) -> Result<DeviceSnapshot, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<DeviceSnapshot, FetchError>>,
    {
        let slot = self.slot(device);
        let mut entry = slot.lock().await;

        if let Some(cached) = entry.as_ref() {
            if Instant::now().duration_since(cached.captured_at) < self.ttl {
                return Ok(cached.snapshot.clone());
            }
        }

        let result = fetch().await;
        match &result {
            Ok(snapshot) => {
                *entry = Some(CacheEntry {
                    snapshot: snapshot.clone(),
                    captured_at: Instant::now(),
                });
            }
            Err(_) => *entry = None,
        }
        result
    }

    /// Drop the cached snapshot for `device`, if any.
    pub fn invalidate(&self, device: &str) {
        self.slots.lock().remove(device);
    }
}

impl Default for StatusCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use time::OffsetDateTime;

    use super::*;
    use crate::device::layout;

    fn snapshot(temp: f64) -> DeviceSnapshot {
        layout::parse(&json!({ "temp": temp }), OffsetDateTime::UNIX_EPOCH).unwrap()
    }

    /// Counts upstream calls and answers with the call number as
    /// temperature so tests can tell fresh data from cached.
    struct Upstream {
        calls: AtomicUsize,
    }

    impl Upstream {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }

        async fn fetch(&self) -> Result<DeviceSnapshot, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(snapshot(n as f64))
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn serves_fresh_entry_without_fetching() {
        let cache = StatusCache::default();
        let upstream = Upstream::new();

        let first = cache.get_or_fetch("gamma", || upstream.fetch()).await.unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        let second = cache.get_or_fetch("gamma", || upstream.fetch()).await.unwrap();

        assert_eq!(upstream.calls(), 1);
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn refetches_once_ttl_elapsed() {
        let cache = StatusCache::default();
        let upstream = Upstream::new();

        cache.get_or_fetch("gamma", || upstream.fetch()).await.unwrap();
        tokio::time::advance(DEFAULT_TTL).await;
        let refreshed = cache.get_or_fetch("gamma", || upstream.fetch()).await.unwrap();

        assert_eq!(upstream.calls(), 2);
        assert_eq!(refreshed.thermal.temp_c, Some(2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_not_cached() {
        let cache = StatusCache::default();
        let upstream = Upstream::new();

        let err = cache
            .get_or_fetch("gamma", || async {
                Err::<DeviceSnapshot, _>(FetchError::Unreachable("refused".into()))
            })
            .await;
        assert!(err.is_err());

        cache.get_or_fetch("gamma", || upstream.fetch()).await.unwrap();
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn devices_are_cached_separately() {
        let cache = StatusCache::default();
        let upstream = Upstream::new();

        cache.get_or_fetch("gamma", || upstream.fetch()).await.unwrap();
        cache.get_or_fetch("nerd", || upstream.fetch()).await.unwrap();
        cache.get_or_fetch("gamma", || upstream.fetch()).await.unwrap();

        assert_eq!(upstream.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_forces_refetch() {
        let cache = StatusCache::default();
        let upstream = Upstream::new();

        cache.get_or_fetch("gamma", || upstream.fetch()).await.unwrap();
        cache.invalidate("gamma");
        cache.get_or_fetch("gamma", || upstream.fetch()).await.unwrap();

        assert_eq!(upstream.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_request() {
        let cache = StatusCache::default();
        let upstream = Upstream::new();

        let upstream = &upstream;
        let slow_fetch = move || async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            upstream.fetch().await
        };

        let (a, b) = tokio::join!(
            cache.get_or_fetch("gamma", slow_fetch),
            cache.get_or_fetch("gamma", slow_fetch),
        );

        assert_eq!(upstream.calls(), 1);
        assert_eq!(a.unwrap(), b.unwrap());
    }
}
