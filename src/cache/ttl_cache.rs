// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Time-bounded memoization.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// A cached value and the instant it stops being served.
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

/// Memoizes expensive lookups for a bounded time.
///
/// The map lock is only held to look up or store an entry, never while the
/// value is being computed, so lookups for different keys never wait on
/// each other. Concurrent misses on the same key may both compute; the last
/// one to finish wins.
///
/// There is no eviction besides expiry. Expired entries are replaced on the
/// next lookup or dropped by [`purge_expired`](Self::purge_expired).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use attrgate::cache::TtlCache;
///
/// # async fn example() {
/// let cache: TtlCache<String, u32> = TtlCache::new();
///
/// let value = cache
///     .get_or_compute("answer".to_string(), Duration::from_secs(10), || async {
///         Ok::<_, std::io::Error>(42)
///     })
///     .await
///     .unwrap();
/// assert_eq!(value, 42);
/// # }
/// ```
#[derive(Debug)]
pub struct TtlCache<K, V> {
    entries: Mutex<HashMap<K, CacheEntry<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the live value for `key`, computing and storing it on a miss.
    ///
    /// # Errors
    ///
    /// Returns the computation's error unchanged. Nothing is stored on
    /// failure, and an expired entry is left for the next call to replace.
    pub async fn get_or_compute<F, Fut, E>(&self, key: K, ttl: Duration, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }

        let value = compute().await?;
        self.entries.lock().insert(
            key,
            CacheEntry {
                value: value.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(value)
    }

    /// Returns the value for `key` if it has not expired.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone())
    }

    /// Removes the entry for `key`.
    pub fn invalidate(&self, key: &K) {
        self.entries.lock().remove(key);
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    /// Returns the number of stored entries, expired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<K, V> Default for TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TTL: Duration = Duration::from_secs(10);

    async fn counted(cache: &TtlCache<&'static str, usize>, calls: &Arc<AtomicUsize>) -> usize {
        let calls = Arc::clone(calls);
        cache
            .get_or_compute("k", TTL, || async move {
                Ok::<_, String>(calls.fetch_add(1, Ordering::SeqCst) + 1)
            })
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn computes_once_within_ttl() {
        let cache = TtlCache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        assert_eq!(counted(&cache, &calls).await, 1);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(counted(&cache, &calls).await, 1);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recomputes_after_expiry() {
        let cache = TtlCache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        assert_eq!(counted(&cache, &calls).await, 1);
        tokio::time::advance(TTL + Duration::from_millis(1)).await;
        assert_eq!(counted(&cache, &calls).await, 2);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failure_is_not_cached() {
        let cache: TtlCache<&str, u32> = TtlCache::new();

        let err = cache
            .get_or_compute("k", TTL, || async { Err::<u32, _>("device down") })
            .await
            .unwrap_err();
        assert_eq!(err, "device down");
        assert!(cache.is_empty());

        let value = cache
            .get_or_compute("k", TTL, || async { Ok::<_, &str>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let cache: TtlCache<&str, u32> = TtlCache::new();

        cache
            .get_or_compute("a", TTL, || async { Ok::<_, ()>(1) })
            .await
            .unwrap();
        let b = cache
            .get_or_compute("b", TTL, || async { Ok::<_, ()>(2) })
            .await
            .unwrap();

        assert_eq!(b, 2);
        assert_eq!(cache.get(&"a"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn purge_and_invalidate() {
        let cache: TtlCache<&str, u32> = TtlCache::new();
        cache
            .get_or_compute("short", Duration::from_secs(1), || async { Ok::<_, ()>(1) })
            .await
            .unwrap();
        cache
            .get_or_compute("long", TTL, || async { Ok::<_, ()>(2) })
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get(&"short"), None);
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);

        cache.invalidate(&"long");
        assert!(cache.is_empty());
    }
}
