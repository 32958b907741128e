//! Get-or-refresh memoization keyed by a freshness token.
//!
//! A cached value is tagged with the marker it was computed for. Callers pass the marker of the
//! current source data on every lookup; the value is recomputed only when that marker moves past
//! the stored one. A negative token `-n` instead means "recompute at most every `n` seconds".
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

/// Physical lifetime of an entry when none is given: one week.
pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Why a refresh function is being called.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshReason {
    /// There is no usable entry for the key.
    NotExists,
    /// An entry exists but the freshness token says it is stale.
    Expired,
}

/// Source of the current time in whole seconds since the Unix epoch.
pub trait Clock: Send + Sync {
    /// The current time.
    fn now(&self) -> i64;
}

/// [`Clock`] backed by the system time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

/// A get-or-refresh cache.
///
/// Implementations differ in where entries live (process memory, shared memory, ...), never in
/// the freshness rules.
pub trait CacheAdapter<V> {
    /// Returns the value cached under `key`, refreshing it through `refresh` when it is missing
    /// or stale according to `freshness`.
    ///
    /// `freshness` is either a non-negative last-modified marker or `-interval` in seconds.
    /// `ttl` bounds how long an entry may physically live and defaults to [`DEFAULT_TTL`]. When
    /// `refresh` fails the previous entry, if any, is left in place and the error is returned.
    fn get<P, F, E>(
        &self,
        key: &str,
        freshness: i64,
        refresh: F,
        params: P,
        ttl: Option<Duration>,
    ) -> Result<V, E>
    where
        F: FnOnce(RefreshReason, P) -> Result<V, E>;

    /// Drops the entry for `key`; the next [`get`](Self::get) refreshes with
    /// [`RefreshReason::NotExists`].
    fn delete(&self, key: &str);
}

impl<V, T: CacheAdapter<V>> CacheAdapter<V> for Arc<T> {
    fn get<P, F, E>(
        &self,
        key: &str,
        freshness: i64,
        refresh: F,
        params: P,
        ttl: Option<Duration>,
    ) -> Result<V, E>
    where
        F: FnOnce(RefreshReason, P) -> Result<V, E>,
    {
        (**self).get(key, freshness, refresh, params, ttl)
    }

    fn delete(&self, key: &str) {
        (**self).delete(key)
    }
}

struct Entry<V> {
    marker: i64,
    expires_at: i64,
    value: V,
}

/// Process-local [`CacheAdapter`].
///
/// Cloning values out of the cache should be cheap; wrap large values in an [`Arc`].
pub struct LocalCache<V> {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry<V>>>,
}

impl<V> Default for LocalCache<V> {
    fn default() -> Self {
        LocalCache::with_clock(Arc::new(SystemClock))
    }
}

impl<V> LocalCache<V> {
    /// Creates an empty cache using the system clock.
    pub fn new() -> LocalCache<V> {
        LocalCache::default()
    }

    /// Creates an empty cache reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> LocalCache<V> {
        LocalCache {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: Clone> CacheAdapter<V> for LocalCache<V> {
    fn get<P, F, E>(
        &self,
        key: &str,
        freshness: i64,
        refresh: F,
        params: P,
        ttl: Option<Duration>,
    ) -> Result<V, E>
    where
        F: FnOnce(RefreshReason, P) -> Result<V, E>,
    {
        let now = self.clock.now();

        let (reason, marker) = {
            let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            match entries.get(key) {
                Some(entry) if entry.expires_at > now => {
                    let marker = if freshness >= 0 {
                        freshness
                    } else if now - entry.marker >= -freshness {
                        now
                    } else {
                        entry.marker
                    };
                    if marker <= entry.marker {
                        return Ok(entry.value.clone());
                    }
                    (RefreshReason::Expired, marker)
                }
                _ => (
                    RefreshReason::NotExists,
                    if freshness >= 0 { freshness } else { now },
                ),
            }
        };

        debug!(key, ?reason, marker, "refreshing cache entry");
        // The lock is not held while refreshing; a concurrent refresh of the same key just
        // overwrites with an equivalent value.
        let value = refresh(reason, params)?;

        let ttl = ttl.unwrap_or(DEFAULT_TTL).as_secs() as i64;
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key.to_string(),
                Entry {
                    marker,
                    expires_at: now.saturating_add(ttl),
                    value: value.clone(),
                },
            );

        Ok(value)
    }

    fn delete(&self, key: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}
