//! In-memory forecast cache with per-key expiry
//!
//! Provides a `ForecastCache` that memoizes fetcher results for a fixed TTL and
//! collapses concurrent misses for the same key into a single upstream fetch.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::data::{Fetcher, ForecastError, ForecastRecord};

/// How long a fetched forecast is served from memory
pub const DEFAULT_TTL: Duration = Duration::from_secs(15 * 60);

type FetchResult = Result<Arc<ForecastRecord>, ForecastError>;
type InFlight = Shared<BoxFuture<'static, FetchResult>>;

/// A stored forecast and the instant it stops being served
#[derive(Debug)]
struct CacheEntry {
    record: Arc<ForecastRecord>,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    in_flight: HashMap<String, InFlight>,
}

/// Result of a cache lookup
#[derive(Debug, Clone)]
pub struct Lookup {
    /// The forecast, shared with the cache
    pub record: Arc<ForecastRecord>,
    /// Whether the forecast was served without contacting the upstream
    pub from_cache: bool,
}

/// Clears the in-flight slot for a key when the fetch task finishes or unwinds
struct InFlightGuard {
    state: Arc<Mutex<CacheState>>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.state.lock().in_flight.remove(&self.key);
    }
}

/// Memoizes forecasts per place key
///
/// Entries expire `ttl` after they were stored. Expired entries are treated as
/// absent and are physically removed by [`ForecastCache::sweep`] or replaced by
/// the next successful fetch. Failures are never stored.
pub struct ForecastCache {
    fetcher: Arc<dyn Fetcher>,
    ttl: Duration,
    state: Arc<Mutex<CacheState>>,
}

impl fmt::Debug for ForecastCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ForecastCache")
            .field("ttl", &self.ttl)
            .field("entries", &state.entries.len())
            .field("in_flight", &state.in_flight.len())
            .finish()
    }
}

impl ForecastCache {
    /// Creates a cache in front of `fetcher` with the given default TTL
    pub fn new(fetcher: Arc<dyn Fetcher>, ttl: Duration) -> Self {
        Self {
            fetcher,
            ttl,
            state: Arc::new(Mutex::new(CacheState::default())),
        }
    }

    /// Creates a cache with the default 15 minute TTL
    pub fn with_default_ttl(fetcher: Arc<dyn Fetcher>) -> Self {
        Self::new(fetcher, DEFAULT_TTL)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of stored entries, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of upstream fetches currently running
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Returns the stored forecast for `key` if it has not expired
    pub fn get(&self, key: &str) -> Option<Arc<ForecastRecord>> {
        let state = self.state.lock();
        state
            .entries
            .get(key)
            .filter(|entry| entry.is_fresh(Instant::now()))
            .map(|entry| Arc::clone(&entry.record))
    }

    /// Stores a forecast under `key`, replacing any previous entry
    ///
    /// # Arguments
    /// * `key` - Normalized place key
    /// * `record` - The forecast to store
    /// * `ttl` - Lifetime of the entry, or `None` for the cache default
    pub fn set(
        &self,
        key: impl Into<String>,
        record: ForecastRecord,
        ttl: Option<Duration>,
    ) -> Arc<ForecastRecord> {
        let record = Arc::new(record);
        let ttl = ttl.unwrap_or(self.ttl);
        store(&mut self.state.lock(), key.into(), Arc::clone(&record), ttl);
        record
    }

    /// Returns the forecast for `key`, fetching it on a miss
    ///
    /// A fresh entry is returned with `from_cache = true` and no network
    /// access. Otherwise the caller joins the fetch already running for the
    /// key, or starts one; every caller waiting on the same fetch receives the
    /// same record or the same error.
    pub async fn get_or_fetch(&self, key: &str) -> Result<Lookup, ForecastError> {
        let pending = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            if let Some(entry) = state.entries.get(key) {
                if entry.is_fresh(Instant::now()) {
                    debug!(key, "forecast cache hit");
                    return Ok(Lookup {
                        record: Arc::clone(&entry.record),
                        from_cache: true,
                    });
                }
            }

            match state.in_flight.get(key) {
                Some(pending) => {
                    debug!(key, "joining in-flight forecast fetch");
                    pending.clone()
                }
                None => {
                    debug!(key, "forecast cache miss");
                    let pending = self.start_fetch(key);
                    state.in_flight.insert(key.to_string(), pending.clone());
                    pending
                }
            }
        };

        let record = pending.await?;
        Ok(Lookup {
            record,
            from_cache: false,
        })
    }

    /// Removes every expired entry, returning how many were dropped
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|_, entry| entry.is_fresh(now));
        before - state.entries.len()
    }

    /// Spawns the upstream fetch for `key`
    ///
    /// Must be called with the state lock held so the in-flight slot is
    /// registered before the task can clear it.
    fn start_fetch(&self, key: &str) -> InFlight {
        let fetcher = Arc::clone(&self.fetcher);
        let ttl = self.ttl;
        let guard = InFlightGuard {
            state: Arc::clone(&self.state),
            key: key.to_string(),
        };

        let task = tokio::spawn(async move {
            let result = fetcher.fetch(&guard.key).await.map(Arc::new);

            match &result {
                Ok(record) => {
                    info!(
                        key = %guard.key,
                        entries = record.forecast().len(),
                        "cached fresh forecast"
                    );
                    store(&mut guard.state.lock(), guard.key.clone(), Arc::clone(record), ttl);
                }
                Err(e) => warn!(key = %guard.key, error = %e, "forecast fetch failed"),
            }

            // The in-flight slot is cleared only once the entry is stored
            drop(guard);
            result
        });

        let key = key.to_string();
        async move {
            task.await.unwrap_or_else(|e| {
                Err(ForecastError::upstream(&key, format!("fetch task failed: {}", e)))
            })
        }
        .boxed()
        .shared()
    }
}

fn store(state: &mut CacheState, key: String, record: Arc<ForecastRecord>, ttl: Duration) {
    state.entries.insert(
        key,
        CacheEntry {
            record,
            expires_at: Instant::now() + ttl,
        },
    );
}
