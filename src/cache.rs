//! Single-flight result cache keyed by normalised URL
//!
//! A fresh entry is served without work. Otherwise callers for the same key
//! are collapsed onto one computation; its outcome, success or error, is
//! delivered identically to every waiter. Only successes are stored. Stale
//! entries are ignored on lookup and pruned whenever a new result is stored.

use crate::{MeasureError, Metrics};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

type Waiter<V> = oneshot::Sender<Result<V, MeasureError>>;

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub recorded_at: Instant,
}

struct CacheInner<V> {
    ttl: Duration,
    entries: DashMap<String, CacheEntry<V>>,
    in_flight: DashMap<String, Vec<Waiter<V>>>,
    metrics: Arc<Metrics>,
}

impl<V: Clone> CacheInner<V> {
    fn fresh(&self, key: &str) -> Option<V> {
        self.entries
            .get(key)
            .filter(|entry| entry.recorded_at.elapsed() < self.ttl)
            .map(|entry| entry.value.clone())
    }

    /// Store a success, then resolve and drop the registration. Storing first
    /// means a caller arriving in between finds the entry.
    fn complete(&self, key: &str, outcome: Result<V, MeasureError>) {
        if let Ok(value) = &outcome {
            self.prune_stale();
            self.entries.insert(
                key.to_string(),
                CacheEntry {
                    value: value.clone(),
                    recorded_at: Instant::now(),
                },
            );
        }

        if let Some((_, waiters)) = self.in_flight.remove(key) {
            debug!("Resolving {} waiter(s) for {}", waiters.len(), key);
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
    }
}

impl<V> CacheInner<V> {
    fn prune_stale(&self) {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.recorded_at.elapsed() < self.ttl);
        let pruned = before.saturating_sub(self.entries.len());
        if pruned > 0 {
            debug!("Pruned {} stale cache entries", pruned);
        }
    }
}

/// Removes the registration if the computation unwinds before completing,
/// which drops every waiter's sender and wakes them with an error.
struct InFlightGuard<V> {
    inner: Arc<CacheInner<V>>,
    key: String,
    armed: bool,
}

impl<V> Drop for InFlightGuard<V> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.in_flight.remove(&self.key);
        }
    }
}

pub struct SingleFlightCache<V> {
    inner: Arc<CacheInner<V>>,
}

impl<V> Clone for SingleFlightCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V> SingleFlightCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                ttl,
                entries: DashMap::new(),
                in_flight: DashMap::new(),
                metrics,
            }),
        }
    }

    /// Return the cached value for `key` or the outcome of the single
    /// computation in flight for it, starting `compute` if there is none.
    ///
    /// The computation runs on its own task, so a caller that stops waiting
    /// does not cancel it and its result still lands in the cache.
    pub async fn get_or_compute<F, Fut>(&self, key: &str, compute: F) -> Result<V, MeasureError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, MeasureError>> + Send + 'static,
    {
        if let Some(value) = self.inner.fresh(key) {
            self.inner.metrics.cache_hits.increment(1);
            debug!("Cache hit for {}", key);
            return Ok(value);
        }

        let (tx, rx) = oneshot::channel();
        match self.inner.in_flight.entry(key.to_string()) {
            Entry::Occupied(mut waiting) => {
                waiting.get_mut().push(tx);
                self.inner.metrics.dedup_joins.increment(1);
                debug!("Joined in-flight measurement for {}", key);
            }
            Entry::Vacant(slot) => {
                if let Some(value) = self.inner.fresh(key) {
                    self.inner.metrics.cache_hits.increment(1);
                    return Ok(value);
                }
                slot.insert(vec![tx]);
                self.spawn_leader(key.to_string(), compute);
            }
        }

        rx.await.map_err(|_| {
            MeasureError::Internal(format!("measurement for {key} was abandoned"))
        })?
    }

    fn spawn_leader<F, Fut>(&self, key: String, compute: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, MeasureError>> + Send + 'static,
    {
        let inner = self.inner.clone();

        tokio::spawn(async move {
            let mut guard = InFlightGuard {
                inner: inner.clone(),
                key: key.clone(),
                armed: true,
            };
            let outcome = compute().await;
            inner.complete(&key, outcome);
            guard.armed = false;
        });
    }

    /// Fresh cached value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<V> {
        self.inner.fresh(key)
    }

    /// Entries stored, including stale ones not yet pruned.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.entries.contains_key(key)
    }

    pub fn in_flight_len(&self) -> usize {
        self.inner.in_flight.len()
    }

    pub fn clear(&self) {
        self.inner.entries.clear();
    }
}
