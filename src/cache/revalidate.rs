//! Serve projections from cache, refreshing them according to their age.
//!
//! A read falls into one of four cases:
//!
//! * no entry: fetch in full while the caller waits;
//! * fresh (`age <= soft`): return the entry;
//! * soft-stale (`soft < age <= hard`): return the entry and refresh it
//!   incrementally in the background;
//! * hard-stale (`age > hard`): fetch in full while the caller waits, falling
//!   back to the stale entry if that fails.
//!
//! At most one refresh per key runs at a time. Callers that block behind a
//! running refresh get its outcome, stale or unavailable included, instead
//! of fetching again.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use serde::Serialize;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::{CacheEntry, CacheKey, CacheStore, Classification, Ttls};
use crate::{clock::Clock, event::Event, notify::ChangeNotifier, refresh::Refresh};

/// Per-key lock holding the outcome of the last blocking refresh.
type KeyLock = Arc<tokio::sync::Mutex<Option<Projection>>>;

/// Events for a key and where they came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    pub events: Vec<Event>,
    pub source: Source,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Cached and within the soft TTL.
    Fresh,
    /// Cached past the soft TTL; a background refresh was scheduled.
    Revalidating,
    /// Fetched from relays for this read.
    Relays,
    /// Cached past the hard TTL; relays could not be reached.
    Stale,
    /// Nothing cached and relays could not be reached.
    Unavailable,
}

impl Projection {
    fn new(events: Vec<Event>, source: Source) -> Self {
        Self { events, source }
    }

    pub fn unavailable() -> Self {
        Self::new(Vec::new(), Source::Unavailable)
    }

    pub fn is_available(&self) -> bool {
        self.source != Source::Unavailable
    }
}

#[derive(Clone)]
pub struct Revalidator {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    ttls: Ttls,
    notifier: ChangeNotifier,
    locks: Mutex<HashMap<CacheKey, KeyLock>>,
    tasks: TaskTracker,
}

impl Revalidator {
    pub fn new(store: Arc<dyn CacheStore>, clock: Arc<dyn Clock>, ttls: Ttls, notifier: ChangeNotifier) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                clock,
                ttls,
                notifier,
                locks: Mutex::new(HashMap::new()),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn ttls(&self) -> Ttls {
        self.inner.ttls
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.inner.notifier
    }

    /// Serve `key`, refreshing through `refresher` as its age requires.
    /// Never fails; the worst case is [`Projection::unavailable`].
    pub async fn get_or_refresh<R>(&self, key: &CacheKey, refresher: Arc<R>) -> Projection
    where
        R: Refresh + ?Sized + 'static,
    {
        let inner = &self.inner;
        let cached = match inner.store.read(key).await {
            Ok(cached) => cached,
            Err(e) => {
                warn!(key = %key, error = %e, "cache read failed, fetching directly");
                return inner.bypass(key, refresher.as_ref()).await;
            }
        };
        let Some(entry) = cached else {
            info!(key = %key, classification = ?Classification::Miss, "projection read");
            return self.refresh_blocking(key, None, refresher).await;
        };

        let age = entry.age(inner.clock.now_ms());
        let classification = inner.ttls.classify(age);
        info!(
            key = %key,
            ?classification,
            age_ms = age.as_millis() as u64,
            events = entry.events.len(),
            "projection read"
        );
        match classification {
            Classification::Fresh => Projection::new(entry.events, Source::Fresh),
            Classification::SoftStale => {
                self.spawn_revalidation(key.clone(), refresher);
                Projection::new(entry.events, Source::Revalidating)
            }
            Classification::HardStale | Classification::Miss => {
                self.refresh_blocking(key, Some(entry), refresher).await
            }
        }
    }

    /// Wait for every background refresh started so far.
    pub async fn drain(&self) {
        let tasks = &self.inner.tasks;
        tasks.close();
        tasks.wait().await;
        tasks.reopen();
    }

    async fn refresh_blocking<R>(&self, key: &CacheKey, stale: Option<CacheEntry>, refresher: Arc<R>) -> Projection
    where
        R: Refresh + ?Sized + 'static,
    {
        let inner = &self.inner;
        let lock = inner.lock_for(key);
        let (mut shared, waited) = acquire(&lock).await;
        let turn = match shared.as_ref() {
            Some(outcome) if waited => {
                debug!(key = %key, source = ?outcome.source, "sharing concurrent refresh");
                Turn::Cached(outcome.clone())
            }
            _ => inner.refresh_locked(key, stale, refresher.as_ref(), waited).await,
        };
        let (projection, revalidate) = match turn {
            Turn::Fetched(projection) => {
                *shared = Some(projection.clone());
                (projection, false)
            }
            Turn::Cached(projection) => (projection, false),
            Turn::SoftStale(projection) => (projection, true),
        };
        drop(shared);
        drop(lock);
        inner.prune_lock(key);
        if revalidate {
            self.spawn_revalidation(key.clone(), refresher);
        }
        projection
    }

    fn spawn_revalidation<R>(&self, key: CacheKey, refresher: Arc<R>)
    where
        R: Refresh + ?Sized + 'static,
    {
        let lock = self.inner.lock_for(&key);
        let Ok(mut guard) = lock.try_lock_owned() else {
            debug!(key = %key, "refresh already in flight");
            return;
        };
        // Callers queued behind this task re-read the store instead.
        *guard = None;
        let inner = self.inner.clone();
        self.inner.tasks.spawn(async move {
            inner.revalidate(&key, refresher.as_ref()).await;
            drop(guard);
            inner.prune_lock(&key);
        });
    }
}

/// What a blocking caller did while holding the key lock.
enum Turn {
    /// Ran its own fetch; callers queued behind it reuse the result.
    Fetched(Projection),
    Cached(Projection),
    /// Found a soft-stale entry that still needs a background refresh.
    SoftStale(Projection),
}

/// Take the key lock, reporting whether another holder had it first.
async fn acquire(lock: &KeyLock) -> (tokio::sync::MutexGuard<'_, Option<Projection>>, bool) {
    match lock.try_lock() {
        Ok(guard) => (guard, false),
        Err(_) => (lock.lock().await, true),
    }
}

fn fallback(stale: Option<CacheEntry>) -> Projection {
    match stale {
        Some(stale) => Projection::new(stale.events, Source::Stale),
        None => Projection::unavailable(),
    }
}

impl Inner {
    fn lock_for(&self, key: &CacheKey) -> KeyLock {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Forget the lock for `key` once nobody holds or waits on it.
    fn prune_lock(&self, key: &CacheKey) {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }

    /// Blocking refresh body. The caller holds the key lock; `waited` means
    /// a background refresh held it first, so no second fetch is started.
    async fn refresh_locked<R>(&self, key: &CacheKey, stale: Option<CacheEntry>, refresher: &R, waited: bool) -> Turn
    where
        R: Refresh + ?Sized,
    {
        let mut stale = stale;
        match self.store.read(key).await {
            Ok(Some(current)) => match self.ttls.classify(current.age(self.clock.now_ms())) {
                Classification::Fresh => {
                    debug!(key = %key, "refreshed while waiting");
                    return Turn::Cached(Projection::new(current.events, Source::Fresh));
                }
                Classification::SoftStale => {
                    return Turn::SoftStale(Projection::new(current.events, Source::Revalidating));
                }
                Classification::HardStale | Classification::Miss => stale = Some(current),
            },
            Ok(None) => {}
            Err(e) => warn!(key = %key, error = %e, "cache re-read failed"),
        }
        if waited {
            debug!(key = %key, "background refresh just ran, not fetching again");
            return Turn::Cached(fallback(stale));
        }

        match refresher.full(key).await {
            Ok(entry) => {
                self.store_and_announce(key, &entry).await;
                Turn::Fetched(Projection::new(entry.events, Source::Relays))
            }
            Err(e) => {
                match stale {
                    Some(_) => warn!(key = %key, error = %e, "refresh failed, serving stale entry"),
                    None => warn!(key = %key, error = %e, "refresh failed, nothing cached"),
                }
                Turn::Fetched(fallback(stale))
            }
        }
    }

    /// Full fetch for when the store cannot be read. Concurrent callers
    /// share one fetch through the key lock.
    async fn bypass<R>(&self, key: &CacheKey, refresher: &R) -> Projection
    where
        R: Refresh + ?Sized,
    {
        let lock = self.lock_for(key);
        let (mut shared, waited) = acquire(&lock).await;
        let projection = match shared.as_ref() {
            Some(outcome) if waited => outcome.clone(),
            _ => {
                let projection = match refresher.full(key).await {
                    Ok(entry) => {
                        self.store_and_announce(key, &entry).await;
                        Projection::new(entry.events, Source::Relays)
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "direct fetch failed");
                        Projection::unavailable()
                    }
                };
                *shared = Some(projection.clone());
                projection
            }
        };
        drop(shared);
        drop(lock);
        self.prune_lock(key);
        projection
    }

    /// Background refresh body. The caller holds the key lock.
    async fn revalidate<R>(&self, key: &CacheKey, refresher: &R)
    where
        R: Refresh + ?Sized,
    {
        let result = match self.store.read(key).await {
            Ok(Some(current)) => {
                if self.ttls.classify(current.age(self.clock.now_ms())) == Classification::Fresh {
                    debug!(key = %key, "already refreshed");
                    return;
                }
                refresher.incremental(key, &current).await
            }
            Ok(None) => refresher.full(key).await,
            Err(e) => {
                warn!(key = %key, error = %e, "cache read failed, skipping background refresh");
                return;
            }
        };
        match result {
            Ok(entry) => self.store_and_announce(key, &entry).await,
            Err(e) => warn!(key = %key, error = %e, "background refresh failed, keeping cached entry"),
        }
    }

    async fn store_and_announce(&self, key: &CacheKey, entry: &CacheEntry) {
        if let Err(e) = self.store.write(key, entry, self.ttls.store()).await {
            warn!(key = %key, error = %e, "cache write failed");
        }
        info!(
            key = %key,
            events = entry.events.len(),
            max_event_timestamp = entry.max_event_timestamp,
            "projection refreshed"
        );
        self.notifier.announce(key, &entry.events);
    }
}
