//! Entry point tying the relay pool, the projection cache and the notifier
//! together.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use tokio::sync::broadcast;

use crate::{
    aggregate::{self, Aggregated},
    cache::{CacheKey, CacheStore, Projection, Revalidator, Ttls},
    clock::Clock,
    directory::RelayDirectory,
    filter::QueryDescriptor,
    notify::{ChangeNotifier, Update},
    refresh::RelayRefresh,
    relay::{RelayAddress, RelayPool},
};

/// Cache and fetch tunables.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub ttls: Ttls,
    pub per_relay_timeout: Duration,
}

#[derive(Clone)]
pub struct Engine {
    pool: RelayPool,
    directory: Arc<dyn RelayDirectory>,
    revalidator: Revalidator,
    clock: Arc<dyn Clock>,
    per_relay_timeout: Duration,
}

impl Engine {
    /// `pool` may be shared, e.g. with a [`Nip65Directory`](crate::directory::Nip65Directory).
    pub fn new(
        pool: RelayPool,
        options: EngineOptions,
        directory: Arc<dyn RelayDirectory>,
        store: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let revalidator = Revalidator::new(store, clock.clone(), options.ttls, ChangeNotifier::default());
        Self {
            pool,
            directory,
            revalidator,
            clock,
            per_relay_timeout: options.per_relay_timeout,
        }
    }

    pub fn pool(&self) -> &RelayPool {
        &self.pool
    }

    /// Serve the projection for `key`. `query` builds the relay query for
    /// the key and is only consulted when a refresh is needed.
    pub async fn get_or_refresh<F>(&self, key: &CacheKey, query: F) -> Projection
    where
        F: FnOnce(&CacheKey) -> QueryDescriptor,
    {
        let refresh = RelayRefresh::new(
            self.pool.clone(),
            self.directory.clone(),
            query(key),
            self.per_relay_timeout,
            self.clock.clone(),
        );
        self.revalidator.get_or_refresh(key, Arc::new(refresh)).await
    }

    /// Receive every refresh of `key` from now on.
    pub fn subscribe(&self, key: &CacheKey) -> broadcast::Receiver<Update> {
        self.revalidator.notifier().subscribe(key)
    }

    /// Uncached one-shot query.
    pub async fn fetch(&self, relays: &BTreeSet<RelayAddress>, query: &QueryDescriptor) -> Aggregated {
        aggregate::merge(self.pool.fetch(relays, query, self.per_relay_timeout).await)
    }

    /// Wait for background refreshes to finish.
    pub async fn drain(&self) {
        self.revalidator.drain().await;
    }
}
