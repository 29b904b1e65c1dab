//! Rebuilding cache entries from relays.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    aggregate::{self, Aggregated},
    cache::{CacheEntry, CacheError, CacheKey},
    clock::Clock,
    directory::RelayDirectory,
    filter::QueryDescriptor,
    relay::RelayPool,
};

#[derive(Debug, Error)]
pub enum RefreshError {
    /// No relay answered within its budget, or there was none to ask.
    #[error("all {relays} relays failed")]
    AllRelaysFailed { relays: usize },
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Produces cache entries for a key.
#[async_trait]
pub trait Refresh: Send + Sync {
    /// Build the entry from scratch.
    async fn full(&self, key: &CacheKey) -> Result<CacheEntry, RefreshError>;

    /// Fetch only what is newer than `cached` and merge it in.
    async fn incremental(&self, key: &CacheKey, cached: &CacheEntry) -> Result<CacheEntry, RefreshError>;
}

/// Refreshes one query against the relays a directory names for the key's
/// subject.
pub struct RelayRefresh {
    pool: RelayPool,
    directory: Arc<dyn RelayDirectory>,
    query: QueryDescriptor,
    per_relay_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl RelayRefresh {
    pub fn new(
        pool: RelayPool,
        directory: Arc<dyn RelayDirectory>,
        query: QueryDescriptor,
        per_relay_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pool,
            directory,
            query,
            per_relay_timeout,
            clock,
        }
    }

    pub fn query(&self) -> &QueryDescriptor {
        &self.query
    }

    async fn fetch(&self, key: &CacheKey, query: &QueryDescriptor) -> Result<Aggregated, RefreshError> {
        let relays = self.directory.relays_for(&key.subject).await;
        if relays.is_empty() {
            return Err(RefreshError::AllRelaysFailed { relays: 0 });
        }
        let outcomes = self.pool.fetch(&relays, query, self.per_relay_timeout).await;
        let merged = aggregate::merge(outcomes);
        if !merged.any_responsive() {
            return Err(RefreshError::AllRelaysFailed {
                relays: relays.len(),
            });
        }
        for (relay, message) in &merged.passthrough {
            debug!(key = %key, relay = %relay, ?message, "relay message");
        }
        Ok(merged)
    }
}

#[async_trait]
impl Refresh for RelayRefresh {
    async fn full(&self, key: &CacheKey) -> Result<CacheEntry, RefreshError> {
        let merged = self.fetch(key, &self.query).await?;
        info!(key = %key, events = merged.events.len(), "full refresh");
        Ok(CacheEntry::new(merged.events, self.query.clone(), self.clock.now_ms()))
    }

    async fn incremental(&self, key: &CacheKey, cached: &CacheEntry) -> Result<CacheEntry, RefreshError> {
        if cached.query != self.query {
            debug!(key = %key, "query changed, refreshing in full");
            return self.full(key).await;
        }
        let cursor = cached.max_event_timestamp.saturating_add(1);
        let merged = self.fetch(key, &self.query.with_since(cursor)).await?;
        info!(key = %key, since = cursor, events = merged.events.len(), "incremental refresh");
        Ok(cached.merged(merged.events, self.clock.now_ms()))
    }
}
