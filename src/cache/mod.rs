//! Stale-while-revalidate projection cache.

pub mod revalidate;
pub mod store;

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{aggregate, event::Event, filter::QueryDescriptor};

pub use revalidate::{Projection, Revalidator, Source};
pub use store::{CacheStore, FileStore, MemoryStore};

/// Address of a cached aggregate: who it is about and which view of them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// Subject identifier, e.g. an author public key or `pubkey:slug`.
    pub subject: String,
    /// View kind, e.g. `articles` or `highlights`.
    pub view: String,
}

impl CacheKey {
    pub fn new(subject: impl Into<String>, view: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            view: view.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.view, self.subject)
    }
}

/// A materialized aggregate and its refresh bookkeeping.
///
/// `max_event_timestamp` is at least the `created_at` of every held event,
/// and `events` never holds two events with the same id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub events: Vec<Event>,
    /// Wall-clock time of the last successful refresh, Unix millis.
    pub stored_at_ms: u64,
    /// Cursor for incremental refresh.
    pub max_event_timestamp: u64,
    /// Query the entry was built from.
    pub query: QueryDescriptor,
}

impl CacheEntry {
    /// Entry from a full fetch. `events` are re-deduplicated and sorted.
    pub fn new(events: Vec<Event>, query: QueryDescriptor, stored_at_ms: u64) -> Self {
        let events = aggregate::merge_events(Vec::new(), events);
        let max_event_timestamp = events.iter().map(|e| e.created_at).max().unwrap_or(0);
        Self {
            events,
            stored_at_ms,
            max_event_timestamp,
            query,
        }
    }

    /// Extend with newly fetched events. The cursor never moves backwards.
    pub fn merged(&self, incoming: Vec<Event>, stored_at_ms: u64) -> Self {
        let events = aggregate::merge_events(self.events.clone(), incoming);
        let newest = events.iter().map(|e| e.created_at).max().unwrap_or(0);
        Self {
            events,
            stored_at_ms,
            max_event_timestamp: self.max_event_timestamp.max(newest),
            query: self.query.clone(),
        }
    }

    pub fn age(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.stored_at_ms))
    }
}

/// Staleness thresholds. `soft < hard < store` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ttls {
    soft: Duration,
    hard: Duration,
    store: Duration,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid cache ttls: need soft ({soft:?}) < hard ({hard:?}) < store ({store:?})")]
pub struct InvalidTtls {
    pub soft: Duration,
    pub hard: Duration,
    pub store: Duration,
}

impl Ttls {
    /// Thresholds with the backend expiry set to twice the hard TTL.
    pub fn new(soft: Duration, hard: Duration) -> Result<Self, InvalidTtls> {
        Self::with_store(soft, hard, hard * 2)
    }

    pub fn with_store(soft: Duration, hard: Duration, store: Duration) -> Result<Self, InvalidTtls> {
        if soft < hard && hard < store {
            Ok(Self { soft, hard, store })
        } else {
            Err(InvalidTtls { soft, hard, store })
        }
    }

    pub fn soft(&self) -> Duration {
        self.soft
    }

    pub fn hard(&self) -> Duration {
        self.hard
    }

    /// Expiry handed to the backing store on every write.
    pub fn store(&self) -> Duration {
        self.store
    }

    /// Classify an existing entry of the given age.
    pub fn classify(&self, age: Duration) -> Classification {
        if age <= self.soft {
            Classification::Fresh
        } else if age <= self.hard {
            Classification::SoftStale
        } else {
            Classification::HardStale
        }
    }
}

/// How a cache read was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Miss,
    Fresh,
    SoftStale,
    HardStale,
}

/// Backing store failure.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache encoding: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("cache write: {0}")]
    Persist(#[from] tempfile::PersistError),
    #[error("cache scan: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
}
