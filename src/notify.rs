//! Push refreshed projections to live subscribers.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::sync::broadcast;
use tracing::debug;

use crate::{cache::CacheKey, event::Event};

const DEFAULT_CAPACITY: usize = 16;

/// A refreshed projection.
#[derive(Debug, Clone)]
pub struct Update {
    pub key: CacheKey,
    pub events: Arc<Vec<Event>>,
}

/// Per-key broadcast channels. Cheap to clone; clones share subscribers.
#[derive(Clone)]
pub struct ChangeNotifier {
    channels: Arc<Mutex<HashMap<CacheKey, broadcast::Sender<Update>>>>,
    capacity: usize,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ChangeNotifier {
    /// `capacity` bounds how many updates a slow subscriber may fall behind
    /// before it starts missing them.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, key: &CacheKey) -> broadcast::Receiver<Update> {
        let mut channels = self.lock();
        match channels.get(key) {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(self.capacity);
                channels.insert(key.clone(), tx);
                rx
            }
        }
    }

    /// Best-effort broadcast of `events` to subscribers of `key`.
    pub fn announce(&self, key: &CacheKey, events: &[Event]) {
        let mut channels = self.lock();
        let Some(tx) = channels.get(key) else {
            debug!(key = %key, "no subscribers for update");
            return;
        };
        let update = Update {
            key: key.clone(),
            events: Arc::new(events.to_vec()),
        };
        match tx.send(update) {
            Ok(receivers) => debug!(key = %key, receivers, "announced update"),
            Err(_) => {
                debug!(key = %key, "subscribers gone, dropping channel");
                channels.remove(key);
            }
        }
    }

    /// Number of keys with at least one channel open.
    pub fn channels(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, broadcast::Sender<Update>>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
