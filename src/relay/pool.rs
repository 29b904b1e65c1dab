//! Concurrent fan-out of one query to many relays.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    panic::AssertUnwindSafe,
    slice,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures_util::FutureExt;
use tokio::{task::JoinSet, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{FetchStatus, RelayAddress, RelayConnection, RelayError, RelayOutcome};
use crate::{filter::QueryDescriptor, message::RelayMessage};

/// Tunables for a [`RelayPool`].
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Optional SOCKS5 proxy (host:port) for every outbound connection.
    pub proxy: Option<String>,
    /// Idle connections kept per relay for reuse by later fetches.
    pub max_idle_per_relay: usize,
    /// Drop events whose id or signature does not verify.
    pub verify_signatures: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            proxy: None,
            max_idle_per_relay: 2,
            verify_signatures: false,
        }
    }
}

/// Pool of relay connections. Cheap to clone; clones share idle connections.
#[derive(Clone)]
pub struct RelayPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    options: PoolOptions,
    idle: Mutex<HashMap<RelayAddress, Vec<RelayConnection>>>,
    next_sub: AtomicU64,
}

impl Default for RelayPool {
    fn default() -> Self {
        Self::new(PoolOptions::default())
    }
}

impl RelayPool {
    pub fn new(options: PoolOptions) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                options,
                idle: Mutex::new(HashMap::new()),
                next_sub: AtomicU64::new(0),
            }),
        }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    /// Query every relay concurrently, waiting at most `per_relay_timeout`
    /// for each. Always returns one outcome per relay.
    pub async fn fetch(
        &self,
        relays: &BTreeSet<RelayAddress>,
        query: &QueryDescriptor,
        per_relay_timeout: Duration,
    ) -> BTreeMap<RelayAddress, RelayOutcome> {
        self.fetch_with_cancel(relays, query, per_relay_timeout, CancellationToken::new())
            .await
    }

    /// Like [`fetch`](Self::fetch), but stops waiting on every relay once
    /// `cancel` fires. Responses received before cancellation are kept.
    pub async fn fetch_with_cancel(
        &self,
        relays: &BTreeSet<RelayAddress>,
        query: &QueryDescriptor,
        per_relay_timeout: Duration,
        cancel: CancellationToken,
    ) -> BTreeMap<RelayAddress, RelayOutcome> {
        let started = Instant::now();
        let deadline = started + per_relay_timeout;
        let mut workers = JoinSet::new();
        for relay in relays {
            let pool = self.clone();
            let relay = relay.clone();
            let query = query.clone();
            let cancel = cancel.child_token();
            workers.spawn(async move {
                let worker = pool.query_relay(relay.clone(), query, deadline, cancel);
                let outcome = AssertUnwindSafe(worker).catch_unwind().await.unwrap_or_else(|_| {
                    RelayOutcome::failed(vec![], RelayError::Worker("worker panicked".into()))
                });
                (relay, outcome)
            });
        }

        let mut outcomes = BTreeMap::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((relay, outcome)) => {
                    outcomes.insert(relay, outcome);
                }
                Err(e) => warn!(error = %e, "relay worker aborted"),
            }
        }
        for relay in relays {
            if !outcomes.contains_key(relay) {
                outcomes.insert(
                    relay.clone(),
                    RelayOutcome::failed(vec![], RelayError::Worker("worker aborted".into())),
                );
            }
        }

        let responsive = outcomes.values().filter(|o| o.is_responsive()).count();
        let events: usize = outcomes.values().map(|o| o.events().count()).sum();
        info!(
            relays = relays.len(),
            responsive,
            events,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "relay fetch finished"
        );
        outcomes
    }

    /// Open a connection to `relay` and close it again.
    pub async fn ping(&self, relay: &RelayAddress, timeout: Duration) -> Result<(), RelayError> {
        let connect = RelayConnection::connect(relay, self.inner.options.proxy.as_deref());
        match tokio::time::timeout(timeout, connect).await {
            Ok(conn) => {
                conn?.close().await;
                Ok(())
            }
            Err(_) => Err(RelayError::Connect(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            ))),
        }
    }

    /// Number of idle pooled connections for `relay`.
    pub fn idle_connections(&self, relay: &RelayAddress) -> usize {
        self.lock_idle().get(relay).map_or(0, Vec::len)
    }

    /// One relay worker: check out a connection, subscribe, collect until
    /// done or `deadline`, then hand the connection back.
    async fn query_relay(
        self,
        relay: RelayAddress,
        query: QueryDescriptor,
        deadline: Instant,
        cancel: CancellationToken,
    ) -> RelayOutcome {
        let sub_id = self.subscription_id();
        let filters = slice::from_ref(&query);
        let mut pooled = self.checkout_idle(&relay);
        loop {
            // A pooled connection may have been dropped by the relay while
            // idle; such a connection gets one retry on a fresh socket.
            let reused = pooled.is_some();
            let mut conn = match pooled.take() {
                Some(conn) => conn,
                None => match self.connect(&relay, deadline, &cancel).await {
                    Ok(conn) => conn,
                    Err(outcome) => return outcome,
                },
            };
            if let Err(e) = conn.subscribe(&sub_id, filters).await {
                if reused {
                    debug!(relay = %relay, error = %e, "pooled connection unusable");
                    continue;
                }
                warn!(relay = %relay, error = %e, "sending request failed");
                return RelayOutcome::failed(vec![], e);
            }

            let mut responses = Vec::new();
            let result = conn.collect(&sub_id, deadline, &cancel, &mut responses).await;
            if reused && result.is_err() && responses.is_empty() {
                debug!(relay = %relay, "pooled connection went stale");
                continue;
            }
            if self.inner.options.verify_signatures {
                discard_unverified(&relay, &mut responses);
            }
            return match result {
                Ok(status) => {
                    debug!(
                        relay = %relay,
                        status = ?status,
                        responses = responses.len(),
                        reused,
                        "relay query finished"
                    );
                    if status == FetchStatus::Complete {
                        // Still within budget: release inline so the next fetch can reuse it.
                        let _ = tokio::time::timeout_at(deadline, self.clone().release(conn, sub_id))
                            .await;
                    } else {
                        tokio::spawn(self.clone().release(conn, sub_id));
                    }
                    RelayOutcome::finished(responses, status)
                }
                Err(e) => {
                    warn!(relay = %relay, error = %e, partial = responses.len(), "relay stream failed");
                    RelayOutcome::failed(responses, e)
                }
            };
        }
    }

    /// Open a fresh connection within the worker's budget. The error side is
    /// the finished outcome for this relay.
    async fn connect(
        &self,
        relay: &RelayAddress,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<RelayConnection, RelayOutcome> {
        let connect = RelayConnection::connect(relay, self.inner.options.proxy.as_deref());
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RelayOutcome::finished(vec![], FetchStatus::Cancelled)),
            res = tokio::time::timeout_at(deadline, connect) => match res {
                Ok(Ok(conn)) => Ok(conn),
                Ok(Err(e)) => {
                    warn!(relay = %relay, error = %e, "relay connect failed");
                    Err(RelayOutcome::failed(vec![], e))
                }
                Err(_) => {
                    debug!(relay = %relay, "relay connect timed out");
                    Err(RelayOutcome::finished(vec![], FetchStatus::TimedOut))
                }
            },
        }
    }

    /// Close the subscription and return the connection to the idle list.
    async fn release(self, mut conn: RelayConnection, sub_id: String) {
        if conn.unsubscribe(&sub_id).await.is_err() || !conn.is_open() {
            return;
        }
        let max = self.inner.options.max_idle_per_relay;
        let rejected = {
            let mut idle = self.lock_idle();
            let slot = idle.entry(conn.address().clone()).or_default();
            if slot.len() < max {
                slot.push(conn);
                None
            } else {
                Some(conn)
            }
        };
        if let Some(conn) = rejected {
            conn.close().await;
        }
    }

    fn checkout_idle(&self, relay: &RelayAddress) -> Option<RelayConnection> {
        self.lock_idle().get_mut(relay).and_then(Vec::pop)
    }

    fn lock_idle(&self) -> std::sync::MutexGuard<'_, HashMap<RelayAddress, Vec<RelayConnection>>> {
        self.inner
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Subscription ids are unique per fetch so responses still in flight on
    /// a reused connection cannot be mistaken for the current query's.
    fn subscription_id(&self) -> String {
        let seq = self.inner.next_sub.fetch_add(1, Ordering::Relaxed);
        format!("rv{seq}-{:08x}", rand::random::<u32>())
    }
}

fn discard_unverified(relay: &RelayAddress, responses: &mut Vec<RelayMessage>) {
    responses.retain(|msg| match msg {
        RelayMessage::Event { event, .. } => match event.verify() {
            Ok(()) => true,
            Err(e) => {
                warn!(relay = %relay, id = %event.id, error = %e, "discarding unverifiable event");
                false
            }
        },
        _ => true,
    });
}
