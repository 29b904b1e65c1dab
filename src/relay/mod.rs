//! Relay connections and the concurrent fan-out pool.

pub mod connection;
pub mod pool;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{event::Event, message::RelayMessage};

pub use connection::RelayConnection;
pub use pool::{PoolOptions, RelayPool};

/// WebSocket URL of a relay, e.g. `wss://relay.example.com`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelayAddress(String);

impl RelayAddress {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RelayAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RelayAddress {
    fn from(url: &str) -> Self {
        Self::new(url)
    }
}

impl From<String> for RelayAddress {
    fn from(url: String) -> Self {
        Self(url)
    }
}

/// Failure talking to one relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid relay url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("connect failed: {0}")]
    Connect(#[from] std::io::Error),
    #[error("proxy connect failed: {0}")]
    Proxy(#[from] tokio_socks::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection closed by relay")]
    Closed,
    #[error("relay worker aborted: {0}")]
    Worker(String),
}

/// How a relay's part of a fetch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    /// The relay signalled `EOSE` or `CLOSED` for the subscription.
    Complete,
    /// The per-relay deadline fired first.
    TimedOut,
    /// The fetch was cancelled by the caller.
    Cancelled,
    /// The connection failed; see [`RelayOutcome::error`].
    Failed,
}

/// Everything one relay produced for one fetch.
#[derive(Debug)]
pub struct RelayOutcome {
    /// Responses in arrival order, including connection-level messages.
    pub responses: Vec<RelayMessage>,
    pub status: FetchStatus,
    /// Set when `status` is `Failed`. Responses collected before the failure
    /// are still present.
    pub error: Option<RelayError>,
}

impl RelayOutcome {
    pub(crate) fn finished(responses: Vec<RelayMessage>, status: FetchStatus) -> Self {
        Self {
            responses,
            status,
            error: None,
        }
    }

    pub(crate) fn failed(responses: Vec<RelayMessage>, error: RelayError) -> Self {
        Self {
            responses,
            status: FetchStatus::Failed,
            error: Some(error),
        }
    }

    /// Events received for the subscription.
    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.responses.iter().filter_map(|r| match r {
            RelayMessage::Event { event, .. } => Some(event.as_ref()),
            _ => None,
        })
    }

    /// The relay answered: it completed, or it sent something before the
    /// deadline. A silent timeout or a connection failure with nothing
    /// received does not count.
    pub fn is_responsive(&self) -> bool {
        match self.status {
            FetchStatus::Complete => true,
            FetchStatus::TimedOut | FetchStatus::Cancelled => !self.responses.is_empty(),
            FetchStatus::Failed => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::tests::event;

    #[test]
    fn responsiveness() {
        let ev = RelayMessage::Event {
            subscription_id: "s".into(),
            event: Box::new(event("aa", 1)),
        };
        assert!(RelayOutcome::finished(vec![], FetchStatus::Complete).is_responsive());
        assert!(!RelayOutcome::finished(vec![], FetchStatus::TimedOut).is_responsive());
        assert!(RelayOutcome::finished(vec![ev.clone()], FetchStatus::TimedOut).is_responsive());
        let failed = RelayOutcome::failed(vec![ev], RelayError::Closed);
        assert!(!failed.is_responsive());
        assert_eq!(failed.events().count(), 1);
    }

    #[test]
    fn address_display_and_order() {
        let a = RelayAddress::from("wss://a");
        let b = RelayAddress::from("wss://b".to_string());
        assert!(a < b);
        assert_eq!(a.to_string(), "wss://a");
        assert_eq!(serde_json::to_string(&a).unwrap(), "\"wss://a\"");
    }
}
