//! Local mock relays for tests.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_tungstenite::{accept_async, tungstenite::Message};

use crate::{event::Event, filter::QueryDescriptor, relay::RelayAddress};

/// A relay serving a fixed set of events. Each `REQ` is answered with the
/// events at or after the filter's `since`, followed by `EOSE` when `eose`
/// is set. With no events and no `EOSE` the relay stays silent.
pub(crate) struct MockRelay {
    pub address: RelayAddress,
    connections: Arc<AtomicUsize>,
    requests: Arc<AtomicUsize>,
    handle: tokio::task::JoinHandle<()>,
}

impl MockRelay {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub(crate) async fn spawn_relay(events: Vec<Event>, eose: bool) -> MockRelay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(AtomicUsize::new(0));
    let events = Arc::new(events);
    let (conns, reqs) = (connections.clone(), requests.clone());
    let handle = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            conns.fetch_add(1, Ordering::SeqCst);
            let events = events.clone();
            let reqs = reqs.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    let Message::Text(txt) = msg else { continue };
                    let Ok(val) = serde_json::from_str::<Value>(&txt) else {
                        continue;
                    };
                    if val[0] != "REQ" {
                        continue;
                    }
                    reqs.fetch_add(1, Ordering::SeqCst);
                    let sub = val[1].as_str().unwrap_or_default().to_string();
                    let filter = QueryDescriptor::from_filter(&val[2]);
                    for ev in events.iter() {
                        if filter.since.is_some_and(|s| ev.created_at < s) {
                            continue;
                        }
                        let frame = serde_json::json!(["EVENT", sub, ev]).to_string();
                        if ws.send(Message::Text(frame)).await.is_err() {
                            return;
                        }
                    }
                    if eose {
                        let frame = serde_json::json!(["EOSE", sub]).to_string();
                        if ws.send(Message::Text(frame)).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });
    MockRelay {
        address: RelayAddress::new(format!("ws://{addr}")),
        connections,
        requests,
        handle,
    }
}
