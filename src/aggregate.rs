//! Merge per-relay outcomes into one deduplicated, ordered event sequence.

use std::{
    cmp::{Ordering, Reverse},
    collections::{BTreeMap, HashMap},
};

use serde::Serialize;

use crate::{
    event::Event,
    message::RelayMessage,
    relay::{FetchStatus, RelayAddress, RelayOutcome},
};

/// Result of one fetch across all relays.
#[derive(Debug, Default)]
pub struct Aggregated {
    /// Unique by id, newest first, id ascending on equal timestamps.
    pub events: Vec<Event>,
    /// Notices, auth challenges, acknowledgements and `CLOSED` messages,
    /// kept for observability.
    pub passthrough: Vec<(RelayAddress, RelayMessage)>,
    pub relays: BTreeMap<RelayAddress, RelaySummary>,
}

/// Per-relay bookkeeping for logs and CLI output.
#[derive(Debug, Clone, Serialize)]
pub struct RelaySummary {
    pub status: FetchStatus,
    pub events: usize,
    pub responsive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Aggregated {
    /// At least one relay answered within budget.
    pub fn any_responsive(&self) -> bool {
        self.relays.values().any(|r| r.responsive)
    }

    pub fn max_created_at(&self) -> Option<u64> {
        self.events.iter().map(|e| e.created_at).max()
    }
}

/// Flatten, deduplicate and sort the events of every relay outcome.
pub fn merge(outcomes: BTreeMap<RelayAddress, RelayOutcome>) -> Aggregated {
    let mut by_id: HashMap<String, Event> = HashMap::new();
    let mut passthrough = Vec::new();
    let mut relays = BTreeMap::new();
    for (relay, outcome) in outcomes {
        let responsive = outcome.is_responsive();
        let mut events = 0;
        for response in outcome.responses {
            match response {
                RelayMessage::Event { event, .. } => {
                    events += 1;
                    by_id.insert(event.id.clone(), *event);
                }
                RelayMessage::EndOfStoredEvents { .. } => {}
                other @ (RelayMessage::Notice { .. }
                | RelayMessage::Auth { .. }
                | RelayMessage::Ok { .. }
                | RelayMessage::Closed { .. }) => passthrough.push((relay.clone(), other)),
            }
        }
        relays.insert(
            relay,
            RelaySummary {
                status: outcome.status,
                events,
                responsive,
                error: outcome.error.map(|e| e.to_string()),
            },
        );
    }
    let mut events: Vec<Event> = by_id.into_values().collect();
    sort_events(&mut events);
    Aggregated {
        events,
        passthrough,
        relays,
    }
}

/// Merge `incoming` into `existing` with the same id and order rules as
/// [`merge`]. On an id collision the incoming copy wins.
pub fn merge_events(existing: Vec<Event>, incoming: Vec<Event>) -> Vec<Event> {
    let mut by_id: HashMap<String, Event> = HashMap::with_capacity(existing.len() + incoming.len());
    for ev in existing.into_iter().chain(incoming) {
        by_id.insert(ev.id.clone(), ev);
    }
    let mut events: Vec<Event> = by_id.into_values().collect();
    sort_events(&mut events);
    events
}

/// Newest first; equal timestamps ordered by id.
pub fn sort_events(events: &mut [Event]) {
    events.sort_by(compare);
}

fn compare(a: &Event, b: &Event) -> Ordering {
    (Reverse(a.created_at), &a.id).cmp(&(Reverse(b.created_at), &b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{event::tests::event, relay::RelayError};

    fn ev_msg(id: &str, ts: u64) -> RelayMessage {
        RelayMessage::Event {
            subscription_id: "s".into(),
            event: Box::new(event(id, ts)),
        }
    }

    fn ids(events: &[Event]) -> Vec<&str> {
        events.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn overlapping_relays_collapse_to_one_copy() {
        let mut outcomes = BTreeMap::new();
        outcomes.insert(
            RelayAddress::from("wss://a"),
            RelayOutcome::finished(vec![ev_msg("x", 5), ev_msg("y", 4)], FetchStatus::Complete),
        );
        outcomes.insert(
            RelayAddress::from("wss://b"),
            RelayOutcome::finished(vec![ev_msg("y", 4), ev_msg("z", 9)], FetchStatus::TimedOut),
        );
        let agg = merge(outcomes);
        assert_eq!(ids(&agg.events), vec!["z", "x", "y"]);
        assert_eq!(agg.relays[&RelayAddress::from("wss://b")].events, 2);
        assert!(agg.any_responsive());
        assert_eq!(agg.max_created_at(), Some(9));
    }

    #[test]
    fn equal_timestamps_order_by_id_regardless_of_arrival() {
        let forward = vec![ev_msg("c", 1), ev_msg("a", 1), ev_msg("b", 1)];
        let mut backward = forward.clone();
        backward.reverse();
        for responses in [forward, backward] {
            let mut outcomes = BTreeMap::new();
            outcomes.insert(
                RelayAddress::from("wss://a"),
                RelayOutcome::finished(responses, FetchStatus::Complete),
            );
            assert_eq!(ids(&merge(outcomes).events), vec!["a", "b", "c"]);
        }
    }

    #[test]
    fn non_event_messages_pass_through() {
        let mut outcomes = BTreeMap::new();
        outcomes.insert(
            RelayAddress::from("wss://a"),
            RelayOutcome::finished(
                vec![
                    RelayMessage::Notice {
                        message: "hi".into(),
                    },
                    ev_msg("x", 1),
                    RelayMessage::EndOfStoredEvents {
                        subscription_id: "s".into(),
                    },
                ],
                FetchStatus::Complete,
            ),
        );
        outcomes.insert(
            RelayAddress::from("wss://b"),
            RelayOutcome::failed(vec![], RelayError::Closed),
        );
        let agg = merge(outcomes);
        assert_eq!(agg.events.len(), 1);
        assert_eq!(agg.passthrough.len(), 1);
        let b = &agg.relays[&RelayAddress::from("wss://b")];
        assert!(!b.responsive);
        assert!(b.error.is_some());
    }

    #[test]
    fn all_failed_is_empty_and_unresponsive() {
        let mut outcomes = BTreeMap::new();
        outcomes.insert(
            RelayAddress::from("wss://a"),
            RelayOutcome::finished(vec![], FetchStatus::TimedOut),
        );
        let agg = merge(outcomes);
        assert!(agg.events.is_empty());
        assert!(!agg.any_responsive());
        assert!(!merge(BTreeMap::new()).any_responsive());
    }

    #[test]
    fn merge_events_prefers_incoming_copy() {
        let mut old = event("x", 5);
        old.content = "old".into();
        let mut new = event("x", 5);
        new.content = "new".into();
        let merged = merge_events(vec![old, event("a", 1)], vec![new, event("b", 7)]);
        assert_eq!(ids(&merged), vec!["b", "x", "a"]);
        assert_eq!(merged[1].content, "new");
    }
}
