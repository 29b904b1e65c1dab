//! Where to look for a subject's events.

use std::{collections::BTreeSet, time::Duration};

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use crate::{
    aggregate,
    event::Event,
    filter::QueryDescriptor,
    relay::{RelayAddress, RelayPool},
};

/// Relay list kind (NIP-65).
pub const RELAY_LIST_KIND: u32 = 10002;

#[async_trait]
pub trait RelayDirectory: Send + Sync {
    async fn relays_for(&self, subject: &str) -> BTreeSet<RelayAddress>;
}

/// The same configured relays for every subject.
#[derive(Debug, Clone, Default)]
pub struct StaticRelays {
    relays: BTreeSet<RelayAddress>,
}

impl StaticRelays {
    pub fn new(relays: impl IntoIterator<Item = RelayAddress>) -> Self {
        Self {
            relays: relays.into_iter().collect(),
        }
    }

    pub fn relays(&self) -> &BTreeSet<RelayAddress> {
        &self.relays
    }
}

#[async_trait]
impl RelayDirectory for StaticRelays {
    async fn relays_for(&self, _subject: &str) -> BTreeSet<RelayAddress> {
        self.relays.clone()
    }
}

/// Resolves a subject's write relays from its latest relay list event,
/// looked up on the default relays. Subjects are expected to start with the
/// author's public key, optionally followed by `:` and a qualifier.
pub struct Nip65Directory {
    pool: RelayPool,
    defaults: BTreeSet<RelayAddress>,
    timeout: Duration,
}

impl Nip65Directory {
    pub fn new(pool: RelayPool, defaults: BTreeSet<RelayAddress>, timeout: Duration) -> Self {
        Self {
            pool,
            defaults,
            timeout,
        }
    }
}

#[async_trait]
impl RelayDirectory for Nip65Directory {
    async fn relays_for(&self, subject: &str) -> BTreeSet<RelayAddress> {
        let author = subject.split(':').next().unwrap_or(subject);
        if self.defaults.is_empty() || author.is_empty() {
            return self.defaults.clone();
        }
        let query = QueryDescriptor::new()
            .kind(RELAY_LIST_KIND)
            .author(author)
            .limit(1);
        let outcomes = self.pool.fetch(&self.defaults, &query, self.timeout).await;
        let merged = aggregate::merge(outcomes);
        let found = merged
            .events
            .iter()
            .find(|e| e.kind == RELAY_LIST_KIND && e.pubkey == author)
            .map(write_relays)
            .unwrap_or_default();
        if found.is_empty() {
            debug!(subject, "no relay list, using defaults");
            self.defaults.clone()
        } else {
            debug!(subject, relays = found.len(), "resolved relay list");
            found
        }
    }
}

/// `r` tags with no marker or a `write` marker, restricted to websocket urls.
fn write_relays(list: &Event) -> BTreeSet<RelayAddress> {
    list.tags
        .iter()
        .filter(|t| t.name() == Some("r"))
        .filter(|t| matches!(t.0.get(2).map(String::as_str), None | Some("write")))
        .filter_map(|t| t.value())
        .filter(|url| {
            Url::parse(url)
                .map(|u| matches!(u.scheme(), "ws" | "wss"))
                .unwrap_or(false)
        })
        .map(RelayAddress::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::{tests::event, Tag},
        testutil::spawn_relay,
    };

    fn relay_list(author: &str, tags: &[&[&str]]) -> Event {
        let mut ev = event("list", 10);
        ev.kind = RELAY_LIST_KIND;
        ev.pubkey = author.into();
        ev.tags = tags
            .iter()
            .map(|t| Tag(t.iter().map(|s| s.to_string()).collect()))
            .collect();
        ev
    }

    #[test]
    fn write_relays_skip_read_only_and_bad_urls() {
        let list = relay_list(
            "pk",
            &[
                &["r", "wss://both.example"],
                &["r", "wss://write.example", "write"],
                &["r", "wss://read.example", "read"],
                &["r", "https://not-ws.example"],
                &["p", "wss://wrong-tag.example"],
            ],
        );
        let relays: Vec<_> = write_relays(&list).into_iter().map(|r| r.to_string()).collect();
        assert_eq!(relays, vec!["wss://both.example", "wss://write.example"]);
    }

    #[tokio::test]
    async fn static_relays_ignore_subject() {
        let dir = StaticRelays::new([RelayAddress::from("wss://a"), RelayAddress::from("wss://b")]);
        assert_eq!(dir.relays_for("anyone").await.len(), 2);
    }

    #[tokio::test]
    async fn nip65_resolves_from_relay_list() {
        let relay = spawn_relay(vec![relay_list("pk", &[&["r", "wss://home.example"]])], true).await;
        let defaults = BTreeSet::from([relay.address.clone()]);
        let dir = Nip65Directory::new(RelayPool::default(), defaults, Duration::from_secs(2));
        let relays = dir.relays_for("pk:articles").await;
        assert_eq!(relays, BTreeSet::from([RelayAddress::from("wss://home.example")]));
    }

    #[tokio::test]
    async fn nip65_falls_back_to_defaults() {
        let relay = spawn_relay(vec![], true).await;
        let defaults = BTreeSet::from([relay.address.clone()]);
        let dir = Nip65Directory::new(RelayPool::default(), defaults.clone(), Duration::from_secs(2));
        assert_eq!(dir.relays_for("pk").await, defaults);
    }
}
