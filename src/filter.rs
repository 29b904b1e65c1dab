//! Query descriptors and their NIP-01 filter encoding.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What events to fetch. One descriptor is sent identically to every target
/// relay as a single filter object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    /// Restrict to specific event ids.
    #[serde(default)]
    pub ids: BTreeSet<String>,
    /// Restrict to specific authors (hex public keys).
    #[serde(default)]
    pub authors: BTreeSet<String>,
    /// Restrict to event kinds.
    #[serde(default)]
    pub kinds: BTreeSet<u32>,
    /// Tag filters keyed by tag name without the `#` prefix (e.g. `d`).
    #[serde(default)]
    pub tags: BTreeMap<String, BTreeSet<String>>,
    /// Lower bound for `created_at`, inclusive.
    pub since: Option<u64>,
    /// Upper bound for `created_at`, inclusive.
    pub until: Option<u64>,
    /// Maximum number of stored events requested from each relay.
    pub limit: Option<u32>,
}

impl QueryDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: u32) -> Self {
        self.kinds.insert(kind);
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u32>) -> Self {
        self.kinds.extend(kinds);
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.authors.insert(author.into());
        self
    }

    pub fn authors<S: Into<String>>(mut self, authors: impl IntoIterator<Item = S>) -> Self {
        self.authors.extend(authors.into_iter().map(Into::into));
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.ids.insert(id.into());
        self
    }

    /// Add a tag filter value. A leading `#` on `name` is accepted and dropped.
    pub fn tag(mut self, name: &str, value: impl Into<String>) -> Self {
        let name = name.strip_prefix('#').unwrap_or(name);
        self.tags
            .entry(name.to_string())
            .or_default()
            .insert(value.into());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Same query starting at `cursor`. An existing lower bound that is
    /// already later than the cursor is kept.
    pub fn with_since(&self, cursor: u64) -> Self {
        let mut q = self.clone();
        q.since = Some(self.since.map_or(cursor, |base| base.max(cursor)));
        q
    }

    /// Encode as a NIP-01 filter object for a `REQ` message.
    pub fn to_filter(&self) -> Map<String, Value> {
        let mut map = Map::new();
        if !self.ids.is_empty() {
            map.insert("ids".into(), string_array(&self.ids));
        }
        if !self.authors.is_empty() {
            map.insert("authors".into(), string_array(&self.authors));
        }
        if !self.kinds.is_empty() {
            map.insert(
                "kinds".into(),
                Value::Array(self.kinds.iter().map(|k| Value::Number((*k).into())).collect()),
            );
        }
        for (tag, values) in &self.tags {
            if values.is_empty() {
                continue;
            }
            map.insert(format!("#{tag}"), string_array(values));
        }
        if let Some(since) = self.since {
            map.insert("since".into(), Value::Number(since.into()));
        }
        if let Some(until) = self.until {
            map.insert("until".into(), Value::Number(until.into()));
        }
        if let Some(limit) = self.limit {
            map.insert("limit".into(), Value::Number(limit.into()));
        }
        map
    }

    /// Decode a NIP-01 filter object, skipping entries of the wrong type.
    pub fn from_filter(val: &Value) -> Self {
        let strings = |key: &str| -> BTreeSet<String> {
            val.get(key)
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default()
        };
        let kinds = val
            .get("kinds")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_u64().and_then(|u| u32::try_from(u).ok()))
                    .collect()
            })
            .unwrap_or_default();
        let mut tags = BTreeMap::new();
        if let Some(obj) = val.as_object() {
            for key in obj.keys() {
                if let Some(name) = key.strip_prefix('#') {
                    tags.insert(name.to_string(), strings(key));
                }
            }
        }
        Self {
            ids: strings("ids"),
            authors: strings("authors"),
            kinds,
            tags,
            since: val.get("since").and_then(|v| v.as_u64()),
            until: val.get("until").and_then(|v| v.as_u64()),
            limit: val
                .get("limit")
                .and_then(|v| v.as_u64())
                .and_then(|v| u32::try_from(v).ok()),
        }
    }
}

fn string_array(values: &BTreeSet<String>) -> Value {
    Value::Array(values.iter().cloned().map(Value::String).collect())
}
