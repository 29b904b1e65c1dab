//! Configuration loading from `.env` files.

use std::{env, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result};

use crate::{
    cache::Ttls,
    engine::EngineOptions,
    relay::{PoolOptions, RelayAddress},
};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Relays queried when no better relay list is known.
    pub relays_default: Vec<String>,
    /// Directory for the file-backed projection cache.
    pub cache_root: Option<PathBuf>,
    /// Deadline for each relay within one fetch, in milliseconds.
    pub per_relay_timeout_ms: u64,
    pub soft_ttl_secs: u64,
    pub hard_ttl_secs: u64,
    /// Backend expiry for cache entries; twice the hard TTL when unset.
    pub store_ttl_secs: Option<u64>,
    pub max_idle_per_relay: usize,
    /// Discard events whose id or signature does not check out.
    pub verify_sig: bool,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let relays_default = csv_strings(env::var("RELAYS_DEFAULT").unwrap_or_default());
        let cache_root = env::var("CACHE_ROOT")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        let per_relay_timeout_ms = number("PER_RELAY_TIMEOUT_MS", 3_000)?;
        let soft_ttl_secs = number("SOFT_TTL_SECS", 60)?;
        let hard_ttl_secs = number("HARD_TTL_SECS", 900)?;
        let store_ttl_secs = match env::var("STORE_TTL_SECS").ok().filter(|s| !s.is_empty()) {
            Some(raw) => Some(raw.trim().parse().context("parsing STORE_TTL_SECS")?),
            None => None,
        };
        let max_idle_per_relay = number("MAX_IDLE_PER_RELAY", 2)?;
        let verify_sig = env::var("VERIFY_SIG").unwrap_or_else(|_| "0".into()) == "1";
        let tor_socks = env::var("TOR_SOCKS").ok().filter(|s| !s.is_empty());
        let settings = Self {
            relays_default,
            cache_root,
            per_relay_timeout_ms,
            soft_ttl_secs,
            hard_ttl_secs,
            store_ttl_secs,
            max_idle_per_relay,
            verify_sig,
            tor_socks,
        };
        settings.ttls()?;
        Ok(settings)
    }

    pub fn per_relay_timeout(&self) -> Duration {
        Duration::from_millis(self.per_relay_timeout_ms)
    }

    /// Cache thresholds; fails unless soft < hard < store.
    pub fn ttls(&self) -> Result<Ttls> {
        let hard = Duration::from_secs(self.hard_ttl_secs);
        let store = self
            .store_ttl_secs
            .map(Duration::from_secs)
            .unwrap_or(hard * 2);
        Ok(Ttls::with_store(Duration::from_secs(self.soft_ttl_secs), hard, store)?)
    }

    pub fn relays(&self) -> Vec<RelayAddress> {
        self.relays_default
            .iter()
            .map(|url| RelayAddress::from(url.as_str()))
            .collect()
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            proxy: self.tor_socks.clone(),
            max_idle_per_relay: self.max_idle_per_relay,
            verify_signatures: self.verify_sig,
        }
    }

    pub fn engine_options(&self) -> Result<EngineOptions> {
        Ok(EngineOptions {
            ttls: self.ttls()?,
            per_relay_timeout: self.per_relay_timeout(),
        })
    }
}

/// Parse an optional numeric variable, falling back to `default` when unset
/// or empty.
fn number<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name).ok().filter(|s| !s.trim().is_empty()) {
        Some(raw) => raw.trim().parse().with_context(|| format!("parsing {name}")),
        None => Ok(default),
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}
