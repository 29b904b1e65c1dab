//! Query many Nostr relays at once and keep the merged results in a
//! stale-while-revalidate cache.

pub mod aggregate;
pub mod cache;
pub mod clock;
pub mod config;
pub mod directory;
pub mod engine;
pub mod event;
pub mod filter;
pub mod message;
pub mod notify;
pub mod refresh;
pub mod relay;

#[cfg(test)]
mod testutil;

pub use cache::{CacheKey, Projection, Source};
pub use engine::{Engine, EngineOptions};
pub use event::Event;
pub use filter::QueryDescriptor;
