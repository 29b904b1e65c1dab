//! Command line interface: one-shot relay queries, cached projection reads
//! and default relay management.

use std::{
    collections::BTreeSet,
    fs,
    io::Write,
    path::Path,
    sync::Arc,
};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use relayview::{
    aggregate,
    cache::{CacheStore, FileStore},
    clock::{Clock, SystemClock},
    config::Settings,
    directory::Nip65Directory,
    event::Event,
    filter::QueryDescriptor,
    relay::{RelayAddress, RelayPool},
    CacheKey, Engine,
};
use tracing_subscriber::EnvFilter;

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "relayview",
    author,
    version,
    about = "Query Nostr relays in parallel with a stale-while-revalidate cache"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Query the default relays once, bypassing the cache.
    Fetch {
        /// Raw NIP-01 filter object; the other flags add to it.
        #[arg(long)]
        filter: Option<String>,
        #[arg(long = "kind")]
        kinds: Vec<u32>,
        #[arg(long = "author")]
        authors: Vec<String>,
        #[arg(long)]
        since: Option<u64>,
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Read a subject's projection through the cache.
    Get {
        /// Author public key, optionally followed by `:<d-tag>`.
        subject: String,
        #[arg(long, default_value = "notes")]
        view: String,
        /// Kinds to query; derived from the view when omitted.
        #[arg(long = "kind")]
        kinds: Vec<u32>,
    },
    /// Manage the default relay list.
    Relays {
        #[command(subcommand)]
        action: RelayAction,
    },
    /// Maintain the file cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

/// Operations available under `relayview relays`.
#[derive(Subcommand)]
enum RelayAction {
    /// Add a relay after verifying connectivity.
    Add { url: String },
    /// Remove a relay from the configuration.
    Remove { url: String },
}

/// Operations available under `relayview cache`.
#[derive(Subcommand)]
enum CacheAction {
    /// Delete expired and unreadable cache files.
    Purge,
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    match cli.command {
        Commands::Fetch {
            filter,
            kinds,
            authors,
            since,
            limit,
        } => {
            let base = match filter {
                Some(raw) => {
                    let val: serde_json::Value = serde_json::from_str(&raw).context("parsing --filter")?;
                    if !val.is_object() {
                        bail!("--filter must be a JSON object");
                    }
                    QueryDescriptor::from_filter(&val)
                }
                None => QueryDescriptor::new(),
            };
            let mut query = base.kinds(kinds).authors(authors);
            if let Some(since) = since {
                query = query.since(since);
            }
            if let Some(limit) = limit {
                query = query.limit(limit);
            }
            fetch(&cfg, &query).await?;
        }
        Commands::Get {
            subject,
            view,
            kinds,
        } => get(&cfg, CacheKey::new(subject, view), kinds).await?,
        Commands::Relays { action } => match action {
            RelayAction::Add { url } => add_relay(&cli.env, &cfg, url).await?,
            RelayAction::Remove { url } => remove_relay(&cli.env, &cfg, url)?,
        },
        Commands::Cache {
            action: CacheAction::Purge,
        } => {
            let store = file_store(&cfg, Arc::new(SystemClock))?;
            let removed = store.purge_expired()?;
            eprintln!("removed {removed} expired cache files");
        }
    }
    Ok(())
}

async fn fetch(cfg: &Settings, query: &QueryDescriptor) -> anyhow::Result<()> {
    let relays: BTreeSet<RelayAddress> = cfg.relays().into_iter().collect();
    let pool = RelayPool::new(cfg.pool_options());
    let merged = aggregate::merge(pool.fetch(&relays, query, cfg.per_relay_timeout()).await);
    for (relay, summary) in &merged.relays {
        eprintln!("{relay} {}", serde_json::to_string(summary)?);
    }
    print_events(&merged.events)
}

async fn get(cfg: &Settings, key: CacheKey, kinds: Vec<u32>) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn CacheStore> = Arc::new(file_store(cfg, clock.clone())?);
    let pool = RelayPool::new(cfg.pool_options());
    let defaults = cfg.relays().into_iter().collect();
    let directory = Arc::new(Nip65Directory::new(pool.clone(), defaults, cfg.per_relay_timeout()));
    let engine = Engine::new(pool, cfg.engine_options()?, directory, store, clock);

    let projection = engine
        .get_or_refresh(&key, |key| view_query(key, kinds))
        .await;
    // Let a scheduled background refresh land in the cache before exiting.
    engine.drain().await;
    if !projection.is_available() {
        eprintln!("no data available");
        return Ok(());
    }
    eprintln!("source: {}", serde_json::to_string(&projection.source)?);
    print_events(&projection.events)
}

/// Relay query for a cache key: the subject's author, the view's kinds and,
/// for `pubkey:slug` subjects, the `d` tag.
fn view_query(key: &CacheKey, kinds: Vec<u32>) -> QueryDescriptor {
    let (author, slug) = match key.subject.split_once(':') {
        Some((author, slug)) => (author, Some(slug)),
        None => (key.subject.as_str(), None),
    };
    let kinds = if kinds.is_empty() {
        view_kinds(&key.view)
    } else {
        kinds
    };
    let mut query = QueryDescriptor::new().author(author).kinds(kinds);
    if let Some(slug) = slug.filter(|s| !s.is_empty()) {
        query = query.tag("d", slug);
    }
    query
}

fn view_kinds(view: &str) -> Vec<u32> {
    match view {
        "profile" => vec![0],
        "notes" => vec![1],
        "highlights" => vec![9802],
        "articles" => vec![30023],
        _ => vec![],
    }
}

fn print_events(events: &[Event]) -> anyhow::Result<()> {
    let mut out = std::io::stdout().lock();
    for ev in events {
        writeln!(out, "{}", serde_json::to_string(ev)?)?;
    }
    Ok(())
}

fn file_store(cfg: &Settings, clock: Arc<dyn Clock>) -> anyhow::Result<FileStore> {
    let root = cfg.cache_root.clone().context("CACHE_ROOT is not set")?;
    let store = FileStore::new(root, clock);
    store
        .init()
        .with_context(|| format!("creating {}", store.root().display()))?;
    Ok(store)
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let cache_root = base_dir.join("relayview-cache");
    let mut content = String::new();
    content.push_str("RELAYS_DEFAULT=\n");
    content.push_str(&format!("CACHE_ROOT={}\n", display_path(&cache_root)));
    content.push_str("PER_RELAY_TIMEOUT_MS=3000\n");
    content.push_str("SOFT_TTL_SECS=60\n");
    content.push_str("HARD_TTL_SECS=900\n");
    content.push_str("STORE_TTL_SECS=\n");
    content.push_str("MAX_IDLE_PER_RELAY=2\n");
    content.push_str("VERIFY_SIG=0\n");
    content.push_str("TOR_SOCKS=\n");
    fs::write(env_path, content)?;
    Ok(())
}

fn display_path(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

async fn add_relay(env_path: &str, cfg: &Settings, url: String) -> anyhow::Result<()> {
    if cfg.relays_default.iter().any(|existing| existing == &url) {
        bail!("relay already configured: {url}");
    }
    RelayPool::new(cfg.pool_options())
        .ping(&RelayAddress::from(url.as_str()), cfg.per_relay_timeout())
        .await
        .with_context(|| format!("connecting to {url}"))?;
    let mut relays = cfg.relays_default.clone();
    relays.push(url);
    write_relays_to_env(env_path, &relays)?;
    Ok(())
}

fn remove_relay(env_path: &str, cfg: &Settings, url: String) -> anyhow::Result<()> {
    let mut relays = cfg.relays_default.clone();
    let before = relays.len();
    relays.retain(|existing| existing != &url);
    if relays.len() == before {
        bail!("relay not configured: {url}");
    }
    write_relays_to_env(env_path, &relays)?;
    Ok(())
}

fn write_relays_to_env(env_path: &str, relays: &[String]) -> anyhow::Result<()> {
    let content = fs::read_to_string(env_path)?;
    let relays_joined = relays.join(",");
    let mut new_content = String::new();
    let mut replaced = false;
    for line in content.lines() {
        if line.starts_with("RELAYS_DEFAULT=") {
            new_content.push_str(&format!("RELAYS_DEFAULT={relays_joined}\n"));
            replaced = true;
        } else {
            new_content.push_str(line);
            new_content.push('\n');
        }
    }
    if !replaced {
        new_content.push_str(&format!("RELAYS_DEFAULT={relays_joined}\n"));
    }
    fs::write(env_path, new_content)?;
    std::env::set_var("RELAYS_DEFAULT", relays_joined);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run(cli).await
}
