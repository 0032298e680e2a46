use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use log::warn;

/// Which authoritative backend the session talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// SQLite via sqlx, shared by every session pointed at the same database.
    Sqlite,
    /// Process-local store, for a single device with no server.
    Memory,
}

#[derive(Debug, Clone)]
pub struct VoteConfig {
    pub backend: BackendKind,
    pub database_url: String,
    pub revote_window: Duration,
    pub window_tick: Duration,
    /// `None` keeps the vote cache in memory only.
    pub cache_path: Option<PathBuf>,
    pub admin_ids: HashSet<String>,
    pub feed_capacity: usize,
    /// How often a file database is checked for commits from other connections.
    pub feed_poll: Duration,
    pub seed_demo: bool,
}

const DEFAULT_DATABASE_URL: &str = "sqlite:pollstream.db";
const DEFAULT_REVOTE_WINDOW_SECS: u64 = 60;
const DEFAULT_WINDOW_TICK_MS: u64 = 1000;
const DEFAULT_CACHE_PATH: &str = "pollstream_user_votes.json";
const DEFAULT_FEED_CAPACITY: usize = 256;
const DEFAULT_FEED_POLL_MS: u64 = 1000;

impl Default for VoteConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Sqlite,
            database_url: DEFAULT_DATABASE_URL.to_string(),
            revote_window: Duration::from_secs(DEFAULT_REVOTE_WINDOW_SECS),
            window_tick: Duration::from_millis(DEFAULT_WINDOW_TICK_MS),
            cache_path: Some(PathBuf::from(DEFAULT_CACHE_PATH)),
            admin_ids: HashSet::new(),
            feed_capacity: DEFAULT_FEED_CAPACITY,
            feed_poll: Duration::from_millis(DEFAULT_FEED_POLL_MS),
            seed_demo: true,
        }
    }
}

impl VoteConfig {
    /// Read configuration from the environment. Call `dotenvy::dotenv()` first
    /// if a `.env` file should be honoured.
    pub fn from_env() -> Self {
        let backend = match env::var("POLLSTREAM_BACKEND").as_deref() {
            Ok("memory") => BackendKind::Memory,
            Ok("sqlite") | Err(_) => BackendKind::Sqlite,
            Ok(other) => {
                warn!("Unknown POLLSTREAM_BACKEND '{}', using sqlite", other);
                BackendKind::Sqlite
            }
        };

        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

        let cache_path = match env::var("POLLSTREAM_VOTE_CACHE") {
            Ok(path) if path.is_empty() => None,
            Ok(path) => Some(PathBuf::from(path)),
            Err(_) => Some(PathBuf::from(DEFAULT_CACHE_PATH)),
        };

        let admin_ids = env::var("POLLSTREAM_ADMIN_IDS")
            .map(|raw| parse_id_list(&raw))
            .unwrap_or_default();

        Self {
            backend,
            database_url,
            revote_window: Duration::from_secs(read_number(
                "POLLSTREAM_REVOTE_WINDOW_SECS",
                DEFAULT_REVOTE_WINDOW_SECS,
            )),
            window_tick: Duration::from_millis(
                read_number("POLLSTREAM_WINDOW_TICK_MS", DEFAULT_WINDOW_TICK_MS).max(1),
            ),
            cache_path,
            admin_ids,
            feed_capacity: read_number("POLLSTREAM_FEED_CAPACITY", DEFAULT_FEED_CAPACITY as u64)
                .max(1) as usize,
            feed_poll: Duration::from_millis(
                read_number("POLLSTREAM_FEED_POLL_MS", DEFAULT_FEED_POLL_MS).max(1),
            ),
            seed_demo: env::var("POLLSTREAM_SEED_DEMO")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
        }
    }
}

fn read_number(key: &str, default: u64) -> u64 {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Invalid value '{}' for {}, using {}", raw, key, default);
            default
        }),
        Err(_) => default,
    }
}

fn parse_id_list(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}
