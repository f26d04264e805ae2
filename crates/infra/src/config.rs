//! Process configuration read from the environment.
//!
//! Missing values fall back to development defaults with a warning, the same
//! way the relay binary treats every optional knob.

use std::time::Duration;

use tracing::warn;

pub const DATABASE_URL: &str = "TALLY_DATABASE_URL";
pub const REDIS_URL: &str = "TALLY_REDIS_URL";
pub const EVENT_STREAM: &str = "TALLY_EVENT_STREAM";
pub const OUTBOX_BATCH_SIZE: &str = "TALLY_OUTBOX_BATCH_SIZE";
pub const OUTBOX_POLL_MS: &str = "TALLY_OUTBOX_POLL_MS";
pub const DATABASE_MAX_CONNECTIONS: &str = "TALLY_DATABASE_MAX_CONNECTIONS";
pub const CONSUMER_GROUP: &str = "TALLY_CONSUMER_GROUP";
pub const CONSUMER_NAME: &str = "TALLY_CONSUMER_NAME";
pub const OUTBOX_RETENTION_SECS: &str = "TALLY_OUTBOX_RETENTION_SECS";

pub const DEFAULT_EVENT_STREAM: &str = "tally:account-events";
pub const DEFAULT_OUTBOX_BATCH_SIZE: usize = 100;
pub const DEFAULT_OUTBOX_POLL_MS: u64 = 500;
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_CONSUMER_GROUP: &str = "tally-ingestion";
pub const DEFAULT_CONSUMER_NAME: &str = "tally-relay";
pub const DEFAULT_OUTBOX_RETENTION_SECS: u64 = 86_400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// `None` means "run without Postgres"; the relay refuses to start then.
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    /// `None` selects the in-process bus.
    pub redis_url: Option<String>,
    pub event_stream: String,
    /// Redis consumer group shared by every ingesting relay.
    pub consumer_group: String,
    /// Must stay the same across restarts: unacknowledged entries are
    /// replayed to the consumer that last received them.
    pub consumer_name: String,
    pub outbox_batch_size: usize,
    pub outbox_poll_interval: Duration,
    /// How long dispatched outbox rows are kept before pruning.
    pub outbox_retention: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            redis_url: None,
            event_stream: DEFAULT_EVENT_STREAM.to_string(),
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            consumer_name: DEFAULT_CONSUMER_NAME.to_string(),
            outbox_batch_size: DEFAULT_OUTBOX_BATCH_SIZE,
            outbox_poll_interval: Duration::from_millis(DEFAULT_OUTBOX_POLL_MS),
            outbox_retention: Duration::from_secs(DEFAULT_OUTBOX_RETENTION_SECS),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let database_url = text(DATABASE_URL);
        if database_url.is_none() {
            warn!("{DATABASE_URL} not set; Postgres-backed components are unavailable");
        }

        let event_stream = text(EVENT_STREAM).unwrap_or_else(|| DEFAULT_EVENT_STREAM.to_string());

        Self {
            database_url,
            database_max_connections: parsed(
                DATABASE_MAX_CONNECTIONS,
                text(DATABASE_MAX_CONNECTIONS),
                DEFAULT_DATABASE_MAX_CONNECTIONS,
            ),
            redis_url: text(REDIS_URL),
            event_stream,
            consumer_group: text(CONSUMER_GROUP)
                .unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string()),
            consumer_name: text(CONSUMER_NAME).unwrap_or_else(|| DEFAULT_CONSUMER_NAME.to_string()),
            outbox_batch_size: parsed(
                OUTBOX_BATCH_SIZE,
                text(OUTBOX_BATCH_SIZE),
                DEFAULT_OUTBOX_BATCH_SIZE,
            )
            .max(1),
            outbox_poll_interval: Duration::from_millis(parsed(
                OUTBOX_POLL_MS,
                text(OUTBOX_POLL_MS),
                DEFAULT_OUTBOX_POLL_MS,
            )),
            outbox_retention: Duration::from_secs(parsed(
                OUTBOX_RETENTION_SECS,
                text(OUTBOX_RETENTION_SECS),
                DEFAULT_OUTBOX_RETENTION_SECS,
            )),
        }
    }
}

fn parsed<T>(key: &str, raw: Option<String>, default: T) -> T
where
    T: std::str::FromStr + Copy + core::fmt::Display,
{
    match raw {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "unparseable setting; using default {default}");
            default
        }),
    }
}
