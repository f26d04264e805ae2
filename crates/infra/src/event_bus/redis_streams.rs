//! Redis Streams transport.
//!
//! - **Publish**: `XADD <stream> * payload <json>` over one reused
//!   connection; the returned entry id is the acknowledgment.
//! - **Subscribe**: a background thread joins a consumer group
//!   (`XGROUP CREATE … 0 MKSTREAM`, so entries written before the group existed
//!   are read too) and forwards each `payload` field as a [`Delivery`].
//! - **Acknowledge**: [`Delivery::ack`] queues the entry id; the reader sends
//!   `XACK` before its next read. An entry that is never acknowledged stays in
//!   the consumer's pending list.
//! - **Restart**: the reader first replays its own pending list (`XREADGROUP`
//!   from id `0`), then switches to new entries (`>`). The consumer name must
//!   therefore be stable across restarts.
//!
//! ```text
//! XADD ──► stream ──► XREADGROUP (pending, then >) ──► Delivery ──► ingest
//!                          ▲                                          │
//!                          └──────────────── XACK ◄── ack() ◄─────────┘
//! ```
//!
//! Delivery is at-least-once end to end, so consumers deduplicate on `eventId`.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use redis::Commands;
use redis::streams::{StreamReadOptions, StreamReadReply};
use tracing::{debug, error, instrument, warn};

use tally_events::{Delivery, EventBus, Subscription};

use crate::config::{DEFAULT_CONSUMER_GROUP, DEFAULT_CONSUMER_NAME, DEFAULT_EVENT_STREAM};

const PAYLOAD_FIELD: &str = "payload";
const DEFAULT_BLOCK_MS: usize = 1_000;
const READ_BATCH: usize = 100;
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),
}

#[derive(Clone)]
pub struct RedisStreamsEventBus {
    client: Arc<redis::Client>,
    stream_key: String,
    group: String,
    consumer: String,
    block_ms: usize,
    /// Shared by every clone; dropped and reopened after a failed command.
    publish_conn: Arc<Mutex<Option<redis::Connection>>>,
}

impl std::fmt::Debug for RedisStreamsEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsEventBus")
            .field("stream_key", &self.stream_key)
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .field("block_ms", &self.block_ms)
            .finish_non_exhaustive()
    }
}

/// `(entry id, payload)`; the payload is `None` when the field is missing.
type StreamEntry = (String, Option<String>);

impl RedisStreamsEventBus {
    /// `stream_key` defaults to [`DEFAULT_EVENT_STREAM`]; the consumer group
    /// and name default to [`DEFAULT_CONSUMER_GROUP`] / [`DEFAULT_CONSUMER_NAME`].
    pub fn new(
        redis_url: impl AsRef<str>,
        stream_key: Option<String>,
    ) -> Result<Self, RedisStreamsError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            stream_key: stream_key.unwrap_or_else(|| DEFAULT_EVENT_STREAM.to_string()),
            group: DEFAULT_CONSUMER_GROUP.to_string(),
            consumer: DEFAULT_CONSUMER_NAME.to_string(),
            block_ms: DEFAULT_BLOCK_MS,
            publish_conn: Arc::new(Mutex::new(None)),
        })
    }

    /// Read as `consumer` inside `group`. One live subscription per consumer
    /// name; two readers sharing a name would replay each other's entries.
    pub fn with_consumer(mut self, group: impl Into<String>, consumer: impl Into<String>) -> Self {
        self.group = group.into();
        self.consumer = consumer.into();
        self
    }

    pub fn with_block_ms(mut self, block_ms: usize) -> Self {
        self.block_ms = block_ms.max(1);
        self
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    pub fn consumer_group(&self) -> &str {
        &self.group
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer
    }

    fn connection(&self) -> Result<redis::Connection, RedisStreamsError> {
        self.client
            .get_connection()
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))
    }

    #[instrument(skip(self, payload), fields(stream_key = %self.stream_key), err)]
    fn append(&self, payload: &str) -> Result<String, RedisStreamsError> {
        let mut slot = self
            .publish_conn
            .lock()
            .map_err(|_| RedisStreamsError::Connection("publish connection poisoned".into()))?;

        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => self.connection()?,
        };

        let id: String = conn
            .xadd(&self.stream_key, "*", &[(PAYLOAD_FIELD, payload)])
            .map_err(|e| RedisStreamsError::Command(format!("XADD failed: {e}")))?;

        // Only a connection that just succeeded goes back into the slot.
        *slot = Some(conn);
        Ok(id)
    }

    /// Create the consumer group (and the stream) if missing.
    fn ensure_group(&self, conn: &mut redis::Connection) -> Result<(), RedisStreamsError> {
        let created: redis::RedisResult<()> =
            conn.xgroup_create_mkstream(&self.stream_key, &self.group, "0");
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(RedisStreamsError::ConsumerGroup(e.to_string())),
        }
    }

    /// `XREADGROUP` after `id`: `"0"`-style ids walk this consumer's pending
    /// list, `">"` waits up to `block_ms` for new entries.
    fn read_group(
        &self,
        conn: &mut redis::Connection,
        id: &str,
    ) -> Result<Vec<StreamEntry>, RedisStreamsError> {
        let mut options = StreamReadOptions::default()
            .group(self.group.as_str(), self.consumer.as_str())
            .count(READ_BATCH);
        if id == ">" {
            options = options.block(self.block_ms);
        }

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.stream_key], &[id], &options)
            .map_err(|e| RedisStreamsError::Command(format!("XREADGROUP failed: {e}")))?;

        let mut entries = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in key.ids {
                let payload = entry.get::<String>(PAYLOAD_FIELD);
                entries.push((entry.id, payload));
            }
        }
        Ok(entries)
    }

    /// `XACK` every id queued by acknowledged deliveries.
    fn flush_acks(
        &self,
        conn: &mut redis::Connection,
        acks: &mpsc::Receiver<String>,
    ) -> Result<(), RedisStreamsError> {
        let ids: Vec<String> = acks.try_iter().collect();
        if ids.is_empty() {
            return Ok(());
        }

        let _: i64 = conn
            .xack(&self.stream_key, &self.group, &ids)
            .map_err(|e| RedisStreamsError::Command(format!("XACK failed: {e}")))?;
        Ok(())
    }

    fn forward(&self, tx: mpsc::Sender<Delivery<String>>) {
        let (ack_tx, ack_rx) = mpsc::channel::<String>();

        loop {
            let mut conn = match self.connection().and_then(|mut conn| {
                self.ensure_group(&mut conn)?;
                Ok(conn)
            }) {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "Redis subscription cannot start; retrying");
                    thread::sleep(RECONNECT_BACKOFF);
                    continue;
                }
            };

            // After (re)connecting, hand out whatever is still unacknowledged
            // before asking for new entries.
            let mut pending_cursor = Some("0".to_string());

            loop {
                if let Err(e) = self.flush_acks(&mut conn, &ack_rx) {
                    error!(error = %e, "failed to acknowledge stream entries");
                    thread::sleep(RECONNECT_BACKOFF);
                    break;
                }

                let read_from = pending_cursor.as_deref().unwrap_or(">");
                let entries = match self.read_group(&mut conn, read_from) {
                    Ok(entries) => entries,
                    Err(e) => {
                        error!(error = %e, "failed to read from stream");
                        thread::sleep(RECONNECT_BACKOFF);
                        break;
                    }
                };

                if pending_cursor.is_some() && entries.is_empty() {
                    debug!(consumer = %self.consumer, "pending entries replayed");
                    pending_cursor = None;
                    continue;
                }

                for (id, payload) in entries {
                    if let Some(cursor) = pending_cursor.as_mut() {
                        cursor.clone_from(&id);
                    }

                    let Some(payload) = payload else {
                        warn!(entry_id = %id, "stream entry without payload field; acknowledging");
                        let _ = ack_tx.send(id);
                        continue;
                    };

                    let acks = ack_tx.clone();
                    let delivery = Delivery::with_ack(payload, move || {
                        let _ = acks.send(id);
                    });
                    if tx.send(delivery).is_err() {
                        let _ = self.flush_acks(&mut conn, &ack_rx);
                        debug!(stream_key = %self.stream_key, "subscriber dropped; stopping reader");
                        return;
                    }
                }
            }
        }
    }
}

impl EventBus<String> for RedisStreamsEventBus {
    type Error = RedisStreamsError;

    fn publish(&self, message: String) -> Result<(), Self::Error> {
        self.append(&message).map(|_| ())
    }

    fn subscribe(&self) -> Subscription<String> {
        let (tx, rx) = mpsc::channel();
        let reader = self.clone();

        if let Err(e) = thread::Builder::new()
            .name(format!("redis-stream-{}", self.consumer))
            .spawn(move || reader.forward(tx))
        {
            // The sender died with the closure; the subscription reports Disconnected.
            error!(error = %e, "failed to spawn Redis stream reader");
        }

        Subscription::new(rx)
    }
}
