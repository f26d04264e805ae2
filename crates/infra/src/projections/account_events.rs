//! Idempotent ingestion of account events into the projection.
//!
//! ```text
//! raw JSON
//!   ↓ decode (shape + 2-decimal amounts)    → MalformedPayload
//!   ↓ eventId already stored?              → Duplicate (no-op)
//!   ↓ insert
//!       unique violation on eventId (race) → Duplicate
//!       other failure                      → Store error
//!   ↓
//! Stored
//! ```

use tally_events::{AccountEvent, DecodeError, Event};
use thiserror::Error;
use tracing::{debug, info};

use super::store::{IngestedEventRecord, IngestedEventStore, ProjectionStoreError};

pub const DEFAULT_RECENT_LIMIT: i64 = 50;
pub const MAX_RECENT_LIMIT: i64 = 200;

/// `None` → 50; anything else is clamped into `1..=200`.
pub fn clamp_recent_limit(limit: Option<i64>) -> i64 {
    limit
        .unwrap_or(DEFAULT_RECENT_LIMIT)
        .clamp(1, MAX_RECENT_LIMIT)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored,
    Duplicate,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed account event: {0}")]
    MalformedPayload(#[from] DecodeError),

    #[error(transparent)]
    Store(#[from] ProjectionStoreError),
}

/// Consumer-side handler: turns raw transport messages into projection rows.
#[derive(Debug, Clone)]
pub struct EventIngestor<S> {
    store: S,
}

impl<S> EventIngestor<S>
where
    S: IngestedEventStore,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn ingest(&self, raw: &str) -> Result<IngestOutcome, IngestError> {
        let event = AccountEvent::decode(raw)?;
        let event_id = event.event_id();

        if self.store.contains(event_id).await? {
            debug!(%event_id, "duplicate account event ignored");
            return Ok(IngestOutcome::Duplicate);
        }

        match self
            .store
            .insert(IngestedEventRecord::from_event(&event, raw))
            .await
        {
            Ok(()) => {
                info!(
                    %event_id,
                    event_type = event.event_type(),
                    "stored account event"
                );
                Ok(IngestOutcome::Stored)
            }
            Err(ProjectionStoreError::DuplicateEventId(_)) => {
                debug!(%event_id, "account event stored concurrently; treating as duplicate");
                Ok(IngestOutcome::Duplicate)
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Most recent ingested events, newest first.
    pub async fn recent(
        &self,
        limit: Option<i64>,
    ) -> Result<Vec<IngestedEventRecord>, ProjectionStoreError> {
        self.store.latest(clamp_recent_limit(limit)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use tally_core::{AccountNumber, MoneyAmount};
    use uuid::Uuid;

    use crate::projections::InMemoryIngestedEventStore;

    fn number(text: &str) -> AccountNumber {
        AccountNumber::parse(text).unwrap()
    }

    fn deposit_json() -> (AccountEvent, String) {
        let event = AccountEvent::deposited(
            number("0000000001"),
            MoneyAmount::from_minor(500),
            MoneyAmount::from_minor(500),
        );
        let raw = event.encode().unwrap();
        (event, raw)
    }

    #[test]
    fn recent_limit_policy() {
        assert_eq!(clamp_recent_limit(None), 50);
        assert_eq!(clamp_recent_limit(Some(0)), 1);
        assert_eq!(clamp_recent_limit(Some(-10)), 1);
        assert_eq!(clamp_recent_limit(Some(75)), 75);
        assert_eq!(clamp_recent_limit(Some(10_000)), 200);
    }

    #[tokio::test]
    async fn same_event_twice_is_stored_once() {
        let ingestor = EventIngestor::new(InMemoryIngestedEventStore::new());
        let (event, raw) = deposit_json();

        assert_eq!(ingestor.ingest(&raw).await.unwrap(), IngestOutcome::Stored);
        assert_eq!(ingestor.ingest(&raw).await.unwrap(), IngestOutcome::Duplicate);

        assert_eq!(ingestor.store().len(), 1);
        let stored = ingestor.store().get(event.event_id()).unwrap();
        assert_eq!(stored.raw_json, raw);
        assert_eq!(stored.amount, Some(MoneyAmount::from_minor(500)));
    }

    #[tokio::test]
    async fn malformed_payloads_are_rejected() {
        let ingestor = EventIngestor::new(InMemoryIngestedEventStore::new());
        for raw in ["", "{}", "[1,2]", r#"{"eventId":"nope"}"#] {
            assert!(
                matches!(ingestor.ingest(raw).await, Err(IngestError::MalformedPayload(_))),
                "payload {raw:?}"
            );
        }
        assert!(ingestor.store().is_empty());
    }

    /// Reports "absent" on lookup, then loses the insert race.
    struct RacingStore {
        inner: InMemoryIngestedEventStore,
        raced: AtomicBool,
    }

    #[async_trait]
    impl IngestedEventStore for RacingStore {
        async fn contains(&self, _event_id: Uuid) -> Result<bool, ProjectionStoreError> {
            Ok(false)
        }

        async fn insert(&self, record: IngestedEventRecord) -> Result<(), ProjectionStoreError> {
            if !self.raced.swap(true, Ordering::SeqCst) {
                self.inner.insert(record.clone()).await?;
            }
            self.inner.insert(record).await
        }

        async fn latest(&self, limit: i64) -> Result<Vec<IngestedEventRecord>, ProjectionStoreError> {
            self.inner.latest(limit).await
        }
    }

    #[tokio::test]
    async fn losing_the_insert_race_is_a_duplicate() {
        let store = Arc::new(RacingStore {
            inner: InMemoryIngestedEventStore::new(),
            raced: AtomicBool::new(false),
        });
        let ingestor = EventIngestor::new(Arc::clone(&store));
        let (_, raw) = deposit_json();

        assert_eq!(ingestor.ingest(&raw).await.unwrap(), IngestOutcome::Duplicate);
        assert_eq!(store.inner.len(), 1);
    }

    #[tokio::test]
    async fn recent_is_newest_first_and_clamped() {
        let store = InMemoryIngestedEventStore::new();
        let base = Utc::now();
        for offset in 0..5 {
            let (event, raw) = deposit_json();
            let mut record = IngestedEventRecord::from_event(&event, &raw);
            record.occurred_at = base + Duration::seconds(offset);
            store.insert(record).await.unwrap();
        }
        let ingestor = EventIngestor::new(store);

        let recent = ingestor.recent(Some(3)).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert!(recent.windows(2).all(|w| w[0].occurred_at >= w[1].occurred_at));
        assert_eq!(recent[0].occurred_at, base + Duration::seconds(4));

        assert_eq!(ingestor.recent(Some(0)).await.unwrap().len(), 1);
        assert_eq!(ingestor.recent(None).await.unwrap().len(), 5);
    }
}
