use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tally_core::{AccountNumber, MoneyAmount};
use tally_events::{AccountEvent, AccountEventType, Event};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProjectionStoreError {
    /// Another writer stored the same event first.
    #[error("event {0} already ingested")]
    DuplicateEventId(Uuid),

    #[error("stored projection row could not be decoded: {0}")]
    Decode(String),

    #[error("projection backend error: {0}")]
    Backend(String),
}

/// Deduplicated copy of one [`AccountEvent`] plus the exact text it arrived as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestedEventRecord {
    pub event_id: Uuid,
    pub event_type: AccountEventType,
    pub occurred_at: DateTime<Utc>,
    pub account_number: Option<AccountNumber>,
    pub from_account_number: Option<AccountNumber>,
    pub to_account_number: Option<AccountNumber>,
    pub amount: Option<MoneyAmount>,
    pub balance: Option<MoneyAmount>,
    pub raw_json: String,
    pub ingested_at: DateTime<Utc>,
}

impl IngestedEventRecord {
    pub fn from_event(event: &AccountEvent, raw_json: &str) -> Self {
        Self {
            event_id: event.event_id(),
            event_type: event.kind(),
            occurred_at: event.occurred_at(),
            account_number: event.account_number().cloned(),
            from_account_number: event.from_account_number().cloned(),
            to_account_number: event.to_account_number().cloned(),
            amount: event.amount(),
            balance: event.balance(),
            raw_json: raw_json.to_string(),
            ingested_at: Utc::now(),
        }
    }
}

/// Storage for the ingested event projection, unique on `event_id`.
#[async_trait]
pub trait IngestedEventStore: Send + Sync {
    async fn contains(&self, event_id: Uuid) -> Result<bool, ProjectionStoreError>;

    /// Fails [`ProjectionStoreError::DuplicateEventId`] if the id is taken.
    async fn insert(&self, record: IngestedEventRecord) -> Result<(), ProjectionStoreError>;

    /// Newest first by `occurred_at`, at most `limit` rows.
    async fn latest(&self, limit: i64) -> Result<Vec<IngestedEventRecord>, ProjectionStoreError>;
}

#[async_trait]
impl<S> IngestedEventStore for Arc<S>
where
    S: IngestedEventStore + ?Sized,
{
    async fn contains(&self, event_id: Uuid) -> Result<bool, ProjectionStoreError> {
        (**self).contains(event_id).await
    }

    async fn insert(&self, record: IngestedEventRecord) -> Result<(), ProjectionStoreError> {
        (**self).insert(record).await
    }

    async fn latest(&self, limit: i64) -> Result<Vec<IngestedEventRecord>, ProjectionStoreError> {
        (**self).latest(limit).await
    }
}
