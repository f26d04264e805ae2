use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use uuid::Uuid;

use super::store::{IngestedEventRecord, IngestedEventStore, ProjectionStoreError};

/// In-memory projection store.
///
/// Intended for tests/dev. `latest` sorts on every call.
#[derive(Debug, Default)]
pub struct InMemoryIngestedEventStore {
    records: RwLock<HashMap<Uuid, IngestedEventRecord>>,
}

impl InMemoryIngestedEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, event_id: Uuid) -> Option<IngestedEventRecord> {
        self.records
            .read()
            .ok()
            .and_then(|records| records.get(&event_id).cloned())
    }
}

fn poisoned() -> ProjectionStoreError {
    ProjectionStoreError::Backend("projection lock poisoned".to_string())
}

#[async_trait]
impl IngestedEventStore for InMemoryIngestedEventStore {
    async fn contains(&self, event_id: Uuid) -> Result<bool, ProjectionStoreError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records.contains_key(&event_id))
    }

    async fn insert(&self, record: IngestedEventRecord) -> Result<(), ProjectionStoreError> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        if records.contains_key(&record.event_id) {
            return Err(ProjectionStoreError::DuplicateEventId(record.event_id));
        }
        records.insert(record.event_id, record);
        Ok(())
    }

    async fn latest(&self, limit: i64) -> Result<Vec<IngestedEventRecord>, ProjectionStoreError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        let mut all: Vec<IngestedEventRecord> = records.values().cloned().collect();
        all.sort_by(|a, b| {
            b.occurred_at
                .cmp(&a.occurred_at)
                .then_with(|| b.event_id.cmp(&a.event_id))
        });
        all.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(all)
    }
}
