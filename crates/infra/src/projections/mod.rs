//! Downstream read model fed by the event transport.
//!
//! The projection keeps one row per distinct `eventId`. Ingestion is
//! idempotent, so replays, outbox re-sends and out-of-order delivery all
//! converge to the same set of rows.

pub mod account_events;
pub mod in_memory;
pub mod postgres;
pub mod store;

pub use account_events::{
    DEFAULT_RECENT_LIMIT, EventIngestor, IngestError, IngestOutcome, MAX_RECENT_LIMIT,
    clamp_recent_limit,
};
pub use in_memory::InMemoryIngestedEventStore;
pub use postgres::PostgresIngestedEventStore;
pub use store::{IngestedEventRecord, IngestedEventStore, ProjectionStoreError};
