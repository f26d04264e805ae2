//! Metadata every ledger fact exposes to storage and transport code.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Read-only view over a recorded fact.
///
/// The outbox and the projection key everything on [`Event::event_id`]: two
/// messages with the same id are the same fact, however many times they were
/// delivered.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    fn event_id(&self) -> Uuid;

    /// Wire name, e.g. `"DEPOSITED"`.
    fn event_type(&self) -> &'static str;

    /// Payload layout revision; bump when fields change meaning.
    fn version(&self) -> u32;

    /// Commit-time timestamp assigned by the producer.
    fn occurred_at(&self) -> DateTime<Utc>;
}
