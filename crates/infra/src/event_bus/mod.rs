//! Outbound event delivery.
//!
//! The bus abstraction lives in `tally-events` as pure mechanics. This module
//! adds the publisher that turns [`tally_events::AccountEvent`]s into wire
//! messages, and the infrastructure-backed transports.

pub mod publisher;
#[cfg(feature = "redis")]
pub mod redis_streams;

pub use publisher::{EventPublisher, PublishError};
#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsError, RedisStreamsEventBus};
