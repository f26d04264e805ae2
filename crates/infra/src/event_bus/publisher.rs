//! Serialize ledger facts and hand them to the transport.

use tally_events::{AccountEvent, Event, EventBus};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("transport rejected event: {0}")]
    Transport(String),
}

/// Publishes [`AccountEvent`]s as JSON strings over any `EventBus<String>`.
#[derive(Debug, Clone)]
pub struct EventPublisher<B> {
    bus: B,
}

impl<B> EventPublisher<B>
where
    B: EventBus<String>,
{
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// `Ok` means the transport acknowledged the message.
    pub fn publish(&self, event: &AccountEvent) -> Result<(), PublishError> {
        let payload = event.encode()?;
        self.bus
            .publish(payload)
            .map_err(|err| PublishError::Transport(err.to_string()))?;
        debug!(
            event_id = %event.event_id(),
            event_type = event.event_type(),
            "account event published"
        );
        Ok(())
    }

    /// Publish, logging instead of returning any failure.
    ///
    /// Returns whether the event went out.
    pub fn safe_publish(&self, event: &AccountEvent) -> bool {
        match self.publish(event) {
            Ok(()) => true,
            Err(error) => {
                warn!(
                    event_id = %event.event_id(),
                    event_type = event.event_type(),
                    %error,
                    "failed to publish account event"
                );
                false
            }
        }
    }
}
