//! Outbound/inbound transport abstraction for serialized ledger facts.
//!
//! The bus only moves messages. It does not store them and it does not
//! promise exactly-once delivery:
//!
//! - a message may arrive more than once (the outbox re-sends anything it
//!   cannot prove was acknowledged)
//! - messages from different producers may interleave in any order
//!
//! Consumers therefore deduplicate on `eventId` and never rely on ordering,
//! and acknowledge a [`Delivery`] only once its effect is durable.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::Duration;

/// One message taken off a [`Subscription`].
///
/// Transports that track consumption (Redis consumer groups) attach an
/// acknowledgment. Until [`Delivery::ack`] runs the transport still counts
/// the message as pending and hands it out again after a restart. Buses
/// without that bookkeeping deliver with a no-op acknowledgment.
pub struct Delivery<M> {
    message: M,
    ack: Option<Box<dyn FnOnce() + Send>>,
}

impl<M> Delivery<M> {
    /// A delivery with nothing to acknowledge.
    pub fn new(message: M) -> Self {
        Self { message, ack: None }
    }

    pub fn with_ack(message: M, ack: impl FnOnce() + Send + 'static) -> Self {
        Self {
            message,
            ack: Some(Box::new(ack)),
        }
    }

    pub fn message(&self) -> &M {
        &self.message
    }

    /// Confirm the message was handled and take it back.
    pub fn ack(mut self) -> M {
        if let Some(ack) = self.ack.take() {
            ack();
        }
        self.message
    }

    /// Take the message without acknowledging it.
    pub fn into_message(self) -> M {
        self.message
    }
}

impl<M: core::fmt::Debug> core::fmt::Debug for Delivery<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("tracked", &self.ack.is_some())
            .finish()
    }
}

/// A receiving end of the bus.
///
/// Every subscription sees every message published after it was created.
/// Consume it from a single thread; the worker loop polls with
/// [`Subscription::recv_timeout`] so it can notice shutdown requests:
///
/// ```ignore
/// loop {
///     match subscription.recv_timeout(Duration::from_millis(250)) {
///         Ok(delivery) => {
///             handle(delivery.message());
///             delivery.ack();
///         }
///         Err(RecvTimeoutError::Timeout) => continue,
///         Err(RecvTimeoutError::Disconnected) => break,
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<Delivery<M>>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<Delivery<M>>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<Delivery<M>, RecvError> {
        self.receiver.recv()
    }

    pub fn try_recv(&self) -> Result<Delivery<M>, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Delivery<M>, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Publish/subscribe transport.
///
/// `publish` returning `Ok` is the transport acknowledgment: after that the
/// producer considers the message handed off. An `Err` means the message may
/// or may not have gone out and the producer is free to send it again.
pub trait EventBus<M>: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
