//! In-process bus for tests and single-binary deployments.
//!
//! Nothing is persisted: a message published while no subscription exists is
//! acknowledged and gone. Deliveries carry no acknowledgment hook.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, mpsc};

use thiserror::Error;

use crate::bus::{Delivery, EventBus, Subscription};

#[derive(Debug, Error)]
pub enum InMemoryBusError {
    #[error("in-memory bus subscriber list is poisoned")]
    Poisoned,
}

/// Fan-out over std channels.
///
/// Every live subscription receives its own copy. A subscription whose
/// receiver was dropped is forgotten the next time a publish reaches it.
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    outlets: Mutex<Vec<mpsc::Sender<Delivery<M>>>>,
    published: AtomicU64,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live subscriptions as of the last publish.
    pub fn subscriber_count(&self) -> usize {
        self.outlets.lock().map(|outlets| outlets.len()).unwrap_or(0)
    }

    /// Messages accepted since the bus was created.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            outlets: Mutex::new(Vec::new()),
            published: AtomicU64::new(0),
        }
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut outlets = self.outlets.lock().map_err(|_| InMemoryBusError::Poisoned)?;

        let mut live = Vec::with_capacity(outlets.len());
        for outlet in outlets.drain(..) {
            if outlet.send(Delivery::new(message.clone())).is_ok() {
                live.push(outlet);
            }
        }
        *outlets = live;
        self.published.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (outlet, receiver) = mpsc::channel();
        match self.outlets.lock() {
            Ok(mut outlets) => outlets.push(outlet),
            // Still hand out a subscription; it reports Disconnected at once.
            Err(_) => drop(outlet),
        }
        Subscription::new(receiver)
    }
}
