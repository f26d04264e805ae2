//! Ledger facts and the transport they travel on.

pub mod account_event;
pub mod bus;
pub mod event;
pub mod in_memory_bus;

pub use account_event::{AccountEvent, AccountEventType, DecodeError};
pub use bus::{Delivery, EventBus, Subscription};
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
