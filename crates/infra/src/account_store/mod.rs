//! Account persistence boundary.
//!
//! Ledger operations never touch rows directly: they open a [`UnitOfWork`],
//! lock what they need, and either commit or let the unit of work drop.
//! Dropping without commit rolls back and releases every row lock.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{InMemoryAccountStore, InMemoryUnitOfWork};
pub use postgres::{PostgresAccountStore, PostgresUnitOfWork};
pub use r#trait::{AccountStore, Outbox, OutboxEntry, StoreError, UnitOfWork};
