use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tally_accounts::Account;
use tally_core::AccountNumber;
use tally_events::AccountEvent;
use thiserror::Error;
use uuid::Uuid;

/// Storage failures, classified independently of the backing engine.
///
/// | variant | meaning | ledger treatment |
/// |---|---|---|
/// | `UniqueViolation` | account number already taken | retried during create |
/// | `NotFound` | no committed row for the number | reported to the caller |
/// | `Conflict` | stale version on save | internal |
/// | `NotLocked` | save of a row this unit of work does not hold | internal (bug) |
/// | `Serialization` | a stored row or payload could not be decoded | internal |
/// | `Backend` | anything else from the engine | internal |
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("account number {0} is already taken")]
    UniqueViolation(AccountNumber),

    #[error("account {0} not found")]
    NotFound(AccountNumber),

    #[error("account {account_number} was modified concurrently (expected version {expected})")]
    Conflict {
        account_number: AccountNumber,
        expected: u64,
    },

    #[error("account {0} is not locked by this unit of work")]
    NotLocked(AccountNumber),

    #[error("stored data could not be decoded: {0}")]
    Serialization(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// An event staged alongside the mutation that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    /// Staging order; strictly increasing across the whole outbox.
    pub sequence: i64,
    pub event: AccountEvent,
    pub staged_at: DateTime<Utc>,
}

/// Entry point to account storage.
#[async_trait]
pub trait AccountStore: Send + Sync {
    type Unit: UnitOfWork;

    /// Open a unit of work. No locks are taken until first use.
    async fn begin(&self) -> Result<Self::Unit, StoreError>;

    /// Unlocked read of the last committed state.
    async fn lookup(&self, account_number: &AccountNumber) -> Result<Account, StoreError>;
}

/// One all-or-nothing session against account storage.
///
/// Row locks are acquired on first use and released when the unit of work
/// ends, whether by `commit`, `rollback` or drop.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Insert a brand new account.
    ///
    /// Fails [`StoreError::UniqueViolation`] if the number exists, detected by
    /// the insert itself. A failed insert leaves the unit of work usable. A
    /// successful insert holds the new row locked.
    async fn insert_new(&mut self, account: Account) -> Result<(), StoreError>;

    /// Take the exclusive lock on an existing row and return its state.
    ///
    /// Blocks while another unit of work holds the row. Locking a row this
    /// unit of work already holds returns the working copy immediately.
    async fn lock_for_update(
        &mut self,
        account_number: &AccountNumber,
    ) -> Result<Account, StoreError>;

    /// Write back a mutated account held by this unit of work.
    async fn save(&mut self, account: &Account) -> Result<(), StoreError>;

    /// Append an event to the outbox as part of this unit of work.
    async fn stage_event(&mut self, event: &AccountEvent) -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

/// Read side of the transactional outbox.
#[async_trait]
pub trait Outbox: Send + Sync {
    /// Undispatched entries in staging order, at most `limit`.
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError>;

    /// Marking an unknown or already dispatched id is not an error.
    async fn mark_dispatched(&self, event_id: Uuid) -> Result<(), StoreError>;

    /// Delete entries dispatched at or before `cutoff`; returns how many went.
    /// Undispatched entries are never removed.
    async fn prune_dispatched(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
impl<S> AccountStore for Arc<S>
where
    S: AccountStore + ?Sized,
{
    type Unit = S::Unit;

    async fn begin(&self) -> Result<Self::Unit, StoreError> {
        (**self).begin().await
    }

    async fn lookup(&self, account_number: &AccountNumber) -> Result<Account, StoreError> {
        (**self).lookup(account_number).await
    }
}

#[async_trait]
impl<S> Outbox for Arc<S>
where
    S: Outbox + ?Sized,
{
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        (**self).pending(limit).await
    }

    async fn mark_dispatched(&self, event_id: Uuid) -> Result<(), StoreError> {
        (**self).mark_dispatched(event_id).await
    }

    async fn prune_dispatched(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        (**self).prune_dispatched(cutoff).await
    }
}
