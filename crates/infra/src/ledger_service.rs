//! Ledger mutation protocol.
//!
//! Every operation runs as one unit of work against the [`AccountStore`]:
//!
//! ```text
//! inputs
//!   ↓
//! 1. Normalize amounts / account numbers (no storage touched on failure)
//!   ↓
//! 2. Lock the rows involved (two rows: smaller account number first)
//!   ↓
//! 3. Apply the entity rule (deposit / withdraw)
//!   ↓
//! 4. Save + stage the event in the outbox, commit
//!   ↓
//! 5. Best-effort publish; mark the outbox entry dispatched on success
//! ```
//!
//! A failure in steps 1-4 drops the unit of work, which rolls back and
//! releases every lock. A failure in step 5 is logged and left to the
//! [`crate::outbox::OutboxDispatcher`]; it never reaches the caller.
//!
//! ## Deadlock avoidance
//!
//! Transfers lock the lexicographically smaller account number first, so two
//! opposite transfers (`A→B`, `B→A`) always contend on the same first row.
//!
//! ## Identifier collisions
//!
//! `create` draws candidates from an [`AccountNumberAllocator`] and relies on the
//! store rejecting duplicates at insert time. A collision is retried with a
//! fresh candidate up to `max_attempts` times inside the same unit of work.

use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use tally_accounts::{Account, AccountNumberAllocator};
use tally_core::{AccountNumber, DomainError, MoneyAmount, MoneyError};
use tally_events::{AccountEvent, Event, EventBus};

use crate::account_store::{AccountStore, Outbox, StoreError, UnitOfWork};
use crate::event_bus::EventPublisher;

/// Candidate account numbers tried by `create` before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Coarse classification for callers that translate errors (e.g. to HTTP).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    InsufficientFunds,
    Internal,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("invalid amount: {0}")]
    InvalidAmount(#[from] MoneyError),

    #[error("{field} must not be blank")]
    BlankField { field: &'static str },

    #[error("source and destination accounts must differ")]
    SameAccount,

    #[error("account {0} not found")]
    NotFound(AccountNumber),

    #[error(
        "insufficient funds in account {account_number}: balance {current_balance}, attempted {attempted_amount}"
    )]
    InsufficientFunds {
        account_number: AccountNumber,
        current_balance: MoneyAmount,
        attempted_amount: MoneyAmount,
    },

    #[error("could not allocate a free account number after {attempts} attempts")]
    AllocationExhausted { attempts: u32 },

    #[error("storage failure: {0}")]
    Storage(StoreError),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::InvalidAmount(_)
            | LedgerError::BlankField { .. }
            | LedgerError::SameAccount => ErrorKind::InvalidInput,
            LedgerError::NotFound(_) => ErrorKind::NotFound,
            LedgerError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            LedgerError::AllocationExhausted { .. } | LedgerError::Storage(_) => {
                ErrorKind::Internal
            }
        }
    }
}

impl From<StoreError> for LedgerError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(number) => LedgerError::NotFound(number),
            other => LedgerError::Storage(other),
        }
    }
}

impl From<DomainError> for LedgerError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Blank { field } => LedgerError::BlankField { field },
            DomainError::InvalidAmount(err) => LedgerError::InvalidAmount(err),
            DomainError::InsufficientFunds {
                account_number,
                current_balance,
                attempted_amount,
            } => LedgerError::InsufficientFunds {
                account_number,
                current_balance,
                attempted_amount,
            },
        }
    }
}

/// An account number with its balance as of the operation that returned it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountBalance {
    pub account_number: AccountNumber,
    pub balance: MoneyAmount,
}

impl From<&Account> for AccountBalance {
    fn from(account: &Account) -> Self {
        Self {
            account_number: account.account_number().clone(),
            balance: account.balance(),
        }
    }
}

/// Post-transfer balances of both legs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub from: AccountBalance,
    pub to: AccountBalance,
}

/// The order two account rows must be locked in.
///
/// Depends only on the unordered pair: `lock_order(a, b) == lock_order(b, a)`.
pub fn lock_order<'a>(
    a: &'a AccountNumber,
    b: &'a AccountNumber,
) -> (&'a AccountNumber, &'a AccountNumber) {
    if a <= b { (a, b) } else { (b, a) }
}

fn account_number_input(value: &str) -> Result<AccountNumber, LedgerError> {
    AccountNumber::parse(value).map_err(LedgerError::from)
}

fn name_input(field: &'static str, value: &str) -> Result<String, LedgerError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(LedgerError::BlankField { field });
    }
    Ok(trimmed.to_string())
}

/// Ledger application service.
///
/// - `S`: account storage plus its outbox
/// - `A`: account number source
/// - `B`: outbound transport for serialized events
pub struct LedgerService<S, A, B> {
    store: S,
    allocator: A,
    publisher: EventPublisher<B>,
    max_attempts: u32,
}

impl<S, A, B> LedgerService<S, A, B>
where
    S: AccountStore + Outbox,
    A: AccountNumberAllocator,
    B: EventBus<String>,
{
    pub fn new(store: S, allocator: A, publisher: EventPublisher<B>) -> Self {
        Self {
            store,
            allocator,
            publisher,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Override the collision retry budget (minimum 1).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn publisher(&self) -> &EventPublisher<B> {
        &self.publisher
    }

    /// Open a new account.
    ///
    /// `initial_deposit` may be zero; absent means zero.
    #[instrument(skip(self, first_name, last_name))]
    pub async fn create(
        &self,
        first_name: &str,
        last_name: &str,
        initial_deposit: Option<Decimal>,
    ) -> Result<AccountBalance, LedgerError> {
        let initial = match initial_deposit {
            Some(raw) => MoneyAmount::normalize(Some(raw), true)?,
            None => MoneyAmount::zero(),
        };
        let first_name = name_input("firstName", first_name)?;
        let last_name = name_input("lastName", last_name)?;

        let mut uow = self.store.begin().await?;

        for attempt in 1..=self.max_attempts {
            let candidate = self.allocator.next();
            let account = Account::new(candidate.clone(), &first_name, &last_name, initial)?;
            let created = AccountBalance::from(&account);

            match uow.insert_new(account).await {
                Ok(()) => {}
                Err(StoreError::UniqueViolation(_)) => {
                    debug!(attempt, account_number = %candidate, "account number collision; retrying");
                    continue;
                }
                Err(other) => return Err(other.into()),
            }

            let event = AccountEvent::created(created.account_number.clone(), created.balance);
            uow.stage_event(&event).await?;
            uow.commit().await?;

            info!(
                account_number = %created.account_number,
                balance = %created.balance,
                attempt,
                "account created"
            );
            self.dispatch(&event).await;
            return Ok(created);
        }

        Err(LedgerError::AllocationExhausted {
            attempts: self.max_attempts,
        })
    }

    /// Add `amount` (strictly positive) to an account and return its new balance.
    #[instrument(skip(self))]
    pub async fn deposit(
        &self,
        account_number: &str,
        amount: Decimal,
    ) -> Result<AccountBalance, LedgerError> {
        let account_number = account_number_input(account_number)?;
        let amount = MoneyAmount::normalize(Some(amount), false)?;

        let mut uow = self.store.begin().await?;
        let mut account = uow.lock_for_update(&account_number).await?;
        let balance = account.deposit(amount)?;
        uow.save(&account).await?;

        let event = AccountEvent::deposited(account_number.clone(), amount, balance);
        uow.stage_event(&event).await?;
        uow.commit().await?;

        info!(account_number = %account_number, %amount, %balance, "deposit committed");
        self.dispatch(&event).await;
        Ok(AccountBalance::from(&account))
    }

    /// Move `amount` from one account to another atomically.
    #[instrument(skip(self))]
    pub async fn transfer(
        &self,
        from: &str,
        to: &str,
        amount: Decimal,
    ) -> Result<TransferOutcome, LedgerError> {
        let from = account_number_input(from)?;
        let to = account_number_input(to)?;
        if from == to {
            return Err(LedgerError::SameAccount);
        }
        let amount = MoneyAmount::normalize(Some(amount), false)?;

        let mut uow = self.store.begin().await?;
        let (first, second) = lock_order(&from, &to);
        let first_locked = uow.lock_for_update(first).await?;
        let second_locked = uow.lock_for_update(second).await?;
        let (mut source, mut destination) = if first == &from {
            (first_locked, second_locked)
        } else {
            (second_locked, first_locked)
        };

        source.withdraw(amount)?;
        destination.deposit(amount)?;
        uow.save(&source).await?;
        uow.save(&destination).await?;

        let event = AccountEvent::transferred(from.clone(), to.clone(), amount);
        uow.stage_event(&event).await?;
        uow.commit().await?;

        info!(from = %from, to = %to, %amount, "transfer committed");
        self.dispatch(&event).await;
        Ok(TransferOutcome {
            from: AccountBalance::from(&source),
            to: AccountBalance::from(&destination),
        })
    }

    /// Last committed balance; takes no lock.
    #[instrument(skip(self))]
    pub async fn balance(&self, account_number: &str) -> Result<AccountBalance, LedgerError> {
        let account_number = account_number_input(account_number)?;
        let account = self.store.lookup(&account_number).await?;
        Ok(AccountBalance::from(&account))
    }

    async fn dispatch(&self, event: &AccountEvent) {
        if !self.publisher.safe_publish(event) {
            return;
        }
        if let Err(error) = self.store.mark_dispatched(event.event_id()).await {
            warn!(
                event_id = %event.event_id(),
                %error,
                "published event could not be marked dispatched; it will be re-sent"
            );
        }
    }
}
