//! In-process account store.
//!
//! Each row owns a `tokio::sync::Mutex<()>`; a unit of work holds the owned
//! guard for every row it touches until it ends. Committed state sits behind
//! the row map's `RwLock` so a commit touching two rows becomes visible to
//! unlocked lookups in one step.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use tally_accounts::Account;
use tally_core::AccountNumber;
use tally_events::{AccountEvent, Event};

use super::r#trait::{AccountStore, Outbox, OutboxEntry, StoreError, UnitOfWork};

#[derive(Debug)]
struct Row {
    /// `None` while the row is reserved by an uncommitted insert.
    committed: Mutex<Option<Account>>,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Row {
    fn reserved() -> Self {
        Self {
            committed: Mutex::new(None),
            lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn committed(&self) -> Result<Option<Account>, StoreError> {
        self.committed
            .lock()
            .map(|guard| guard.clone())
            .map_err(|_| poisoned("row"))
    }
}

#[derive(Debug)]
struct OutboxRecord {
    entry: OutboxEntry,
    dispatched_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Inner {
    rows: RwLock<HashMap<AccountNumber, Arc<Row>>>,
    outbox: Mutex<Vec<OutboxRecord>>,
    last_sequence: AtomicI64,
}

fn poisoned(what: &str) -> StoreError {
    StoreError::Backend(format!("{what} lock poisoned"))
}

/// Account store for tests and single-process use.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAccountStore {
    inner: Arc<Inner>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every outbox entry, dispatched or not, in staging order.
    pub fn outbox_entries(&self) -> Vec<(OutboxEntry, bool)> {
        self.inner
            .outbox
            .lock()
            .map(|records| {
                records
                    .iter()
                    .map(|r| (r.entry.clone(), r.dispatched_at.is_some()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn row(&self, account_number: &AccountNumber) -> Result<Option<Arc<Row>>, StoreError> {
        let rows = self.inner.rows.read().map_err(|_| poisoned("row map"))?;
        Ok(rows.get(account_number).cloned())
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    type Unit = InMemoryUnitOfWork;

    async fn begin(&self) -> Result<Self::Unit, StoreError> {
        Ok(InMemoryUnitOfWork {
            inner: Arc::clone(&self.inner),
            held: HashMap::new(),
            inserted: Vec::new(),
            staged: Vec::new(),
        })
    }

    async fn lookup(&self, account_number: &AccountNumber) -> Result<Account, StoreError> {
        // Read under the map lock so multi-row commits are seen all at once.
        let rows = self.inner.rows.read().map_err(|_| poisoned("row map"))?;
        let row = rows
            .get(account_number)
            .ok_or_else(|| StoreError::NotFound(account_number.clone()))?;
        row.committed()?
            .ok_or_else(|| StoreError::NotFound(account_number.clone()))
    }
}

#[async_trait]
impl Outbox for InMemoryAccountStore {
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        let outbox = self.inner.outbox.lock().map_err(|_| poisoned("outbox"))?;
        Ok(outbox
            .iter()
            .filter(|r| r.dispatched_at.is_none())
            .take(limit)
            .map(|r| r.entry.clone())
            .collect())
    }

    async fn mark_dispatched(&self, event_id: Uuid) -> Result<(), StoreError> {
        let mut outbox = self.inner.outbox.lock().map_err(|_| poisoned("outbox"))?;
        if let Some(record) = outbox
            .iter_mut()
            .find(|r| r.entry.event.event_id() == event_id)
        {
            record.dispatched_at.get_or_insert_with(Utc::now);
        }
        Ok(())
    }

    async fn prune_dispatched(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut outbox = self.inner.outbox.lock().map_err(|_| poisoned("outbox"))?;
        let before = outbox.len();
        outbox.retain(|r| !matches!(r.dispatched_at, Some(at) if at <= cutoff));
        Ok((before - outbox.len()) as u64)
    }
}

#[derive(Debug)]
struct HeldRow {
    row: Arc<Row>,
    working: Account,
    dirty: bool,
    _guard: OwnedMutexGuard<()>,
}

/// Unit of work over [`InMemoryAccountStore`].
///
/// Dropping it without `commit` discards staged changes, removes reserved
/// inserts and releases every row lock.
#[derive(Debug)]
pub struct InMemoryUnitOfWork {
    inner: Arc<Inner>,
    held: HashMap<AccountNumber, HeldRow>,
    inserted: Vec<(AccountNumber, Arc<Row>)>,
    staged: Vec<AccountEvent>,
}

impl InMemoryUnitOfWork {
    fn release_reservations(&mut self) {
        if self.inserted.is_empty() {
            return;
        }
        if let Ok(mut rows) = self.inner.rows.write() {
            for (number, row) in self.inserted.drain(..) {
                if rows.get(&number).is_some_and(|r| Arc::ptr_eq(r, &row)) {
                    rows.remove(&number);
                }
            }
        }
    }
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    async fn insert_new(&mut self, account: Account) -> Result<(), StoreError> {
        let number = account.account_number().clone();
        let row = {
            let mut rows = self.inner.rows.write().map_err(|_| poisoned("row map"))?;
            if rows.contains_key(&number) {
                return Err(StoreError::UniqueViolation(number));
            }
            let row = Arc::new(Row::reserved());
            rows.insert(number.clone(), Arc::clone(&row));
            row
        };

        // Fresh mutex; nobody else can hold it yet.
        let guard = Arc::clone(&row.lock)
            .try_lock_owned()
            .map_err(|_| StoreError::Backend(format!("reserved row {number} already locked")))?;

        self.inserted.push((number.clone(), Arc::clone(&row)));
        self.held.insert(
            number,
            HeldRow {
                row,
                working: account,
                dirty: false,
                _guard: guard,
            },
        );
        Ok(())
    }

    async fn lock_for_update(
        &mut self,
        account_number: &AccountNumber,
    ) -> Result<Account, StoreError> {
        if let Some(held) = self.held.get(account_number) {
            return Ok(held.working.clone());
        }

        let row = {
            let rows = self.inner.rows.read().map_err(|_| poisoned("row map"))?;
            rows.get(account_number)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(account_number.clone()))?
        };

        let guard = Arc::clone(&row.lock).lock_owned().await;

        // A reservation rolled back while we waited leaves nothing behind.
        let working = row
            .committed()?
            .ok_or_else(|| StoreError::NotFound(account_number.clone()))?;

        self.held.insert(
            account_number.clone(),
            HeldRow {
                row,
                working: working.clone(),
                dirty: false,
                _guard: guard,
            },
        );
        Ok(working)
    }

    async fn save(&mut self, account: &Account) -> Result<(), StoreError> {
        let number = account.account_number();
        let held = self
            .held
            .get_mut(number)
            .ok_or_else(|| StoreError::NotLocked(number.clone()))?;

        if held.working.version() != account.version() {
            return Err(StoreError::Conflict {
                account_number: number.clone(),
                expected: account.version(),
            });
        }

        held.working = account.clone();
        held.dirty = true;
        Ok(())
    }

    async fn stage_event(&mut self, event: &AccountEvent) -> Result<(), StoreError> {
        self.staged.push(event.clone());
        Ok(())
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        {
            let _rows = self.inner.rows.write().map_err(|_| poisoned("row map"))?;

            for held in self.held.values_mut() {
                let mut state = held.working.clone();
                if held.dirty {
                    state.advance_version();
                }
                let mut committed = held.row.committed.lock().map_err(|_| poisoned("row"))?;
                *committed = Some(state);
            }

            let mut outbox = self.inner.outbox.lock().map_err(|_| poisoned("outbox"))?;
            let staged_at = Utc::now();
            for event in self.staged.drain(..) {
                let sequence = self.inner.last_sequence.fetch_add(1, Ordering::SeqCst) + 1;
                outbox.push(OutboxRecord {
                    entry: OutboxEntry {
                        sequence,
                        event,
                        staged_at,
                    },
                    dispatched_at: None,
                });
            }
        }

        // Inserted rows are now committed; nothing to undo on drop.
        self.inserted.clear();
        self.held.clear();
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), StoreError> {
        self.release_reservations();
        Ok(())
    }
}

impl Drop for InMemoryUnitOfWork {
    fn drop(&mut self) {
        self.release_reservations();
    }
}
