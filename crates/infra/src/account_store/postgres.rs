//! Postgres-backed account store.
//!
//! A unit of work is one sqlx transaction. Row locks come from
//! `SELECT ... FOR UPDATE` and are released by the database when the
//! transaction ends; dropping an uncommitted [`PostgresUnitOfWork`] rolls the
//! transaction back.
//!
//! ## Error Mapping
//!
//! | SQLx error | PostgreSQL code | `StoreError` |
//! |---|---|---|
//! | Database (unique violation) on `accounts` insert | `23505` | `UniqueViolation` |
//! | Database (check violation) | `23514` | `Backend` |
//! | Database (other) | any | `Backend` |
//! | ColumnDecode / Decode | n/a | `Serialization` |
//! | PoolClosed, Io, Tls, ... | n/a | `Backend` |

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use tally_accounts::Account;
use tally_core::{AccountNumber, MoneyAmount};
use tally_events::{AccountEvent, Event};

use super::r#trait::{AccountStore, Outbox, OutboxEntry, StoreError, UnitOfWork};
use crate::db::is_unique_violation;

#[derive(Debug, Clone)]
pub struct PostgresAccountStore {
    pool: PgPool,
}

impl PostgresAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl AccountStore for PostgresAccountStore {
    type Unit = PostgresUnitOfWork;

    #[instrument(skip(self), err)]
    async fn begin(&self) -> Result<Self::Unit, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(PostgresUnitOfWork {
            tx,
            held: HashMap::new(),
        })
    }

    #[instrument(skip(self), fields(account_number = %account_number), err)]
    async fn lookup(&self, account_number: &AccountNumber) -> Result<Account, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT account_number, first_name, last_name, balance, version
            FROM accounts
            WHERE account_number = $1
            "#,
        )
        .bind(account_number.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("lookup", e))?;

        match row {
            Some(row) => account_from_row(&row),
            None => Err(StoreError::NotFound(account_number.clone())),
        }
    }
}

#[async_trait]
impl Outbox for PostgresAccountStore {
    #[instrument(skip(self), err)]
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, payload, staged_at
            FROM account_event_outbox
            WHERE dispatched_at IS NULL
            ORDER BY sequence ASC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("pending_outbox", e))?;

        rows.iter().map(outbox_entry_from_row).collect()
    }

    #[instrument(skip(self), fields(event_id = %event_id), err)]
    async fn mark_dispatched(&self, event_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE account_event_outbox
            SET dispatched_at = NOW()
            WHERE event_id = $1 AND dispatched_at IS NULL
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_dispatched", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(cutoff = %cutoff), err)]
    async fn prune_dispatched(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM account_event_outbox
            WHERE dispatched_at IS NOT NULL AND dispatched_at <= $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("prune_outbox", e))?;
        Ok(result.rows_affected())
    }
}

/// One Postgres transaction plus the accounts it has locked.
pub struct PostgresUnitOfWork {
    tx: Transaction<'static, Postgres>,
    held: HashMap<AccountNumber, Account>,
}

impl core::fmt::Debug for PostgresUnitOfWork {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PostgresUnitOfWork")
            .field("held", &self.held.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl UnitOfWork for PostgresUnitOfWork {
    #[instrument(skip(self, account), fields(account_number = %account.account_number()), err)]
    async fn insert_new(&mut self, account: Account) -> Result<(), StoreError> {
        // Savepoint, so a duplicate key does not abort the outer transaction.
        let mut savepoint = sqlx::Connection::begin(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_savepoint", e))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO accounts (account_number, first_name, last_name, balance, version)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(account.account_number().as_str())
        .bind(account.first_name())
        .bind(account.last_name())
        .bind(account.balance().as_decimal())
        .bind(version_to_db(account.version()))
        .execute(&mut *savepoint)
        .await;

        match inserted {
            Ok(_) => {
                savepoint
                    .commit()
                    .await
                    .map_err(|e| map_sqlx_error("release_savepoint", e))?;
            }
            Err(err) => {
                savepoint
                    .rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback_savepoint", e))?;
                if is_unique_violation(&err) {
                    return Err(StoreError::UniqueViolation(account.account_number().clone()));
                }
                return Err(map_sqlx_error("insert_account", err));
            }
        }

        self.held.insert(account.account_number().clone(), account);
        Ok(())
    }

    #[instrument(skip(self), fields(account_number = %account_number), err)]
    async fn lock_for_update(
        &mut self,
        account_number: &AccountNumber,
    ) -> Result<Account, StoreError> {
        if let Some(account) = self.held.get(account_number) {
            return Ok(account.clone());
        }

        let row = sqlx::query(
            r#"
            SELECT account_number, first_name, last_name, balance, version
            FROM accounts
            WHERE account_number = $1
            FOR UPDATE
            "#,
        )
        .bind(account_number.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("lock_for_update", e))?;

        let account = match row {
            Some(row) => account_from_row(&row)?,
            None => return Err(StoreError::NotFound(account_number.clone())),
        };

        self.held.insert(account_number.clone(), account.clone());
        Ok(account)
    }

    #[instrument(skip(self, account), fields(account_number = %account.account_number()), err)]
    async fn save(&mut self, account: &Account) -> Result<(), StoreError> {
        let number = account.account_number();
        if !self.held.contains_key(number) {
            return Err(StoreError::NotLocked(number.clone()));
        }

        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET first_name = $2,
                last_name = $3,
                balance = $4,
                version = version + 1,
                updated_at = NOW()
            WHERE account_number = $1 AND version = $5
            "#,
        )
        .bind(number.as_str())
        .bind(account.first_name())
        .bind(account.last_name())
        .bind(account.balance().as_decimal())
        .bind(version_to_db(account.version()))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("save_account", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict {
                account_number: number.clone(),
                expected: account.version(),
            });
        }

        let mut saved = account.clone();
        saved.advance_version();
        self.held.insert(number.clone(), saved);
        Ok(())
    }

    #[instrument(
        skip(self, event),
        fields(event_id = %event.event_id(), event_type = event.event_type()),
        err
    )]
    async fn stage_event(&mut self, event: &AccountEvent) -> Result<(), StoreError> {
        let payload = serde_json::to_value(event)
            .map_err(|e| StoreError::Serialization(format!("event payload: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO account_event_outbox (event_id, event_type, occurred_at, payload)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(event.event_id())
        .bind(event.event_type())
        .bind(event.occurred_at())
        .bind(payload)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("stage_event", e))?;
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback_transaction", e))
    }
}

fn version_to_db(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

fn account_from_row(row: &PgRow) -> Result<Account, StoreError> {
    let number: String = row.try_get("account_number").map_err(decode_error)?;
    let first_name: String = row.try_get("first_name").map_err(decode_error)?;
    let last_name: String = row.try_get("last_name").map_err(decode_error)?;
    let balance: Decimal = row.try_get("balance").map_err(decode_error)?;
    let version: i64 = row.try_get("version").map_err(decode_error)?;

    let account_number = AccountNumber::parse(&number)
        .map_err(|e| StoreError::Serialization(format!("account_number: {e}")))?;
    let balance = MoneyAmount::from_decimal(balance)
        .map_err(|e| StoreError::Serialization(format!("balance: {e}")))?;
    let version = u64::try_from(version)
        .map_err(|_| StoreError::Serialization(format!("negative version {version}")))?;

    Ok(Account::restore(
        account_number,
        first_name,
        last_name,
        balance,
        version,
    ))
}

fn outbox_entry_from_row(row: &PgRow) -> Result<OutboxEntry, StoreError> {
    let sequence: i64 = row.try_get("sequence").map_err(decode_error)?;
    let payload: serde_json::Value = row.try_get("payload").map_err(decode_error)?;
    let staged_at: DateTime<Utc> = row.try_get("staged_at").map_err(decode_error)?;

    let event: AccountEvent = serde_json::from_value(payload)
        .map_err(|e| StoreError::Serialization(format!("outbox payload {sequence}: {e}")))?;

    Ok(OutboxEntry {
        sequence,
        event,
        staged_at,
    })
}

fn decode_error(err: sqlx::Error) -> StoreError {
    StoreError::Serialization(err.to_string())
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::Backend(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(format!("{operation}: {err}"))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed during {operation}"))
        }
        other => StoreError::Backend(format!("{operation}: {other}")),
    }
}
