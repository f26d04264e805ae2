//! Postgres-backed projection store (`account_events` table).
//!
//! Uniqueness of `event_id` is enforced by the `uk_account_events_event_id`
//! constraint; a `23505` on insert maps to
//! [`ProjectionStoreError::DuplicateEventId`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use tally_core::{AccountNumber, MoneyAmount};
use tally_events::AccountEventType;

use super::store::{IngestedEventRecord, IngestedEventStore, ProjectionStoreError};
use crate::db::is_unique_violation;

#[derive(Debug, Clone)]
pub struct PostgresIngestedEventStore {
    pool: PgPool,
}

impl PostgresIngestedEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IngestedEventStore for PostgresIngestedEventStore {
    #[instrument(skip(self), fields(event_id = %event_id), err)]
    async fn contains(&self, event_id: Uuid) -> Result<bool, ProjectionStoreError> {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM account_events WHERE event_id = $1) AS present")
            .bind(event_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("contains", e))?;
        row.try_get::<bool, _>("present")
            .map_err(|e| ProjectionStoreError::Decode(e.to_string()))
    }

    #[instrument(
        skip(self, record),
        fields(event_id = %record.event_id, event_type = record.event_type.as_str()),
        err
    )]
    async fn insert(&self, record: IngestedEventRecord) -> Result<(), ProjectionStoreError> {
        sqlx::query(
            r#"
            INSERT INTO account_events (
                event_id,
                event_type,
                occurred_at,
                account_number,
                from_account_number,
                to_account_number,
                amount,
                balance,
                raw_json,
                ingested_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.event_id)
        .bind(record.event_type.as_str())
        .bind(record.occurred_at)
        .bind(record.account_number.as_ref().map(AccountNumber::as_str))
        .bind(record.from_account_number.as_ref().map(AccountNumber::as_str))
        .bind(record.to_account_number.as_ref().map(AccountNumber::as_str))
        .bind(record.amount.map(Decimal::from))
        .bind(record.balance.map(Decimal::from))
        .bind(&record.raw_json)
        .bind(record.ingested_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ProjectionStoreError::DuplicateEventId(record.event_id)
            } else {
                map_sqlx_error("insert", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn latest(&self, limit: i64) -> Result<Vec<IngestedEventRecord>, ProjectionStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                event_id,
                event_type,
                occurred_at,
                account_number,
                from_account_number,
                to_account_number,
                amount,
                balance,
                raw_json,
                ingested_at
            FROM account_events
            ORDER BY occurred_at DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("latest", e))?;

        rows.iter().map(record_from_row).collect()
    }
}

fn decode(err: sqlx::Error) -> ProjectionStoreError {
    ProjectionStoreError::Decode(err.to_string())
}

fn optional_number(value: Option<String>) -> Result<Option<AccountNumber>, ProjectionStoreError> {
    value
        .map(|v| AccountNumber::parse(&v).map_err(|e| ProjectionStoreError::Decode(e.to_string())))
        .transpose()
}

fn optional_money(value: Option<Decimal>) -> Result<Option<MoneyAmount>, ProjectionStoreError> {
    value
        .map(|v| MoneyAmount::from_decimal(v).map_err(|e| ProjectionStoreError::Decode(e.to_string())))
        .transpose()
}

fn record_from_row(row: &PgRow) -> Result<IngestedEventRecord, ProjectionStoreError> {
    let event_type: String = row.try_get("event_type").map_err(decode)?;
    let event_type = AccountEventType::parse(&event_type)
        .ok_or_else(|| ProjectionStoreError::Decode(format!("unknown event_type {event_type}")))?;
    let occurred_at: DateTime<Utc> = row.try_get("occurred_at").map_err(decode)?;
    let ingested_at: DateTime<Utc> = row.try_get("ingested_at").map_err(decode)?;

    Ok(IngestedEventRecord {
        event_id: row.try_get("event_id").map_err(decode)?,
        event_type,
        occurred_at,
        account_number: optional_number(row.try_get("account_number").map_err(decode)?)?,
        from_account_number: optional_number(row.try_get("from_account_number").map_err(decode)?)?,
        to_account_number: optional_number(row.try_get("to_account_number").map_err(decode)?)?,
        amount: optional_money(row.try_get("amount").map_err(decode)?)?,
        balance: optional_money(row.try_get("balance").map_err(decode)?)?,
        raw_json: row.try_get("raw_json").map_err(decode)?,
        ingested_at,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> ProjectionStoreError {
    match err {
        sqlx::Error::Database(db_err) => ProjectionStoreError::Backend(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        other => ProjectionStoreError::Backend(format!("{operation}: {other}")),
    }
}
