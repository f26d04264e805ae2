//! The single fact type the ledger emits, and its JSON wire format.
//!
//! Wire shape (flat object, absent payload fields are explicit `null`):
//!
//! ```text
//! {
//!   "eventId": "0190c5e2-...",
//!   "occurredAt": "2026-01-05T10:15:30.123Z",
//!   "type": "DEPOSITED",
//!   "accountNumber": "0000000042",
//!   "fromAccountNumber": null,
//!   "toAccountNumber": null,
//!   "amount": "5.00",
//!   "balance": "15.00"
//! }
//! ```
//!
//! Amounts travel as decimal strings and must satisfy the same two-decimal rule
//! on the way in as on the way out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tally_core::{AccountNumber, MoneyAmount};
use thiserror::Error;
use uuid::Uuid;

use crate::event::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountEventType {
    Created,
    Deposited,
    Transferred,
}

impl AccountEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountEventType::Created => "CREATED",
            AccountEventType::Deposited => "DEPOSITED",
            AccountEventType::Transferred => "TRANSFERRED",
        }
    }

    /// Inverse of [`AccountEventType::as_str`].
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CREATED" => Some(AccountEventType::Created),
            "DEPOSITED" => Some(AccountEventType::Deposited),
            "TRANSFERRED" => Some(AccountEventType::Transferred),
            _ => None,
        }
    }
}

impl core::fmt::Display for AccountEventType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not an account event: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{event_type} event is missing `{field}`")]
    MissingField {
        event_type: AccountEventType,
        field: &'static str,
    },
}

/// Immutable record of one balance-changing fact.
///
/// Which payload fields are populated depends on [`AccountEventType`]:
///
/// | type | accountNumber | from/to | amount | balance |
/// |---|---|---|---|---|
/// | CREATED | yes | - | initial deposit | initial deposit |
/// | DEPOSITED | yes | - | yes | resulting balance |
/// | TRANSFERRED | - | yes | yes | - |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountEvent {
    event_id: Uuid,
    occurred_at: DateTime<Utc>,
    #[serde(rename = "type")]
    kind: AccountEventType,
    #[serde(default)]
    account_number: Option<AccountNumber>,
    #[serde(default)]
    from_account_number: Option<AccountNumber>,
    #[serde(default)]
    to_account_number: Option<AccountNumber>,
    #[serde(default)]
    amount: Option<MoneyAmount>,
    #[serde(default)]
    balance: Option<MoneyAmount>,
}

impl AccountEvent {
    fn blank(kind: AccountEventType) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            occurred_at: Utc::now(),
            kind,
            account_number: None,
            from_account_number: None,
            to_account_number: None,
            amount: None,
            balance: None,
        }
    }

    /// An account came into existence holding `initial_balance`.
    pub fn created(account_number: AccountNumber, initial_balance: MoneyAmount) -> Self {
        Self {
            account_number: Some(account_number),
            amount: Some(initial_balance),
            balance: Some(initial_balance),
            ..Self::blank(AccountEventType::Created)
        }
    }

    pub fn deposited(
        account_number: AccountNumber,
        amount: MoneyAmount,
        resulting_balance: MoneyAmount,
    ) -> Self {
        Self {
            account_number: Some(account_number),
            amount: Some(amount),
            balance: Some(resulting_balance),
            ..Self::blank(AccountEventType::Deposited)
        }
    }

    /// Transfers deliberately carry no balances.
    pub fn transferred(from: AccountNumber, to: AccountNumber, amount: MoneyAmount) -> Self {
        Self {
            from_account_number: Some(from),
            to_account_number: Some(to),
            amount: Some(amount),
            ..Self::blank(AccountEventType::Transferred)
        }
    }

    pub fn kind(&self) -> AccountEventType {
        self.kind
    }

    pub fn account_number(&self) -> Option<&AccountNumber> {
        self.account_number.as_ref()
    }

    pub fn from_account_number(&self) -> Option<&AccountNumber> {
        self.from_account_number.as_ref()
    }

    pub fn to_account_number(&self) -> Option<&AccountNumber> {
        self.to_account_number.as_ref()
    }

    pub fn amount(&self) -> Option<MoneyAmount> {
        self.amount
    }

    pub fn balance(&self) -> Option<MoneyAmount> {
        self.balance
    }

    /// Serialize to the JSON wire format.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse the JSON wire format and check that the payload fields required
    /// by the event type are present.
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        let event: AccountEvent = serde_json::from_str(raw)?;
        event.check_payload()?;
        Ok(event)
    }

    fn check_payload(&self) -> Result<(), DecodeError> {
        let missing = |field| DecodeError::MissingField {
            event_type: self.kind,
            field,
        };

        match self.kind {
            AccountEventType::Created => {
                self.account_number.as_ref().ok_or_else(|| missing("accountNumber"))?;
                self.balance.ok_or_else(|| missing("balance"))?;
            }
            AccountEventType::Deposited => {
                self.account_number.as_ref().ok_or_else(|| missing("accountNumber"))?;
                self.amount.ok_or_else(|| missing("amount"))?;
                self.balance.ok_or_else(|| missing("balance"))?;
            }
            AccountEventType::Transferred => {
                self.from_account_number
                    .as_ref()
                    .ok_or_else(|| missing("fromAccountNumber"))?;
                self.to_account_number
                    .as_ref()
                    .ok_or_else(|| missing("toAccountNumber"))?;
                self.amount.ok_or_else(|| missing("amount"))?;
            }
        }
        Ok(())
    }
}

impl Event for AccountEvent {
    fn event_id(&self) -> Uuid {
        self.event_id
    }

    fn event_type(&self) -> &'static str {
        self.kind.as_str()
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}
