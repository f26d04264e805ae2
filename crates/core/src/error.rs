//! Domain error model.

use thiserror::Error;

use crate::id::AccountNumber;
use crate::money::{MoneyAmount, MoneyError};

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic business failures (validation,
/// invariants). Storage and transport concerns belong to the infra layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A required text field was missing or only whitespace.
    #[error("{field} must not be blank")]
    Blank { field: &'static str },

    /// An amount failed normalization, or arithmetic left the valid range.
    #[error("invalid amount: {0}")]
    InvalidAmount(#[from] MoneyError),

    /// A withdrawal asked for more than the current balance.
    #[error(
        "insufficient funds on account {account_number}: balance {current_balance}, attempted {attempted_amount}"
    )]
    InsufficientFunds {
        account_number: AccountNumber,
        current_balance: MoneyAmount,
        attempted_amount: MoneyAmount,
    },
}

impl DomainError {
    pub fn blank(field: &'static str) -> Self {
        Self::Blank { field }
    }
}
