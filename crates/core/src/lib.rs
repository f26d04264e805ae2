//! Ledger value types shared by every tally crate.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! exact two-decimal money, account identifiers and the shared domain error.

pub mod entity;
pub mod error;
pub mod id;
pub mod money;
pub mod value_object;

pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::AccountNumber;
pub use money::{MoneyAmount, MoneyError};
pub use value_object::ValueObject;
