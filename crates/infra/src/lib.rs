//! Infrastructure layer: storage, transport, background loops, config.

pub mod account_store;
pub mod config;
pub mod db;
pub mod event_bus;
pub mod ledger_service;
pub mod outbox;
pub mod projections;
pub mod workers;


pub use ledger_service::{
    AccountBalance, DEFAULT_MAX_ATTEMPTS, ErrorKind, LedgerError, LedgerService, TransferOutcome,
    lock_order,
};
