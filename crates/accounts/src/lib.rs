//! Account domain module.
//!
//! Pure business rules for a single account plus the identifier allocation
//! seam. No IO, no storage, no locking: callers own the concurrency story.

pub mod account;
pub mod allocator;

pub use account::Account;
pub use allocator::{ACCOUNT_NUMBER_DIGITS, AccountNumberAllocator, SecureRandomAllocator};
