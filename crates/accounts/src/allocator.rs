//! Account identifier allocation.
//!
//! Allocation is a draw, not a reservation: two allocators may hand out the
//! same number. Uniqueness is enforced by the store on insert and a collision
//! is simply retried by the caller.

use rand::Rng;
use tally_core::AccountNumber;

pub const ACCOUNT_NUMBER_DIGITS: usize = 10;

const ACCOUNT_NUMBER_SPACE: u64 = 10_000_000_000;

pub trait AccountNumberAllocator: Send + Sync {
    fn next(&self) -> AccountNumber;
}

impl<A> AccountNumberAllocator for std::sync::Arc<A>
where
    A: AccountNumberAllocator + ?Sized,
{
    fn next(&self) -> AccountNumber {
        (**self).next()
    }
}

/// Uniform 10-digit numbers from the thread-local CSPRNG (OS-seeded ChaCha).
#[derive(Debug, Clone, Copy, Default)]
pub struct SecureRandomAllocator;

impl SecureRandomAllocator {
    pub fn new() -> Self {
        Self
    }
}

impl AccountNumberAllocator for SecureRandomAllocator {
    fn next(&self) -> AccountNumber {
        let value = rand::rng().random_range(0..ACCOUNT_NUMBER_SPACE);
        format_account_number(value)
    }
}

fn format_account_number(value: u64) -> AccountNumber {
    AccountNumber::zero_padded(value, ACCOUNT_NUMBER_DIGITS)
}
