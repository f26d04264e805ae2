use tally_core::{AccountNumber, DomainError, DomainResult, Entity, MoneyAmount, MoneyError};

/// Entity: Account.
///
/// `balance` is never negative. `version` is the concurrency token the store
/// advances after each successful write; the entity itself never bumps it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    account_number: AccountNumber,
    first_name: String,
    last_name: String,
    balance: MoneyAmount,
    version: u64,
}

fn required_name(field: &'static str, value: &str) -> DomainResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(DomainError::blank(field));
    }
    Ok(trimmed.to_string())
}

impl Account {
    /// A brand new, not-yet-persisted account at version 0.
    pub fn new(
        account_number: AccountNumber,
        first_name: &str,
        last_name: &str,
        initial_balance: MoneyAmount,
    ) -> DomainResult<Self> {
        let first_name = required_name("firstName", first_name)?;
        let last_name = required_name("lastName", last_name)?;
        if initial_balance.is_negative() {
            return Err(MoneyError::Negative {
                value: initial_balance.to_string(),
            }
            .into());
        }

        Ok(Self {
            account_number,
            first_name,
            last_name,
            balance: initial_balance,
            version: 0,
        })
    }

    /// Rehydrate a persisted row. Stores only.
    pub fn restore(
        account_number: AccountNumber,
        first_name: String,
        last_name: String,
        balance: MoneyAmount,
        version: u64,
    ) -> Self {
        Self {
            account_number,
            first_name,
            last_name,
            balance,
            version,
        }
    }

    pub fn account_number(&self) -> &AccountNumber {
        &self.account_number
    }

    pub fn first_name(&self) -> &str {
        &self.first_name
    }

    pub fn last_name(&self) -> &str {
        &self.last_name
    }

    pub fn balance(&self) -> MoneyAmount {
        self.balance
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn advance_version(&mut self) {
        self.version += 1;
    }

    pub fn deposit(&mut self, amount: MoneyAmount) -> DomainResult<MoneyAmount> {
        ensure_positive(amount)?;
        self.balance = self.balance.checked_add(amount)?;
        Ok(self.balance)
    }

    /// Leaves the balance untouched on any failure.
    pub fn withdraw(&mut self, amount: MoneyAmount) -> DomainResult<MoneyAmount> {
        ensure_positive(amount)?;
        if self.balance < amount {
            return Err(DomainError::InsufficientFunds {
                account_number: self.account_number.clone(),
                current_balance: self.balance,
                attempted_amount: amount,
            });
        }
        self.balance = self.balance.checked_sub(amount)?;
        Ok(self.balance)
    }
}

fn ensure_positive(amount: MoneyAmount) -> Result<(), MoneyError> {
    if amount.is_positive() {
        Ok(())
    } else {
        Err(MoneyError::NonPositive {
            value: amount.to_string(),
        })
    }
}

impl Entity for Account {
    type Id = AccountNumber;

    fn id(&self) -> &Self::Id {
        &self.account_number
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn number() -> AccountNumber {
        AccountNumber::parse("0000000042").unwrap()
    }

    fn money(text: &str) -> MoneyAmount {
        MoneyAmount::parse(text).unwrap()
    }

    fn account_with(balance: &str) -> Account {
        Account::new(number(), "Denis", "Ignatenko", money(balance)).unwrap()
    }

    #[test]
    fn new_trims_names() {
        let account = Account::new(number(), "  Denis ", " Ignatenko", money("10")).unwrap();
        assert_eq!(account.first_name(), "Denis");
        assert_eq!(account.last_name(), "Ignatenko");
        assert_eq!(account.balance(), money("10.00"));
        assert_eq!(account.version(), 0);
    }

    #[test]
    fn new_rejects_blank_names() {
        assert_eq!(
            Account::new(number(), " ", "Ignatenko", MoneyAmount::zero()),
            Err(DomainError::Blank { field: "firstName" })
        );
        assert_eq!(
            Account::new(number(), "Denis", "", MoneyAmount::zero()),
            Err(DomainError::Blank { field: "lastName" })
        );
    }

    #[test]
    fn new_rejects_negative_initial_balance() {
        assert!(matches!(
            Account::new(number(), "Denis", "Ignatenko", money("-0.01")),
            Err(DomainError::InvalidAmount(MoneyError::Negative { .. }))
        ));
    }

    #[test]
    fn deposit_on_empty_account() {
        let mut account = account_with("0");
        assert_eq!(account.deposit(money("5.00")).unwrap(), money("5.00"));
    }

    #[test]
    fn deposit_rejects_non_positive() {
        let mut account = account_with("1");
        assert!(matches!(
            account.deposit(MoneyAmount::zero()),
            Err(DomainError::InvalidAmount(MoneyError::NonPositive { .. }))
        ));
        assert_eq!(account.balance(), money("1.00"));
    }

    #[test]
    fn withdraw_more_than_balance_reports_context() {
        let mut account = account_with("3.00");
        let err = account.withdraw(money("3.01")).unwrap_err();
        assert_eq!(
            err,
            DomainError::InsufficientFunds {
                account_number: number(),
                current_balance: money("3.00"),
                attempted_amount: money("3.01"),
            }
        );
        assert_eq!(account.balance(), money("3.00"));
    }

    #[test]
    fn withdraw_entire_balance_leaves_zero() {
        let mut account = account_with("3.00");
        assert_eq!(account.withdraw(money("3.00")).unwrap(), MoneyAmount::zero());
    }

    #[test]
    fn advance_version_is_explicit() {
        let mut account = account_with("1");
        account.deposit(money("1")).unwrap();
        assert_eq!(account.version(), 0);
        account.advance_version();
        assert_eq!(account.version(), 1);
    }

    proptest! {
        #[test]
        fn withdraw_fails_iff_amount_exceeds_balance(balance in 0i64..1_000_000, amount in 1i64..1_000_000) {
            let mut account = Account::new(number(), "A", "B", MoneyAmount::from_minor(balance)).unwrap();
            let result = account.withdraw(MoneyAmount::from_minor(amount));

            if amount > balance {
                prop_assert!(
                    matches!(result, Err(DomainError::InsufficientFunds { .. })),
                    "expected InsufficientFunds"
                );
                prop_assert_eq!(account.balance(), MoneyAmount::from_minor(balance));
            } else {
                prop_assert_eq!(result.unwrap(), MoneyAmount::from_minor(balance - amount));
            }
        }

        #[test]
        fn deposit_adds_exactly(balance in 0i64..1_000_000_000, amount in 1i64..1_000_000_000) {
            let mut account = Account::new(number(), "A", "B", MoneyAmount::from_minor(balance)).unwrap();
            let after = account.deposit(MoneyAmount::from_minor(amount)).unwrap();
            prop_assert_eq!(after, MoneyAmount::from_minor(balance + amount));
        }
    }
}
