//! Holder collateral accounts outside the vaults.

use std::fmt::Debug;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EscrowError;
use crate::registry::{AssetId, Identity};

/// Fungible collateral balances keyed by `(holder, asset)`.
///
/// Each call is atomic on its own account.
pub trait CollateralBank: Send + Sync + Debug {
    /// Current balance.
    fn balance(&self, holder: &Identity, asset: &AssetId) -> u64;

    /// Take `amount` from the account.
    fn debit(&self, holder: &Identity, asset: &AssetId, amount: u64) -> Result<(), EscrowError>;

    /// Add `amount` to the account.
    fn credit(&self, holder: &Identity, asset: &AssetId, amount: u64) -> Result<(), EscrowError>;
}

/// Serializable account balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub holder: Identity,
    pub asset: AssetId,
    pub balance: u64,
}

/// In-process bank backed by a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryBank {
    accounts: DashMap<(Identity, AssetId), u64>,
}

impl InMemoryBank {
    /// Create an empty bank.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from saved balances.
    pub fn from_accounts(accounts: Vec<AccountBalance>) -> Self {
        let bank = Self::new();
        for account in accounts {
            bank.accounts
                .insert((account.holder, account.asset), account.balance);
        }
        bank
    }

    /// Open accounts that do not exist yet with the given balances. Existing
    /// accounts keep their balance. Returns the accounts that were opened.
    pub fn seed(&self, accounts: Vec<AccountBalance>) -> Vec<AccountBalance> {
        let mut opened = Vec::new();
        for account in accounts {
            let key = (account.holder.clone(), account.asset.clone());
            if let Entry::Vacant(slot) = self.accounts.entry(key) {
                slot.insert(account.balance);
                debug!(
                    holder = %account.holder,
                    asset = %account.asset,
                    balance = account.balance,
                    "Seeded account"
                );
                opened.push(account);
            }
        }
        opened
    }

    /// Faucet: credit test funds to an account.
    pub fn fund(&self, holder: &Identity, asset: &AssetId, amount: u64) -> Result<u64, EscrowError> {
        self.credit(holder, asset, amount)?;
        Ok(self.balance(holder, asset))
    }

    /// All accounts, ordered by holder then asset.
    pub fn accounts(&self) -> Vec<AccountBalance> {
        let mut accounts: Vec<AccountBalance> = self
            .accounts
            .iter()
            .map(|entry| {
                let (holder, asset) = entry.key();
                AccountBalance {
                    holder: holder.clone(),
                    asset: asset.clone(),
                    balance: *entry.value(),
                }
            })
            .collect();
        accounts.sort_by(|a, b| (&a.holder, &a.asset).cmp(&(&b.holder, &b.asset)));
        accounts
    }
}

impl CollateralBank for InMemoryBank {
    fn balance(&self, holder: &Identity, asset: &AssetId) -> u64 {
        self.accounts
            .get(&(holder.clone(), asset.clone()))
            .map(|balance| *balance)
            .unwrap_or(0)
    }

    fn debit(&self, holder: &Identity, asset: &AssetId, amount: u64) -> Result<(), EscrowError> {
        let key = (holder.clone(), asset.clone());
        let Some(mut balance) = self.accounts.get_mut(&key) else {
            return Err(EscrowError::InsufficientFunds {
                required: amount,
                available: 0,
            });
        };

        if *balance < amount {
            return Err(EscrowError::InsufficientFunds {
                required: amount,
                available: *balance,
            });
        }
        *balance -= amount;
        debug!(%holder, %asset, amount, remaining = *balance, "Debited collateral");
        Ok(())
    }

    fn credit(&self, holder: &Identity, asset: &AssetId, amount: u64) -> Result<(), EscrowError> {
        let mut balance = self
            .accounts
            .entry((holder.clone(), asset.clone()))
            .or_insert(0);
        *balance = balance.checked_add(amount).ok_or(EscrowError::Overflow)?;
        debug!(%holder, %asset, amount, balance = *balance, "Credited collateral");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (Identity, AssetId) {
        (Identity::new("alice").unwrap(), AssetId::new("USDC").unwrap())
    }

    #[test]
    fn debit_requires_funds() {
        let bank = InMemoryBank::new();
        let (alice, usdc) = ids();

        assert_eq!(
            bank.debit(&alice, &usdc, 1),
            Err(EscrowError::InsufficientFunds { required: 1, available: 0 })
        );

        bank.fund(&alice, &usdc, 500).unwrap();
        assert_eq!(
            bank.debit(&alice, &usdc, 501),
            Err(EscrowError::InsufficientFunds { required: 501, available: 500 })
        );
        bank.debit(&alice, &usdc, 500).unwrap();
        assert_eq!(bank.balance(&alice, &usdc), 0);
    }

    #[test]
    fn balances_are_per_asset() {
        let bank = InMemoryBank::new();
        let (alice, usdc) = ids();
        let eurc = AssetId::new("EURC").unwrap();

        bank.fund(&alice, &usdc, 10).unwrap();
        assert_eq!(bank.balance(&alice, &eurc), 0);
        assert_eq!(bank.accounts().len(), 1);
    }

    #[test]
    fn credit_overflow_keeps_balance() {
        let bank = InMemoryBank::new();
        let (alice, usdc) = ids();
        bank.fund(&alice, &usdc, u64::MAX).unwrap();
        assert_eq!(bank.credit(&alice, &usdc, 1), Err(EscrowError::Overflow));
        assert_eq!(bank.balance(&alice, &usdc), u64::MAX);
    }

    #[test]
    fn seed_opens_only_new_accounts() {
        let bank = InMemoryBank::new();
        let (alice, usdc) = ids();
        let bob = Identity::new("bob").unwrap();
        bank.fund(&alice, &usdc, 7).unwrap();

        let opened = bank.seed(vec![
            AccountBalance { holder: alice.clone(), asset: usdc.clone(), balance: 1_000 },
            AccountBalance { holder: bob.clone(), asset: usdc.clone(), balance: 50 },
            AccountBalance { holder: bob.clone(), asset: usdc.clone(), balance: 99 },
        ]);

        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].holder, bob);
        assert_eq!(bank.balance(&alice, &usdc), 7);
        assert_eq!(bank.balance(&bob, &usdc), 50);
    }

    #[test]
    fn accounts_round_trip_through_from_accounts() {
        let bank = InMemoryBank::new();
        let (alice, usdc) = ids();
        bank.fund(&alice, &usdc, 42).unwrap();

        let restored = InMemoryBank::from_accounts(bank.accounts());
        assert_eq!(restored.balance(&alice, &usdc), 42);
    }
}
