//! Per-event collateral account.

use serde::{Deserialize, Serialize};

use crate::error::EscrowError;
use crate::registry::AssetId;

/// Escrowed collateral for one event.
///
/// Vaults are never mutated in place. The engine stages the next vault with
/// `after_deposit` / `after_withdraw` and the event book swaps it in on commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowVault {
    event_id: String,
    asset: AssetId,
    balance: u64,
    total_deposited: u64,
    total_withdrawn: u64,
}

impl EscrowVault {
    /// Create an empty vault for an event.
    pub fn new(event_id: impl Into<String>, asset: AssetId) -> Self {
        Self {
            event_id: event_id.into(),
            asset,
            balance: 0,
            total_deposited: 0,
            total_withdrawn: 0,
        }
    }

    /// Event this vault belongs to.
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    /// Collateral asset held.
    pub fn asset(&self) -> &AssetId {
        &self.asset
    }

    /// Units currently escrowed.
    pub fn balance(&self) -> u64 {
        self.balance
    }

    /// Lifetime deposits.
    pub fn total_deposited(&self) -> u64 {
        self.total_deposited
    }

    /// Lifetime payouts.
    pub fn total_withdrawn(&self) -> u64 {
        self.total_withdrawn
    }

    /// Rebuild a vault from stored figures.
    pub(crate) fn from_parts(
        event_id: impl Into<String>,
        asset: AssetId,
        balance: u64,
        total_deposited: u64,
        total_withdrawn: u64,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            asset,
            balance,
            total_deposited,
            total_withdrawn,
        }
    }

    /// The vault as it would be after depositing `amount`.
    pub(crate) fn after_deposit(&self, amount: u64) -> Result<EscrowVault, EscrowError> {
        Ok(Self {
            balance: self.balance.checked_add(amount).ok_or(EscrowError::Overflow)?,
            total_deposited: self
                .total_deposited
                .checked_add(amount)
                .ok_or(EscrowError::Overflow)?,
            ..self.clone()
        })
    }

    /// The vault as it would be after paying out `amount`.
    pub(crate) fn after_withdraw(&self, amount: u64) -> Result<EscrowVault, EscrowError> {
        if amount > self.balance {
            return Err(EscrowError::InsufficientVaultBalance {
                event_id: self.event_id.clone(),
                requested: amount,
                available: self.balance,
            });
        }
        Ok(Self {
            balance: self.balance - amount,
            total_withdrawn: self
                .total_withdrawn
                .checked_add(amount)
                .ok_or(EscrowError::Overflow)?,
            ..self.clone()
        })
    }
}
