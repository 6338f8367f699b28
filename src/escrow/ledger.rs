//! Outstanding YES/NO claims per holder.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::EscrowError;
use crate::registry::{Identity, Outcome};

/// Claims held by one holder on one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPosition {
    pub event_id: String,
    pub holder: Identity,
    pub yes_amount: u64,
    pub no_amount: u64,
}

impl UserPosition {
    /// A position with no claims.
    pub fn empty(event_id: impl Into<String>, holder: Identity) -> Self {
        Self {
            event_id: event_id.into(),
            holder,
            yes_amount: 0,
            no_amount: 0,
        }
    }

    /// Claims on the given side.
    pub fn amount(&self, side: Outcome) -> u64 {
        match side {
            Outcome::Yes => self.yes_amount,
            Outcome::No => self.no_amount,
        }
    }

    /// True when both sides are equal, as they are until a redemption.
    pub fn is_paired(&self) -> bool {
        self.yes_amount == self.no_amount
    }
}

/// Position ledger for one event.
///
/// Running side totals are kept next to the positions and cross-checked by
/// [`PositionLedger::verify_totals`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionLedger {
    event_id: String,
    positions: BTreeMap<Identity, UserPosition>,
    total_yes: u64,
    total_no: u64,
}

impl PositionLedger {
    /// Create an empty ledger.
    pub fn new(event_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            positions: BTreeMap::new(),
            total_yes: 0,
            total_no: 0,
        }
    }

    /// Position for `holder`. Holders that never minted get an empty one.
    pub fn get(&self, holder: &Identity) -> UserPosition {
        self.positions
            .get(holder)
            .cloned()
            .unwrap_or_else(|| UserPosition::empty(self.event_id.clone(), holder.clone()))
    }

    /// All positions ordered by holder.
    pub fn positions(&self) -> impl Iterator<Item = &UserPosition> {
        self.positions.values()
    }

    /// Number of holders with a position record.
    pub fn holder_count(&self) -> usize {
        self.positions.len()
    }

    /// Outstanding claims on `side` across all holders.
    pub fn total(&self, side: Outcome) -> u64 {
        match side {
            Outcome::Yes => self.total_yes,
            Outcome::No => self.total_no,
        }
    }

    /// Rebuild a ledger from stored positions, recomputing the totals.
    pub(crate) fn from_positions(
        event_id: impl Into<String>,
        positions: Vec<UserPosition>,
    ) -> Result<Self, EscrowError> {
        let mut ledger = Self::new(event_id);
        for position in positions {
            ledger.put(position)?;
        }
        Ok(ledger)
    }

    /// `holder`'s position after crediting `amount` to both sides.
    pub(crate) fn staged_credit(
        &self,
        holder: &Identity,
        amount: u64,
    ) -> Result<UserPosition, EscrowError> {
        let mut position = self.get(holder);
        position.yes_amount = position
            .yes_amount
            .checked_add(amount)
            .ok_or(EscrowError::Overflow)?;
        position.no_amount = position
            .no_amount
            .checked_add(amount)
            .ok_or(EscrowError::Overflow)?;
        self.totals_after(&position)?;
        Ok(position)
    }

    /// `holder`'s position after zeroing `side`, and the amount removed.
    pub(crate) fn staged_clear(&self, holder: &Identity, side: Outcome) -> (UserPosition, u64) {
        let mut position = self.get(holder);
        let cleared = match side {
            Outcome::Yes => std::mem::take(&mut position.yes_amount),
            Outcome::No => std::mem::take(&mut position.no_amount),
        };
        (position, cleared)
    }

    /// Side totals if `position` replaced the holder's current one.
    pub(crate) fn totals_after(&self, position: &UserPosition) -> Result<(u64, u64), EscrowError> {
        let current = self.positions.get(&position.holder);
        let (yes, no) = current.map_or((0, 0), |p| (p.yes_amount, p.no_amount));

        let shift = |total: u64, old: u64, new: u64| {
            total
                .checked_sub(old)
                .and_then(|rest| rest.checked_add(new))
                .ok_or(EscrowError::Overflow)
        };
        Ok((
            shift(self.total_yes, yes, position.yes_amount)?,
            shift(self.total_no, no, position.no_amount)?,
        ))
    }

    /// Replace the holder's position. Nothing changes on error.
    pub(crate) fn put(&mut self, position: UserPosition) -> Result<(), EscrowError> {
        if position.event_id != self.event_id {
            return Err(EscrowError::InvalidInput {
                field: "event_id",
                reason: format!("position for {} in ledger {}", position.event_id, self.event_id),
            });
        }

        let (total_yes, total_no) = self.totals_after(&position)?;
        self.total_yes = total_yes;
        self.total_no = total_no;
        self.positions.insert(position.holder.clone(), position);
        Ok(())
    }

    /// Recompute side totals from the positions and compare with the running ones.
    pub fn verify_totals(&self) -> Result<(), String> {
        let mut yes: u128 = 0;
        let mut no: u128 = 0;
        for position in self.positions.values() {
            yes += u128::from(position.yes_amount);
            no += u128::from(position.no_amount);
        }

        if yes != u128::from(self.total_yes) || no != u128::from(self.total_no) {
            return Err(format!(
                "ledger totals yes={} no={} but positions sum to yes={} no={}",
                self.total_yes, self.total_no, yes, no
            ));
        }
        Ok(())
    }
}
