//! Everything recorded for a single event, guarded by one lock.

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::EscrowError;
use crate::escrow::{verify_conservation, EscrowVault, PositionLedger, UserPosition};
use crate::metrics;

use super::types::{
    ActivityEntry, ActivityKind, EventTerms, Identity, MarketEvent, Outcome, Resolution,
};

/// Terms, resolution state, vault, positions and audit trail of one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBook {
    pub(crate) terms: EventTerms,
    pub(crate) resolution: Option<Resolution>,
    pub(crate) vault: EscrowVault,
    pub(crate) ledger: PositionLedger,
    pub(crate) activity: Vec<ActivityEntry>,
}

/// One staged mutation of a book.
///
/// A change is built from the current book, checked, written to the journal
/// and only then committed, so a rejected or unpersisted change leaves the
/// book exactly as it was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookChange {
    pub event_id: String,
    /// Replacement vault, if collateral moves.
    pub vault: Option<EscrowVault>,
    /// Replacement position for one holder.
    pub position: Option<UserPosition>,
    /// Resolution being recorded.
    pub resolution: Option<Resolution>,
    /// Audit entry appended on commit.
    pub entry: ActivityEntry,
}

impl EventBook {
    /// Open a book with an empty vault and ledger.
    pub fn new(terms: EventTerms) -> Self {
        let vault = EscrowVault::new(terms.event_id.clone(), terms.collateral_asset.clone());
        let ledger = PositionLedger::new(terms.event_id.clone());
        let created_at = terms.created_at;
        let creator = terms.creator.clone();

        let mut book = Self {
            terms,
            resolution: None,
            vault,
            ledger,
            activity: Vec::new(),
        };
        let entry = book.next_entry(created_at, ActivityKind::Created { creator });
        book.activity.push(entry);
        book
    }

    /// Reassemble a stored book. Activity must be numbered from 0 without gaps.
    pub(crate) fn from_parts(
        terms: EventTerms,
        resolution: Option<Resolution>,
        vault: EscrowVault,
        positions: Vec<UserPosition>,
        activity: Vec<ActivityEntry>,
    ) -> Result<Self, EscrowError> {
        let ledger = PositionLedger::from_positions(terms.event_id.clone(), positions)?;
        if let Some((index, entry)) = activity
            .iter()
            .enumerate()
            .find(|(index, entry)| entry.seq != *index as u64)
        {
            return Err(EscrowError::InvalidInput {
                field: "activity",
                reason: format!("entry {} has seq {}", index, entry.seq),
            });
        }

        Ok(Self {
            terms,
            resolution,
            vault,
            ledger,
            activity,
        })
    }

    pub fn terms(&self) -> &EventTerms {
        &self.terms
    }

    pub fn event_id(&self) -> &str {
        &self.terms.event_id
    }

    pub fn resolution(&self) -> Option<&Resolution> {
        self.resolution.as_ref()
    }

    /// Outcome, once resolved.
    pub fn outcome(&self) -> Option<Outcome> {
        self.resolution.map(|r| r.outcome)
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    pub fn vault(&self) -> &EscrowVault {
        &self.vault
    }

    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    pub fn activity(&self) -> &[ActivityEntry] {
        &self.activity
    }

    /// Owned read view.
    pub fn snapshot(&self) -> MarketEvent {
        MarketEvent {
            event_id: self.terms.event_id.clone(),
            description: self.terms.description.clone(),
            settlement_time: self.terms.settlement_time,
            reporter: self.terms.reporter.clone(),
            collateral_asset: self.terms.collateral_asset.clone(),
            creator: self.terms.creator.clone(),
            created_at: self.terms.created_at,
            resolved: self.is_resolved(),
            outcome: self.outcome(),
            resolved_at: self.resolution.map(|r| r.resolved_at),
            vault_balance: self.vault.balance(),
        }
    }

    /// The audit entry the next commit will append.
    pub(crate) fn next_entry(&self, at: i64, kind: ActivityKind) -> ActivityEntry {
        ActivityEntry {
            seq: self.activity.len() as u64,
            at,
            kind,
        }
    }

    /// Active -> Resolved. Callers check authorization and timing first.
    pub(crate) fn stage_resolution(
        &self,
        outcome: Outcome,
        at: i64,
        reporter: Identity,
    ) -> BookChange {
        BookChange {
            event_id: self.terms.event_id.clone(),
            vault: None,
            position: None,
            resolution: Some(Resolution {
                outcome,
                resolved_at: at,
            }),
            entry: self.next_entry(at, ActivityKind::Resolved { reporter, outcome }),
        }
    }

    /// Deposit `amount` and credit a YES/NO pair to `holder`.
    pub(crate) fn stage_mint(
        &self,
        holder: &Identity,
        amount: u64,
        at: i64,
    ) -> Result<BookChange, EscrowError> {
        let vault = self.vault.after_deposit(amount)?;
        let position = self.ledger.staged_credit(holder, amount)?;
        Ok(BookChange {
            event_id: self.terms.event_id.clone(),
            vault: Some(vault),
            position: Some(position),
            resolution: None,
            entry: self.next_entry(
                at,
                ActivityKind::Minted {
                    holder: holder.clone(),
                    amount,
                },
            ),
        })
    }

    /// Zero `holder`'s `side` and pay it out of the vault. Returns the change
    /// and the amount paid.
    pub(crate) fn stage_redeem(
        &self,
        holder: &Identity,
        side: Outcome,
        at: i64,
    ) -> Result<(BookChange, u64), EscrowError> {
        let (position, amount) = self.ledger.staged_clear(holder, side);
        let vault = self.vault.after_withdraw(amount)?;
        let change = BookChange {
            event_id: self.terms.event_id.clone(),
            vault: Some(vault),
            position: Some(position),
            resolution: None,
            entry: self.next_entry(
                at,
                ActivityKind::Redeemed {
                    holder: holder.clone(),
                    side,
                    amount,
                },
            ),
        };
        Ok((change, amount))
    }

    /// Check that the book would still conserve collateral after `change`.
    ///
    /// A failure is counted and logged here; the caller drops the change.
    pub fn check_change(&self, change: &BookChange) -> Result<(), EscrowError> {
        self.prospective(change).inspect_err(|e| {
            metrics::inc_conservation_violations();
            error!(
                event_id = %self.terms.event_id,
                error = %e,
                "Conservation invariant broken, change dropped"
            );
        })
    }

    fn prospective(&self, change: &BookChange) -> Result<(), EscrowError> {
        let violated = |detail: String| EscrowError::ConservationViolated {
            event_id: self.terms.event_id.clone(),
            detail,
        };

        if change.event_id != self.terms.event_id {
            return Err(violated(format!("change targets {}", change.event_id)));
        }
        if change.entry.seq != self.activity.len() as u64 {
            return Err(violated(format!(
                "activity seq {} but log has {} entries",
                change.entry.seq,
                self.activity.len()
            )));
        }
        if change.resolution.is_some() && self.is_resolved() {
            return Err(violated("second resolution".to_string()));
        }

        self.ledger.verify_totals().map_err(violated)?;
        let (total_yes, total_no) = match &change.position {
            Some(position) => self
                .ledger
                .totals_after(position)
                .map_err(|e| violated(e.to_string()))?,
            None => (
                self.ledger.total(Outcome::Yes),
                self.ledger.total(Outcome::No),
            ),
        };
        let vault = change.vault.as_ref().unwrap_or(&self.vault);
        let outcome = change.resolution.map(|r| r.outcome).or(self.outcome());

        verify_conservation(vault, total_yes, total_no, outcome)
    }

    /// Apply a checked change. Nothing changes on error.
    pub(crate) fn commit(&mut self, change: BookChange) -> Result<(), EscrowError> {
        if let Some(position) = change.position {
            self.ledger.put(position)?;
        }
        if let Some(vault) = change.vault {
            self.vault = vault;
        }
        if let Some(resolution) = change.resolution {
            self.resolution = Some(resolution);
        }
        self.activity.push(change.entry);
        Ok(())
    }

    /// Check vault against outstanding claims.
    pub fn check_conservation(&self) -> Result<(), EscrowError> {
        self.ledger
            .verify_totals()
            .map_err(|detail| EscrowError::ConservationViolated {
                event_id: self.terms.event_id.clone(),
                detail,
            })?;
        verify_conservation(
            &self.vault,
            self.ledger.total(Outcome::Yes),
            self.ledger.total(Outcome::No),
            self.outcome(),
        )
    }
}
