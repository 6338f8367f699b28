//! Mint and redemption: the two holder-facing mutations.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::error::EscrowError;
use crate::metrics;
use crate::registry::{AssetId, BookChange, EventRegistry, Identity, Outcome};

use super::bank::{AccountBalance, CollateralBank};
use super::ledger::UserPosition;

/// Whether minting stays open once an event is resolved.
#[derive(Debug, Clone, Copy, Default)]
pub struct MintPolicy {
    /// Accept mints after resolution. Off by default: such claims are
    /// immediately worthless on the losing side.
    pub allow_after_resolution: bool,
}

/// Result of a redeem call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Redemption {
    pub event_id: String,
    pub holder: Identity,
    /// Side that was payable.
    pub side: Outcome,
    /// Collateral transferred to the holder. Zero for a no-op.
    pub amount_paid: u64,
    /// Position after the call.
    pub position: UserPosition,
}

/// Moves collateral between holder accounts and event vaults while keeping
/// claims and escrow in step.
///
/// Lock order is always book, then `commit`. The commit lock spans the bank
/// movement and the journal write, so persisted account balances are written
/// in the same order they change.
#[derive(Debug, Clone)]
pub struct SettlementEngine {
    registry: Arc<EventRegistry>,
    bank: Arc<dyn CollateralBank>,
    policy: MintPolicy,
    commit: Arc<Mutex<()>>,
}

impl SettlementEngine {
    /// Create an engine over a registry and a collateral bank.
    pub fn new(registry: Arc<EventRegistry>, bank: Arc<dyn CollateralBank>, policy: MintPolicy) -> Self {
        Self {
            registry,
            bank,
            policy,
            commit: Arc::new(Mutex::new(())),
        }
    }

    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.registry
    }

    pub fn bank(&self) -> &Arc<dyn CollateralBank> {
        &self.bank
    }

    pub fn policy(&self) -> MintPolicy {
        self.policy
    }

    /// Deposit `amount` of collateral and credit `amount` YES and `amount` NO
    /// claims to `holder`.
    #[instrument(skip(self), fields(holder = %holder))]
    pub async fn mint(
        &self,
        event_id: &str,
        amount: i64,
        holder: &Identity,
    ) -> Result<UserPosition, EscrowError> {
        let _timer = metrics::timer_op("mint");
        let units = u64::try_from(amount)
            .ok()
            .filter(|units| *units > 0)
            .ok_or(EscrowError::InvalidAmount { amount })?;

        let handle = self.registry.book(event_id)?;
        let mut book = handle.lock().await;

        if book.is_resolved() && !self.policy.allow_after_resolution {
            warn!("Mint rejected: event already resolved");
            return Err(EscrowError::AlreadyResolved {
                event_id: event_id.to_string(),
            });
        }

        let now = self.registry.clock().now();
        let change = book.stage_mint(holder, units, now)?;
        book.check_change(&change)?;

        let asset = book.terms.collateral_asset.clone();
        let _commit = self.commit.lock().await;
        self.bank.debit(holder, &asset, units)?;

        if let Err(e) = self.persist(&change, holder, &asset) {
            if let Err(refund) = self.bank.credit(holder, &asset, units) {
                error!(error = %refund, "Refund after unpersisted mint did not apply");
            }
            return Err(e);
        }
        book.commit(change)?;

        let position = book.ledger.get(holder);
        metrics::record_mint(units);
        info!(
            amount = units,
            yes = position.yes_amount,
            no = position.no_amount,
            vault_balance = book.vault.balance(),
            "Minted claim pair"
        );
        Ok(position)
    }

    /// Pay out `holder`'s full winning-side balance and zero that side.
    ///
    /// Calling again, or holding only losing claims, pays 0 without error.
    #[instrument(skip(self), fields(holder = %holder))]
    pub async fn redeem(&self, event_id: &str, holder: &Identity) -> Result<Redemption, EscrowError> {
        let _timer = metrics::timer_op("redeem");
        let handle = self.registry.book(event_id)?;
        let mut book = handle.lock().await;

        let side = book.outcome().ok_or_else(|| EscrowError::NotResolved {
            event_id: event_id.to_string(),
        })?;

        if book.ledger.get(holder).amount(side) == 0 {
            debug!(%side, "Nothing to redeem");
            return Ok(Redemption {
                event_id: event_id.to_string(),
                holder: holder.clone(),
                side,
                amount_paid: 0,
                position: book.ledger.get(holder),
            });
        }

        let now = self.registry.clock().now();
        let (change, payout) = book.stage_redeem(holder, side, now)?;
        book.check_change(&change)?;

        let asset = book.terms.collateral_asset.clone();
        let _commit = self.commit.lock().await;
        self.bank.credit(holder, &asset, payout)?;

        if let Err(e) = self.persist(&change, holder, &asset) {
            if let Err(clawback) = self.bank.debit(holder, &asset, payout) {
                error!(error = %clawback, "Reversal after unpersisted redemption did not apply");
            }
            return Err(e);
        }
        book.commit(change)?;

        metrics::record_redemption(payout);
        info!(
            %side,
            amount = payout,
            vault_balance = book.vault.balance(),
            "Redeemed winning claims"
        );

        Ok(Redemption {
            event_id: event_id.to_string(),
            holder: holder.clone(),
            side,
            amount_paid: payout,
            position: book.ledger.get(holder),
        })
    }

    // Journal the change together with the holder's new account balance.
    fn persist(
        &self,
        change: &BookChange,
        holder: &Identity,
        asset: &AssetId,
    ) -> Result<(), EscrowError> {
        let account = AccountBalance {
            holder: holder.clone(),
            asset: asset.clone(),
            balance: self.bank.balance(holder, asset),
        };
        self.registry.journal().apply(change, &[account]).map_err(|e| {
            error!(error = %e, event_id = %change.event_id, "Change not persisted, rolling back");
            EscrowError::from(e)
        })
    }
}
