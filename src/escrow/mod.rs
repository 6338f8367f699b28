//! Escrow accounting: vaults, position ledgers and the settlement engine.
//!
//! This module handles:
//! - Per-event collateral vaults
//! - Per-holder YES/NO claim positions
//! - Holder collateral accounts
//! - Mint and redeem, each checked for conservation before it commits

pub mod bank;
pub mod conservation;
pub mod engine;
pub mod ledger;
pub mod vault;

pub use bank::{AccountBalance, CollateralBank, InMemoryBank};
pub use conservation::verify_conservation;
pub use engine::{MintPolicy, Redemption, SettlementEngine};
pub use ledger::{PositionLedger, UserPosition};
pub use vault::EscrowVault;
