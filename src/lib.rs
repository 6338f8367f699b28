//! Binary prediction-market settlement and escrow.
//!
//! An event asks a yes/no question that a trusted reporter answers once its
//! settlement time has passed. Holders deposit collateral to mint paired YES
//! and NO claims, one of each per unit. After resolution each winning claim
//! redeems for one unit and losing claims are worth nothing:
//!
//! ```text
//! mint 100 USDC    ->  100 YES + 100 NO, vault = 100
//! resolve YES      ->  YES claims win
//! redeem           ->  holder receives 100, vault = 0
//! ```
//!
//! Every event's vault always equals the collateral it owes to outstanding
//! winning claims.
//!
//! # Modules
//!
//! - [`config`]: Configuration loading from environment
//! - [`error`]: Unified error types
//! - [`clock`]: Time source for settlement checks
//! - [`registry`]: Event creation, resolution and lookup
//! - [`escrow`]: Vaults, position ledgers and the settlement engine
//! - [`reporter`]: Trusted reporter polling loop
//! - [`store`]: SQLite write-through persistence
//! - [`api`]: HTTP API
//! - [`metrics`]: Prometheus metrics
//! - [`utils`]: Utility functions

pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod escrow;
pub mod metrics;
pub mod registry;
pub mod reporter;
pub mod store;
pub mod utils;

pub use config::Config;
pub use error::{AppError, EscrowError, Result};
