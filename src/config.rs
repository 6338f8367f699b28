//! Application configuration loaded from environment variables.

use std::time::Duration;

use serde::Deserialize;

use crate::escrow::{AccountBalance, MintPolicy};
use crate::registry::{AssetId, Identity, RegistryPolicy};
use crate::reporter::BackoffConfig;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // === Server Configuration ===
    /// HTTP server port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log filter: a level (trace, debug, info, warn, error) or `target=level`
    /// directives.
    #[serde(default = "default_log_level")]
    pub rust_log: String,

    /// Enable verbose logging.
    #[serde(default)]
    pub verbose: bool,

    // === Settlement Policy ===
    /// Accept mints on events that are already resolved.
    #[serde(default)]
    pub allow_mint_after_resolution: bool,

    /// Reject new events whose settlement time is not in the future.
    #[serde(default = "default_true")]
    pub require_future_settlement: bool,

    // === Persistence ===
    /// SQLite database file. Every committed change is written here before it
    /// takes effect; state is in-memory when unset.
    #[serde(default)]
    pub state_path: Option<String>,

    /// Accounts opened at startup, as `holder:asset:amount` pairs separated by
    /// commas. Accounts that already exist are left alone.
    #[serde(default)]
    pub initial_balances: Option<String>,

    // === Reporter ===
    /// Identity the in-process reporter resolves as. Reporter is off when unset.
    #[serde(default)]
    pub reporter_identity: Option<String>,

    /// Seconds between reporter polls.
    #[serde(default = "default_poll_interval")]
    pub reporter_poll_interval_secs: u64,

    /// Retry attempts for a transient source failure.
    #[serde(default = "default_max_retries")]
    pub reporter_max_retries: u32,

    /// First retry delay in milliseconds.
    #[serde(default = "default_initial_backoff")]
    pub reporter_initial_backoff_ms: u64,

    /// Retry delay ceiling in seconds.
    #[serde(default = "default_max_backoff")]
    pub reporter_max_backoff_secs: u64,

    /// Outcome source: "simulated" or "http".
    #[serde(default = "default_outcome_source")]
    pub outcome_source: String,

    /// Base URL for the http outcome source.
    #[serde(default)]
    pub outcome_source_url: Option<String>,

    /// Reading above this value resolves YES.
    #[serde(default = "default_threshold")]
    pub congestion_threshold: i64,
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    10
}

fn default_outcome_source() -> String {
    "simulated".to_string()
}

fn default_threshold() -> i64 {
    20
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            rust_log: default_log_level(),
            verbose: false,
            allow_mint_after_resolution: false,
            require_future_settlement: default_true(),
            state_path: None,
            initial_balances: None,
            reporter_identity: None,
            reporter_poll_interval_secs: default_poll_interval(),
            reporter_max_retries: default_max_retries(),
            reporter_initial_backoff_ms: default_initial_backoff(),
            reporter_max_backoff_secs: default_max_backoff(),
            outcome_source: default_outcome_source(),
            outcome_source_url: None,
            congestion_threshold: default_threshold(),
        }
    }
}

impl Config {
    /// Load configuration from environment, reading .env file first.
    pub fn load() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    /// Check if the configuration is valid.
    pub fn validate(&self) -> Result<(), String> {
        if self.reporter_poll_interval_secs == 0 {
            return Err("REPORTER_POLL_INTERVAL_SECS must be at least 1".to_string());
        }

        if let Some(identity) = &self.reporter_identity {
            if identity.trim().is_empty() {
                return Err("REPORTER_IDENTITY must not be blank".to_string());
            }
        }

        if self.rust_log.trim().is_empty() {
            return Err("RUST_LOG must not be blank".to_string());
        }

        self.initial_balances()?;

        match self.outcome_source_lower().as_str() {
            "simulated" => {}
            "http" => {
                if self.outcome_source_url.is_none() {
                    return Err("OUTCOME_SOURCE_URL is required for the http source".to_string());
                }
            }
            other => return Err(format!("unknown OUTCOME_SOURCE: {}", other)),
        }

        Ok(())
    }

    /// Parse INITIAL_BALANCES.
    pub fn initial_balances(&self) -> Result<Vec<AccountBalance>, String> {
        let Some(spec) = self.initial_balances.as_deref() else {
            return Ok(Vec::new());
        };

        spec.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let invalid =
                    |reason: String| format!("INITIAL_BALANCES entry {:?}: {}", entry, reason);
                let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
                let [holder, asset, amount] = parts.as_slice() else {
                    return Err(invalid("expected holder:asset:amount".to_string()));
                };
                Ok(AccountBalance {
                    holder: Identity::new(*holder).map_err(|e| invalid(e.to_string()))?,
                    asset: AssetId::new(*asset).map_err(|e| invalid(e.to_string()))?,
                    balance: amount
                        .parse::<u64>()
                        .map_err(|e| invalid(format!("amount: {}", e)))?,
                })
            })
            .collect()
    }

    /// Outcome source name (lowercase).
    pub fn outcome_source_lower(&self) -> String {
        self.outcome_source.to_lowercase()
    }

    /// Mint policy derived from settings.
    pub fn mint_policy(&self) -> MintPolicy {
        MintPolicy {
            allow_after_resolution: self.allow_mint_after_resolution,
        }
    }

    /// Registry policy derived from settings.
    pub fn registry_policy(&self) -> RegistryPolicy {
        RegistryPolicy {
            require_future_settlement: self.require_future_settlement,
        }
    }

    /// Reporter retry schedule.
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay_ms: self.reporter_initial_backoff_ms,
            max_delay_s: self.reporter_max_backoff_secs,
            max_retries: self.reporter_max_retries,
            ..Default::default()
        }
    }

    /// Reporter poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.reporter_poll_interval_secs)
    }
}
