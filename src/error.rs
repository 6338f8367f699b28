//! Unified error types for the settlement service.

use thiserror::Error;

/// Unified error type for the service binary.
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration loading error.
    #[error("configuration error: {0}")]
    Config(#[from] envy::Error),

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Escrow or registry error.
    #[error("escrow error: {0}")]
    Escrow(#[from] EscrowError),

    /// Reporter service error.
    #[error("reporter error: {0}")]
    Reporter(#[from] ReporterError),

    /// State store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the registry, vault, ledger and engine.
///
/// Every variant is local to the operation that produced it. Nothing here is
/// retried internally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EscrowError {
    /// An event with this identifier is already registered.
    #[error("event {event_id} already exists")]
    AlreadyExists {
        /// The colliding identifier.
        event_id: String,
    },

    /// No event with this identifier.
    #[error("event {event_id} not found")]
    NotFound {
        /// The missing identifier.
        event_id: String,
    },

    /// Caller is not the event's reporter.
    #[error("{caller} is not authorized to resolve event {event_id}")]
    Unauthorized {
        /// Identity that attempted the call.
        caller: String,
        /// Target event.
        event_id: String,
    },

    /// The event has already been resolved.
    #[error("event {event_id} is already resolved")]
    AlreadyResolved {
        /// Target event.
        event_id: String,
    },

    /// Resolution attempted before the settlement time.
    #[error("event {event_id} settles at {settlement_time}, now is {now}")]
    TooEarly {
        /// Target event.
        event_id: String,
        /// Earliest allowed resolution time.
        settlement_time: i64,
        /// Clock reading at the attempt.
        now: i64,
    },

    /// Redemption attempted before resolution.
    #[error("event {event_id} is not resolved yet")]
    NotResolved {
        /// Target event.
        event_id: String,
    },

    /// Mint amount must be positive.
    #[error("invalid amount: {amount}")]
    InvalidAmount {
        /// The rejected amount.
        amount: i64,
    },

    /// Holder's collateral account cannot fund the deposit.
    #[error("insufficient funds: need {required}, have {available}")]
    InsufficientFunds {
        /// Required amount.
        required: u64,
        /// Available amount.
        available: u64,
    },

    /// Vault withdrawal larger than the escrowed balance.
    #[error("insufficient vault balance for {event_id}: requested {requested}, held {available}")]
    InsufficientVaultBalance {
        /// Target event.
        event_id: String,
        /// Requested withdrawal.
        requested: u64,
        /// Escrowed balance.
        available: u64,
    },

    /// Malformed request field.
    #[error("invalid {field}: {reason}")]
    InvalidInput {
        /// Offending field name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// An accounting addition would overflow.
    #[error("arithmetic overflow")]
    Overflow,

    /// Vault and outstanding claims disagree. Internal consistency bug.
    #[error("conservation violated for {event_id}: {detail}")]
    ConservationViolated {
        /// Affected event.
        event_id: String,
        /// Which check failed.
        detail: String,
    },

    /// The change could not be written to the state store. Nothing was applied.
    #[error("storage unavailable: {detail}")]
    Storage {
        /// Underlying store failure.
        detail: String,
    },
}

impl From<StoreError> for EscrowError {
    fn from(e: StoreError) -> Self {
        EscrowError::Storage {
            detail: e.to_string(),
        }
    }
}

impl EscrowError {
    /// Short machine-readable kind, used in API bodies and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            EscrowError::AlreadyExists { .. } => "already_exists",
            EscrowError::NotFound { .. } => "not_found",
            EscrowError::Unauthorized { .. } => "unauthorized",
            EscrowError::AlreadyResolved { .. } => "already_resolved",
            EscrowError::TooEarly { .. } => "too_early",
            EscrowError::NotResolved { .. } => "not_resolved",
            EscrowError::InvalidAmount { .. } => "invalid_amount",
            EscrowError::InsufficientFunds { .. } => "insufficient_funds",
            EscrowError::InsufficientVaultBalance { .. } => "insufficient_vault_balance",
            EscrowError::InvalidInput { .. } => "invalid_input",
            EscrowError::Overflow => "overflow",
            EscrowError::ConservationViolated { .. } => "conservation_violated",
            EscrowError::Storage { .. } => "storage",
        }
    }

    /// Only storage outages are worth retrying. Every other variant is a
    /// logical outcome that the same call would hit again.
    pub fn is_retriable(&self) -> bool {
        matches!(self, EscrowError::Storage { .. })
    }

    /// Whether this error signals a broken internal invariant.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EscrowError::ConservationViolated { .. } | EscrowError::InsufficientVaultBalance { .. }
        )
    }
}

/// State store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite call failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Activity body could not be encoded or decoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A value does not fit the column type.
    #[error("{0} is out of range for storage")]
    OutOfRange(&'static str),

    /// Stored rows do not form a valid state.
    #[error("corrupt state: {0}")]
    Corrupt(String),

    /// A writer panicked while holding the connection.
    #[error("store connection poisoned")]
    Poisoned,
}

/// Reporter service errors.
#[derive(Error, Debug)]
pub enum ReporterError {
    /// The outcome source could not produce a reading.
    #[error("outcome source unavailable: {0}")]
    SourceUnavailable(String),

    /// The outcome source returned data we could not use.
    #[error("malformed outcome data: {0}")]
    MalformedReading(String),

    /// HTTP request failed.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid source URL.
    #[error("invalid source url: {0}")]
    Url(#[from] url::ParseError),

    /// Registry rejected the resolution.
    #[error("resolution rejected: {0}")]
    Escrow(#[from] EscrowError),
}

impl ReporterError {
    /// Transient failures are worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            ReporterError::SourceUnavailable(_) => true,
            ReporterError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ReporterError::Escrow(e) => e.is_retriable(),
            ReporterError::MalformedReading(_) | ReporterError::Url(_) => false,
        }
    }
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, AppError>;
