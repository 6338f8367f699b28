//! Event records, identities and the audit log.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::EscrowError;

/// Maximum event identifier length in bytes.
pub const MAX_EVENT_ID_LEN: usize = 32;
/// Maximum description length in bytes.
pub const MAX_DESCRIPTION_LEN: usize = 256;
/// Maximum identity / asset identifier length in bytes.
pub const MAX_IDENTITY_LEN: usize = 64;

fn check_token(field: &'static str, value: &str, max_len: usize) -> Result<(), EscrowError> {
    let invalid = |reason: String| EscrowError::InvalidInput { field, reason };

    if value.is_empty() {
        return Err(invalid("must not be empty".to_string()));
    }
    if value.len() > max_len {
        return Err(invalid(format!("longer than {} bytes", max_len)));
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(invalid("must not contain whitespace".to_string()));
    }
    Ok(())
}

/// Identity of a holder, reporter or creator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Validate and wrap an identity string.
    pub fn new(value: impl Into<String>) -> Result<Self, EscrowError> {
        let value = value.into();
        check_token("identity", &value, MAX_IDENTITY_LEN)?;
        Ok(Self(value))
    }

    /// Borrow the raw identity.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a fungible collateral asset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(String);

impl AssetId {
    /// Validate and wrap an asset identifier.
    pub fn new(value: impl Into<String>) -> Result<Self, EscrowError> {
        let value = value.into();
        check_token("collateral_asset", &value, MAX_IDENTITY_LEN)?;
        Ok(Self(value))
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolved outcome of an event, and the claim side it makes payable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The YES condition occurred.
    #[strum(to_string = "yes", serialize = "YES", serialize = "true")]
    Yes,
    /// The YES condition did not occur.
    #[strum(to_string = "no", serialize = "NO", serialize = "false")]
    No,
}

impl Outcome {
    /// Boolean form: true means YES.
    pub fn as_bool(&self) -> bool {
        matches!(self, Outcome::Yes)
    }

    /// The other side.
    pub fn opposite(&self) -> Self {
        match self {
            Outcome::Yes => Outcome::No,
            Outcome::No => Outcome::Yes,
        }
    }
}

impl From<bool> for Outcome {
    fn from(value: bool) -> Self {
        if value {
            Outcome::Yes
        } else {
            Outcome::No
        }
    }
}

/// Raw request to register an event.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NewEvent {
    /// Human-chosen unique identifier.
    pub event_id: String,
    /// Condition text.
    pub description: String,
    /// Earliest resolution time (Unix seconds).
    pub settlement_time: i64,
    /// Sole party allowed to resolve.
    pub reporter: String,
    /// Collateral asset for deposits and payouts.
    pub collateral_asset: String,
}

/// Immutable terms fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTerms {
    pub event_id: String,
    pub description: String,
    pub settlement_time: i64,
    pub reporter: Identity,
    pub collateral_asset: AssetId,
    pub creator: Identity,
    pub created_at: i64,
}

impl EventTerms {
    /// Validate a creation request.
    pub fn from_request(
        request: NewEvent,
        creator: Identity,
        created_at: i64,
    ) -> Result<Self, EscrowError> {
        check_token("event_id", &request.event_id, MAX_EVENT_ID_LEN)?;

        if request.description.len() > MAX_DESCRIPTION_LEN {
            return Err(EscrowError::InvalidInput {
                field: "description",
                reason: format!("longer than {} bytes", MAX_DESCRIPTION_LEN),
            });
        }

        Ok(Self {
            event_id: request.event_id,
            description: request.description,
            settlement_time: request.settlement_time,
            reporter: Identity::new(request.reporter)?,
            collateral_asset: AssetId::new(request.collateral_asset)?,
            creator,
            created_at,
        })
    }
}

/// Recorded resolution. Written once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub outcome: Outcome,
    pub resolved_at: i64,
}

/// Read view of an event with its current vault balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketEvent {
    pub event_id: String,
    pub description: String,
    pub settlement_time: i64,
    pub reporter: Identity,
    pub collateral_asset: AssetId,
    pub creator: Identity,
    pub created_at: i64,
    pub resolved: bool,
    /// Set once `resolved` is true.
    pub outcome: Option<Outcome>,
    pub resolved_at: Option<i64>,
    pub vault_balance: u64,
}

/// One entry of an event's append-only audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntry {
    /// Position in the log, starting at 0.
    pub seq: u64,
    /// Clock time of the operation.
    pub at: i64,
    /// What happened.
    #[serde(flatten)]
    pub kind: ActivityKind,
}

/// Audited operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityKind {
    Created { creator: Identity },
    Minted { holder: Identity, amount: u64 },
    Resolved { reporter: Identity, outcome: Outcome },
    Redeemed { holder: Identity, side: Outcome, amount: u64 },
}

/// Filters for listing events.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventFilter {
    /// Only events with this reporter.
    pub reporter: Option<String>,
    /// Only events with this resolution state.
    pub resolved: Option<bool>,
}

impl EventFilter {
    /// Whether `event` passes the filter.
    pub fn matches(&self, event: &MarketEvent) -> bool {
        if let Some(reporter) = &self.reporter {
            if event.reporter.as_str() != reporter {
                return false;
            }
        }
        if let Some(resolved) = self.resolved {
            if event.resolved != resolved {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn request(event_id: &str) -> NewEvent {
        NewEvent {
            event_id: event_id.to_string(),
            description: "Shibuya congestion > 30km/h".to_string(),
            settlement_time: 3_600,
            reporter: "oracle".to_string(),
            collateral_asset: "USDC".to_string(),
        }
    }

    #[test]
    fn outcome_from_string_works() {
        assert_eq!(Outcome::from_str("yes").unwrap(), Outcome::Yes);
        assert_eq!(Outcome::from_str("NO").unwrap(), Outcome::No);
        assert_eq!(Outcome::from_str("true").unwrap(), Outcome::Yes);
        assert_eq!(Outcome::from(false), Outcome::No);
        assert_eq!(Outcome::Yes.opposite(), Outcome::No);
        assert!(Outcome::Yes.as_bool());
    }

    #[test]
    fn identity_rejects_blank_and_spaced_values() {
        assert!(Identity::new("").is_err());
        assert!(Identity::new("two words").is_err());
        assert!(Identity::new("x".repeat(MAX_IDENTITY_LEN + 1)).is_err());
        assert_eq!(Identity::new("alice").unwrap().as_str(), "alice");
    }

    #[test]
    fn terms_validate_event_id_and_description() {
        let creator = Identity::new("admin").unwrap();

        assert!(EventTerms::from_request(request("TOKYO-SHIBUYA-7"), creator.clone(), 0).is_ok());

        let too_long = "E".repeat(MAX_EVENT_ID_LEN + 1);
        let err = EventTerms::from_request(request(&too_long), creator.clone(), 0).unwrap_err();
        assert!(matches!(err, EscrowError::InvalidInput { field: "event_id", .. }));

        let mut wordy = request("E1");
        wordy.description = "d".repeat(MAX_DESCRIPTION_LEN + 1);
        let err = EventTerms::from_request(wordy, creator.clone(), 0).unwrap_err();
        assert!(matches!(err, EscrowError::InvalidInput { field: "description", .. }));

        let mut bad_asset = request("E2");
        bad_asset.collateral_asset = String::new();
        let err = EventTerms::from_request(bad_asset, creator, 0).unwrap_err();
        assert!(matches!(err, EscrowError::InvalidInput { field: "collateral_asset", .. }));
    }

    #[test]
    fn activity_serializes_with_type_tag() {
        let entry = ActivityEntry {
            seq: 2,
            at: 10,
            kind: ActivityKind::Minted {
                holder: Identity::new("h").unwrap(),
                amount: 5,
            },
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "minted");
        assert_eq!(json["amount"], 5);
        assert_eq!(json["holder"], "h");
    }
}
