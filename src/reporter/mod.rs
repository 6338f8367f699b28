//! Trusted reporter service.
//!
//! Polls the registry for its own unresolved events, observes each due
//! event's condition from an outcome source, and records the outcome.
//! Repeated or early resolutions are logged and skipped; the loop keeps going.

pub mod backoff;
pub mod service;
pub mod source;

pub use backoff::BackoffConfig;
pub use service::{PollSummary, Reporter, DEFAULT_POLL_INTERVAL};
pub use source::{
    ConfiguredSource, HttpSource, Observation, OutcomeSource, ReadingResponse, SimulatedSource,
};
