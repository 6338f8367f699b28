//! Outcome sources: where the reporter gets the observed condition.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::config::Config;
use crate::error::ReporterError;
use crate::registry::{MarketEvent, Outcome};

/// Upper bound (exclusive) for simulated congestion readings, in km/h.
pub const SIMULATED_READING_RANGE: u64 = 40;

/// HTTP source request timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// A reading and the outcome it implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// Raw measured value.
    pub reading: i64,
    /// Threshold the reading was compared against.
    pub threshold: i64,
    /// YES when `reading > threshold`.
    pub outcome: Outcome,
}

impl Observation {
    /// Build an observation by comparing against a threshold.
    pub fn from_reading(reading: i64, threshold: i64) -> Self {
        Self {
            reading,
            threshold,
            outcome: Outcome::from(reading > threshold),
        }
    }
}

/// Produces the observed outcome for an event.
pub trait OutcomeSource: Send + Sync {
    /// Observe the condition for `event`.
    fn observe(
        &self,
        event: &MarketEvent,
    ) -> impl Future<Output = Result<Observation, ReporterError>> + Send;
}

/// Deterministic stand-in for a traffic feed.
///
/// The reading is an FNV-1a hash of the event id and settlement time, so the
/// same event resolves the same way on every run and every build.
#[derive(Debug, Clone)]
pub struct SimulatedSource {
    threshold: i64,
}

impl SimulatedSource {
    pub fn new(threshold: i64) -> Self {
        Self { threshold }
    }

    /// Reading this source reports for an event.
    pub fn reading_for(event_id: &str, settlement_time: i64) -> i64 {
        const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

        let hash = event_id
            .bytes()
            .chain(settlement_time.to_le_bytes())
            .fold(FNV_OFFSET, |hash, byte| {
                (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
            });
        (hash % SIMULATED_READING_RANGE) as i64
    }
}

impl OutcomeSource for SimulatedSource {
    async fn observe(&self, event: &MarketEvent) -> Result<Observation, ReporterError> {
        let reading = Self::reading_for(&event.event_id, event.settlement_time);
        Ok(Observation::from_reading(reading, self.threshold))
    }
}

/// Reading returned by the HTTP feed.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadingResponse {
    /// Measured value.
    pub value: i64,
}

/// Fetches readings from `GET {base}/readings/{event_id}`.
#[derive(Debug, Clone)]
pub struct HttpSource {
    http: reqwest::Client,
    base: Url,
    threshold: i64,
}

impl HttpSource {
    /// Create a source for the given base URL.
    pub fn new(base_url: &str, threshold: i64) -> Result<Self, ReporterError> {
        let base = Url::parse(base_url)?;
        if base.cannot_be_a_base() {
            return Err(ReporterError::Url(
                url::ParseError::RelativeUrlWithCannotBeABaseBase,
            ));
        }

        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            http,
            base,
            threshold,
        })
    }

    /// URL queried for an event. Event ids are percent-encoded as one segment.
    pub fn reading_url(&self, event_id: &str) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("readings").push(event_id);
        }
        url
    }
}

impl OutcomeSource for HttpSource {
    async fn observe(&self, event: &MarketEvent) -> Result<Observation, ReporterError> {
        let url = self.reading_url(&event.event_id);
        debug!(%url, "Fetching reading");

        let response = self.http.get(url).send().await?;
        let status = response.status();
        if status.is_server_error() {
            return Err(ReporterError::SourceUnavailable(format!("feed returned {}", status)));
        }
        if !status.is_success() {
            return Err(ReporterError::MalformedReading(format!("feed returned {}", status)));
        }

        let body: ReadingResponse = response.json().await?;
        Ok(Observation::from_reading(body.value, self.threshold))
    }
}

/// Source selected by configuration.
#[derive(Debug, Clone)]
pub enum ConfiguredSource {
    Simulated(SimulatedSource),
    Http(HttpSource),
}

impl ConfiguredSource {
    /// Build the source named by `OUTCOME_SOURCE`.
    pub fn from_config(config: &Config) -> Result<Self, ReporterError> {
        match config.outcome_source_lower().as_str() {
            "http" => {
                let url = config.outcome_source_url.as_deref().ok_or_else(|| {
                    ReporterError::SourceUnavailable("OUTCOME_SOURCE_URL is not set".to_string())
                })?;
                Ok(Self::Http(HttpSource::new(url, config.congestion_threshold)?))
            }
            _ => Ok(Self::Simulated(SimulatedSource::new(config.congestion_threshold))),
        }
    }
}

impl OutcomeSource for ConfiguredSource {
    async fn observe(&self, event: &MarketEvent) -> Result<Observation, ReporterError> {
        match self {
            ConfiguredSource::Simulated(source) => source.observe(event).await,
            ConfiguredSource::Http(source) => source.observe(event).await,
        }
    }
}
