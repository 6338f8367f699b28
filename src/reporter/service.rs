//! Reporter polling loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::error::{EscrowError, ReporterError};
use crate::metrics;
use crate::registry::{EventFilter, EventRegistry, Identity, MarketEvent};

use super::backoff::BackoffConfig;
use super::source::{Observation, OutcomeSource};

/// Default time between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// What one poll did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Due events owned by this reporter.
    pub pending: usize,
    /// Events resolved by this poll.
    pub resolved: usize,
    /// Events another call resolved first, or not yet due at resolve time.
    pub skipped: usize,
    /// Events whose observation or resolution failed.
    pub failed: usize,
}

/// Trusted reporter: resolves its own events once they are due.
#[derive(Debug)]
pub struct Reporter<S> {
    identity: Identity,
    registry: Arc<EventRegistry>,
    source: S,
    backoff: BackoffConfig,
    poll_interval: Duration,
}

impl<S: OutcomeSource> Reporter<S> {
    /// Create a reporter with default retry and poll settings.
    pub fn new(identity: Identity, registry: Arc<EventRegistry>, source: S) -> Self {
        Self {
            identity,
            registry,
            source,
            backoff: BackoffConfig::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the retry schedule.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Override the poll interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Unresolved events reported by us whose settlement time has passed.
    pub async fn due_events(&self) -> Vec<MarketEvent> {
        let filter = EventFilter {
            reporter: Some(self.identity.to_string()),
            resolved: Some(false),
        };
        let now = self.registry.clock().now();

        self.registry
            .list(&filter)
            .await
            .into_iter()
            .filter(|event| event.settlement_time <= now)
            .collect()
    }

    /// Observe and resolve every due event once.
    #[instrument(skip(self), fields(reporter = %self.identity))]
    pub async fn poll_once(&self) -> PollSummary {
        metrics::inc_reporter_polls();
        let due = self.due_events().await;
        let mut summary = PollSummary {
            pending: due.len(),
            ..Default::default()
        };

        for event in due {
            debug!(event_id = %event.event_id, settlement_time = event.settlement_time, "Event due");

            let observation = match self.observe_with_retry(&event).await {
                Ok(observation) => observation,
                Err(e) => {
                    metrics::inc_reporter_failures();
                    warn!(event_id = %event.event_id, error = %e, "Could not observe outcome");
                    summary.failed += 1;
                    continue;
                }
            };

            info!(
                event_id = %event.event_id,
                reading = observation.reading,
                threshold = observation.threshold,
                outcome = %observation.outcome,
                "Observed outcome"
            );

            match self
                .registry
                .resolve(&event.event_id, observation.outcome, &self.identity)
                .await
            {
                Ok(_) => summary.resolved += 1,
                Err(e @ (EscrowError::AlreadyResolved { .. } | EscrowError::TooEarly { .. })) => {
                    info!(event_id = %event.event_id, reason = %e, "Skipping event");
                    summary.skipped += 1;
                }
                Err(e) => {
                    metrics::inc_reporter_failures();
                    warn!(event_id = %event.event_id, error = %e, "Resolution rejected");
                    summary.failed += 1;
                }
            }
        }

        summary
    }

    async fn observe_with_retry(&self, event: &MarketEvent) -> Result<Observation, ReporterError> {
        let mut attempt = 0;
        loop {
            match self.source.observe(event).await {
                Ok(observation) => return Ok(observation),
                Err(e) if e.is_transient() && attempt < self.backoff.max_retries => {
                    let delay = self.backoff.next_delay(attempt);
                    warn!(
                        event_id = %event.event_id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient source failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Poll immediately, then every interval, until `shutdown` turns true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            reporter = %self.identity,
            interval_s = self.poll_interval.as_secs(),
            "Reporter started"
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let summary = self.poll_once().await;
                    if summary.pending > 0 {
                        info!(
                            pending = summary.pending,
                            resolved = summary.resolved,
                            skipped = summary.skipped,
                            failed = summary.failed,
                            "Poll complete"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reporter stopping");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::clock::ManualClock;
    use crate::registry::{NewEvent, Outcome, RegistryPolicy};

    const T0: i64 = 1_700_000_000;

    /// Fails with a transient error `failures` times, then reads `reading`.
    #[derive(Debug)]
    struct FlakySource {
        failures: AtomicU32,
        calls: AtomicU32,
        reading: i64,
    }

    impl FlakySource {
        fn new(failures: u32, reading: i64) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
                reading,
            }
        }
    }

    impl OutcomeSource for FlakySource {
        async fn observe(&self, _event: &MarketEvent) -> Result<Observation, ReporterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(ReporterError::SourceUnavailable("feed down".to_string()));
            }
            Ok(Observation::from_reading(self.reading, 20))
        }
    }

    /// Resolves the event itself before answering, like a second reporter instance.
    #[derive(Debug)]
    struct RacingSource {
        registry: Arc<EventRegistry>,
    }

    impl OutcomeSource for RacingSource {
        async fn observe(&self, event: &MarketEvent) -> Result<Observation, ReporterError> {
            self.registry
                .resolve(&event.event_id, Outcome::No, &id("oracle"))
                .await?;
            Ok(Observation::from_reading(30, 20))
        }
    }

    fn id(name: &str) -> Identity {
        Identity::new(name).unwrap()
    }

    fn create(registry: &EventRegistry, event_id: &str, settlement: i64, reporter: &str) {
        registry
            .create_event(
                NewEvent {
                    event_id: event_id.to_string(),
                    description: "Traffic > 20km/h".to_string(),
                    settlement_time: settlement,
                    reporter: reporter.to_string(),
                    collateral_asset: "USDC".to_string(),
                },
                &id("admin"),
            )
            .unwrap();
    }

    fn setup() -> (Arc<EventRegistry>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        let registry = Arc::new(EventRegistry::new(clock.clone(), RegistryPolicy::default()));
        (registry, clock)
    }

    #[tokio::test]
    async fn resolves_only_own_due_events() {
        let (registry, clock) = setup();
        create(&registry, "due", T0 + 60, "oracle");
        create(&registry, "later", T0 + 7_200, "oracle");
        create(&registry, "theirs", T0 + 60, "other-oracle");
        clock.advance(60);

        let reporter = Reporter::new(id("oracle"), registry.clone(), FlakySource::new(0, 35))
            .with_backoff(BackoffConfig::immediate(0));
        let summary = reporter.poll_once().await;

        assert_eq!(summary, PollSummary { pending: 1, resolved: 1, skipped: 0, failed: 0 });
        assert_eq!(registry.get("due").await.unwrap().outcome, Some(Outcome::Yes));
        assert!(!registry.get("later").await.unwrap().resolved);
        assert!(!registry.get("theirs").await.unwrap().resolved);

        let again = reporter.poll_once().await;
        assert_eq!(again.pending, 0);
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let (registry, clock) = setup();
        create(&registry, "E", T0 + 1, "oracle");
        clock.advance(1);

        let reporter = Reporter::new(id("oracle"), registry.clone(), FlakySource::new(2, 5))
            .with_backoff(BackoffConfig::immediate(3));
        let summary = reporter.poll_once().await;

        assert_eq!(summary.resolved, 1);
        assert_eq!(reporter.source.calls.load(Ordering::SeqCst), 3);
        assert_eq!(registry.get("E").await.unwrap().outcome, Some(Outcome::No));
    }

    #[tokio::test]
    async fn gives_up_after_max_retries_and_tries_next_poll() {
        let (registry, clock) = setup();
        create(&registry, "E", T0 + 1, "oracle");
        clock.advance(1);

        let reporter = Reporter::new(id("oracle"), registry.clone(), FlakySource::new(3, 25))
            .with_backoff(BackoffConfig::immediate(2));

        let summary = reporter.poll_once().await;
        assert_eq!(summary.failed, 1);
        assert_eq!(reporter.source.calls.load(Ordering::SeqCst), 3);
        assert!(!registry.get("E").await.unwrap().resolved);

        let summary = reporter.poll_once().await;
        assert_eq!(summary.resolved, 1);
    }

    #[tokio::test]
    async fn already_resolved_is_skipped_not_failed() {
        let (registry, clock) = setup();
        create(&registry, "E", T0 + 1, "oracle");
        clock.advance(1);

        let source = RacingSource {
            registry: registry.clone(),
        };
        let reporter = Reporter::new(id("oracle"), registry.clone(), source);
        let summary = reporter.poll_once().await;

        assert_eq!(summary, PollSummary { pending: 1, resolved: 0, skipped: 1, failed: 0 });
        assert_eq!(registry.get("E").await.unwrap().outcome, Some(Outcome::No));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (registry, clock) = setup();
        create(&registry, "E", T0 + 1, "oracle");
        clock.advance(1);

        let reporter = Reporter::new(id("oracle"), registry.clone(), FlakySource::new(0, 30))
            .with_poll_interval(Duration::from_millis(10));
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move { reporter.run(rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("reporter did not stop")
            .unwrap();

        assert!(registry.get("E").await.unwrap().resolved);
    }
}
