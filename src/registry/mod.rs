//! Event registry: creation, resolution and lookup of market events.
//!
//! Each event lives in its own [`EventBook`] behind a dedicated lock, so
//! operations on different events run in parallel while operations on the
//! same event are strictly ordered. Every change is written to the
//! [`Journal`] before it is applied in memory.

pub mod book;
pub mod types;

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::clock::Clock;
use crate::error::EscrowError;
use crate::escrow::UserPosition;
use crate::metrics;
use crate::store::{Journal, NoJournal};

pub use book::{BookChange, EventBook};
pub use types::{
    ActivityEntry, ActivityKind, AssetId, EventFilter, EventTerms, Identity, MarketEvent,
    NewEvent, Outcome, Resolution,
};

/// Registry-level creation rules.
#[derive(Debug, Clone, Copy)]
pub struct RegistryPolicy {
    /// Reject events whose settlement time is not after creation time.
    pub require_future_settlement: bool,
}

impl Default for RegistryPolicy {
    fn default() -> Self {
        Self {
            require_future_settlement: true,
        }
    }
}

/// Keyed store of event books.
#[derive(Debug)]
pub struct EventRegistry {
    books: DashMap<String, Arc<Mutex<EventBook>>>,
    clock: Arc<dyn Clock>,
    policy: RegistryPolicy,
    journal: Arc<dyn Journal>,
}

impl EventRegistry {
    /// Create an empty, in-memory registry.
    pub fn new(clock: Arc<dyn Clock>, policy: RegistryPolicy) -> Self {
        Self {
            books: DashMap::new(),
            clock,
            policy,
            journal: Arc::new(NoJournal),
        }
    }

    /// Write every change through `journal`.
    pub fn with_journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = journal;
        self
    }

    /// Rebuild a registry from saved books, re-checking each one.
    pub fn restore(
        books: Vec<EventBook>,
        clock: Arc<dyn Clock>,
        policy: RegistryPolicy,
    ) -> Result<Self, EscrowError> {
        let registry = Self::new(clock, policy);

        for book in books {
            book.check_conservation()?;
            let event_id = book.event_id().to_string();
            match registry.books.entry(event_id.clone()) {
                Entry::Occupied(_) => return Err(EscrowError::AlreadyExists { event_id }),
                Entry::Vacant(slot) => {
                    slot.insert(Arc::new(Mutex::new(book)));
                }
            }
        }

        info!(events = registry.len(), "Registry restored");
        Ok(registry)
    }

    /// Where changes are persisted.
    pub fn journal(&self) -> &Arc<dyn Journal> {
        &self.journal
    }

    /// Time source used for settlement checks.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Number of registered events.
    pub fn len(&self) -> usize {
        self.books.len()
    }

    /// Whether no events are registered.
    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }

    /// Register a new event with an empty vault.
    #[instrument(skip(self, request), fields(event_id = %request.event_id, creator = %creator))]
    pub fn create_event(
        &self,
        request: NewEvent,
        creator: &Identity,
    ) -> Result<MarketEvent, EscrowError> {
        let _timer = metrics::timer_op("create_event");
        let now = self.clock.now();
        let terms = EventTerms::from_request(request, creator.clone(), now)?;

        if self.policy.require_future_settlement && terms.settlement_time <= now {
            return Err(EscrowError::InvalidInput {
                field: "settlement_time",
                reason: format!("{} is not after now ({})", terms.settlement_time, now),
            });
        }

        let event_id = terms.event_id.clone();
        let view = match self.books.entry(event_id.clone()) {
            Entry::Occupied(_) => {
                warn!("Event id already taken");
                return Err(EscrowError::AlreadyExists { event_id });
            }
            Entry::Vacant(slot) => {
                let book = EventBook::new(terms);
                self.journal.insert_event(&book).inspect_err(|e| {
                    warn!(error = %e, "Event not persisted");
                })?;
                let view = book.snapshot();
                slot.insert(Arc::new(Mutex::new(book)));
                view
            }
        };

        metrics::inc_events_created();
        info!(
            settlement_time = view.settlement_time,
            reporter = %view.reporter,
            asset = %view.collateral_asset,
            "Event created"
        );
        Ok(view)
    }

    /// Record the outcome of an event. Only its reporter may call this, once,
    /// at or after the settlement time.
    #[instrument(skip(self), fields(caller = %caller))]
    pub async fn resolve(
        &self,
        event_id: &str,
        outcome: Outcome,
        caller: &Identity,
    ) -> Result<MarketEvent, EscrowError> {
        let _timer = metrics::timer_op("resolve");
        let handle = self.book(event_id)?;
        let mut book = handle.lock().await;

        if &book.terms.reporter != caller {
            warn!("Resolve rejected: caller is not the reporter");
            return Err(EscrowError::Unauthorized {
                caller: caller.to_string(),
                event_id: event_id.to_string(),
            });
        }

        if book.is_resolved() {
            return Err(EscrowError::AlreadyResolved {
                event_id: event_id.to_string(),
            });
        }

        let now = self.clock.now();
        if now < book.terms.settlement_time {
            return Err(EscrowError::TooEarly {
                event_id: event_id.to_string(),
                settlement_time: book.terms.settlement_time,
                now,
            });
        }

        let change = book.stage_resolution(outcome, now, caller.clone());
        book.check_change(&change)?;
        self.journal.apply(&change, &[]).inspect_err(|e| {
            warn!(error = %e, "Resolution not persisted");
        })?;
        book.commit(change)?;
        metrics::inc_resolutions(outcome);
        info!(%outcome, vault_balance = book.vault.balance(), "Event resolved");

        Ok(book.snapshot())
    }

    /// Fetch one event.
    pub async fn get(&self, event_id: &str) -> Result<MarketEvent, EscrowError> {
        let handle = self.book(event_id)?;
        let book = handle.lock().await;
        Ok(book.snapshot())
    }

    /// List events passing `filter`, ordered by identifier.
    pub async fn list(&self, filter: &EventFilter) -> Vec<MarketEvent> {
        let views = join_all(
            self.handles()
                .into_iter()
                .map(|handle| async move {
                    let book = handle.lock().await;
                    book.snapshot()
                }),
        )
        .await;

        let mut events: Vec<MarketEvent> =
            views.into_iter().filter(|view| filter.matches(view)).collect();
        events.sort_by(|a, b| a.event_id.cmp(&b.event_id));
        events
    }

    /// Audit trail of one event.
    pub async fn activity(&self, event_id: &str) -> Result<Vec<ActivityEntry>, EscrowError> {
        let handle = self.book(event_id)?;
        let book = handle.lock().await;
        Ok(book.activity().to_vec())
    }

    /// Position of `holder` on `event_id`; empty if the holder never minted.
    pub async fn position(
        &self,
        event_id: &str,
        holder: &Identity,
    ) -> Result<UserPosition, EscrowError> {
        let handle = self.book(event_id)?;
        let book = handle.lock().await;
        Ok(book.ledger.get(holder))
    }

    /// Copies of every book, ordered by identifier.
    pub async fn records(&self) -> Vec<EventBook> {
        let mut records = join_all(
            self.handles()
                .into_iter()
                .map(|handle| async move {
                    let book = handle.lock().await;
                    book.clone()
                }),
        )
        .await;
        records.sort_by(|a, b| a.event_id().cmp(b.event_id()));
        records
    }

    /// Lock handle for one event.
    pub(crate) fn book(&self, event_id: &str) -> Result<Arc<Mutex<EventBook>>, EscrowError> {
        self.books
            .get(event_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EscrowError::NotFound {
                event_id: event_id.to_string(),
            })
    }

    // Collected up front so no map guard is held across an await.
    fn handles(&self) -> Vec<Arc<Mutex<EventBook>>> {
        self.books
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::testing::SwitchableJournal;
    use pretty_assertions::assert_eq;

    const T0: i64 = 1_700_000_000;

    fn id(name: &str) -> Identity {
        Identity::new(name).unwrap()
    }

    fn request(event_id: &str, settlement_time: i64) -> NewEvent {
        NewEvent {
            event_id: event_id.to_string(),
            description: "Traffic > 20km/h".to_string(),
            settlement_time,
            reporter: "oracle".to_string(),
            collateral_asset: "USDC".to_string(),
        }
    }

    fn registry() -> (EventRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        let registry = EventRegistry::new(clock.clone(), RegistryPolicy::default());
        (registry, clock)
    }

    #[tokio::test]
    async fn create_event_starts_active_with_empty_vault() {
        let (registry, _) = registry();
        let event = registry
            .create_event(request("E", T0 + 3_600), &id("admin"))
            .unwrap();

        assert!(!event.resolved);
        assert_eq!(event.vault_balance, 0);
        assert_eq!(event.created_at, T0);
        assert_eq!(event.creator, id("admin"));
        assert_eq!(registry.get("E").await.unwrap(), event);
    }

    #[tokio::test]
    async fn duplicate_event_id_is_rejected() {
        let (registry, _) = registry();
        registry.create_event(request("E", T0 + 10), &id("admin")).unwrap();

        let err = registry
            .create_event(request("E", T0 + 20), &id("someone-else"))
            .unwrap_err();
        assert_eq!(err, EscrowError::AlreadyExists { event_id: "E".to_string() });
        assert_eq!(registry.get("E").await.unwrap().settlement_time, T0 + 10);
    }

    #[tokio::test]
    async fn past_settlement_rejected_unless_policy_allows() {
        let (registry, _) = registry();
        let err = registry.create_event(request("E", T0), &id("admin")).unwrap_err();
        assert!(matches!(err, EscrowError::InvalidInput { field: "settlement_time", .. }));

        let lenient = EventRegistry::new(
            Arc::new(ManualClock::new(T0)),
            RegistryPolicy {
                require_future_settlement: false,
            },
        );
        assert!(lenient.create_event(request("E", T0 - 1), &id("admin")).is_ok());
    }

    #[tokio::test]
    async fn resolve_enforces_reporter_timing_and_once() {
        let (registry, clock) = registry();
        registry.create_event(request("E", T0 + 3_600), &id("admin")).unwrap();

        let err = registry.resolve("E", Outcome::Yes, &id("oracle")).await.unwrap_err();
        assert!(matches!(err, EscrowError::TooEarly { settlement_time, now, .. }
            if settlement_time == T0 + 3_600 && now == T0));

        clock.advance(3_600);
        let err = registry.resolve("E", Outcome::Yes, &id("mallory")).await.unwrap_err();
        assert!(matches!(err, EscrowError::Unauthorized { .. }));

        let event = registry.resolve("E", Outcome::Yes, &id("oracle")).await.unwrap();
        assert!(event.resolved);
        assert_eq!(event.outcome, Some(Outcome::Yes));
        assert_eq!(event.resolved_at, Some(T0 + 3_600));

        let err = registry.resolve("E", Outcome::No, &id("oracle")).await.unwrap_err();
        assert_eq!(err, EscrowError::AlreadyResolved { event_id: "E".to_string() });
        assert_eq!(registry.get("E").await.unwrap().outcome, Some(Outcome::Yes));
    }

    #[tokio::test]
    async fn unknown_event_is_not_found() {
        let (registry, _) = registry();
        assert!(matches!(registry.get("nope").await, Err(EscrowError::NotFound { .. })));
        assert!(matches!(
            registry.resolve("nope", Outcome::No, &id("oracle")).await,
            Err(EscrowError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn list_filters_by_reporter_and_state() {
        let (registry, clock) = registry();
        registry.create_event(request("B", T0 + 5), &id("admin")).unwrap();
        registry.create_event(request("A", T0 + 5), &id("admin")).unwrap();
        let mut other = request("C", T0 + 5);
        other.reporter = "other-oracle".to_string();
        registry.create_event(other, &id("admin")).unwrap();

        clock.advance(5);
        registry.resolve("B", Outcome::No, &id("oracle")).await.unwrap();

        let all = registry.list(&EventFilter::default()).await;
        let ids: Vec<&str> = all.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);

        let pending = registry
            .list(&EventFilter {
                reporter: Some("oracle".to_string()),
                resolved: Some(false),
            })
            .await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_id, "A");
    }

    #[tokio::test]
    async fn unpersisted_changes_are_not_applied() {
        let journal = Arc::new(SwitchableJournal::default());
        let clock = Arc::new(ManualClock::new(T0));
        let registry = EventRegistry::new(clock.clone(), RegistryPolicy::default())
            .with_journal(journal.clone());
        registry.create_event(request("E", T0 + 5), &id("admin")).unwrap();

        journal.set_down(true);
        let err = registry.create_event(request("F", T0 + 5), &id("admin")).unwrap_err();
        assert!(matches!(err, EscrowError::Storage { .. }));
        assert!(matches!(registry.get("F").await, Err(EscrowError::NotFound { .. })));

        clock.advance(5);
        let err = registry.resolve("E", Outcome::Yes, &id("oracle")).await.unwrap_err();
        assert!(matches!(err, EscrowError::Storage { .. }));
        assert!(!registry.get("E").await.unwrap().resolved);
        assert_eq!(registry.activity("E").await.unwrap().len(), 1);

        journal.set_down(false);
        let event = registry.resolve("E", Outcome::Yes, &id("oracle")).await.unwrap();
        assert_eq!(event.outcome, Some(Outcome::Yes));
    }

    #[tokio::test]
    async fn restore_rejects_duplicate_books() {
        let (registry, _) = registry();
        registry.create_event(request("E", T0 + 5), &id("admin")).unwrap();
        let mut records = registry.records().await;
        records.push(records[0].clone());

        let err = EventRegistry::restore(
            records,
            Arc::new(ManualClock::new(T0)),
            RegistryPolicy::default(),
        )
        .unwrap_err();
        assert!(matches!(err, EscrowError::AlreadyExists { .. }));
    }
}
