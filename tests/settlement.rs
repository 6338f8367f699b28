//! End-to-end settlement scenarios against the public library API.

use std::sync::Arc;

use pretty_assertions::assert_eq;

use prediction_escrow::clock::ManualClock;
use prediction_escrow::escrow::{CollateralBank, InMemoryBank, MintPolicy, SettlementEngine};
use prediction_escrow::registry::{
    AssetId, EventRegistry, Identity, NewEvent, Outcome, RegistryPolicy,
};
use prediction_escrow::EscrowError;

const T0: i64 = 1_700_000_000;
const SETTLES_AT: i64 = T0 + 3_600;

struct Market {
    clock: Arc<ManualClock>,
    registry: Arc<EventRegistry>,
    bank: Arc<InMemoryBank>,
    engine: SettlementEngine,
}

fn id(name: &str) -> Identity {
    Identity::new(name).unwrap()
}

fn usdc() -> AssetId {
    AssetId::new("USDC").unwrap()
}

fn market(policy: MintPolicy) -> Market {
    let clock = Arc::new(ManualClock::new(T0));
    let registry = Arc::new(EventRegistry::new(clock.clone(), RegistryPolicy::default()));
    let bank = Arc::new(InMemoryBank::new());
    let engine = SettlementEngine::new(registry.clone(), bank.clone(), policy);
    Market {
        clock,
        registry,
        bank,
        engine,
    }
}

impl Market {
    fn create(&self, event_id: &str) {
        self.registry
            .create_event(
                NewEvent {
                    event_id: event_id.to_string(),
                    description: "Shibuya crossing congestion above 20km/h".to_string(),
                    settlement_time: SETTLES_AT,
                    reporter: "oracle".to_string(),
                    collateral_asset: "USDC".to_string(),
                },
                &id("admin"),
            )
            .unwrap();
    }

    fn fund(&self, holder: &str, amount: u64) {
        self.bank.fund(&id(holder), &usdc(), amount).unwrap();
    }

    fn balance(&self, holder: &str) -> u64 {
        self.bank.balance(&id(holder), &usdc())
    }

    async fn settle(&self, event_id: &str, outcome: Outcome) {
        self.clock.set(SETTLES_AT);
        self.registry
            .resolve(event_id, outcome, &id("oracle"))
            .await
            .unwrap();
    }

    async fn assert_conserved(&self) {
        for book in self.registry.records().await {
            book.check_conservation().unwrap();
        }
    }
}

#[tokio::test]
async fn winner_is_paid_in_full() {
    let m = market(MintPolicy::default());
    m.create("E");
    m.fund("alice", 500);

    let position = m.engine.mint("E", 100, &id("alice")).await.unwrap();
    assert_eq!((position.yes_amount, position.no_amount), (100, 100));
    assert_eq!(m.balance("alice"), 400);
    assert_eq!(m.registry.get("E").await.unwrap().vault_balance, 100);

    m.settle("E", Outcome::Yes).await;
    let redemption = m.engine.redeem("E", &id("alice")).await.unwrap();

    assert_eq!(redemption.amount_paid, 100);
    assert_eq!(redemption.side, Outcome::Yes);
    assert_eq!(m.balance("alice"), 500);
    assert_eq!(m.registry.get("E").await.unwrap().vault_balance, 0);
    m.assert_conserved().await;
}

#[tokio::test]
async fn losing_side_is_worthless() {
    let m = market(MintPolicy::default());
    m.create("E");
    m.fund("alice", 100);
    m.engine.mint("E", 100, &id("alice")).await.unwrap();

    m.settle("E", Outcome::No).await;
    let redemption = m.engine.redeem("E", &id("alice")).await.unwrap();
    assert_eq!(redemption.amount_paid, 100);

    // YES claims stay on the books but redeem for nothing.
    let position = m.registry.position("E", &id("alice")).await.unwrap();
    assert_eq!((position.yes_amount, position.no_amount), (100, 0));
    let again = m.engine.redeem("E", &id("alice")).await.unwrap();
    assert_eq!(again.amount_paid, 0);
    m.assert_conserved().await;
}

#[tokio::test]
async fn multiple_holders_drain_vault_exactly() {
    let m = market(MintPolicy::default());
    m.create("E");
    m.fund("alice", 70);
    m.fund("bob", 30);
    m.engine.mint("E", 70, &id("alice")).await.unwrap();
    m.engine.mint("E", 30, &id("bob")).await.unwrap();
    assert_eq!(m.registry.get("E").await.unwrap().vault_balance, 100);

    m.settle("E", Outcome::Yes).await;
    assert_eq!(m.engine.redeem("E", &id("alice")).await.unwrap().amount_paid, 70);
    assert_eq!(m.registry.get("E").await.unwrap().vault_balance, 30);
    assert_eq!(m.engine.redeem("E", &id("bob")).await.unwrap().amount_paid, 30);
    assert_eq!(m.registry.get("E").await.unwrap().vault_balance, 0);

    assert_eq!(m.balance("alice"), 70);
    assert_eq!(m.balance("bob"), 30);
    m.assert_conserved().await;
}

#[tokio::test]
async fn resolution_is_not_early_and_not_repeated() {
    let m = market(MintPolicy::default());
    m.create("E");

    m.clock.set(SETTLES_AT - 1);
    let err = m
        .registry
        .resolve("E", Outcome::Yes, &id("oracle"))
        .await
        .unwrap_err();
    assert!(matches!(err, EscrowError::TooEarly { .. }));

    m.clock.set(SETTLES_AT);
    m.registry.resolve("E", Outcome::Yes, &id("oracle")).await.unwrap();

    let err = m
        .registry
        .resolve("E", Outcome::No, &id("oracle"))
        .await
        .unwrap_err();
    assert!(matches!(err, EscrowError::AlreadyResolved { .. }));
    assert_eq!(m.registry.get("E").await.unwrap().outcome, Some(Outcome::Yes));
}

#[tokio::test]
async fn redeem_before_resolution_moves_nothing() {
    let m = market(MintPolicy::default());
    m.create("E");
    m.fund("alice", 10);
    m.engine.mint("E", 10, &id("alice")).await.unwrap();

    let err = m.engine.redeem("E", &id("alice")).await.unwrap_err();
    assert!(matches!(err, EscrowError::NotResolved { .. }));
    assert_eq!(m.balance("alice"), 0);
    assert_eq!(m.registry.get("E").await.unwrap().vault_balance, 10);
}

#[tokio::test]
async fn failed_mint_leaves_no_trace() {
    let m = market(MintPolicy::default());
    m.create("E");
    m.fund("alice", 10);

    let err = m.engine.mint("E", 11, &id("alice")).await.unwrap_err();
    assert!(matches!(err, EscrowError::InsufficientFunds { required: 11, available: 10 }));
    assert_eq!(m.balance("alice"), 10);

    let event = m.registry.get("E").await.unwrap();
    assert_eq!(event.vault_balance, 0);
    assert_eq!(m.registry.activity("E").await.unwrap().len(), 1);
}

#[tokio::test]
async fn mint_after_resolution_follows_policy() {
    let strict = market(MintPolicy::default());
    strict.create("E");
    strict.fund("alice", 10);
    strict.settle("E", Outcome::Yes).await;
    let err = strict.engine.mint("E", 5, &id("alice")).await.unwrap_err();
    assert!(matches!(err, EscrowError::AlreadyResolved { .. }));
    assert_eq!(strict.balance("alice"), 10);

    let lenient = market(MintPolicy {
        allow_after_resolution: true,
    });
    lenient.create("E");
    lenient.fund("alice", 10);
    lenient.settle("E", Outcome::Yes).await;
    lenient.engine.mint("E", 5, &id("alice")).await.unwrap();
    lenient.assert_conserved().await;
    assert_eq!(lenient.engine.redeem("E", &id("alice")).await.unwrap().amount_paid, 5);
    assert_eq!(lenient.balance("alice"), 10);
}

#[tokio::test]
async fn conservation_holds_across_mixed_sequence() {
    let m = market(MintPolicy::default());
    m.create("A");
    m.create("B");
    for holder in ["h0", "h1", "h2", "h3"] {
        m.fund(holder, 1_000);
    }

    for round in 0..20u64 {
        let holder = format!("h{}", round % 4);
        let event = if round % 3 == 0 { "B" } else { "A" };
        m.engine.mint(event, (round + 1) as i64, &id(&holder)).await.unwrap();
        m.assert_conserved().await;
    }

    m.settle("A", Outcome::Yes).await;
    m.registry.resolve("B", Outcome::No, &id("oracle")).await.unwrap();

    let mut paid = 0;
    for holder in ["h0", "h1", "h2", "h3"] {
        for event in ["A", "B"] {
            paid += m.engine.redeem(event, &id(holder)).await.unwrap().amount_paid;
            m.assert_conserved().await;
        }
    }

    let minted: u64 = (1..=20).sum();
    assert_eq!(paid, minted);
    let total: u64 = ["h0", "h1", "h2", "h3"].iter().map(|h| m.balance(h)).sum();
    assert_eq!(total, 4_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_mints_are_all_counted() {
    let m = Arc::new(market(MintPolicy::default()));
    m.create("E");
    for n in 0..16 {
        m.fund(&format!("h{}", n), 100);
    }

    let mut tasks = Vec::new();
    for n in 0..16 {
        let m = m.clone();
        tasks.push(tokio::spawn(async move {
            let holder = id(&format!("h{}", n));
            for _ in 0..10 {
                m.engine.mint("E", 10, &holder).await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let event = m.registry.get("E").await.unwrap();
    assert_eq!(event.vault_balance, 1_600);
    m.assert_conserved().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_double_redeem_pays_once() {
    let m = Arc::new(market(MintPolicy::default()));
    m.create("E");
    m.fund("alice", 100);
    m.engine.mint("E", 100, &id("alice")).await.unwrap();
    m.settle("E", Outcome::Yes).await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let m = m.clone();
        tasks.push(tokio::spawn(async move {
            m.engine.redeem("E", &id("alice")).await.unwrap().amount_paid
        }));
    }

    let mut payouts = Vec::new();
    for task in tasks {
        payouts.push(task.await.unwrap());
    }
    payouts.sort_unstable();

    assert_eq!(payouts.iter().sum::<u64>(), 100);
    assert_eq!(payouts.last(), Some(&100));
    assert_eq!(m.balance("alice"), 100);
    m.assert_conserved().await;
}
