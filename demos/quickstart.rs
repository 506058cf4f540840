//! A minimal example demonstrating the core concepts of tidemark.
//!
//! Run with: `cargo run --example quickstart`

// NB: the 'ANCHOR's support embedding in mdbook in docs/ directory.

// ANCHOR: full_example
use std::{
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tidemark::{
    Aggregate, CancellationToken, DomainEvent, EventEnvelope, EventSet, Projection,
    ProjectionRegistry, ProjectionWorker, ReadModelProjector, Repository, RuleViolation,
    StreamName, checkpoint::inmemory as checkpoints, ensure, event_set, store::inmemory,
};

// ANCHOR: events
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountOpened {
    pub owner: String,
}

impl DomainEvent for AccountOpened {
    const KIND: &'static str = "account-opened";
    const TYPE_TOKEN: &'static str = "bank.v1.account-opened";
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundsDeposited {
    pub amount: i64,
}

impl DomainEvent for FundsDeposited {
    const KIND: &'static str = "funds-deposited";
    const TYPE_TOKEN: &'static str = "bank.v1.funds-deposited";
}

event_set! {
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum AccountEvent {
        Opened(AccountOpened),
        Deposited(FundsDeposited),
    }
}
// ANCHOR_END: events

// ANCHOR: aggregate
#[derive(Clone, Debug, Default)]
pub struct Account {
    owner: String,
    balance: i64,
}

impl Aggregate for Account {
    const KIND: &'static str = "account";
    type Event = AccountEvent;

    fn on_state_changed(&mut self, event: &AccountEvent) -> Result<(), RuleViolation> {
        match event {
            AccountEvent::Opened(e) => self.owner.clone_from(&e.owner),
            AccountEvent::Deposited(e) => {
                ensure!(e.amount > 0, "deposit of {} must be positive", e.amount);
                self.balance += e.amount;
            }
        }
        Ok(())
    }

    fn ensure_invariants(&self) -> Result<(), RuleViolation> {
        ensure!(!self.owner.is_empty(), "an account needs an owner");
        Ok(())
    }
}
// ANCHOR_END: aggregate

// ANCHOR: projection
#[derive(Clone, Debug, Default)]
pub struct TotalDeposits {
    pub total: Arc<AtomicI64>,
}

impl Projection for TotalDeposits {
    const NAME: &'static str = "total-deposits";
    const AGGREGATE_KIND: &'static str = "account";
    type Event = AccountEvent;
    type Error = std::convert::Infallible;

    async fn project_event(
        &self,
        _envelope: &EventEnvelope,
        event: &AccountEvent,
    ) -> Result<bool, Self::Error> {
        if let AccountEvent::Deposited(e) = event {
            self.total.fetch_add(e.amount, Ordering::SeqCst);
        }
        Ok(true)
    }
}
// ANCHOR_END: projection

// ANCHOR: main
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let store = inmemory::Store::new();
    let repository = Repository::new(store.clone());
    let registry = AccountEvent::registry();

    // Start the read side before writing so it sees every batch
    let totals = TotalDeposits::default();
    let checkpoints = checkpoints::Store::new();
    let projections = ProjectionRegistry::new().with(totals.clone(), AccountEvent::registry())?;
    let projector = ReadModelProjector::new(projections, checkpoints.clone());
    let worker = ProjectionWorker::new(store, projector).spawn(CancellationToken::new());

    repository
        .execute::<Account, _>("ACC-001", &registry, |account| {
            account.raise_create_event(AccountOpened {
                owner: "ada".into(),
            })
        })
        .await?;
    let account = repository
        .execute::<Account, _>("ACC-001", &registry, |account| {
            account.raise_change_event(FundsDeposited { amount: 100 })
        })
        .await?;
    println!("Balance after deposit: {}", account.state().balance);

    // Wait for the worker to move the checkpoint past version 2
    let stream = StreamName::for_entity(Account::KIND, "ACC-001");
    while checkpoints.get(&stream) != Some(3) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let summary = worker.stop().await?;
    println!(
        "Total deposits: {} ({} events projected)",
        totals.total.load(Ordering::SeqCst),
        summary.projected
    );
    assert_eq!(totals.total.load(Ordering::SeqCst), 100);

    Ok(())
}
// ANCHOR_END: main
// ANCHOR_END: full_example
