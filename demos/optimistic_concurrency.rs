//! Demonstrates contiguity-checked appends under concurrent writers.
//!
//! Every append is checked against the stored head of the stream. When two
//! writers load the same version and both raise events, the second save is
//! rejected with [`ErrorKind::EntityExists`]; the loser reloads and retries.
//!
//! Run with: `cargo run --example optimistic_concurrency`

use serde::{Deserialize, Serialize};
use tidemark::{
    Aggregate, DomainEvent, ErrorKind, EventSet, Repository, RuleViolation, ensure, event_set,
    store::inmemory,
};

// =============================================================================
// Domain Events
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStocked {
    pub quantity: u32,
}

impl DomainEvent for ItemStocked {
    const KIND: &'static str = "item-stocked";
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemReserved {
    pub quantity: u32,
}

impl DomainEvent for ItemReserved {
    const KIND: &'static str = "item-reserved";
}

event_set! {
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum InventoryEvent {
        Stocked(ItemStocked),
        Reserved(ItemReserved),
    }
}

// =============================================================================
// Aggregate
// =============================================================================

#[derive(Clone, Debug, Default)]
pub struct InventoryItem {
    available: u32,
}

impl Aggregate for InventoryItem {
    const KIND: &'static str = "inventory-item";
    type Event = InventoryEvent;

    fn on_state_changed(&mut self, event: &InventoryEvent) -> Result<(), RuleViolation> {
        match event {
            InventoryEvent::Stocked(e) => self.available += e.quantity,
            InventoryEvent::Reserved(e) => {
                ensure!(
                    e.quantity <= self.available,
                    "cannot reserve {} of {} available",
                    e.quantity,
                    self.available
                );
                self.available -= e.quantity;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Example
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let repository = Repository::new(inmemory::Store::new());
    let registry = InventoryEvent::registry();

    repository
        .execute::<InventoryItem, _>("SKU-42", &registry, |item| {
            item.raise_create_event(ItemStocked { quantity: 10 })
        })
        .await?;

    // Two writers load the same version
    let mut alice = repository
        .load::<InventoryItem>("SKU-42", &registry)
        .await?
        .ok_or("item not found")?;
    let mut bob = repository
        .load::<InventoryItem>("SKU-42", &registry)
        .await?
        .ok_or("item not found")?;

    alice.raise_change_event(ItemReserved { quantity: 6 })?;
    bob.raise_change_event(ItemReserved { quantity: 6 })?;

    repository.save(&mut alice).await?;
    println!("alice reserved 6, stream at version {}", alice.version());

    let conflict = repository
        .save(&mut bob)
        .await
        .expect_err("bob's version is stale");
    assert_eq!(conflict.kind(), ErrorKind::EntityExists);
    println!("bob was rejected: {conflict}");

    // Bob reloads and retries against the fresh state; now the domain says no
    let retry = repository
        .execute::<InventoryItem, _>("SKU-42", &registry, |item| {
            item.raise_change_event(ItemReserved { quantity: 6 })
        })
        .await;
    let rejected = retry.expect_err("only 4 left");
    assert_eq!(rejected.kind(), ErrorKind::RuleViolation);
    println!("bob's retry was refused: {rejected}");

    let item = repository
        .load::<InventoryItem>("SKU-42", &registry)
        .await?
        .ok_or("item not found")?;
    println!("{} available at version {}", item.state().available, item.version());
    assert_eq!(item.state().available, 4);

    Ok(())
}
