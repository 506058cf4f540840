//! Versioned Events Example
//!
//! Demonstrates replaying history written by older versions of an event
//! schema. The [`EventTypeRegistry`] maps obsolete type tokens onto the
//! current types and rewrites old payloads on the way in.
//!
//! This example shows:
//! - **Upcasting**: `shop.v1.order-placed` stored `qty`; the current type
//!   wants `quantity` and an optional customer
//! - **Renaming**: `shop.order-shipped` moved to `shop.v2.order-shipped`
//!   with the same payload
//! - **Relocation by name**: a token nobody registered still resolves when
//!   exactly one current type has the same event-type name
//!
//! Run with: `cargo run --example versioned_events`

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tidemark::{
    Aggregate, DomainEvent, EventEnvelope, EventSet, EventTypeRegistry, Repository,
    RuleViolation, StreamName, event_set,
    store::{EventStore, NonEmpty, inmemory},
};

// =============================================================================
// Current event types
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub product: String,
    pub quantity: u32,
    #[serde(default)]
    pub customer_id: Option<String>,
}

impl DomainEvent for OrderPlaced {
    const KIND: &'static str = "order-placed";
    const TYPE_TOKEN: &'static str = "shop.v2.order-placed";
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderShipped {
    pub carrier: String,
}

impl DomainEvent for OrderShipped {
    const KIND: &'static str = "order-shipped";
    const TYPE_TOKEN: &'static str = "shop.v2.order-shipped";
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDelivered {}

impl DomainEvent for OrderDelivered {
    const KIND: &'static str = "order-delivered";
    const TYPE_TOKEN: &'static str = "shop.v2.order-delivered";
}

event_set! {
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum OrderEvent {
        Placed(OrderPlaced),
        Shipped(OrderShipped),
        Delivered(OrderDelivered),
    }
}

#[derive(Clone, Debug, Default)]
pub struct Order {
    product: String,
    quantity: u32,
    carrier: Option<String>,
    delivered: bool,
}

impl Aggregate for Order {
    const KIND: &'static str = "order";
    type Event = OrderEvent;

    fn on_state_changed(&mut self, event: &OrderEvent) -> Result<(), RuleViolation> {
        match event {
            OrderEvent::Placed(e) => {
                self.product.clone_from(&e.product);
                self.quantity = e.quantity;
            }
            OrderEvent::Shipped(e) => self.carrier = Some(e.carrier.clone()),
            OrderEvent::Delivered(_) => self.delivered = true,
        }
        Ok(())
    }
}

// =============================================================================
// Migrations
// =============================================================================

fn order_placed_v1_to_v2(mut payload: Value) -> Value {
    if let Some(fields) = payload.as_object_mut()
        && let Some(qty) = fields.remove("qty")
    {
        fields.insert("quantity".into(), qty);
    }
    payload
}

fn registry() -> EventTypeRegistry<OrderEvent> {
    OrderEvent::registry()
        .upcast(
            "shop.v1.order-placed",
            OrderPlaced::TYPE_TOKEN,
            order_placed_v1_to_v2,
        )
        .rename("shop.order-shipped", OrderShipped::TYPE_TOKEN)
}

/// An envelope as an older release would have written it.
fn legacy(version: u64, event_type: &str, type_token: &str, payload: Value) -> EventEnvelope {
    let mut envelope = EventEnvelope::record(
        Order::KIND,
        "ORD-7",
        &OrderEvent::Delivered(OrderDelivered {}),
        version,
        Utc::now(),
    )
    .expect("serializable");
    envelope.event_type = event_type.into();
    envelope.type_token = type_token.into();
    envelope.payload = payload;
    envelope
}

// =============================================================================
// Example
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let store = inmemory::Store::new();
    let stream = StreamName::for_entity(Order::KIND, "ORD-7");

    let history = NonEmpty::from_vec(vec![
        legacy(
            1,
            "order-placed",
            "shop.v1.order-placed",
            json!({ "product": "kettle", "qty": 2 }),
        ),
        legacy(
            2,
            "order-shipped",
            "shop.order-shipped",
            json!({ "carrier": "postnl" }),
        ),
        legacy(3, "order-delivered", "legacy.OrderDelivered", json!({})),
    ])
    .ok_or("history is empty")?;
    store.append(&stream, history).await?;

    let registry = registry();
    for envelope in store.read_from(&stream, 1).await? {
        println!(
            "{} -> {}",
            envelope.type_token,
            registry.resolve(&envelope.event_type, &envelope.type_token)?
        );
    }

    let repository = Repository::new(store);
    let order = repository
        .load::<Order>("ORD-7", &registry)
        .await?
        .ok_or("order not found")?;

    println!("{:?}", order.state());
    assert_eq!(order.state().quantity, 2);
    assert_eq!(order.state().carrier.as_deref(), Some("postnl"));
    assert!(order.state().delivered);

    // Without the migrations the v1 placement cannot be read
    let bare = OrderEvent::registry();
    let decoded = bare.decode(&legacy(
        1,
        "order-placed",
        "shop.v1.order-placed",
        json!({ "product": "kettle", "qty": 2 }),
    ));
    println!("bare registry: {}", decoded.expect_err("qty is not quantity"));

    Ok(())
}
