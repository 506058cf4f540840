//! Domain event markers.
//!
//! `DomainEvent` is the lightweight trait every concrete event struct
//! implements. Aggregates group their events into a sum type implementing
//! [`EventSet`]; the [`event_set!`](crate::event_set) macro writes that enum
//! and its plumbing for you.

use crate::migrate::EventTypeRegistry;

/// Marker trait for events that can be persisted in an envelope.
///
/// [`Self::KIND`] is the event-type name stored alongside the payload.
/// [`Self::TYPE_TOKEN`] is the fully-qualified type identity used to route
/// stored payloads back to a concrete type. It defaults to `KIND`; give it a
/// namespaced value (for example `"booking.v1.created"`) when several
/// aggregates share event names or when you expect to relocate types.
pub trait DomainEvent {
    const KIND: &'static str;
    const TYPE_TOKEN: &'static str = Self::KIND;
}

/// Instance-level access to [`DomainEvent::KIND`].
///
/// Blanket-implemented for every [`DomainEvent`]; you never implement it
/// yourself.
pub trait EventKind {
    fn kind(&self) -> &'static str;
}

impl<T: DomainEvent> EventKind for T {
    fn kind(&self) -> &'static str {
        T::KIND
    }
}

/// Sum type over the events of one aggregate.
///
/// The runtime uses this to build envelopes when events are raised, and the
/// default [`registry`](EventSet::registry) to decode them again on replay.
pub trait EventSet: Sized {
    /// Event-type name of the wrapped event.
    fn kind(&self) -> &'static str;

    /// Type token of the wrapped event.
    fn type_token(&self) -> &'static str;

    /// Serialize the wrapped event (not the enum tag) to JSON.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if the event cannot be represented as
    /// JSON.
    fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error>;

    /// A registry that knows every current event type of this set.
    ///
    /// Add renames and upcasts to the returned registry before handing it to
    /// the repository or the projector.
    fn registry() -> EventTypeRegistry<Self>;
}

/// Declare an aggregate's event enum together with its [`EventSet`] impl.
///
/// Every variant wraps exactly one [`DomainEvent`] struct. The macro emits
/// the enum, a `From` conversion per variant, and an [`EventSet`] impl whose
/// registry registers every variant's type token.
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use tidemark_core::{event::{DomainEvent, EventSet}, event_set};
///
/// #[derive(Clone, Debug, Serialize, Deserialize)]
/// struct Opened { owner: String }
///
/// impl DomainEvent for Opened {
///     const KIND: &'static str = "opened";
/// }
///
/// event_set! {
///     #[derive(Clone, Debug)]
///     enum AccountEvent {
///         Opened(Opened),
///     }
/// }
///
/// let event: AccountEvent = Opened { owner: "ada".into() }.into();
/// assert_eq!(event.kind(), "opened");
/// ```
#[macro_export]
macro_rules! event_set {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident($event:ty) ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis enum $name {
            $( $(#[$vmeta])* $variant($event), )+
        }

        $(
            impl ::core::convert::From<$event> for $name {
                fn from(event: $event) -> Self {
                    Self::$variant(event)
                }
            }
        )+

        impl $crate::event::EventSet for $name {
            fn kind(&self) -> &'static str {
                match self {
                    $( Self::$variant(_) => <$event as $crate::event::DomainEvent>::KIND, )+
                }
            }

            fn type_token(&self) -> &'static str {
                match self {
                    $( Self::$variant(_) => <$event as $crate::event::DomainEvent>::TYPE_TOKEN, )+
                }
            }

            fn to_payload(
                &self,
            ) -> ::core::result::Result<
                $crate::__private::serde_json::Value,
                $crate::__private::serde_json::Error,
            > {
                match self {
                    $( Self::$variant(event) => $crate::__private::serde_json::to_value(event), )+
                }
            }

            fn registry() -> $crate::migrate::EventTypeRegistry<Self> {
                $crate::migrate::EventTypeRegistry::new()
                    $( .with::<$event>() )+
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    struct SeatsReserved {
        seats: u32,
    }

    impl DomainEvent for SeatsReserved {
        const KIND: &'static str = "seats-reserved";
        const TYPE_TOKEN: &'static str = "booking.v2.seats-reserved";
    }

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    struct SeatsReleased {
        seats: u32,
    }

    impl DomainEvent for SeatsReleased {
        const KIND: &'static str = "seats-released";
    }

    event_set! {
        #[derive(Clone, Debug, PartialEq, Eq)]
        enum SeatEvent {
            Reserved(SeatsReserved),
            Released(SeatsReleased),
        }
    }

    #[test]
    fn type_token_defaults_to_kind() {
        assert_eq!(SeatsReleased::TYPE_TOKEN, "seats-released");
        assert_eq!(SeatsReserved::TYPE_TOKEN, "booking.v2.seats-reserved");
    }

    #[test]
    fn event_kind_is_blanket_implemented() {
        assert_eq!(SeatsReserved { seats: 1 }.kind(), "seats-reserved");
    }

    #[test]
    fn event_set_reports_variant_identity() {
        let event = SeatEvent::from(SeatsReserved { seats: 2 });
        assert_eq!(EventSet::kind(&event), "seats-reserved");
        assert_eq!(event.type_token(), "booking.v2.seats-reserved");
    }

    #[test]
    fn payload_is_the_inner_event_without_enum_tag() {
        let event = SeatEvent::from(SeatsReleased { seats: 3 });
        assert_eq!(event.to_payload().unwrap(), serde_json::json!({ "seats": 3 }));
    }

    #[test]
    fn generated_registry_decodes_every_variant() {
        let registry = SeatEvent::registry();
        let decoded = registry
            .rehydrate(
                &serde_json::json!({ "seats": 4 }),
                "seats-reserved",
                "booking.v2.seats-reserved",
            )
            .unwrap();
        assert_eq!(decoded, SeatEvent::Reserved(SeatsReserved { seats: 4 }));
    }
}
