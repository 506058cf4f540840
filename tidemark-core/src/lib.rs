//! Core traits and types for the tidemark event-sourcing engine.
//!
//! This crate provides the write-side/read-side consistency engine:
//!
//! - [`aggregate`] - Aggregate runtime (`Aggregate`, `Root`, `EntityMeta`)
//! - [`entity`] - Child entities owned by an aggregate (`Entity`, `Children`)
//! - [`event`] - Event marker traits (`DomainEvent`, `EventSet`, `event_set!`)
//! - [`envelope`] - The stored form of an event (`EventEnvelope`, `StreamName`)
//! - [`migrate`] - Type-token resolution and payload upcasting
//!   (`EventTypeRegistry`)
//! - [`contiguity`] - Optimistic-concurrency guard for appends
//! - [`store`] - Event persistence abstraction (`EventStore`, `PublishingStore`)
//! - [`repository`] - Aggregate load/save orchestration (`Repository`)
//! - [`checkpoint`] - Per-stream projection cursors (`CheckpointRepository`)
//! - [`projection`] / [`projector`] - Read-model projections and the
//!   checkpointed projector
//! - [`worker`] - Background projection driven by store publications
//! - [`error`] - Shared error classification (`ErrorKind`, `RuleViolation`)
//!
//! # Example
//!
//! ```
//! use tidemark_core::{repository::Repository, store::inmemory};
//!
//! // Create an in-memory store and repository
//! let repo = Repository::new(inmemory::Store::new());
//! ```
//!
//! Most users should depend on the `tidemark` crate, which re-exports these
//! types with a flatter API surface.

pub mod aggregate;
pub mod checkpoint;
pub mod contiguity;
pub mod entity;
pub mod envelope;
pub mod error;
pub mod event;
pub mod migrate;
pub mod projection;
pub mod projector;
pub mod repository;
pub mod store;
pub mod worker;

// Test utilities module: public when feature enabled, internal for crate tests
#[cfg(feature = "test-util")]
pub mod test;

#[cfg(all(test, not(feature = "test-util")))]
pub(crate) mod test;

#[doc(hidden)]
pub mod __private {
    pub use serde_json;
}
