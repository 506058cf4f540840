//! Postgres-backed tidemark storage.
//!
//! This crate provides `PostgreSQL` implementations of the core tidemark
//! traits:
//!
//! - [`Store`] - An implementation of [`tidemark_core::store::EventStore`] and
//!   [`tidemark_core::store::PublishingStore`]
//! - [`checkpoint::Store`] - An implementation of
//!   [`tidemark_core::checkpoint::CheckpointRepository`]
//!
//! Both use the same database and can share a connection pool.

pub mod checkpoint;
mod error;
mod store;

pub use error::Error;
pub use store::{DEFAULT_PUBLISH_CAPACITY, Store};
