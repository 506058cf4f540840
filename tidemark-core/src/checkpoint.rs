//! Durable per-stream projection cursors.
//!
//! A checkpoint is the version of the next event the projector has not yet
//! consumed for a stream. A stream that was never projected sits at
//! [`STARTING_CHECKPOINT`].

use std::future::Future;

use crate::envelope::StreamName;

pub mod inmemory;

/// Checkpoint of a stream that has never been projected.
pub const STARTING_CHECKPOINT: u64 = 1;

/// Key-value store of checkpoints keyed by stream name.
///
/// The projector reads once and writes at most once per batch; concurrent
/// batches for the same stream must be serialized by the caller.
// ANCHOR: checkpoint_trait
pub trait CheckpointRepository: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// The stored checkpoint, or [`STARTING_CHECKPOINT`] if none exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    fn load_checkpoint<'a>(
        &'a self,
        stream: &'a StreamName,
    ) -> impl Future<Output = Result<u64, Self::Error>> + Send + 'a;

    /// Create or replace the checkpoint for `stream`.
    ///
    /// Saving the same value twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    fn save_checkpoint<'a>(
        &'a self,
        stream: &'a StreamName,
        version: u64,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;
}
// ANCHOR_END: checkpoint_trait
