//! In-memory checkpoint repository.

use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{Arc, RwLock},
};

use super::{CheckpointRepository, STARTING_CHECKPOINT};
use crate::envelope::StreamName;

/// Checkpoints held in a shared hash map.
///
/// Clones share the same checkpoints.
#[derive(Clone, Debug, Default)]
pub struct Store {
    checkpoints: Arc<RwLock<HashMap<StreamName, u64>>>,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored checkpoint, without falling back to
    /// [`STARTING_CHECKPOINT`].
    #[must_use]
    pub fn get(&self, stream: &StreamName) -> Option<u64> {
        self.checkpoints
            .read()
            .expect("in-memory checkpoint lock poisoned")
            .get(stream)
            .copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.checkpoints
            .read()
            .expect("in-memory checkpoint lock poisoned")
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CheckpointRepository for Store {
    type Error = Infallible;

    #[tracing::instrument(skip(self, stream), fields(%stream))]
    fn load_checkpoint<'a>(
        &'a self,
        stream: &'a StreamName,
    ) -> impl Future<Output = Result<u64, Self::Error>> + Send + 'a {
        let checkpoint = self.get(stream).unwrap_or(STARTING_CHECKPOINT);
        tracing::trace!(checkpoint, "checkpoint loaded");
        std::future::ready(Ok(checkpoint))
    }

    #[tracing::instrument(skip(self, stream), fields(%stream))]
    fn save_checkpoint<'a>(
        &'a self,
        stream: &'a StreamName,
        version: u64,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a {
        self.checkpoints
            .write()
            .expect("in-memory checkpoint lock poisoned")
            .insert(stream.clone(), version);
        tracing::debug!("checkpoint saved");
        std::future::ready(Ok(()))
    }
}
