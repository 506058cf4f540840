//! Application service orchestration.
//!
//! `Repository` loads a [`Root`] by replaying its stream and saves the root's
//! buffered changes through the store's contiguity-checked append.

use nonempty::NonEmpty;
use thiserror::Error;

use crate::{
    aggregate::{Aggregate, AggregateError, Root},
    envelope::StreamName,
    error::ErrorKind,
    migrate::EventTypeRegistry,
    store::{AppendError, AppendResult, EventStore},
};

/// Error returned when an aggregate cannot be loaded.
#[derive(Debug, Error)]
pub enum LoadError<StoreError>
where
    StoreError: std::error::Error + 'static,
{
    #[error("failed to read stream: {0}")]
    Store(#[source] StoreError),
    #[error("failed to rebuild aggregate state: {0}")]
    Aggregate(#[source] AggregateError),
}

impl<StoreError: std::error::Error + 'static> LoadError<StoreError> {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(_) => ErrorKind::Store,
            Self::Aggregate(e) => e.kind(),
        }
    }
}

/// Error returned by [`Repository::execute`].
#[derive(Debug, Error)]
pub enum CommandError<StoreError>
where
    StoreError: std::error::Error + 'static,
{
    #[error(transparent)]
    Load(LoadError<StoreError>),
    #[error("aggregate rejected command: {0}")]
    Aggregate(#[source] AggregateError),
    #[error("failed to persist events: {0}")]
    Append(#[source] AppendError<StoreError>),
}

impl<StoreError: std::error::Error + 'static> CommandError<StoreError> {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Load(e) => e.kind(),
            Self::Aggregate(e) => e.kind(),
            Self::Append(e) => e.kind(),
        }
    }
}

/// Repository.
#[derive(Clone, Debug)]
pub struct Repository<S> {
    pub(crate) store: S,
}

impl<S: EventStore> Repository<S> {
    #[must_use]
    pub const fn new(store: S) -> Self {
        Self { store }
    }

    #[must_use]
    pub const fn event_store(&self) -> &S {
        &self.store
    }

    /// Load the aggregate `id`, or `None` if its stream is empty.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::Store`] if the stream cannot be read, or
    /// [`LoadError::Aggregate`] if replay fails.
    #[tracing::instrument(skip(self, registry), fields(aggregate_kind = A::KIND))]
    pub async fn load<A: Aggregate>(
        &self,
        id: &str,
        registry: &EventTypeRegistry<A::Event>,
    ) -> Result<Option<Root<A>>, LoadError<S::Error>> {
        let stream = StreamName::for_entity(A::KIND, id);
        let envelopes = self
            .store
            .read_from(&stream, 1)
            .await
            .map_err(LoadError::Store)?;
        if envelopes.is_empty() {
            tracing::trace!("stream is empty");
            return Ok(None);
        }

        let mut root = Root::new(id);
        root.load_changes(envelopes, registry)
            .map_err(LoadError::Aggregate)?;
        tracing::debug!(version = root.version(), "aggregate loaded");
        Ok(Some(root))
    }

    /// Load the aggregate `id`, or start a brand-new root.
    ///
    /// # Errors
    ///
    /// See [`load`](Self::load).
    pub async fn load_or_new<A: Aggregate>(
        &self,
        id: &str,
        registry: &EventTypeRegistry<A::Event>,
    ) -> Result<Root<A>, LoadError<S::Error>> {
        Ok(self
            .load(id, registry)
            .await?
            .unwrap_or_else(|| Root::new(id)))
    }

    /// Append the root's buffered changes and clear them on success.
    ///
    /// Returns `None` without touching the store when nothing is buffered.
    ///
    /// # Errors
    ///
    /// Returns [`AppendError::Contiguity`] when another writer got there
    /// first; reload and retry the command. The root keeps its buffer on
    /// error.
    #[tracing::instrument(skip(self, root), fields(aggregate_kind = A::KIND, id = root.id()))]
    pub async fn save<A: Aggregate>(
        &self,
        root: &mut Root<A>,
    ) -> Result<Option<AppendResult>, AppendError<S::Error>> {
        let Some(changes) = NonEmpty::from_slice(root.changes()) else {
            tracing::trace!("no changes to save");
            return Ok(None);
        };
        let result = self.store.append(&root.stream(), changes).await?;
        root.clear_changes();
        tracing::debug!(last_version = result.last_version, "aggregate saved");
        Ok(Some(result))
    }

    /// Load (or create) the aggregate `id`, run `command` against it and save
    /// the resulting changes.
    ///
    /// `command` raises events on the root; returning an error discards them.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] for load, command or append failures. A
    /// contiguity failure ([`ErrorKind::EntityExists`]) means the command can
    /// be retried against a fresh load.
    pub async fn execute<A, F>(
        &self,
        id: &str,
        registry: &EventTypeRegistry<A::Event>,
        command: F,
    ) -> Result<Root<A>, CommandError<S::Error>>
    where
        A: Aggregate,
        F: FnOnce(&mut Root<A>) -> Result<(), AggregateError>,
    {
        let mut root = self
            .load_or_new(id, registry)
            .await
            .map_err(CommandError::Load)?;
        command(&mut root).map_err(CommandError::Aggregate)?;
        self.save(&mut root).await.map_err(CommandError::Append)?;
        Ok(root)
    }
}
