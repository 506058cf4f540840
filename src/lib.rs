#![doc = include_str!("../README.md")]

#[cfg(feature = "test-util")]
pub use tidemark_core::test;
pub use tidemark_core::{
    aggregate,
    aggregate::{Aggregate, AggregateError, DehydratedEntity, EntityMeta, Root},
    contiguity,
    contiguity::{ContiguityError, Continuation},
    entity,
    entity::{ApplyChange, Children, Entity},
    ensure,
    envelope,
    envelope::{EventEnvelope, StreamName},
    error,
    error::{BoxError, ErrorKind, RuleViolation},
    event,
    event::{DomainEvent, EventKind, EventSet},
    event_set,
    migrate,
    migrate::{EventTypeRegistry, MigrationError},
    projection,
    projection::{DuplicateProjection, Projection, ProjectionRegistry},
    projector,
    projector::{ProjectionReport, ProjectorError, ReadModelProjector},
    repository,
    repository::{CommandError, LoadError, Repository},
    worker,
    worker::{ProjectionWorker, WorkerHandle, WorkerSummary},
};
// Re-exported so callers can build cancellation scopes without a direct
// tokio-util dependency.
pub use tokio_util::sync::CancellationToken;

pub mod store {
    pub use tidemark_core::store::{
        EventStore, NonEmpty, Published, PublishedStream, PublishingStore, StreamBatch,
    };

    // Low-level append types for EventStore implementors. Most users should
    // interact with the Repository API instead.
    pub use tidemark_core::store::{AppendError, AppendOutcome, AppendResult};

    #[cfg(feature = "postgres")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
    pub mod postgres {
        pub use tidemark_postgres::{DEFAULT_PUBLISH_CAPACITY, Error, Store};
    }

    pub use tidemark_core::store::inmemory;
}

pub mod checkpoint {
    pub use tidemark_core::checkpoint::{CheckpointRepository, STARTING_CHECKPOINT};

    pub use tidemark_core::checkpoint::inmemory;

    #[cfg(feature = "postgres")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
    pub mod postgres {
        pub use tidemark_postgres::{Error, checkpoint::Store};
    }
}
