//! Ledgerfold Core - event-sourced aggregations, projections and the context
//! routing commands and queries between them.
//!
//! This crate holds the engine and the storage traits it depends on. Durable
//! storage lives in `ledgerfold-db`.

pub mod aggregation;
pub mod context;
pub mod error;
pub mod event;
pub mod projection;
pub mod queue;
pub mod scope;
pub mod storage;
pub mod stream;

// Re-exports for convenience
pub use aggregation::{Aggregation, AggregationDef, AggregationDescriptor, Emitter};
pub use context::{CollectionOf, Context, LiveHandle};
pub use error::{EngineError, HandlerError, StorageError};
pub use event::{Event, PendingEvent};
pub use projection::{Consumption, HandlerGroup, Projection, ProjectionDef, ProjectionDescriptor};
pub use queue::{QueueStatus, SequentialQueue};
pub use scope::{qualify, scope_of};
pub use storage::{Collection, EventLog, ScopeStore, StateStore};
pub use stream::{EventPipe, EventSink, EventStream, NameFilter};

#[cfg(any(test, feature = "test-utils"))]
pub use storage::memory::{InMemoryCollection, InMemoryEventLog, InMemoryScope, InMemoryStateStore};
