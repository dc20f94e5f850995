use std::future::Future;

use serde_json::Value;

use crate::error::{EngineError, StorageError};
use crate::event::{Event, PendingEvent};
use crate::stream::EventStream;

/// Durable append-only event log.
pub trait EventLog: Send + Sync + 'static {
    /// Every event of one aggregate, ascending by version.
    fn read_aggregate(
        &self,
        aggregate: &str,
    ) -> impl Future<Output = Result<EventStream, StorageError>> + Send;

    /// Events named in `names` with `stamp > after_stamp`, ascending by stamp.
    fn read_projection(
        &self,
        names: &[String],
        after_stamp: u64,
    ) -> impl Future<Output = Result<EventStream, StorageError>> + Send;

    /// Unbounded subscription to newly appended events named in `names`.
    fn read_live(&self, names: &[String]) -> EventStream;

    /// Append `events` to `aggregate` if its head version equals `expected_version`.
    ///
    /// Fails with [`StorageError::Conflict`] and appends nothing otherwise.
    fn append(
        &self,
        aggregate: &str,
        expected_version: u64,
        events: Vec<PendingEvent>,
    ) -> impl Future<Output = Result<Vec<Event>, StorageError>> + Send;

    /// End every live subscription.
    fn close_live(&self);
}

/// Document collection handed to projection event and query handlers.
pub trait Collection: Clone + Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;

    fn put(&self, key: &str, document: Value) -> Result<(), StorageError>;

    /// Returns whether a document was removed.
    fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Every document, ordered by key.
    fn all(&self) -> Result<Vec<(String, Value)>, StorageError>;
}

/// Storage opened for one projection scope.
pub trait ScopeStore: Send + Sync + 'static {
    type Collection: Collection;

    fn collection(&self) -> Self::Collection;

    /// Persist the stamp of the last applied event.
    fn set_watermark(&self, stamp: u64) -> impl Future<Output = Result<(), StorageError>> + Send;
}

/// Durable per-scope projection state.
pub trait StateStore: Send + Sync + 'static {
    type Scope: ScopeStore;

    /// Open `scope`, returning its handle and last persisted watermark (0 if none).
    fn open_scope(
        &self,
        scope: &str,
    ) -> impl Future<Output = Result<(Self::Scope, u64), StorageError>> + Send;
}

impl From<EngineError> for StorageError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Conflict { aggregate, version } => {
                StorageError::Conflict { aggregate, version }
            }
            EngineError::Storage(inner) => inner,
            other => StorageError::Database(other.to_string()),
        }
    }
}

// In-memory implementations for testing
#[cfg(any(test, feature = "test-utils"))]
pub mod memory {
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Arc;

    use parking_lot::RwLock;

    use crate::event::stamp_batch;
    use crate::queue::SequentialQueue;
    use crate::stream::{EventPipe, NameFilter};

    #[derive(Default)]
    struct LogInner {
        events: RwLock<Vec<Event>>,
        pipe: EventPipe,
    }

    /// In-memory event log for testing.
    #[derive(Clone)]
    pub struct InMemoryEventLog {
        inner: Arc<LogInner>,
        appends: SequentialQueue,
    }

    impl Default for InMemoryEventLog {
        fn default() -> Self {
            Self::new()
        }
    }

    impl InMemoryEventLog {
        pub fn new() -> Self {
            Self {
                inner: Arc::new(LogInner::default()),
                appends: SequentialQueue::persistent(),
            }
        }

        /// Every stored event in stamp order.
        pub fn events(&self) -> Vec<Event> {
            self.inner.events.read().clone()
        }

        pub fn head_stamp(&self) -> u64 {
            self.inner.events.read().last().map_or(0, |e| e.stamp)
        }

        pub fn live_subscribers(&self) -> usize {
            self.inner.pipe.downstream_count()
        }
    }

    impl EventLog for InMemoryEventLog {
        async fn read_aggregate(&self, aggregate: &str) -> Result<EventStream, StorageError> {
            let mut events: Vec<Event> = self
                .inner
                .events
                .read()
                .iter()
                .filter(|e| e.aggregate == aggregate)
                .cloned()
                .collect();
            events.sort_by_key(|e| e.version);
            Ok(EventStream::from_events(events))
        }

        async fn read_projection(
            &self,
            names: &[String],
            after_stamp: u64,
        ) -> Result<EventStream, StorageError> {
            let events = self
                .inner
                .events
                .read()
                .iter()
                .filter(|e| e.stamp > after_stamp && names.contains(&e.name))
                .cloned()
                .collect();
            Ok(EventStream::from_events(events))
        }

        fn read_live(&self, names: &[String]) -> EventStream {
            self.inner
                .pipe
                .attach(Some(NameFilter::new(names.iter().cloned())))
        }

        async fn append(
            &self,
            aggregate: &str,
            expected_version: u64,
            events: Vec<PendingEvent>,
        ) -> Result<Vec<Event>, StorageError> {
            let inner = self.inner.clone();
            let aggregate = aggregate.to_string();

            let appended = self
                .appends
                .submit(move || async move {
                    let mut stored = inner.events.write();
                    let current = stored
                        .iter()
                        .filter(|e| e.aggregate == aggregate)
                        .map(|e| e.version)
                        .max()
                        .unwrap_or(0);
                    if current != expected_version {
                        return Err(EngineError::Conflict {
                            aggregate,
                            version: expected_version,
                        });
                    }

                    let last_stamp = stored.last().map_or(0, |e| e.stamp);
                    let batch = stamp_batch(&aggregate, expected_version, last_stamp, events);
                    stored.extend(batch.iter().cloned());
                    drop(stored);

                    for event in &batch {
                        inner.pipe.write(event);
                    }
                    Ok(batch)
                })
                .await?;
            Ok(appended)
        }

        fn close_live(&self) {
            self.inner.pipe.end();
        }
    }

    /// In-memory document collection for testing.
    #[derive(Clone, Default)]
    pub struct InMemoryCollection {
        documents: Arc<RwLock<BTreeMap<String, Value>>>,
    }

    impl Collection for InMemoryCollection {
        fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
            Ok(self.documents.read().get(key).cloned())
        }

        fn put(&self, key: &str, document: Value) -> Result<(), StorageError> {
            self.documents.write().insert(key.to_string(), document);
            Ok(())
        }

        fn delete(&self, key: &str) -> Result<bool, StorageError> {
            Ok(self.documents.write().remove(key).is_some())
        }

        fn all(&self) -> Result<Vec<(String, Value)>, StorageError> {
            Ok(self
                .documents
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect())
        }
    }

    /// In-memory projection scope for testing.
    pub struct InMemoryScope {
        name: String,
        collection: InMemoryCollection,
        watermarks: Arc<RwLock<HashMap<String, u64>>>,
    }

    impl ScopeStore for InMemoryScope {
        type Collection = InMemoryCollection;

        fn collection(&self) -> InMemoryCollection {
            self.collection.clone()
        }

        async fn set_watermark(&self, stamp: u64) -> Result<(), StorageError> {
            self.watermarks.write().insert(self.name.clone(), stamp);
            Ok(())
        }
    }

    /// In-memory state store for testing.
    #[derive(Clone, Default)]
    pub struct InMemoryStateStore {
        collections: Arc<RwLock<HashMap<String, InMemoryCollection>>>,
        watermarks: Arc<RwLock<HashMap<String, u64>>>,
    }

    impl InMemoryStateStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn watermark(&self, scope: &str) -> u64 {
            self.watermarks.read().get(scope).copied().unwrap_or(0)
        }

        pub fn collection(&self, scope: &str) -> InMemoryCollection {
            self.collections
                .write()
                .entry(scope.to_string())
                .or_default()
                .clone()
        }
    }

    impl StateStore for InMemoryStateStore {
        type Scope = InMemoryScope;

        async fn open_scope(&self, scope: &str) -> Result<(InMemoryScope, u64), StorageError> {
            let handle = InMemoryScope {
                name: scope.to_string(),
                collection: self.collection(scope),
                watermarks: self.watermarks.clone(),
            };
            Ok((handle, self.watermark(scope)))
        }
    }

}
