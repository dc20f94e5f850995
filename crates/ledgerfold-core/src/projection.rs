//! Read-side projections.
//!
//! A projection folds events into its scope's document collection through a
//! private fail-fast [`SequentialQueue`], persisting the stamp of every
//! applied event as its watermark. Queries run directly against the
//! collection and are not serialized with event application.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{EngineError, HandlerError};
use crate::event::Event;
use crate::queue::{QueueStatus, SequentialQueue};
use crate::scope::qualify_all;
use crate::storage::ScopeStore;
use crate::stream::EventStream;

/// Applies one event to a collection: `(collection, aggregate, payload, date)`.
pub type EventHandler<C> = Arc<
    dyn Fn(C, String, Value, DateTime<Utc>) -> BoxFuture<'static, Result<(), HandlerError>>
        + Send
        + Sync,
>;

/// Answers one query against a collection: `(collection, payload)`.
pub type QueryHandler<C> =
    Arc<dyn Fn(C, Value) -> BoxFuture<'static, Result<Value, HandlerError>> + Send + Sync>;

fn event_handler<C, F, Fut>(handler: F) -> EventHandler<C>
where
    F: Fn(C, String, Value, DateTime<Utc>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |collection, aggregate, payload, date| {
        handler(collection, aggregate, payload, date).boxed()
    })
}

/// An entry of a projection's event handler tree.
pub enum HandlerNode<C> {
    /// A handler registered under an already qualified name.
    Handler(EventHandler<C>),
    /// Handlers registered under local names of a sub-scope.
    Group(Vec<(String, EventHandler<C>)>),
}

/// Handlers sharing one sub-scope, e.g. every `todo.*` event.
pub struct HandlerGroup<C> {
    handlers: Vec<(String, EventHandler<C>)>,
}

impl<C> Default for HandlerGroup<C> {
    fn default() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }
}

impl<C: Send + 'static> HandlerGroup<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(C, String, Value, DateTime<Utc>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.handlers.push((name.to_string(), event_handler(handler)));
        self
    }
}

/// Read-side registration: a scope, an event handler tree and query handlers.
pub struct ProjectionDef<C> {
    pub scope: String,
    events: Vec<(String, HandlerNode<C>)>,
    queries: Vec<(String, QueryHandler<C>)>,
}

impl<C: Send + 'static> ProjectionDef<C> {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            events: Vec::new(),
            queries: Vec::new(),
        }
    }

    /// Register a handler under a fully qualified event name.
    pub fn on<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(C, String, Value, DateTime<Utc>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.events
            .push((name.to_string(), HandlerNode::Handler(event_handler(handler))));
        self
    }

    /// Register a group of handlers qualified by `sub_scope`.
    pub fn group(mut self, sub_scope: &str, group: HandlerGroup<C>) -> Self {
        self.events
            .push((sub_scope.to_string(), HandlerNode::Group(group.handlers)));
        self
    }

    /// Register a query handler under a local name.
    pub fn query<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(C, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        let handler: QueryHandler<C> =
            Arc::new(move |collection, payload| handler(collection, payload).boxed());
        self.queries.push((name.to_string(), handler));
        self
    }
}

/// Flatten a handler tree into one map. Later registrations win.
fn flatten<C>(tree: Vec<(String, HandlerNode<C>)>) -> BTreeMap<String, EventHandler<C>> {
    let mut handlers = BTreeMap::new();
    for (key, node) in tree {
        match node {
            HandlerNode::Handler(handler) => {
                handlers.insert(key, handler);
            }
            HandlerNode::Group(group) => handlers.extend(qualify_all(&key, group)),
        }
    }
    handlers
}

/// Public summary returned when a projection is registered.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionDescriptor {
    pub scope: String,
    pub stamp: u64,
    pub events: Vec<String>,
    pub queries: Vec<String>,
}

/// Handle returned by [`Projection::consume`] once its input has ended.
pub struct Consumption {
    queue: SequentialQueue,
}

impl Consumption {
    /// Resolve once every submitted event has been applied; fail with the
    /// first handler or storage failure.
    pub async fn wait_for_drain(&self) -> Result<(), EngineError> {
        self.queue.wait_for_drain().await
    }

    pub fn status(&self) -> QueueStatus {
        self.queue.status()
    }
}

/// The read-side engine for one scope.
pub struct Projection<S: ScopeStore> {
    scope: String,
    handlers: BTreeMap<String, EventHandler<S::Collection>>,
    queries: BTreeMap<String, QueryHandler<S::Collection>>,
    store: S,
    stamp: AtomicU64,
    queue: Mutex<SequentialQueue>,
}

impl<S: ScopeStore> Projection<S> {
    pub fn new(def: ProjectionDef<S::Collection>, store: S, stamp: u64) -> Self {
        Self {
            handlers: flatten(def.events),
            queries: qualify_all(&def.scope, def.queries),
            scope: def.scope,
            store,
            stamp: AtomicU64::new(stamp),
            queue: Mutex::new(SequentialQueue::new()),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Stamp of the last applied event.
    pub fn stamp(&self) -> u64 {
        self.stamp.load(Ordering::Acquire)
    }

    /// Qualified event names, sorted.
    pub fn events(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    /// Qualified query names, sorted.
    pub fn queries(&self) -> Vec<String> {
        self.queries.keys().cloned().collect()
    }

    pub fn has_query(&self, name: &str) -> bool {
        self.queries.contains_key(name)
    }

    pub fn descriptor(&self) -> ProjectionDescriptor {
        ProjectionDescriptor {
            scope: self.scope.clone(),
            stamp: self.stamp(),
            events: self.events(),
            queries: self.queries(),
        }
    }

    /// Submit every event of `stream` for application and return once the
    /// stream has ended.
    ///
    /// Application continues in the background; wait on the returned
    /// [`Consumption`]. Reading stops early if an event fails to apply.
    ///
    /// Every consumer of one projection feeds the same queue, so events are
    /// never applied concurrently. A faulted queue is replaced by the next call.
    pub async fn consume(
        self: &Arc<Self>,
        mut stream: EventStream,
    ) -> Result<Consumption, EngineError> {
        let queue = self.active_queue();

        loop {
            let item = tokio::select! {
                item = stream.next() => item,
                fault = queue.faulted() => {
                    tracing::warn!(scope = %self.scope, error = %fault, "projection stopped consuming");
                    break;
                }
            };
            let Some(item) = item else { break };
            let event = item?;

            let projection = Arc::clone(self);
            if !queue.push(move || async move { projection.apply_one(event).await }) {
                break;
            }
        }

        Ok(Consumption { queue })
    }

    fn active_queue(&self) -> SequentialQueue {
        let mut queue = self.queue.lock();
        if queue.is_cancelled() {
            tracing::info!(scope = %self.scope, "projection queue restarted after fault");
            *queue = SequentialQueue::new();
        }
        queue.clone()
    }

    /// Apply one event if it is newer than the watermark and has a handler.
    pub async fn apply_one(&self, event: Event) -> Result<(), EngineError> {
        if event.stamp <= self.stamp() {
            return Ok(());
        }
        let Some(handler) = self.handlers.get(&event.name) else {
            return Ok(());
        };

        let Event {
            name,
            aggregate,
            payload,
            stamp,
            date,
            ..
        } = event;

        if let Err(e) = handler(self.store.collection(), aggregate, payload, date).await {
            tracing::error!(scope = %self.scope, event = %name, stamp, error = %e, "projection handler failed");
            return Err(e.into());
        }
        self.store.set_watermark(stamp).await?;
        self.stamp.fetch_max(stamp, Ordering::AcqRel);
        Ok(())
    }

    /// Run a query handler against the collection.
    pub async fn answer_query(&self, name: &str, payload: Value) -> Result<Value, EngineError> {
        let handler = self
            .queries
            .get(name)
            .ok_or_else(|| EngineError::UnknownQuery(name.to_string()))?;
        Ok(handler(self.store.collection(), payload).await?)
    }
}
