//! Registry and router tying aggregations and projections to their
//! collaborators.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::try_join_all;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::aggregation::{Aggregation, AggregationDef, AggregationDescriptor};
use crate::error::{EngineError, HandlerError};
use crate::event::Event;
use crate::projection::{Projection, ProjectionDef, ProjectionDescriptor};
use crate::scope::scope_of;
use crate::storage::{EventLog, ScopeStore, StateStore};

/// Document collection type handed to projection handlers for a state store.
pub type CollectionOf<S> = <<S as StateStore>::Scope as ScopeStore>::Collection;

type ProjectionOf<S> = Projection<<S as StateStore>::Scope>;

/// Composite handle over every live projection consumer.
pub struct LiveHandle {
    consumers: Vec<(String, JoinHandle<Result<(), EngineError>>)>,
}

impl LiveHandle {
    /// Number of projections being fed.
    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// Resolve once every live consumer has ended and drained. Fails with the
    /// first consumer failure.
    pub async fn wait_for_all(self) -> Result<(), EngineError> {
        try_join_all(self.consumers.into_iter().map(|(scope, handle)| async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(scope = %scope, error = %e, "live consumer task failed");
                    Err(EngineError::Handler(HandlerError::new(format!(
                        "live consumer for [{scope}] failed: {e}"
                    ))))
                }
            }
        }))
        .await?;
        Ok(())
    }
}

/// Owns the registered aggregations and projections of one process.
pub struct Context<L: EventLog, S: StateStore> {
    log: Arc<L>,
    state: Arc<S>,
    aggregations: RwLock<HashMap<String, Arc<Aggregation>>>,
    projections: RwLock<HashMap<String, Arc<ProjectionOf<S>>>>,
}

impl<L: EventLog, S: StateStore> Context<L, S> {
    pub fn new(log: L, state: S) -> Self {
        Self {
            log: Arc::new(log),
            state: Arc::new(state),
            aggregations: RwLock::new(HashMap::new()),
            projections: RwLock::new(HashMap::new()),
        }
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn register_aggregation(
        &self,
        def: AggregationDef,
    ) -> Result<AggregationDescriptor, EngineError> {
        if def.scope.is_empty() {
            return Err(EngineError::InvalidScope);
        }

        let mut aggregations = self.aggregations.write();
        if aggregations.contains_key(&def.scope) {
            return Err(EngineError::DuplicateScope(def.scope));
        }

        let aggregation = Aggregation::new(def);
        let descriptor = aggregation.descriptor();
        aggregations.insert(descriptor.scope.clone(), Arc::new(aggregation));

        tracing::info!(
            scope = %descriptor.scope,
            events = descriptor.events.len(),
            commands = descriptor.commands.len(),
            "aggregation registered"
        );
        Ok(descriptor)
    }

    pub async fn register_projection(
        &self,
        def: ProjectionDef<CollectionOf<S>>,
    ) -> Result<ProjectionDescriptor, EngineError> {
        if def.scope.is_empty() {
            return Err(EngineError::InvalidScope);
        }
        if self.projections.read().contains_key(&def.scope) {
            return Err(EngineError::DuplicateScope(def.scope));
        }

        let (store, stamp) = self.state.open_scope(&def.scope).await?;
        let projection = Projection::new(def, store, stamp);
        let descriptor = projection.descriptor();

        // Another registration may have won the race while the scope was opening.
        let mut projections = self.projections.write();
        if projections.contains_key(&descriptor.scope) {
            return Err(EngineError::DuplicateScope(descriptor.scope));
        }
        projections.insert(descriptor.scope.clone(), Arc::new(projection));

        tracing::info!(
            scope = %descriptor.scope,
            stamp = descriptor.stamp,
            events = descriptor.events.len(),
            queries = descriptor.queries.len(),
            "projection registered"
        );
        Ok(descriptor)
    }

    /// Replay `aggregate`, run the command and append whatever it emitted.
    pub async fn execute_command(
        &self,
        name: &str,
        aggregate: &str,
        payload: Value,
    ) -> Result<Vec<Event>, EngineError> {
        if aggregate.is_empty() {
            return Err(EngineError::MissingAggregateId);
        }

        let scope = scope_of(name);
        let aggregation = self
            .aggregations
            .read()
            .get(scope)
            .cloned()
            .ok_or_else(|| EngineError::UnknownScope(scope.to_string()))?;
        if !aggregation.has_command(name) {
            return Err(EngineError::UnknownCommand(name.to_string()));
        }

        let history = self.log.read_aggregate(aggregate).await?;
        let (state, version) = aggregation.replay(history).await?;

        let events = aggregation.run_command(name, &payload, &state)?;
        if events.is_empty() {
            return Ok(Vec::new());
        }

        tracing::debug!(
            command = %name,
            aggregate = %aggregate,
            version,
            count = events.len(),
            "appending events"
        );
        match self.log.append(aggregate, version, events).await {
            Ok(appended) => Ok(appended),
            Err(e) => {
                let e = EngineError::from(e);
                if matches!(e, EngineError::Conflict { .. }) {
                    tracing::warn!(command = %name, aggregate = %aggregate, version, "append conflict");
                }
                Err(e)
            }
        }
    }

    pub async fn answer_query(&self, name: &str, payload: Value) -> Result<Value, EngineError> {
        let scope = scope_of(name);
        let projection = self
            .projections
            .read()
            .get(scope)
            .cloned()
            .ok_or_else(|| EngineError::UnknownScope(scope.to_string()))?;
        if !projection.has_query(name) {
            return Err(EngineError::UnknownQuery(name.to_string()));
        }

        projection.answer_query(name, payload).await
    }

    /// Bring every projection up to date with the history available now.
    pub async fn awake(&self) -> Result<(), EngineError> {
        let projections = self.snapshot();

        try_join_all(projections.into_iter().map(|projection| {
            let log = Arc::clone(&self.log);
            async move {
                let stamp = projection.stamp();
                tracing::info!(scope = %projection.scope(), stamp, "projection catching up");

                let history = log.read_projection(&projection.events(), stamp).await?;
                projection.consume(history).await?.wait_for_drain().await?;

                tracing::info!(scope = %projection.scope(), stamp = projection.stamp(), "projection caught up");
                Ok::<_, EngineError>(())
            }
        }))
        .await?;
        Ok(())
    }

    /// Start feeding every projection from the live tail of the log.
    ///
    /// Each projection subscribes to the live tail before reading any history
    /// newer than its stamp, so events appended between [`Context::awake`] and
    /// this call are not lost. Consumers run on spawned tasks; the returned
    /// handle only observes them.
    pub async fn go_live(&self) -> Result<LiveHandle, EngineError> {
        let projections = self.snapshot();

        // A failed read must leave no consumer running.
        let mut feeds = Vec::with_capacity(projections.len());
        for projection in projections {
            let events = projection.events();
            let live = self.log.read_live(&events);
            let backlog = self.log.read_projection(&events, projection.stamp()).await?;
            feeds.push((projection, backlog.chain(live)));
        }

        let consumers = feeds
            .into_iter()
            .map(|(projection, stream)| {
                let scope = projection.scope().to_string();
                tracing::info!(scope = %scope, stamp = projection.stamp(), "projection live");

                let handle = tokio::spawn(async move {
                    let result = match projection.consume(stream).await {
                        Ok(consumption) => consumption.wait_for_drain().await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = &result {
                        tracing::error!(scope = %projection.scope(), error = %e, "live projection stopped");
                    }
                    result
                });
                (scope, handle)
            })
            .collect();

        Ok(LiveHandle { consumers })
    }

    /// Descriptors of every registered projection, sorted by scope.
    pub fn projections(&self) -> Vec<ProjectionDescriptor> {
        let mut descriptors: Vec<_> = self
            .projections
            .read()
            .values()
            .map(|projection| projection.descriptor())
            .collect();
        descriptors.sort_by(|a, b| a.scope.cmp(&b.scope));
        descriptors
    }

    /// Descriptors of every registered aggregation, sorted by scope.
    pub fn aggregations(&self) -> Vec<AggregationDescriptor> {
        let mut descriptors: Vec<_> = self
            .aggregations
            .read()
            .values()
            .map(|aggregation| aggregation.descriptor())
            .collect();
        descriptors.sort_by(|a, b| a.scope.cmp(&b.scope));
        descriptors
    }

    fn snapshot(&self) -> Vec<Arc<ProjectionOf<S>>> {
        self.projections.read().values().cloned().collect()
    }
}
