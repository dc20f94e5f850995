use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::{Map, Value};

use crate::error::{EngineError, HandlerError};
use crate::event::PendingEvent;
use crate::scope::{qualify, qualify_all};
use crate::stream::EventStream;

/// Folds one event payload into aggregate state.
pub type StateHandler = Arc<dyn Fn(&mut Value, &Value) -> Result<(), HandlerError> + Send + Sync>;

/// Decides which events a command emits, given current state and the command payload.
pub type CommandHandler =
    Arc<dyn Fn(&Value, &Value, &mut Emitter) -> Result<(), HandlerError> + Send + Sync>;

/// Collects the events emitted by a command handler, qualified with the
/// aggregation's scope, in call order.
pub struct Emitter {
    scope: String,
    events: Vec<PendingEvent>,
}

impl Emitter {
    fn new(scope: &str) -> Self {
        Self {
            scope: scope.to_string(),
            events: Vec::new(),
        }
    }

    pub fn emit(&mut self, name: &str, payload: Value) {
        self.events
            .push(PendingEvent::new(qualify(&self.scope, name), payload));
    }
}

/// Write-side registration: a scope plus its local event and command handlers.
#[derive(Clone, Default)]
pub struct AggregationDef {
    pub scope: String,
    events: Vec<(String, StateHandler)>,
    commands: Vec<(String, CommandHandler)>,
}

impl AggregationDef {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            ..Self::default()
        }
    }

    /// Register a state handler under a local event name.
    pub fn event<F>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(&mut Value, &Value) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.events.push((name.to_string(), Arc::new(handler)));
        self
    }

    /// Register a command handler under a local command name.
    pub fn command<F>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(&Value, &Value, &mut Emitter) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.commands.push((name.to_string(), Arc::new(handler)));
        self
    }
}

/// Public summary returned when an aggregation is registered.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationDescriptor {
    pub scope: String,
    pub events: Vec<String>,
    pub commands: Vec<String>,
}

/// The write-side engine for one scope. Immutable after construction.
pub struct Aggregation {
    scope: String,
    handlers: BTreeMap<String, StateHandler>,
    commands: BTreeMap<String, CommandHandler>,
}

impl Aggregation {
    pub fn new(def: AggregationDef) -> Self {
        Self {
            handlers: qualify_all(&def.scope, def.events),
            commands: qualify_all(&def.scope, def.commands),
            scope: def.scope,
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Qualified event names, sorted.
    pub fn events(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    /// Qualified command names, sorted.
    pub fn commands(&self) -> Vec<String> {
        self.commands.keys().cloned().collect()
    }

    pub fn has_command(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    pub fn descriptor(&self) -> AggregationDescriptor {
        AggregationDescriptor {
            scope: self.scope.clone(),
            events: self.events(),
            commands: self.commands(),
        }
    }

    /// Fold `stream` into `(state, version)`.
    ///
    /// The version counts every event observed, handled or not.
    pub async fn replay(&self, mut stream: EventStream) -> Result<(Value, u64), EngineError> {
        let mut state = Value::Object(Map::new());
        let mut version = 0;

        while let Some(item) = stream.next().await {
            let event = item?;
            if let Some(handler) = self.handlers.get(&event.name) {
                handler(&mut state, &event.payload)?;
            }
            version += 1;
        }

        Ok((state, version))
    }

    /// Run one command against `state`, returning the events it emitted.
    ///
    /// An unknown command emits nothing.
    pub fn run_command(
        &self,
        name: &str,
        payload: &Value,
        state: &Value,
    ) -> Result<Vec<PendingEvent>, HandlerError> {
        let Some(handler) = self.commands.get(name) else {
            return Ok(Vec::new());
        };

        let mut emitter = Emitter::new(&self.scope);
        handler(state, payload, &mut emitter)?;
        Ok(emitter.events)
    }
}
