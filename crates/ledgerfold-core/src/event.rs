use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An immutable event in the append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Qualified event name, e.g. `"todo.created"`.
    pub name: String,
    /// ID of the aggregate this event belongs to.
    pub aggregate: String,
    pub payload: Value,
    /// 1-based position of this event within its aggregate's history.
    pub version: u64,
    /// Global, strictly increasing sequence number assigned at append time.
    pub stamp: u64,
    pub date: DateTime<Utc>,
}

impl Event {
    /// Build the stored form of a pending event.
    pub fn stored(
        pending: PendingEvent,
        aggregate: &str,
        version: u64,
        stamp: u64,
        date: DateTime<Utc>,
    ) -> Self {
        Self {
            name: pending.name,
            aggregate: aggregate.to_string(),
            payload: pending.payload,
            version,
            stamp,
            date,
        }
    }
}

/// An event emitted by a command handler, not yet appended to the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEvent {
    pub name: String,
    pub payload: Value,
}

impl PendingEvent {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// Assign versions and stamps to a batch of pending events.
///
/// Versions continue from `expected_version`, stamps from `last_stamp`.
pub fn stamp_batch(
    aggregate: &str,
    expected_version: u64,
    last_stamp: u64,
    events: Vec<PendingEvent>,
) -> Vec<Event> {
    let date = Utc::now();
    events
        .into_iter()
        .enumerate()
        .map(|(index, pending)| {
            let offset = index as u64 + 1;
            Event::stored(
                pending,
                aggregate,
                expected_version + offset,
                last_stamp + offset,
                date,
            )
        })
        .collect()
}
