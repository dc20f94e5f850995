use thiserror::Error;

/// Errors surfaced by the engine to callers of the context, aggregations,
/// projections and queues.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Scope must be a non-empty string")]
    InvalidScope,

    #[error("Scope [{0}] is already registered")]
    DuplicateScope(String),

    #[error("Scope [{0}] is not supported by context")]
    UnknownScope(String),

    #[error("Command [{0}] is not supported by its scope")]
    UnknownCommand(String),

    #[error("Query [{0}] is not supported by its scope")]
    UnknownQuery(String),

    #[error("Aggregate should have a valid non-empty ID")]
    MissingAggregateId,

    #[error("Conflicting events for aggregate [{aggregate}] at version {version}")]
    Conflict { aggregate: String, version: u64 },

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Queue is closed after a failed job")]
    QueueClosed,

    #[error("Storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Conflict { aggregate, version } => {
                EngineError::Conflict { aggregate, version }
            }
            other => EngineError::Storage(other),
        }
    }
}

/// Failure raised by a user-supplied event, command or query handler.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError(message.into())
    }
}

impl From<StorageError> for HandlerError {
    fn from(e: StorageError) -> Self {
        HandlerError(e.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        HandlerError(e.to_string())
    }
}

/// Errors returned by event log and state store implementations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("Conflict events for aggregate [{aggregate}] with version [{version}]")]
    Conflict { aggregate: String, version: u64 },

    #[error("Database error: {0}")]
    Database(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_maps_to_engine_conflict() {
        let err: EngineError = StorageError::Conflict {
            aggregate: "id1".to_string(),
            version: 3,
        }
        .into();

        assert_eq!(
            err,
            EngineError::Conflict {
                aggregate: "id1".to_string(),
                version: 3
            }
        );
    }

    #[test]
    fn test_database_error_stays_storage() {
        let err: EngineError = StorageError::Database("disk full".to_string()).into();
        assert!(matches!(err, EngineError::Storage(StorageError::Database(_))));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_handler_error_display() {
        let err = EngineError::from(HandlerError::new("failed"));
        assert_eq!(err.to_string(), "Handler error: failed");
    }
}
