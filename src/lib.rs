//! Ledgerfold - an event-sourcing engine over a redb event log and state
//! store.
//!
//! Register aggregations and projections on the [`Engine`] returned by
//! [`open`], then call [`start`] to bring projections up to date and follow
//! the live tail of the log.

pub mod config;

pub use config::{Config, ConfigError};
pub use ledgerfold_core::{
    AggregationDef, AggregationDescriptor, Collection, Emitter, EngineError, Event, EventLog,
    HandlerError, HandlerGroup, LiveHandle, ProjectionDef, ProjectionDescriptor, StorageError,
};
pub use ledgerfold_db::{RedbCollection, RedbEventLog, RedbStateStore};

use ledgerfold_core::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// A context over the redb event log and state store.
pub type Engine = Context<RedbEventLog, RedbStateStore>;

/// Install the fmt tracing subscriber. Later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Open (or create) the database at `config.db_path` and build an engine on it.
pub fn open(config: &Config) -> Result<Engine, StorageError> {
    let db = ledgerfold_db::init_database(&config.db_path)?;
    let log = RedbEventLog::new(db.clone());
    let head = log.head_stamp()?;

    tracing::info!(path = %config.db_path.display(), head, "database opened");
    Ok(Context::new(log, RedbStateStore::new(db)))
}

/// Catch every registered projection up (unless disabled) and go live.
pub async fn start(engine: &Engine, config: &Config) -> Result<LiveHandle, EngineError> {
    if config.catch_up {
        engine.awake().await?;
    }
    engine.go_live().await
}
