//! Ledgerfold DB - redb implementation of the event log and state store.

pub mod event_log;
pub mod state_store;
pub mod tables;

pub use event_log::RedbEventLog;
pub use state_store::{RedbCollection, RedbScope, RedbStateStore};

use std::path::Path;
use std::sync::Arc;

use redb::Database;

use ledgerfold_core::StorageError;

/// Initialize a database with all required tables.
pub fn init_database(path: impl AsRef<Path>) -> Result<Arc<Database>, StorageError> {
    let db = Database::create(path).map_err(|e| StorageError::Database(e.to_string()))?;

    RedbEventLog::init_tables(&db)?;
    RedbStateStore::init_tables(&db)?;

    Ok(Arc::new(db))
}
