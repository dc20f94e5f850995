use std::sync::Arc;

use redb::{Database, ReadableTable};

use ledgerfold_core::event::stamp_batch;
use ledgerfold_core::{
    EngineError, Event, EventLog, EventPipe, EventStream, NameFilter, PendingEvent,
    SequentialQueue, StorageError,
};

use crate::tables::{AGGREGATES_TABLE, EVENTS_TABLE};

/// redb implementation of EventLog.
///
/// Appends run one at a time through a persistent queue, so the version check
/// and the write it guards are never interleaved with another append from the
/// same process. Stored events are published to live subscribers after commit.
#[derive(Clone)]
pub struct RedbEventLog {
    db: Arc<Database>,
    pipe: EventPipe,
    appends: SequentialQueue,
}

impl RedbEventLog {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            pipe: EventPipe::new(),
            appends: SequentialQueue::persistent(),
        }
    }

    /// Initialize the database tables.
    pub fn init_tables(db: &Database) -> Result<(), StorageError> {
        let write_txn = db
            .begin_write()
            .map_err(|e| StorageError::Database(e.to_string()))?;
        {
            // Create tables if they don't exist
            let _ = write_txn
                .open_table(EVENTS_TABLE)
                .map_err(|e| StorageError::Database(e.to_string()))?;
            let _ = write_txn
                .open_table(AGGREGATES_TABLE)
                .map_err(|e| StorageError::Database(e.to_string()))?;
        }
        write_txn
            .commit()
            .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(())
    }

    /// Highest stamp in the log, 0 if empty.
    pub fn head_stamp(&self) -> Result<u64, StorageError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let table = read_txn
            .open_table(EVENTS_TABLE)
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let last = table
            .last()
            .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(last.map_or(0, |(stamp, _)| stamp.value()))
    }

    /// Number of live subscriptions still attached.
    pub fn live_subscribers(&self) -> usize {
        self.pipe.downstream_count()
    }

    fn load_events(&self, stamps: Vec<u64>) -> Result<Vec<Event>, StorageError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let table = read_txn
            .open_table(EVENTS_TABLE)
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let mut events = Vec::with_capacity(stamps.len());
        for stamp in stamps {
            let value = table
                .get(stamp)
                .map_err(|e| StorageError::Database(e.to_string()))?
                .ok_or_else(|| StorageError::Database(format!("missing event at stamp {stamp}")))?;
            let event: Event = serde_json::from_slice(value.value())
                .map_err(|e| StorageError::Database(e.to_string()))?;
            events.push(event);
        }

        Ok(events)
    }
}

/// Check the aggregate's head version and write the batch in one transaction.
fn write_batch(
    db: &Database,
    aggregate: &str,
    expected_version: u64,
    events: Vec<PendingEvent>,
) -> Result<Vec<Event>, StorageError> {
    let write_txn = db
        .begin_write()
        .map_err(|e| StorageError::Database(e.to_string()))?;

    let batch;
    {
        let mut index = write_txn
            .open_table(AGGREGATES_TABLE)
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let current_version = match index
            .range((aggregate, 0)..=(aggregate, u64::MAX))
            .map_err(|e| StorageError::Database(e.to_string()))?
            .next_back()
        {
            Some(entry) => {
                let (key, _) = entry.map_err(|e| StorageError::Database(e.to_string()))?;
                key.value().1
            }
            None => 0,
        };
        if current_version != expected_version {
            return Err(StorageError::Conflict {
                aggregate: aggregate.to_string(),
                version: expected_version,
            });
        }

        let mut table = write_txn
            .open_table(EVENTS_TABLE)
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let last_stamp = table
            .last()
            .map_err(|e| StorageError::Database(e.to_string()))?
            .map_or(0, |(stamp, _)| stamp.value());

        batch = stamp_batch(aggregate, expected_version, last_stamp, events);
        for event in &batch {
            let value =
                serde_json::to_vec(event).map_err(|e| StorageError::Database(e.to_string()))?;
            table
                .insert(event.stamp, value.as_slice())
                .map_err(|e| StorageError::Database(e.to_string()))?;
            index
                .insert((aggregate, event.version), event.stamp)
                .map_err(|e| StorageError::Database(e.to_string()))?;
        }
    }

    write_txn
        .commit()
        .map_err(|e| StorageError::Database(e.to_string()))?;

    Ok(batch)
}

impl EventLog for RedbEventLog {
    async fn read_aggregate(&self, aggregate: &str) -> Result<EventStream, StorageError> {
        let stamps = {
            let read_txn = self
                .db
                .begin_read()
                .map_err(|e| StorageError::Database(e.to_string()))?;

            let index = read_txn
                .open_table(AGGREGATES_TABLE)
                .map_err(|e| StorageError::Database(e.to_string()))?;

            let mut stamps = Vec::new();
            for entry in index
                .range((aggregate, 0)..=(aggregate, u64::MAX))
                .map_err(|e| StorageError::Database(e.to_string()))?
            {
                let (_, stamp) = entry.map_err(|e| StorageError::Database(e.to_string()))?;
                stamps.push(stamp.value());
            }
            stamps
        };

        Ok(EventStream::from_events(self.load_events(stamps)?))
    }

    async fn read_projection(
        &self,
        names: &[String],
        after_stamp: u64,
    ) -> Result<EventStream, StorageError> {
        if names.is_empty() {
            return Ok(EventStream::empty());
        }

        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let table = read_txn
            .open_table(EVENTS_TABLE)
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let mut events = Vec::new();
        for entry in table
            .range(after_stamp.saturating_add(1)..)
            .map_err(|e| StorageError::Database(e.to_string()))?
        {
            let (_, value) = entry.map_err(|e| StorageError::Database(e.to_string()))?;
            let event: Event = serde_json::from_slice(value.value())
                .map_err(|e| StorageError::Database(e.to_string()))?;
            if names.contains(&event.name) {
                events.push(event);
            }
        }

        Ok(EventStream::from_events(events))
    }

    fn read_live(&self, names: &[String]) -> EventStream {
        self.pipe
            .attach(Some(NameFilter::new(names.iter().cloned())))
    }

    async fn append(
        &self,
        aggregate: &str,
        expected_version: u64,
        events: Vec<PendingEvent>,
    ) -> Result<Vec<Event>, StorageError> {
        let db = self.db.clone();
        let pipe = self.pipe.clone();
        let aggregate = aggregate.to_string();

        let appended = self
            .appends
            .submit(move || async move {
                let batch = match write_batch(&db, &aggregate, expected_version, events) {
                    Ok(batch) => batch,
                    Err(StorageError::Database(e)) => {
                        tracing::error!(aggregate = %aggregate, error = %e, "append failed");
                        return Err(StorageError::Database(e).into());
                    }
                    Err(e) => return Err(e.into()),
                };
                tracing::debug!(
                    aggregate = %aggregate,
                    count = batch.len(),
                    head = batch.last().map_or(0, |e| e.stamp),
                    "events committed"
                );
                for event in &batch {
                    pipe.write(event);
                }
                Ok::<_, EngineError>(batch)
            })
            .await?;
        Ok(appended)
    }

    fn close_live(&self) {
        self.pipe.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    fn create_test_db() -> (TempDir, Arc<Database>) {
        let dir = tempdir().unwrap();
        let db = Database::create(dir.path().join("test.redb")).unwrap();
        RedbEventLog::init_tables(&db).unwrap();
        (dir, Arc::new(db))
    }

    fn pending(name: &str, id: u64) -> PendingEvent {
        PendingEvent::new(name, json!({ "id": id }))
    }

    async fn collect(stream: EventStream) -> Vec<Event> {
        stream.map(|item| item.unwrap()).collect().await
    }

    #[tokio::test]
    async fn test_append_and_read_aggregate() {
        let (_dir, db) = create_test_db();
        let log = RedbEventLog::new(db);

        log.append("a", 0, vec![pending("ag.created", 1), pending("ag.updated", 2)])
            .await
            .unwrap();
        log.append("b", 0, vec![pending("ag.created", 3)]).await.unwrap();
        let third = log.append("a", 2, vec![pending("ag.updated", 4)]).await.unwrap();

        assert_eq!(third[0].version, 3);
        assert_eq!(third[0].stamp, 4);

        let events = collect(log.read_aggregate("a").await.unwrap()).await;
        assert_eq!(events.iter().map(|e| e.version).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(events.iter().map(|e| e.stamp).collect::<Vec<_>>(), vec![1, 2, 4]);
        assert_eq!(events[1].payload, json!({ "id": 2 }));

        assert!(collect(log.read_aggregate("missing").await.unwrap()).await.is_empty());
    }

    #[tokio::test]
    async fn test_conflict_appends_nothing() {
        let (_dir, db) = create_test_db();
        let log = RedbEventLog::new(db);
        log.append("a", 0, vec![pending("ag.created", 1)]).await.unwrap();

        let result = log.append("a", 0, vec![pending("ag.created", 2)]).await;
        assert_eq!(
            result,
            Err(StorageError::Conflict {
                aggregate: "a".to_string(),
                version: 0
            })
        );
        assert_eq!(log.head_stamp().unwrap(), 1);

        // Other aggregates are not blocked by the failed append.
        log.append("b", 0, vec![pending("ag.created", 3)]).await.unwrap();
        assert_eq!(log.head_stamp().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_appends_at_same_version() {
        let (_dir, db) = create_test_db();
        let log = RedbEventLog::new(db);

        let (first, second) = futures::join!(
            log.append("a", 0, vec![pending("ag.created", 1)]),
            log.append("a", 0, vec![pending("ag.created", 2)]),
        );

        assert!(first.is_ok());
        assert!(matches!(second, Err(StorageError::Conflict { .. })));
        assert_eq!(collect(log.read_aggregate("a").await.unwrap()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_read_projection_after_stamp() {
        let (_dir, db) = create_test_db();
        let log = RedbEventLog::new(db);
        log.append("a", 0, vec![pending("ag.created", 1), pending("ag.updated", 2)])
            .await
            .unwrap();
        log.append("b", 0, vec![pending("ag.created", 3), pending("ag.removed", 4)])
            .await
            .unwrap();

        let names = vec!["ag.created".to_string(), "ag.removed".to_string()];
        let events = collect(log.read_projection(&names, 1).await.unwrap()).await;
        assert_eq!(events.iter().map(|e| e.stamp).collect::<Vec<_>>(), vec![3, 4]);

        assert!(collect(log.read_projection(&[], 0).await.unwrap()).await.is_empty());
    }

    #[tokio::test]
    async fn test_head_stamp_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.redb");
        {
            let db = Database::create(&path).unwrap();
            RedbEventLog::init_tables(&db).unwrap();
            let log = RedbEventLog::new(Arc::new(db));
            log.append("a", 0, vec![pending("ag.created", 1), pending("ag.updated", 2)])
                .await
                .unwrap();
        }

        let db = Database::create(&path).unwrap();
        let log = RedbEventLog::new(Arc::new(db));
        assert_eq!(log.head_stamp().unwrap(), 2);

        let appended = log.append("b", 0, vec![pending("ag.created", 3)]).await.unwrap();
        assert_eq!(appended[0].stamp, 3);
    }

    #[tokio::test]
    async fn test_live_subscription() {
        let (_dir, db) = create_test_db();
        let log = RedbEventLog::new(db);
        let updates = log.read_live(&["ag.updated".to_string()]);
        let everything = log.read_live(&["ag.created".to_string(), "ag.updated".to_string()]);
        assert_eq!(log.live_subscribers(), 2);

        log.append("a", 0, vec![pending("ag.created", 1), pending("ag.updated", 2)])
            .await
            .unwrap();
        log.close_live();

        let updates = collect(updates).await;
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].stamp, 2);
        assert_eq!(collect(everything).await.len(), 2);
        assert_eq!(log.live_subscribers(), 0);
    }
}
