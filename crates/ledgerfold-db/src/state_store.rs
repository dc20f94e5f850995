use std::sync::Arc;

use redb::{Database, ReadableTable};
use serde_json::Value;

use ledgerfold_core::{Collection, ScopeStore, StateStore, StorageError};

use crate::tables::{DOCUMENTS_TABLE, WATERMARKS_TABLE};

/// redb implementation of StateStore.
#[derive(Clone)]
pub struct RedbStateStore {
    db: Arc<Database>,
}

impl RedbStateStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Initialize the database tables.
    pub fn init_tables(db: &Database) -> Result<(), StorageError> {
        let write_txn = db
            .begin_write()
            .map_err(|e| StorageError::Database(e.to_string()))?;
        {
            let _ = write_txn
                .open_table(WATERMARKS_TABLE)
                .map_err(|e| StorageError::Database(e.to_string()))?;
            let _ = write_txn
                .open_table(DOCUMENTS_TABLE)
                .map_err(|e| StorageError::Database(e.to_string()))?;
        }
        write_txn
            .commit()
            .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(())
    }

    fn watermark(&self, scope: &str) -> Result<u64, StorageError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let table = read_txn
            .open_table(WATERMARKS_TABLE)
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let stamp = table
            .get(scope)
            .map_err(|e| StorageError::Database(e.to_string()))?
            .map(|v| v.value())
            .unwrap_or(0);
        Ok(stamp)
    }
}

impl StateStore for RedbStateStore {
    type Scope = RedbScope;

    async fn open_scope(&self, scope: &str) -> Result<(RedbScope, u64), StorageError> {
        let stamp = self.watermark(scope)?;
        let handle = RedbScope {
            collection: RedbCollection {
                db: self.db.clone(),
                scope: scope.to_string(),
            },
        };
        Ok((handle, stamp))
    }
}

/// Storage of one projection scope.
pub struct RedbScope {
    collection: RedbCollection,
}

impl ScopeStore for RedbScope {
    type Collection = RedbCollection;

    fn collection(&self) -> RedbCollection {
        self.collection.clone()
    }

    async fn set_watermark(&self, stamp: u64) -> Result<(), StorageError> {
        let db = &self.collection.db;
        let write_txn = db
            .begin_write()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        {
            let mut table = write_txn
                .open_table(WATERMARKS_TABLE)
                .map_err(|e| StorageError::Database(e.to_string()))?;

            table
                .insert(self.collection.scope.as_str(), stamp)
                .map_err(|e| StorageError::Database(e.to_string()))?;
        }

        write_txn
            .commit()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(())
    }
}

/// JSON documents of one projection scope, keyed by string.
#[derive(Clone)]
pub struct RedbCollection {
    db: Arc<Database>,
    scope: String,
}

impl RedbCollection {
    pub fn scope(&self) -> &str {
        &self.scope
    }
}

impl Collection for RedbCollection {
    fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let table = read_txn
            .open_table(DOCUMENTS_TABLE)
            .map_err(|e| StorageError::Database(e.to_string()))?;

        match table
            .get((self.scope.as_str(), key))
            .map_err(|e| StorageError::Database(e.to_string()))?
        {
            Some(value) => {
                let document: Value = serde_json::from_slice(value.value())
                    .map_err(|e| StorageError::Database(e.to_string()))?;
                Ok(Some(document))
            }
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, document: Value) -> Result<(), StorageError> {
        let value =
            serde_json::to_vec(&document).map_err(|e| StorageError::Database(e.to_string()))?;

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        {
            let mut table = write_txn
                .open_table(DOCUMENTS_TABLE)
                .map_err(|e| StorageError::Database(e.to_string()))?;

            table
                .insert((self.scope.as_str(), key), value.as_slice())
                .map_err(|e| StorageError::Database(e.to_string()))?;
        }

        write_txn
            .commit()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let removed;
        {
            let mut table = write_txn
                .open_table(DOCUMENTS_TABLE)
                .map_err(|e| StorageError::Database(e.to_string()))?;

            let result = table
                .remove((self.scope.as_str(), key))
                .map_err(|e| StorageError::Database(e.to_string()))?;
            removed = result.is_some();
        }

        write_txn
            .commit()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(removed)
    }

    fn all(&self) -> Result<Vec<(String, Value)>, StorageError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let table = read_txn
            .open_table(DOCUMENTS_TABLE)
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let mut documents = Vec::new();
        for entry in table
            .range((self.scope.as_str(), "")..)
            .map_err(|e| StorageError::Database(e.to_string()))?
        {
            let (key, value) = entry.map_err(|e| StorageError::Database(e.to_string()))?;
            let (scope, name) = key.value();
            // Keys are ordered by scope first
            if scope != self.scope {
                break;
            }
            let document: Value = serde_json::from_slice(value.value())
                .map_err(|e| StorageError::Database(e.to_string()))?;
            documents.push((name.to_string(), document));
        }

        Ok(documents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    fn create_test_db() -> (TempDir, Arc<Database>) {
        let dir = tempdir().unwrap();
        let db = Database::create(dir.path().join("test.redb")).unwrap();
        RedbStateStore::init_tables(&db).unwrap();
        (dir, Arc::new(db))
    }

    #[tokio::test]
    async fn test_open_scope_without_watermark() {
        let (_dir, db) = create_test_db();
        let store = RedbStateStore::new(db);

        let (scope, stamp) = store.open_scope("todo").await.unwrap();
        assert_eq!(stamp, 0);
        assert_eq!(scope.collection().scope(), "todo");
    }

    #[tokio::test]
    async fn test_watermark_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.redb");
        {
            let db = Database::create(&path).unwrap();
            RedbStateStore::init_tables(&db).unwrap();
            let store = RedbStateStore::new(Arc::new(db));
            let (scope, _) = store.open_scope("todo").await.unwrap();
            scope.set_watermark(3).await.unwrap();
            scope.set_watermark(9).await.unwrap();
        }

        let store = RedbStateStore::new(Arc::new(Database::create(&path).unwrap()));
        let (_, stamp) = store.open_scope("todo").await.unwrap();
        assert_eq!(stamp, 9);
        let (_, other) = store.open_scope("other").await.unwrap();
        assert_eq!(other, 0);
    }

    #[tokio::test]
    async fn test_collection_put_get_delete() {
        let (_dir, db) = create_test_db();
        let store = RedbStateStore::new(db);
        let (scope, _) = store.open_scope("todo").await.unwrap();
        let collection = scope.collection();

        collection.put("id1", json!({ "title": "t1" })).unwrap();
        collection.put("id1", json!({ "title": "t2" })).unwrap();
        assert_eq!(collection.get("id1").unwrap(), Some(json!({ "title": "t2" })));

        assert!(collection.delete("id1").unwrap());
        assert!(collection.get("id1").unwrap().is_none());

        // Deleting non-existent returns false
        assert!(!collection.delete("id1").unwrap());
    }

    #[tokio::test]
    async fn test_collections_are_isolated_by_scope() {
        let (_dir, db) = create_test_db();
        let store = RedbStateStore::new(db);
        let (first, _) = store.open_scope("a").await.unwrap();
        let (second, _) = store.open_scope("b").await.unwrap();
        let (third, _) = store.open_scope("ab").await.unwrap();

        first.collection().put("2", json!(2)).unwrap();
        first.collection().put("1", json!(1)).unwrap();
        second.collection().put("1", json!("b")).unwrap();
        third.collection().put("1", json!("ab")).unwrap();

        assert_eq!(
            first.collection().all().unwrap(),
            vec![("1".to_string(), json!(1)), ("2".to_string(), json!(2))]
        );
        assert_eq!(second.collection().all().unwrap(), vec![("1".to_string(), json!("b"))]);
        assert!(second.collection().get("2").unwrap().is_none());
    }
}
