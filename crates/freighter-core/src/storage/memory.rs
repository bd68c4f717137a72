//! In-process storage backend
//!
//! Backs tests and dry runs with the same transactional contract as the
//! real backends: writes stage inside the session and only land in shared
//! state on commit. Rows are keyed by their primary-key values when a key
//! is registered, so repeated upserts are idempotent the way they are on
//! Postgres.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use freighter_common::Record;

use super::{spawn_tx, Storage, StorageError, StorageKind, StorageSession, Tx, TxSession};

type Table = BTreeMap<String, Record>;

#[derive(Default)]
struct Shared {
    tables: Mutex<HashMap<String, Table>>,
    primary_keys: Mutex<HashMap<String, Vec<String>>>,
}

/// In-process [`Storage`] with per-table state behind a mutex
#[derive(Clone, Default)]
pub struct MemoryStorage {
    shared: Arc<Shared>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a primary key for a table so upserts into it collapse by
    /// key.
    pub fn set_primary_key(&self, table: &str, columns: &[&str]) {
        if let Ok(mut keys) = self.shared.primary_keys.lock() {
            keys.insert(
                table.to_string(),
                columns.iter().map(ToString::to_string).collect(),
            );
        }
    }

    /// Snapshot of a table's committed rows, in key order.
    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.shared
            .tables
            .lock()
            .ok()
            .and_then(|tables| {
                tables
                    .get(table)
                    .map(|rows| rows.values().cloned().collect())
            })
            .unwrap_or_default()
    }

    fn key_for(&self, table: &str, record: &Record, fallback: usize) -> String {
        let keys = self
            .shared
            .primary_keys
            .lock()
            .ok()
            .and_then(|map| map.get(table).cloned())
            .unwrap_or_default();

        if keys.is_empty() {
            // No key registered: every row is distinct.
            return format!("#{fallback:012}");
        }

        keys.iter()
            .map(|key| match record.get(key) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            })
            .collect::<Vec<_>>()
            .join("\u{1f}")
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Memory
    }

    async fn truncate(&self, tables: &[String]) -> Result<(), StorageError> {
        if let Ok(mut state) = self.shared.tables.lock() {
            for table in tables {
                state.remove(table);
            }
        }

        Ok(())
    }

    async fn start_tx(&self) -> Result<Tx, StorageError> {
        Ok(spawn_tx(MemorySession {
            storage: self.clone(),
            staged: Vec::new(),
        }))
    }
}

/// Staged writes for one in-memory transaction
struct MemorySession {
    storage: MemoryStorage,
    staged: Vec<(String, Vec<Record>)>,
}

#[async_trait]
impl StorageSession for MemorySession {
    async fn upsert(&mut self, table: &str, records: &[Record]) -> Result<(), StorageError> {
        self.staged.push((table.to_string(), records.to_vec()));
        Ok(())
    }
}

#[async_trait]
impl TxSession for MemorySession {
    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let storage = self.storage.clone();

        let Ok(mut tables) = storage.shared.tables.lock() else {
            return Err(StorageError::Record("memory state poisoned".to_string()));
        };

        for (table, records) in self.staged {
            let rows = tables.entry(table.clone()).or_default();
            for record in records {
                // Unkeyed rows only ever accumulate, so the current size is
                // a collision-free synthetic key.
                let key = self.storage.key_for(&table, &record, rows.len());
                rows.insert(key, record);
            }
        }

        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_commit_makes_rows_visible() {
        let storage = MemoryStorage::new();
        let tx = storage.start_tx().await.unwrap();

        let row = record(&[("id", json!(1)), ("name", json!("a"))]);
        tx.writer()
            .send(Box::new(move |session| {
                Box::pin(async move { session.upsert("items", &[row]).await })
            }))
            .unwrap();

        assert!(storage.rows("items").is_empty());
        tx.commit().await.unwrap();
        assert_eq!(storage.rows("items").len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_staged_rows() {
        let storage = MemoryStorage::new();
        let tx = storage.start_tx().await.unwrap();

        let row = record(&[("id", json!(1))]);
        tx.writer()
            .send(Box::new(move |session| {
                Box::pin(async move { session.upsert("items", &[row]).await })
            }))
            .unwrap();

        tx.rollback().await.unwrap();
        assert!(storage.rows("items").is_empty());
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_with_primary_key() {
        let storage = MemoryStorage::new();
        storage.set_primary_key("items", &["id"]);

        for run in 0..2 {
            let tx = storage.start_tx().await.unwrap();
            let row = record(&[("id", json!(7)), ("run", json!(run))]);
            tx.writer()
                .send(Box::new(move |session| {
                    Box::pin(async move { session.upsert("items", &[row]).await })
                }))
                .unwrap();
            tx.commit().await.unwrap();
        }

        let rows = storage.rows("items");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("run"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_rows_without_key_accumulate() {
        let storage = MemoryStorage::new();
        let tx = storage.start_tx().await.unwrap();

        let rows = vec![record(&[("v", json!(1))]), record(&[("v", json!(1))])];
        tx.writer()
            .send(Box::new(move |session| {
                Box::pin(async move { session.upsert("events", &rows).await })
            }))
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(storage.rows("events").len(), 2);
    }

    #[tokio::test]
    async fn test_truncate_clears_tables() {
        let storage = MemoryStorage::new();
        let tx = storage.start_tx().await.unwrap();
        let row = record(&[("id", json!(1))]);
        tx.writer()
            .send(Box::new(move |session| {
                Box::pin(async move { session.upsert("items", &[row]).await })
            }))
            .unwrap();
        tx.commit().await.unwrap();

        storage.truncate(&["items".to_string()]).await.unwrap();
        assert!(storage.rows("items").is_empty());
    }
}
