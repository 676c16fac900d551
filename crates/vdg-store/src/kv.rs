//! Async string-keyed persistent map.
//!
//! The store contract the whole subsystem is built on: callers may assume
//! single-key atomicity and nothing else about the backing medium.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

use crate::error::StoreError;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError>;
    async fn multi_set(&self, entries: &[(String, String)]) -> Result<(), StoreError>;
    async fn multi_remove(&self, keys: &[String]) -> Result<(), StoreError>;
    async fn all_keys(&self) -> Result<Vec<String>, StoreError>;
}

/// In-memory backend, used by tests and as a scratch store.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        let entries = self.entries.read().await;
        Ok(keys.iter().map(|key| entries.get(key).cloned()).collect())
    }

    async fn multi_set(&self, entries: &[(String, String)]) -> Result<(), StoreError> {
        let mut map = self.entries.write().await;
        for (key, value) in entries {
            map.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn multi_remove(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut map = self.entries.write().await;
        for key in keys {
            map.remove(key);
        }
        Ok(())
    }

    async fn all_keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }
}

/// Durable backend over a single SQLite `kv` table.
///
/// rusqlite is synchronous, so every operation hops to the blocking pool and
/// serializes on the connection mutex.
pub struct SqliteKvStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKvStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Backend("sqlite connection poisoned".to_string()))?;
            op(&mut guard)
        })
        .await
        .map_err(|err| StoreError::Backend(format!("blocking task failed: {err}")))?
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                    row.get(0)
                })
                .optional()?)
        })
        .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        let value = value.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        let keys = keys.to_vec();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT value FROM kv WHERE key = ?1")?;
            let mut values = Vec::with_capacity(keys.len());
            for key in &keys {
                let value = stmt
                    .query_row(params![key], |row| row.get::<_, String>(0))
                    .optional()?;
                values.push(value);
            }
            Ok(values)
        })
        .await
    }

    async fn multi_set(&self, entries: &[(String, String)]) -> Result<(), StoreError> {
        let entries = entries.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO kv (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                )?;
                for (key, value) in &entries {
                    stmt.execute(params![key, value])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn multi_remove(&self, keys: &[String]) -> Result<(), StoreError> {
        let keys = keys.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare("DELETE FROM kv WHERE key = ?1")?;
                for key in &keys {
                    stmt.execute(params![key])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn all_keys(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key FROM kv ORDER BY key")?;
            let keys = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(keys)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    async fn exercise(store: &dyn KvStore) {
        store.set("a", "1").await.expect("set a");
        store.set("b", "2").await.expect("set b");
        assert_eq!(store.get("a").await.expect("get a").as_deref(), Some("1"));
        assert_eq!(store.get("missing").await.expect("get missing"), None);

        store.set("a", "3").await.expect("overwrite a");
        assert_eq!(store.get("a").await.expect("get a").as_deref(), Some("3"));

        store
            .multi_set(&[
                ("c".to_string(), "4".to_string()),
                ("d".to_string(), "5".to_string()),
            ])
            .await
            .expect("multi_set");
        let values = store
            .multi_get(&["a".to_string(), "c".to_string(), "x".to_string()])
            .await
            .expect("multi_get");
        assert_eq!(
            values,
            vec![Some("3".to_string()), Some("4".to_string()), None]
        );

        let mut keys = store.all_keys().await.expect("all_keys");
        keys.sort();
        assert_eq!(keys, vec!["a", "b", "c", "d"]);

        store
            .multi_remove(&["a".to_string(), "d".to_string()])
            .await
            .expect("multi_remove");
        assert_eq!(store.get("a").await.expect("get a"), None);
        assert_eq!(store.get("b").await.expect("get b").as_deref(), Some("2"));

        store.remove("b").await.expect("remove b");
        assert_eq!(store.get("b").await.expect("get b"), None);
    }

    #[tokio::test]
    async fn memory_store_roundtrip() {
        exercise(&MemoryKvStore::new()).await;
    }

    #[tokio::test]
    async fn sqlite_store_roundtrip() {
        let store = SqliteKvStore::open_in_memory().expect("open db");
        exercise(&store).await;
    }

    #[tokio::test]
    async fn sqlite_store_persists_across_reopen() {
        let file = NamedTempFile::new().expect("temp db");
        {
            let store = SqliteKvStore::open(file.path()).expect("open db");
            store.set("userId", "u1").await.expect("set");
        }
        let store = SqliteKvStore::open(file.path()).expect("reopen db");
        assert_eq!(
            store.get("userId").await.expect("get").as_deref(),
            Some("u1")
        );
    }
}
