use std::{fmt::Debug, path::Path, sync::Arc, time::Duration};

use libsql::{
    Builder, Connection, Row, Value,
    params::IntoParams,
};
use tokio::sync::Mutex;

use crate::api::{StoreEngine, WriteBatch};
use crate::error::StoreError;

/// ### SqlStore
/// - `read_conn`: a connection used for read only statements
/// - `write_conn`: a connection used for writing, protected by a Mutex to
///   enforce a maximum of 1 writer. If writes go through the read connection
///   `SQLite failure: database is locked` problems will arise.
pub struct SqlStore {
    read_conn: Connection,
    write_conn: Arc<Mutex<Connection>>,
}

impl Debug for SqlStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SqlStore")
    }
}

const DB_SCHEMA: [&str; 1] =
    ["CREATE TABLE IF NOT EXISTS kv (key TEXT PRIMARY KEY, value BLOB NOT NULL)"];

impl SqlStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        futures::executor::block_on(async {
            let db = Builder::new_local(path).build().await?;
            let write_conn = db.connect()?;
            // From libsql documentation:
            // Newly created connections currently have a default busy timeout of
            // 5000ms, but this may be subject to change.
            write_conn.busy_timeout(Duration::from_millis(5000))?;
            let store = SqlStore {
                read_conn: db.connect()?,
                write_conn: Arc::new(Mutex::new(write_conn)),
            };
            store.init_db().await?;
            Ok(store)
        })
    }

    async fn init_db(&self) -> Result<(), StoreError> {
        // WAL: readers do not block the single writer and vice versa.
        self.read_conn.query("PRAGMA journal_mode=WAL;", ()).await?;
        let conn = self.write_conn.lock().await;
        for statement in DB_SCHEMA {
            conn.execute(statement, ()).await?;
        }
        Ok(())
    }

    async fn query<T: IntoParams>(
        &self,
        sql: &str,
        params: T,
    ) -> Result<libsql::Rows, StoreError> {
        Ok(self.read_conn.query(sql, params).await?)
    }
}

fn read_from_row_text(row: &Row, index: i32) -> Result<String, StoreError> {
    match row.get_value(index)? {
        Value::Text(s) => Ok(s),
        _ => Err(StoreError::SqlInvalidType),
    }
}

fn read_from_row_blob(row: &Row, index: i32) -> Result<Vec<u8>, StoreError> {
    match row.get_value(index)? {
        Value::Blob(vec) => Ok(vec),
        _ => Err(StoreError::SqlInvalidType),
    }
}

/// Escapes `%`, `_` and `\` so a key prefix can be used in a LIKE pattern.
fn like_escape(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait::async_trait]
impl StoreEngine for SqlStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut rows = self
            .query("SELECT value FROM kv WHERE key = ?1", vec![key])
            .await?;
        if let Some(row) = rows.next().await? {
            return Ok(Some(read_from_row_blob(&row, 0)?));
        }
        Ok(None)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let pattern = format!("{}%", like_escape(prefix));
        let mut rows = self
            .query(
                "SELECT key, value FROM kv WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key ASC",
                vec![pattern],
            )
            .await?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push((read_from_row_text(&row, 0)?, read_from_row_blob(&row, 1)?));
        }
        Ok(entries)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let conn = self.write_conn.lock().await;
        let tx = conn.transaction().await?;
        for (key, value) in batch.sets {
            tx.execute(
                "INSERT INTO kv VALUES (?1, ?2) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                (key, value),
            )
            .await?;
        }
        for key in batch.deletes {
            tx.execute("DELETE FROM kv WHERE key = ?1", vec![key]).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, SqlStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqlStore::new(dir.path().join("kernel.db")).expect("open");
        (dir, store)
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("kernel.db");
        {
            let store = SqlStore::new(&path).expect("open");
            let mut batch = WriteBatch::new();
            batch.set("queue.head", b"4294967296".to_vec());
            store.commit(batch).await.expect("commit");
        }
        let store = SqlStore::new(&path).expect("reopen");
        assert_eq!(
            store.get("queue.head").await.expect("get"),
            Some(b"4294967296".to_vec())
        );
    }

    #[tokio::test]
    async fn batch_applies_sets_then_deletes() {
        let (_dir, store) = temp_store();
        let mut batch = WriteBatch::new();
        batch.set("a", b"1".to_vec());
        batch.set("a", b"2".to_vec());
        batch.set("b", b"3".to_vec());
        batch.delete("b");
        store.commit(batch).await.expect("commit");
        assert_eq!(store.get("a").await.expect("get"), Some(b"2".to_vec()));
        assert_eq!(store.get("b").await.expect("get"), None);
    }

    #[tokio::test]
    async fn scan_prefix_does_not_leak_across_partitions() {
        let (_dir, store) = temp_store();
        let mut batch = WriteBatch::new();
        batch.set("vatstore.v1.a", b"1".to_vec());
        batch.set("vatstore.v1.b", b"2".to_vec());
        batch.set("vatstore.v10.a", b"3".to_vec());
        store.commit(batch).await.expect("commit");

        let scanned = store.scan_prefix("vatstore.v1.").await.expect("scan");
        let keys: Vec<&str> = scanned.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["vatstore.v1.a", "vatstore.v1.b"]);
    }
}
