//! Key-Value Index Database
//!
//! A single SQLite table of raw key/value pairs. Readers hit the table
//! directly; all writes flow through a [`WriteBatch`] committed in one
//! transaction, so an index update is atomic with respect to crashes.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::debug;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{keys, StorageError, StoreFlag};

/// SQLite-backed key-value store
pub struct IndexDb {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

/// An ordered set of puts and deletes applied atomically
#[derive(Default)]
pub struct WriteBatch {
    ops: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

impl WriteBatch {
    pub fn new() -> Self {
        WriteBatch::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push((key, Some(value)));
    }

    pub fn put_json<T: Serialize>(&mut self, key: Vec<u8>, value: &T) -> Result<(), StorageError> {
        self.ops.push((key, Some(serde_json::to_vec(value)?)));
        Ok(())
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push((key, None));
    }

    pub fn put_flag(&mut self, flag: StoreFlag, value: bool) {
        self.put(keys::flag_key(flag.name()), vec![value as u8]);
    }

    /// Merge another batch after this one
    pub fn extend(&mut self, other: WriteBatch) {
        self.ops.extend(other.ops);
    }
}

impl IndexDb {
    /// Open (or create) the database at a path
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, StorageError> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key BLOB PRIMARY KEY,
                value BLOB NOT NULL
            )",
            [],
        )?;
        Ok(IndexDb {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Read one value
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let conn = self.conn.lock().expect("index db lock poisoned");
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Read and JSON-decode one value
    pub fn get_json<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>, StorageError> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.get(key)?.is_some())
    }

    /// All pairs whose key starts with `prefix`, in key order
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let mut upper = prefix.to_vec();
        // Smallest byte string greater than every key with this prefix.
        loop {
            match upper.last_mut() {
                Some(byte) if *byte < 0xff => {
                    *byte += 1;
                    break;
                }
                Some(_) => {
                    upper.pop();
                }
                None => break,
            }
        }
        let conn = self.conn.lock().expect("index db lock poisoned");
        let mut rows = Vec::new();
        if upper.is_empty() {
            let mut stmt =
                conn.prepare("SELECT key, value FROM kv WHERE key >= ?1 ORDER BY key")?;
            let iter = stmt.query_map(params![prefix], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;
            for row in iter {
                rows.push(row?);
            }
        } else {
            let mut stmt = conn
                .prepare("SELECT key, value FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key")?;
            let iter = stmt.query_map(params![prefix, upper], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;
            for row in iter {
                rows.push(row?);
            }
        }
        Ok(rows)
    }

    /// Apply a batch across several transactions of at most `chunk_ops`
    /// operations each, preserving order. A crash between chunks leaves a
    /// prefix applied; callers rely on the head-block markers plus startup
    /// replay to reconcile.
    pub fn commit_chunked(&self, batch: WriteBatch, chunk_ops: usize) -> Result<(), StorageError> {
        let mut ops = batch.ops;
        while !ops.is_empty() {
            let rest = ops.split_off(ops.len().min(chunk_ops.max(1)));
            let chunk = WriteBatch { ops };
            self.commit(chunk)?;
            ops = rest;
        }
        Ok(())
    }

    /// Apply a batch in one transaction
    pub fn commit(&self, batch: WriteBatch) -> Result<(), StorageError> {
        if batch.is_empty() {
            return Ok(());
        }
        let op_count = batch.len();
        let mut conn = self.conn.lock().expect("index db lock poisoned");
        let tx = conn.transaction()?;
        for (key, value) in batch.ops {
            match value {
                Some(value) => {
                    tx.execute(
                        "INSERT INTO kv (key, value) VALUES (?1, ?2)
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                        params![key, value],
                    )?;
                }
                None => {
                    tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
                }
            }
        }
        tx.commit()?;
        debug!("index batch committed: {op_count} op(s)");
        Ok(())
    }

    /// Read a boolean store flag; absent means false
    pub fn flag(&self, flag: StoreFlag) -> Result<bool, StorageError> {
        Ok(self
            .get(&keys::flag_key(flag.name()))?
            .map(|v| v.first() == Some(&1))
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, IndexDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = IndexDb::open(dir.path().join("index.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn test_put_get_delete() {
        let (_dir, db) = open_temp();
        let mut batch = WriteBatch::new();
        batch.put(b"hello".to_vec(), b"world".to_vec());
        db.commit(batch).unwrap();
        assert_eq!(db.get(b"hello").unwrap(), Some(b"world".to_vec()));

        let mut batch = WriteBatch::new();
        batch.delete(b"hello".to_vec());
        db.commit(batch).unwrap();
        assert_eq!(db.get(b"hello").unwrap(), None);
    }

    #[test]
    fn test_batch_overwrites_in_order() {
        let (_dir, db) = open_temp();
        let mut batch = WriteBatch::new();
        batch.put(b"k".to_vec(), b"first".to_vec());
        batch.put(b"k".to_vec(), b"second".to_vec());
        db.commit(batch).unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"second".to_vec()));
    }

    #[test]
    fn test_scan_prefix() {
        let (_dir, db) = open_temp();
        let mut batch = WriteBatch::new();
        batch.put(b"a1".to_vec(), b"1".to_vec());
        batch.put(b"a2".to_vec(), b"2".to_vec());
        batch.put(b"b1".to_vec(), b"3".to_vec());
        db.commit(batch).unwrap();

        let rows = db.scan_prefix(b"a").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, b"a1");
        assert_eq!(rows[1].0, b"a2");
    }

    #[test]
    fn test_flags_default_false() {
        let (_dir, db) = open_temp();
        assert!(!db.flag(StoreFlag::TxIndex).unwrap());
        let mut batch = WriteBatch::new();
        batch.put_flag(StoreFlag::TxIndex, true);
        db.commit(batch).unwrap();
        assert!(db.flag(StoreFlag::TxIndex).unwrap());
    }
}
