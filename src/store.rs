use std::path::PathBuf;

use parking_lot::{Mutex, MutexGuard};
use rocksdb::{
    DBRawIteratorWithThreadMode, DBWithThreadMode, MultiThreaded, Options, WriteBatch,
};

use crate::error::{JoinError, Result};

type Db = DBWithThreadMode<MultiThreaded>;

/// Ordered key-value store holding per-user event records and the queued
/// session envelopes. All mutation goes through a [`Transaction`]; the write
/// lock serializes transactions so each one owns the store for its lifetime.
pub struct SessionStore {
    db: Db,
    write_lock: Mutex<()>,
}

impl SessionStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        let mut options = Options::default();
        options.create_if_missing(true);
        let db = Db::open(&options, path).map_err(|err| JoinError::Storage(err.to_string()))?;

        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    pub fn begin(&self) -> Transaction<'_> {
        Transaction {
            store: self,
            _guard: self.write_lock.lock(),
            batch: WriteBatch::default(),
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.db
            .get(key)
            .map_err(|err| JoinError::Storage(err.to_string()))
    }

    /// Committed keys beginning with `prefix`, in order.
    pub fn keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut iter = self.db.raw_iterator();
        iter.seek(prefix);
        let mut keys = Vec::new();
        while iter.valid() {
            let key = iter.key().unwrap_or_default();
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key.to_vec());
            iter.next();
        }
        iter.status()
            .map_err(|err| JoinError::Storage(err.to_string()))?;
        Ok(keys)
    }
}

/// Pending writes buffered against the store, committed as one atomic batch.
/// Dropping a transaction without committing discards it.
pub struct Transaction<'a> {
    store: &'a SessionStore,
    _guard: MutexGuard<'a, ()>,
    batch: WriteBatch,
}

impl<'a> Transaction<'a> {
    /// Insert-or-overwrite.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) {
        self.batch.put(key, value);
    }

    /// Overwrite. The store treats this identically to [`insert`]; the two
    /// names track the distinct intents of the callers.
    ///
    /// [`insert`]: Transaction::insert
    pub fn update(&mut self, key: &[u8], value: &[u8]) {
        self.batch.put(key, value);
    }

    /// Opens a cursor over the committed key space. Deletions made through
    /// the cursor join this transaction's batch. The cursor borrows the
    /// transaction, so it is released on every exit path by drop.
    pub fn cursor(&mut self) -> Cursor<'_> {
        let db = &self.store.db;
        Cursor {
            iter: db.raw_iterator(),
            batch: &mut self.batch,
        }
    }

    pub fn commit(self) -> Result<()> {
        let Transaction {
            store,
            _guard,
            batch,
        } = self;
        if batch.is_empty() {
            return Ok(());
        }
        store
            .db
            .write(batch)
            .map_err(|err| JoinError::Storage(err.to_string()))
    }
}

/// Ordered scan position over the committed store.
pub struct Cursor<'t> {
    iter: DBRawIteratorWithThreadMode<'t, Db>,
    batch: &'t mut WriteBatch,
}

impl<'t> Cursor<'t> {
    /// Positions on the first key in the store. Returns false on an empty
    /// store.
    pub fn seek_first(&mut self) -> Result<bool> {
        self.iter.seek_to_first();
        self.check_position()
    }

    /// Positions on `key` or the next greater key. Returns false when no key
    /// at or after `key` exists.
    pub fn seek_first_or_greater(&mut self, key: &[u8]) -> Result<bool> {
        self.iter.seek(key);
        self.check_position()
    }

    /// Moves to the next key. Returns false at the end of the key space.
    pub fn advance(&mut self) -> Result<bool> {
        if !self.iter.valid() {
            return Ok(false);
        }
        self.iter.next();
        self.check_position()
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.iter.key()
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.iter.value()
    }

    /// Queues deletion of the current key into the owning transaction.
    pub fn delete_current(&mut self) -> Result<()> {
        let key = self
            .iter
            .key()
            .ok_or_else(|| JoinError::Storage("cursor is not positioned".into()))?;
        self.batch.delete(key);
        Ok(())
    }

    fn check_position(&self) -> Result<bool> {
        if self.iter.valid() {
            return Ok(true);
        }
        self.iter
            .status()
            .map_err(|err| JoinError::Storage(err.to_string()))?;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(tmp: &TempDir) -> SessionStore {
        SessionStore::open(tmp.path().join("sessions")).unwrap()
    }

    #[test]
    fn committed_writes_are_readable() {
        let tmp = TempDir::new().expect("create temp dir");
        let store = open_store(&tmp);

        let mut txn = store.begin();
        txn.insert(b"u1~q~0001", b"first");
        txn.update(b"u1~cust", b"CUST1");
        txn.commit().unwrap();

        assert_eq!(store.get(b"u1~cust").unwrap(), Some(b"CUST1".to_vec()));
        assert_eq!(store.get(b"u1~q~0001").unwrap(), Some(b"first".to_vec()));
        assert_eq!(store.get(b"missing").unwrap(), None);
    }

    #[test]
    fn dropped_transaction_discards_writes() {
        let tmp = TempDir::new().expect("create temp dir");
        let store = open_store(&tmp);

        {
            let mut txn = store.begin();
            txn.insert(b"u1~q~0001", b"first");
        }

        assert_eq!(store.get(b"u1~q~0001").unwrap(), None);
    }

    #[test]
    fn cursor_walks_a_prefix_in_order() {
        let tmp = TempDir::new().expect("create temp dir");
        let store = open_store(&tmp);

        let mut txn = store.begin();
        txn.insert(b"u1~cust", b"CUST1");
        txn.insert(b"u1~q~0002", b"b");
        txn.insert(b"u1~q~0001", b"a");
        txn.insert(b"u2~cust", b"CUST2");
        txn.commit().unwrap();

        let mut txn = store.begin();
        let mut cursor = txn.cursor();
        let mut seen = Vec::new();
        let mut found = cursor.seek_first_or_greater(b"u1").unwrap();
        while found {
            let key = cursor.key().unwrap().to_vec();
            if !key.starts_with(b"u1") {
                break;
            }
            seen.push(key);
            found = cursor.advance().unwrap();
        }
        assert_eq!(
            seen,
            vec![
                b"u1~cust".to_vec(),
                b"u1~q~0001".to_vec(),
                b"u1~q~0002".to_vec()
            ]
        );
    }

    #[test]
    fn cursor_deletions_drain_on_commit() {
        let tmp = TempDir::new().expect("create temp dir");
        let store = open_store(&tmp);

        let mut txn = store.begin();
        txn.insert(b"u1~q~0001", b"a");
        txn.insert(b"u1~q~0002", b"b");
        txn.insert(b"u2~q~0001", b"other");
        txn.commit().unwrap();

        let mut txn = store.begin();
        {
            let mut cursor = txn.cursor();
            let mut found = cursor.seek_first_or_greater(b"u1").unwrap();
            while found {
                let key = cursor.key().unwrap().to_vec();
                if !key.starts_with(b"u1") {
                    break;
                }
                cursor.delete_current().unwrap();
                found = cursor.advance().unwrap();
            }
        }
        txn.commit().unwrap();

        assert!(store.keys_with_prefix(b"u1").unwrap().is_empty());
        assert_eq!(store.keys_with_prefix(b"u2").unwrap().len(), 1);
    }

    #[test]
    fn seek_first_covers_the_whole_store() {
        let tmp = TempDir::new().expect("create temp dir");
        let store = open_store(&tmp);

        let mut txn = store.begin();
        txn.insert(b"__sessionq-abc", b"env");
        txn.insert(b"u1~q~0001", b"a");
        txn.commit().unwrap();

        let mut txn = store.begin();
        let mut cursor = txn.cursor();
        let mut count = 0;
        let mut found = cursor.seek_first().unwrap();
        while found {
            count += 1;
            found = cursor.advance().unwrap();
        }
        assert_eq!(count, 2);
    }
}
