//! Persistent placement store backed by redb.
//!
//! Maps a file path to its 16-byte placement record. A reserved key holds
//! the binary format version; a store written with a different version is
//! refused on open so incompatible records are never misread.

use crate::tables;
use redb::{Database, ReadableTable, ReadableTableMetadata};
use std::path::Path;
use tracing::{debug, error, info};
use xorstor_common::PlacementRecord;

/// Version of the record layout this build reads and writes.
pub const FORMAT_VERSION: u64 = 1;

/// File name of the database inside the metadata directory.
pub const DATABASE_FILE: &str = "placements.redb";

/// Error type for metadata store operations
#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store format version mismatch: found {found}, expected {expected}")]
    SchemaMismatch { found: u64, expected: u64 },
    #[error("corrupt entry: {0}")]
    Corrupt(String),
}

impl From<redb::TransactionError> for MetaStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<MetaStoreError> for xorstor_common::Error {
    fn from(e: MetaStoreError) -> Self {
        match e {
            MetaStoreError::SchemaMismatch { found, expected } => {
                Self::SchemaMismatch { found, expected }
            }
            MetaStoreError::Io(e) => Self::Io(e),
            other => Self::Store(other.to_string()),
        }
    }
}

pub type MetaStoreResult<T> = Result<T, MetaStoreError>;

/// Persistent path to placement map.
///
/// Safe to share between worker lanes; every write is its own transaction.
pub struct PlacementStore {
    db: Database,
}

impl PlacementStore {
    /// Open (or create) the store in `dir` at the current format version.
    pub fn open(dir: impl AsRef<Path>) -> MetaStoreResult<Self> {
        Self::open_with_version(dir, FORMAT_VERSION)
    }

    /// Open (or create) the store in `dir`, requiring `expected` as format
    /// version. A new store is stamped with `expected`.
    pub fn open_with_version(dir: impl AsRef<Path>, expected: u64) -> MetaStoreResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let db = Database::create(dir.join(DATABASE_FILE))?;

        let write_txn = db.begin_write()?;
        let stored = {
            let mut table = write_txn.open_table(tables::PLACEMENTS)?;
            let stored = match table.get(tables::FORMAT_VERSION_KEY)? {
                Some(guard) => Some(decode_version(guard.value())?),
                None => None,
            };
            if stored.is_none() {
                table.insert(tables::FORMAT_VERSION_KEY, &expected.to_le_bytes()[..])?;
            }
            stored
        };

        match stored {
            Some(found) if found != expected => {
                write_txn.abort()?;
                error!(
                    "Refusing store at {}: format version {} (expected {})",
                    dir.display(),
                    found,
                    expected
                );
                return Err(MetaStoreError::SchemaMismatch { found, expected });
            }
            Some(_) => write_txn.abort()?,
            None => {
                write_txn.commit()?;
                info!(
                    "Initialized placement store at {} (format version {})",
                    dir.display(),
                    expected
                );
            }
        }

        Ok(Self { db })
    }

    pub fn get(&self, path: &[u8]) -> MetaStoreResult<Option<PlacementRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::PLACEMENTS)?;
        match table.get(path)? {
            Some(guard) => decode_record(path, guard.value()).map(Some),
            None => Ok(None),
        }
    }

    pub fn set(&self, path: &[u8], record: &PlacementRecord) -> MetaStoreResult<()> {
        reject_reserved(path)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::PLACEMENTS)?;
            table.insert(path, &record.to_bytes()[..])?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn delete(&self, path: &[u8]) -> MetaStoreResult<()> {
        reject_reserved(path)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::PLACEMENTS)?;
            table.remove(path)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Write many records in a single transaction.
    pub fn set_many(&self, records: &[(Vec<u8>, PlacementRecord)]) -> MetaStoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::PLACEMENTS)?;
            for (path, record) in records {
                reject_reserved(path)?;
                table.insert(path.as_slice(), &record.to_bytes()[..])?;
            }
        }
        write_txn.commit()?;
        debug!("Restored {} placement records", records.len());
        Ok(())
    }

    /// Visit every placement record in key order.
    ///
    /// Undecodable entries are logged and skipped.
    pub fn for_each<F>(&self, mut f: F) -> MetaStoreResult<()>
    where
        F: FnMut(&[u8], PlacementRecord) -> MetaStoreResult<()>,
    {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::PLACEMENTS)?;
        for entry in table.iter()? {
            let entry = entry?;
            let path = entry.0.value();
            if path == tables::FORMAT_VERSION_KEY {
                continue;
            }
            match decode_record(path, entry.1.value()) {
                Ok(record) => f(path, record)?,
                Err(e) => error!("Skipping entry: {}", e),
            }
        }
        Ok(())
    }

    /// Number of placement records, excluding the version key.
    pub fn len(&self) -> MetaStoreResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::PLACEMENTS)?;
        Ok(table.len()?.saturating_sub(1))
    }

    pub fn is_empty(&self) -> MetaStoreResult<bool> {
        Ok(self.len()? == 0)
    }
}

fn reject_reserved(path: &[u8]) -> MetaStoreResult<()> {
    if path == tables::FORMAT_VERSION_KEY {
        return Err(MetaStoreError::Corrupt(
            "attempt to overwrite the format version key".to_string(),
        ));
    }
    Ok(())
}

fn decode_version(bytes: &[u8]) -> MetaStoreResult<u64> {
    let bytes: [u8; 8] = bytes.try_into().map_err(|_| {
        MetaStoreError::Corrupt(format!("format version has {} bytes", bytes.len()))
    })?;
    Ok(u64::from_le_bytes(bytes))
}

fn decode_record(path: &[u8], bytes: &[u8]) -> MetaStoreResult<PlacementRecord> {
    PlacementRecord::from_bytes(bytes).map_err(|e| {
        MetaStoreError::Corrupt(format!("{}: {}", String::from_utf8_lossy(path), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use xorstor_common::{Locations, TargetMask, TargetSlot};

    fn record(ts: i64, data: u64, parity: usize) -> PlacementRecord {
        PlacementRecord::new(
            ts,
            Locations::new(
                TargetMask::from_bits(data),
                Some(TargetSlot::new(parity).unwrap()),
            ),
        )
    }

    #[test]
    fn test_set_get_delete() {
        let dir = tempdir().unwrap();
        let store = PlacementStore::open(dir.path()).unwrap();

        let rec = record(42, 0b011, 2);
        store.set(b"a/b", &rec).unwrap();
        assert_eq!(store.get(b"a/b").unwrap(), Some(rec));

        store.delete(b"a/b").unwrap();
        assert_eq!(store.get(b"a/b").unwrap(), None);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_overwrite() {
        let dir = tempdir().unwrap();
        let store = PlacementStore::open(dir.path()).unwrap();
        store.set(b"f", &record(1, 0b1, 1)).unwrap();
        store.set(b"f", &record(2, 0b11, 2)).unwrap();
        assert_eq!(store.get(b"f").unwrap(), Some(record(2, 0b11, 2)));
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_reopen_keeps_records() {
        let dir = tempdir().unwrap();
        {
            let store = PlacementStore::open(dir.path()).unwrap();
            store.set(b"x/y/z", &record(7, 0b100, 0)).unwrap();
        }
        let store = PlacementStore::open(dir.path()).unwrap();
        assert_eq!(store.get(b"x/y/z").unwrap(), Some(record(7, 0b100, 0)));
    }

    #[test]
    fn test_version_mismatch_is_refused() {
        let dir = tempdir().unwrap();
        {
            let store = PlacementStore::open_with_version(dir.path(), 2).unwrap();
            store.set(b"keep", &record(5, 0b1, 1)).unwrap();
        }

        let err = PlacementStore::open_with_version(dir.path(), 1).err().unwrap();
        assert!(matches!(
            err,
            MetaStoreError::SchemaMismatch {
                found: 2,
                expected: 1
            }
        ));
        let common: xorstor_common::Error = err.into();
        assert!(common.is_fatal());

        // Nothing was rewritten by the refused open
        let store = PlacementStore::open_with_version(dir.path(), 2).unwrap();
        assert_eq!(store.get(b"keep").unwrap(), Some(record(5, 0b1, 1)));
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_for_each_skips_version_key() {
        let dir = tempdir().unwrap();
        let store = PlacementStore::open(dir.path()).unwrap();
        store
            .set_many(&[
                (b"b".to_vec(), record(1, 0b01, 1)),
                (b"a".to_vec(), record(2, 0b10, 0)),
            ])
            .unwrap();

        let mut seen = Vec::new();
        store
            .for_each(|path, rec| {
                seen.push((path.to_vec(), rec.timestamp));
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![(b"a".to_vec(), 2), (b"b".to_vec(), 1)]);
    }

    #[test]
    fn test_reserved_key_is_protected() {
        let dir = tempdir().unwrap();
        let store = PlacementStore::open(dir.path()).unwrap();
        assert!(store.set(tables::FORMAT_VERSION_KEY, &record(1, 1, 1)).is_err());
        assert!(store.delete(tables::FORMAT_VERSION_KEY).is_err());
    }
}
