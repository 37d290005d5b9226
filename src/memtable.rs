use crossbeam_skiplist::SkipMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::config::{IoMode, WriteOptions};
use crate::error::{Error, Result};
use crate::wal::Wal;

/// A value as held in a memtable: the payload plus the delete marker and
/// the optional absolute expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub value: Vec<u8>,
    pub tombstone: bool,
    pub expires_at: u64,
}

#[derive(Debug, Clone)]
pub struct MemtableOptions {
    pub dir: PathBuf,
    pub fid: u32,
    pub max_size: u64,
    pub io_mode: IoMode,
    pub wal_bytes_flush: u64,
}

/// An in-memory ordered table backed 1:1 by a WAL segment.
///
/// The skip map makes point reads and inserts safe for concurrent readers;
/// the WAL append is serialized by an internal mutex so the log order
/// matches the order inserts become visible.
#[derive(Debug)]
pub struct Memtable {
    fid: u32,
    data: SkipMap<Vec<u8>, Record>,
    wal: Mutex<Option<Wal>>,
    wal_path: PathBuf,
    size: AtomicU64,
    max_size: u64,
}

impl Memtable {
    /// Opens the memtable for `opts.fid`, replaying its WAL into memory.
    /// A torn or corrupt WAL aborts the open.
    pub fn open(opts: &MemtableOptions) -> Result<Self> {
        let wal = Wal::open(&opts.dir, opts.fid, opts.io_mode, opts.wal_bytes_flush)?;
        let wal_path = wal.path().to_path_buf();

        let data = SkipMap::new();
        let size = AtomicU64::new(0);
        for record in wal.replay()? {
            let record = record?;
            size.fetch_add((record.key.len() + record.value.len()) as u64, Ordering::SeqCst);
            data.insert(
                record.key,
                Record {
                    value: record.value,
                    tombstone: record.tombstone,
                    expires_at: record.expires_at,
                },
            );
        }

        Ok(Self {
            fid: opts.fid,
            data,
            wal: Mutex::new(Some(wal)),
            wal_path,
            size,
            max_size: opts.max_size,
        })
    }

    pub fn fid(&self) -> u32 {
        self.fid
    }

    /// Current byte usage: the sum of key and value lengths ever inserted.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    /// Whether admitting `extra` more bytes would exceed the byte budget.
    pub fn is_full(&self, extra: u64) -> bool {
        self.size() + extra > self.max_size
    }

    /// Inserts or updates a key. The WAL append happens before the
    /// in-memory insert so a failed append leaves the table untouched.
    pub fn put(&self, key: &[u8], value: &[u8], tombstone: bool, opts: &WriteOptions) -> Result<()> {
        let mut guard = self.wal.lock()?;
        if !opts.disable_wal {
            let wal = guard.as_mut().ok_or(Error::Closed)?;
            wal.append(key, value, tombstone, opts.expires_at)?;
            if opts.sync {
                wal.sync()?;
            }
        }
        self.data.insert(
            key.to_vec(),
            Record {
                value: value.to_vec(),
                tombstone,
                expires_at: opts.expires_at,
            },
        );
        self.size
            .fetch_add((key.len() + value.len()) as u64, Ordering::SeqCst);
        Ok(())
    }

    /// Records a tombstone for the key.
    pub fn delete(&self, key: &[u8], opts: &WriteOptions) -> Result<()> {
        self.put(key, &[], true, opts)
    }

    /// Looks up a key. `None` means the key is unknown to this table;
    /// a returned record may still be a tombstone or expired.
    pub fn get(&self, key: &[u8]) -> Option<Record> {
        self.data.get(key).map(|entry| entry.value().clone())
    }

    /// Iterates the table in key order.
    pub fn iter(&self) -> impl Iterator<Item = (Vec<u8>, Record)> + '_ {
        self.data
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
    }

    /// Fsyncs the WAL.
    pub fn sync_wal(&self) -> Result<()> {
        if let Some(wal) = self.wal.lock()?.as_mut() {
            wal.sync()?;
        }
        Ok(())
    }

    /// Flushes and closes the WAL handle. Later writes fail with `Closed`.
    pub fn close_wal(&self) -> Result<()> {
        if let Some(mut wal) = self.wal.lock()?.take() {
            wal.sync()?;
        }
        Ok(())
    }

    /// Removes the WAL segment from disk, closing it first if needed.
    pub fn delete_wal(&self) -> Result<()> {
        match self.wal.lock()?.take() {
            Some(wal) => wal.remove(),
            None => match std::fs::remove_file(&self.wal_path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_memtable(dir: &std::path::Path, fid: u32) -> Memtable {
        Memtable::open(&MemtableOptions {
            dir: dir.to_path_buf(),
            fid,
            max_size: 1024,
            io_mode: IoMode::Buffered,
            wal_bytes_flush: 0,
        })
        .expect("failed to open memtable")
    }

    #[test]
    fn test_put_and_get() {
        let dir = tempdir().unwrap();
        let table = open_memtable(dir.path(), 1);
        let opts = WriteOptions::default();

        table.put(b"key1", b"value1", false, &opts).unwrap();
        table.put(b"key2", b"value2", false, &opts).unwrap();

        assert_eq!(table.get(b"key1").unwrap().value, b"value1");
        assert_eq!(table.get(b"key2").unwrap().value, b"value2");
        assert!(table.get(b"key3").is_none());
    }

    #[test]
    fn test_tombstone_is_present() {
        let dir = tempdir().unwrap();
        let table = open_memtable(dir.path(), 1);
        let opts = WriteOptions::default();

        table.put(b"key1", b"value1", false, &opts).unwrap();
        table.delete(b"key1", &opts).unwrap();

        let record = table.get(b"key1").unwrap();
        assert!(record.tombstone);
        assert!(record.value.is_empty());
    }

    #[test]
    fn test_replay_restores_state() {
        let dir = tempdir().unwrap();
        let opts = WriteOptions::default();
        {
            let table = open_memtable(dir.path(), 1);
            table.put(b"key1", b"value1", false, &opts).unwrap();
            table.put(b"key2", b"value2", false, &opts).unwrap();
            table.delete(b"key1", &opts).unwrap();
            table.sync_wal().unwrap();
            table.close_wal().unwrap();
        }

        let table = open_memtable(dir.path(), 1);
        assert!(table.get(b"key1").unwrap().tombstone);
        assert_eq!(table.get(b"key2").unwrap().value, b"value2");
    }

    #[test]
    fn test_size_tracking() {
        let dir = tempdir().unwrap();
        let table = open_memtable(dir.path(), 1);
        let opts = WriteOptions::default();

        table.put(b"key1", b"value1", false, &opts).unwrap();
        assert_eq!(table.size(), 10);
        assert!(!table.is_full(1014));
        assert!(table.is_full(1015));
    }

    #[test]
    fn test_iter_is_sorted() {
        let dir = tempdir().unwrap();
        let table = open_memtable(dir.path(), 1);
        let opts = WriteOptions::default();

        table.put(b"key3", b"3", false, &opts).unwrap();
        table.put(b"key1", b"1", false, &opts).unwrap();
        table.put(b"key2", b"2", false, &opts).unwrap();

        let keys: Vec<_> = table.iter().map(|(key, _)| key).collect();
        assert_eq!(keys, vec![b"key1".to_vec(), b"key2".to_vec(), b"key3".to_vec()]);
    }

    #[test]
    fn test_disable_wal_skips_log() {
        let dir = tempdir().unwrap();
        let opts = WriteOptions {
            disable_wal: true,
            ..Default::default()
        };
        {
            let table = open_memtable(dir.path(), 1);
            table.put(b"key1", b"value1", false, &opts).unwrap();
            assert_eq!(table.get(b"key1").unwrap().value, b"value1");
            table.close_wal().unwrap();
        }

        // Nothing hit the WAL, so replay comes back empty.
        let table = open_memtable(dir.path(), 1);
        assert!(table.get(b"key1").is_none());
    }

    #[test]
    fn test_delete_wal_removes_file() {
        let dir = tempdir().unwrap();
        let table = open_memtable(dir.path(), 1);
        table
            .put(b"key1", b"value1", false, &WriteOptions::default())
            .unwrap();

        let wal_path = crate::wal::segment_path(dir.path(), 1);
        assert!(wal_path.exists());
        table.delete_wal().unwrap();
        assert!(!wal_path.exists());
    }
}
