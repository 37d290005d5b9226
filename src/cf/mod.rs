//! The column family core: one active memtable, a queue of frozen
//! memtables awaiting flush, a persistent index, and a value log, all
//! sharing a reader-writer lock over the memtable set.

mod flush;
mod gc;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::{ColumnFamilyOptions, IoMode, WriteOptions};
use crate::error::{Error, Result};
use crate::flock::DirLockSet;
use crate::index::Indexer;
use crate::memtable::{Memtable, MemtableOptions};
use crate::vlog::{ValueLog, VlogOptions};
use crate::wal::{self, INITIAL_LOG_FID};

/// Statistics of a column family.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stat {
    /// Summed byte size of the active and frozen memtables.
    pub memtable_size: i64,
}

/// Seconds since the epoch.
pub(crate) fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub(crate) fn is_expired(expires_at: u64) -> bool {
    expires_at > 0 && expires_at <= now_unix()
}

/// The memtable set guarded by the column family's reader-writer lock.
pub(crate) struct Tables {
    pub(crate) active: Arc<Memtable>,
    /// Frozen memtables, oldest first. Every fid here is strictly smaller
    /// than the active table's fid.
    pub(crate) immutables: VecDeque<Arc<Memtable>>,
}

/// An independent keyspace with its own memtables, WAL, index, and value log.
pub struct ColumnFamily {
    opts: ColumnFamilyOptions,
    tables: RwLock<Tables>,
    indexer: Indexer,
    vlog: ValueLog,
    flush_tx: Sender<Arc<Memtable>>,
    /// Serializes rotations so the space wait can block without holding
    /// `tables`; readers and the insert critical section stay unaffected.
    rotation: Mutex<()>,
    /// Serializes flush against value log GC; both rewrite index entries
    /// for value log locations.
    flush_lock: RwLock<()>,
    close_rx: Receiver<()>,
    close_tx: Mutex<Option<Sender<()>>>,
    closed: AtomicBool,
    dir_locks: Mutex<DirLockSet>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

fn memtable_options(opts: &ColumnFamilyOptions, fid: u32) -> MemtableOptions {
    MemtableOptions {
        dir: opts.dir_path.clone(),
        fid,
        max_size: opts.memtable_size,
        io_mode: if opts.wal_mmap {
            IoMode::Mmap
        } else {
            IoMode::Buffered
        },
        wal_bytes_flush: opts.wal_bytes_flush,
    }
}

impl ColumnFamily {
    /// Opens a new or existing column family.
    ///
    /// Locks its directories, replays the WALs into memtables, opens the
    /// value log and the indexer, and starts the flush and GC workers.
    pub fn open(mut opts: ColumnFamilyOptions) -> Result<Arc<Self>> {
        if opts.cf_name.is_empty() {
            return Err(Error::ColumnFamilyNil);
        }
        if opts.value_log_gc_ratio <= 0.0 || opts.value_log_gc_ratio >= 1.0 {
            return Err(Error::InvalidVLogGCRatio(opts.value_log_gc_ratio));
        }
        opts.memtable_nums = opts.memtable_nums.max(2);

        // The column family lives in <root>/<cf_name>; the index and value
        // log default to the same directory.
        opts.dir_path = std::path::absolute(opts.dir_path.join(&opts.cf_name))?;
        opts.indexer_dir = resolve_dir(&opts.indexer_dir, &opts.dir_path)?;
        opts.value_log_dir = resolve_dir(&opts.value_log_dir, &opts.dir_path)?;
        for dir in [&opts.dir_path, &opts.indexer_dir, &opts.value_log_dir] {
            fs::create_dir_all(dir)?;
        }

        let dir_locks = DirLockSet::acquire(&opts.dir_path, &opts.indexer_dir, &opts.value_log_dir)?;

        let (flush_tx, flush_rx) = bounded(opts.memtable_nums - 1);
        let (close_tx, close_rx) = bounded::<()>(1);

        let tables = open_memtables(&opts)?;
        // Recovered frozen memtables go straight back onto the flush queue.
        for table in tables.immutables.iter() {
            if flush_tx.try_send(table.clone()).is_err() {
                tracing::warn!(
                    fid = table.fid(),
                    "flush queue full, recovered memtable deferred to next open"
                );
            }
        }

        let vlog = ValueLog::open(VlogOptions {
            dir: opts.value_log_dir.clone(),
            segment_size: opts.value_log_file_size,
            io_mode: if opts.value_log_mmap {
                IoMode::Mmap
            } else {
                IoMode::Buffered
            },
            gc_ratio: opts.value_log_gc_ratio,
            gc_interval: opts.value_log_gc_interval,
        })?;
        let indexer = Indexer::open(&opts.indexer_dir, vlog.discard_sender())?;

        let gc_interval = opts.value_log_gc_interval;
        let cf_name = opts.cf_name.clone();
        let cf = Arc::new(Self {
            opts,
            tables: RwLock::new(tables),
            indexer,
            vlog,
            flush_tx,
            rotation: Mutex::new(()),
            flush_lock: RwLock::new(()),
            close_rx: close_rx.clone(),
            close_tx: Mutex::new(Some(close_tx)),
            closed: AtomicBool::new(false),
            dir_locks: Mutex::new(dir_locks),
            workers: Mutex::new(Vec::new()),
        });

        let flush_worker = std::thread::Builder::new()
            .name(format!("emberdb-flush-{cf_name}"))
            .spawn({
                let cf = Arc::downgrade(&cf);
                let close_rx = close_rx.clone();
                move || flush::run(cf, flush_rx, close_rx)
            })?;
        let gc_worker = std::thread::Builder::new()
            .name(format!("emberdb-vlog-gc-{cf_name}"))
            .spawn({
                let cf = Arc::downgrade(&cf);
                move || gc::run(cf, close_rx, gc_interval)
            })?;
        cf.workers.lock()?.extend([flush_worker, gc_worker]);

        Ok(cf)
    }

    /// Puts a key-value pair.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_with_options(key, value, &WriteOptions::default())
    }

    /// Puts a key-value pair with explicit write options.
    pub fn put_with_options(&self, key: &[u8], value: &[u8], opts: &WriteOptions) -> Result<()> {
        self.ensure_open()?;
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        self.wait_mem_space((key.len() + value.len()) as u64)?;

        let tables = self.tables.write()?;
        tables.active.put(key, value, false, opts)
    }

    /// Deletes a key.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.delete_with_options(key, &WriteOptions::default())
    }

    /// Deletes a key with explicit write options. Stored as a tombstone
    /// that shadows every older entry.
    pub fn delete_with_options(&self, key: &[u8], opts: &WriteOptions) -> Result<()> {
        self.ensure_open()?;
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        self.wait_mem_space(key.len() as u64)?;

        let tables = self.tables.write()?;
        tables.active.delete(key, opts)
    }

    /// Gets the value for a key, or `None` if absent, deleted, or expired.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;

        // Memtables first, newest to oldest. A tombstone or an expired
        // record shadows everything below it, including the index.
        for table in self.memtable_snapshot()? {
            if let Some(record) = table.get(key) {
                if record.tombstone || is_expired(record.expires_at) {
                    return Ok(None);
                }
                return Ok(Some(record.value));
            }
        }

        let _shared = self.tables.read()?;
        let Some(entry) = self.indexer.get(key)? else {
            return Ok(None);
        };
        // Entries without a value log pointer carry their value inline;
        // `size == 0` also covers a stored empty value.
        if entry.is_inline() || entry.size == 0 {
            if is_expired(entry.expires_at) {
                return Ok(None);
            }
            return Ok(Some(entry.value));
        }

        let record = self.vlog.read(entry.fid, entry.offset)?;
        if record.tombstone || is_expired(record.expires_at) {
            return Ok(None);
        }
        Ok(Some(record.value))
    }

    /// Statistics of this column family.
    pub fn stat(&self) -> Result<Stat> {
        self.ensure_open()?;
        let mut stat = Stat::default();
        for table in self.memtable_snapshot()? {
            stat.memtable_size += table.size() as i64;
        }
        Ok(stat)
    }

    /// Fsyncs the active WAL, the indexer, and the value log, in that
    /// order. Best-effort: the first error is returned but the remaining
    /// steps still run.
    pub fn sync(&self) -> Result<()> {
        self.ensure_open()?;
        self.sync_internal()
    }

    /// Closes the column family. Idempotent; every resource is attempted
    /// and the last error is returned.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Dropping the sender disconnects the close channel, waking every
        // blocked writer and both workers exactly once.
        drop(self.close_tx.lock()?.take());

        // Let the flusher finish its in-flight memtable.
        let workers: Vec<_> = match self.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for worker in workers {
            let _ = worker.join();
        }

        let mut last_err = None;
        if let Err(e) = self.sync_internal() {
            last_err = Some(e);
        }

        match self.tables.read() {
            Ok(tables) => {
                if let Err(e) = tables.active.close_wal() {
                    last_err = Some(e);
                }
                for table in tables.immutables.iter() {
                    if let Err(e) = table.close_wal() {
                        last_err = Some(e);
                    }
                }
            }
            Err(e) => last_err = Some(e.into()),
        }

        if let Err(e) = self.indexer.close() {
            last_err = Some(e);
        }
        if let Err(e) = self.vlog.close() {
            last_err = Some(e);
        }
        let released = self
            .dir_locks
            .lock()
            .map_err(Error::from)
            .and_then(|mut locks| locks.release());
        if let Err(e) = released {
            last_err = Some(e);
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Whether the column family has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The resolved options this column family was opened with.
    pub fn options(&self) -> &ColumnFamilyOptions {
        &self.opts
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn sync_internal(&self) -> Result<()> {
        let mut first_err = None;

        let wal = self
            .tables
            .read()
            .map_err(Error::from)
            .and_then(|tables| tables.active.sync_wal());
        if let Err(e) = wal {
            first_err.get_or_insert(e);
        }
        if let Err(e) = self.indexer.sync() {
            first_err.get_or_insert(e);
        }
        if let Err(e) = self.vlog.sync() {
            first_err.get_or_insert(e);
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The memtables to consult for a read, newest first.
    fn memtable_snapshot(&self) -> Result<Vec<Arc<Memtable>>> {
        let tables = self.tables.read()?;
        let mut snapshot = Vec::with_capacity(tables.immutables.len() + 1);
        snapshot.push(tables.active.clone());
        snapshot.extend(tables.immutables.iter().rev().cloned());
        Ok(snapshot)
    }

    /// Waits until the active memtable can admit `size` more bytes,
    /// rotating it when full. Bounded by `mem_space_wait_timeout` when the
    /// frozen queue is full.
    ///
    /// The wait itself holds no lock on `tables`: rotations are serialized
    /// on `rotation`, the frozen-queue slot is reserved by the channel
    /// send, and `tables` is taken exclusively only for the pointer swap.
    fn wait_mem_space(&self, size: u64) -> Result<()> {
        if size > self.opts.memtable_size {
            return Err(Error::ValueTooBig {
                size,
                memtable_size: self.opts.memtable_size,
            });
        }
        if !self.tables.read()?.active.is_full(size) {
            return Ok(());
        }

        // One rotation at a time; a writer that queued up behind the
        // winner usually finds a fresh table and leaves immediately.
        let _rotating = self.rotation.lock()?;
        let demoted = {
            let tables = self.tables.read()?;
            if !tables.active.is_full(size) {
                return Ok(());
            }
            tables.active.clone()
        };

        // Build the replacement before publishing anything. If the wait
        // below times out, the empty WAL left behind is simply reopened by
        // the rotation that eventually succeeds.
        let next = Arc::new(Memtable::open(&memtable_options(
            &self.opts,
            demoted.fid() + 1,
        ))?);

        select! {
            send(self.flush_tx, demoted.clone()) -> res => {
                if res.is_err() {
                    return Err(Error::Closed);
                }
            }
            recv(self.close_rx) -> _ => return Err(Error::Closed),
            default(self.opts.mem_space_wait_timeout) => return Err(Error::WaitMemSpaceTimeout),
        }

        // Slot reserved and no rotation can race this one, so publishing
        // the swap and the demotion is a single brief critical section.
        let mut tables = self.tables.write()?;
        tables.immutables.push_back(demoted);
        tables.active = next;
        Ok(())
    }
}

fn resolve_dir(dir: &PathBuf, default: &PathBuf) -> Result<PathBuf> {
    if dir.as_os_str().is_empty() {
        Ok(default.clone())
    } else {
        Ok(std::path::absolute(dir)?)
    }
}

/// Enumerates the WAL files of a column family directory and replays each
/// into a memtable. The highest fid becomes the active table.
fn open_memtables(opts: &ColumnFamilyOptions) -> Result<Tables> {
    let wal_suffix = format!(".{}", wal::WAL_SUFFIX);
    let mut fids = Vec::new();
    for entry in fs::read_dir(&opts.dir_path)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.ends_with(&wal_suffix) {
            continue;
        }
        let fid = wal::parse_fid(name)
            .ok_or_else(|| Error::CorruptedLog(format!("unparseable wal file name: {name}")))?;
        fids.push(fid);
    }

    fids.sort_unstable();
    if fids.is_empty() {
        fids.push(INITIAL_LOG_FID);
    }

    let mut tables = Vec::with_capacity(fids.len());
    for fid in fids {
        tables.push(Arc::new(Memtable::open(&memtable_options(opts, fid))?));
    }
    let active = tables.pop().expect("at least one memtable");
    Ok(Tables {
        active,
        immutables: tables.into(),
    })
}
