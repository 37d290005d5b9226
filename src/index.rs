//! Persistent ordered map from key to index entry.
//!
//! Lookups are served from an in-memory ordered map; durability comes from
//! an append-only edit log of bincode-encoded records framed as
//! `[len:u32][crc:u64][payload]`. The log is replayed at open; a torn tail
//! (a crash mid-batch) is truncated away since the memtable WALs still hold
//! every mutation that had not been fully indexed.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::{Mutex, RwLock};

use crate::error::Result;
use crate::hasher::Hasher;

/// Name of the edit log file inside the indexer directory.
pub const INDEX_FILE_NAME: &str = "INDEX";

/// Where a key's value lives: inline in `value`, or in the value log at
/// `(fid, offset)` for `size` bytes when `value` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub value: Vec<u8>,
    pub fid: u32,
    pub offset: u64,
    pub size: u32,
    pub expires_at: u64,
}

impl IndexEntry {
    /// An entry carrying its value inline.
    pub fn inline(value: Vec<u8>, expires_at: u64) -> Self {
        Self {
            value,
            fid: 0,
            offset: 0,
            size: 0,
            expires_at,
        }
    }

    /// An entry pointing into the value log.
    pub fn pointer(fid: u32, offset: u64, size: u32, expires_at: u64) -> Self {
        Self {
            value: Vec::new(),
            fid,
            offset,
            size,
            expires_at,
        }
    }

    pub fn is_inline(&self) -> bool {
        !self.value.is_empty()
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum Edit {
    Put { key: Vec<u8>, entry: IndexEntry },
    Delete { key: Vec<u8> },
}

struct EditLog {
    file: File,
    writer: BufWriter<File>,
}

impl EditLog {
    fn append(&mut self, edit: &Edit) -> Result<()> {
        let payload = bincode::serialize(edit)?;
        let mut hasher = Hasher::new();
        hasher.write(&payload);

        self.writer.write_u32::<BigEndian>(payload.len() as u32)?;
        self.writer.write_u64::<BigEndian>(hasher.checksum())?;
        self.writer.write_all(&payload)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

fn read_edit<R: Read>(reader: &mut R) -> Result<Option<(Edit, u64)>> {
    let len = match reader.read_u32::<BigEndian>() {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let stored_checksum = reader.read_u64::<BigEndian>()?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;

    let mut hasher = Hasher::new();
    hasher.write(&payload);
    if hasher.checksum() != stored_checksum {
        return Err(crate::error::Error::CorruptedLog(
            "index edit checksum mismatch".to_string(),
        ));
    }

    let edit: Edit = bincode::deserialize(&payload)?;
    Ok(Some((edit, 4 + 8 + len as u64)))
}

/// The index collaborator: a durable key → [`IndexEntry`] map with a single
/// writer (the flusher and the GC, serialized by the flush lock) and many
/// readers.
pub struct Indexer {
    map: RwLock<BTreeMap<Vec<u8>, IndexEntry>>,
    log: Mutex<EditLog>,
    discard_tx: Sender<(u32, u64)>,
}

impl Indexer {
    /// Opens the indexer inside `dir`, replaying the edit log. Superseded
    /// value-log locations are reported on `discard_tx`.
    pub fn open(dir: &Path, discard_tx: Sender<(u32, u64)>) -> Result<Self> {
        let path = dir.join(INDEX_FILE_NAME);
        let file = File::options()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let mut map = BTreeMap::new();
        let mut good = 0u64;
        let mut reader = BufReader::new(File::open(&path)?);
        loop {
            match read_edit(&mut reader) {
                Ok(Some((edit, len))) => {
                    good += len;
                    match edit {
                        Edit::Put { key, entry } => {
                            map.insert(key, entry);
                        }
                        Edit::Delete { key } => {
                            map.remove(&key);
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    // A torn tail from a crash mid-batch; everything after
                    // the last good edit is replayed from the WALs anyway.
                    tracing::warn!(error = %e, offset = good, "truncating index edit log tail");
                    file.set_len(good)?;
                    break;
                }
            }
        }

        let writer = BufWriter::new(file.try_clone()?);
        Ok(Self {
            map: RwLock::new(map),
            log: Mutex::new(EditLog { file, writer }),
            discard_tx,
        })
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<IndexEntry>> {
        Ok(self.map.read()?.get(key).cloned())
    }

    /// Applies a batch of puts: logged and fsynced first, then made visible.
    pub fn put_batch(&self, entries: Vec<(Vec<u8>, IndexEntry)>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        {
            let mut log = self.log.lock()?;
            for (key, entry) in &entries {
                log.append(&Edit::Put {
                    key: key.clone(),
                    entry: entry.clone(),
                })?;
            }
            log.sync()?;
        }

        let mut map = self.map.write()?;
        for (key, entry) in entries {
            if let Some(prior) = map.insert(key, entry) {
                self.notify_discard(&prior);
            }
        }
        Ok(())
    }

    /// Removes a key, returning the prior entry if any.
    pub fn delete(&self, key: &[u8]) -> Result<Option<IndexEntry>> {
        {
            let mut log = self.log.lock()?;
            log.append(&Edit::Delete { key: key.to_vec() })?;
            log.sync()?;
        }

        let prior = self.map.write()?.remove(key);
        if let Some(ref entry) = prior {
            self.notify_discard(entry);
        }
        Ok(prior)
    }

    fn notify_discard(&self, prior: &IndexEntry) {
        if !prior.is_inline() && prior.size > 0 {
            // The discard stream is advisory; a full channel drops the
            // notice rather than stalling the flusher.
            let _ = self.discard_tx.try_send((prior.fid, prior.size as u64));
        }
    }

    pub fn sync(&self) -> Result<()> {
        self.log.lock()?.sync()
    }

    pub fn close(&self) -> Result<()> {
        self.sync()
    }
}
