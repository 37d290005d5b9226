//! Segmented append-only value log.
//!
//! Large values live here, out of the index: each write appends a record
//! to the active segment and returns its `(fid, offset, size)` location,
//! which the index stores in place of the value. Reads resolve a location
//! back into the record. Segments roll over at a configured size; sealed
//! segments are immutable and, when configured, memory-mapped for reads.

pub mod discard;

use memmap2::Mmap;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::config::IoMode;
use crate::encoding::{self, LogRecord};
use crate::error::{Error, Result};
use crate::wal::parse_fid;
use discard::Discard;

/// File extension of value log segments.
pub const VLOG_SUFFIX: &str = "vlog";

/// Fid of the first segment in a fresh value log.
pub const INITIAL_SEGMENT_FID: u32 = 1;

/// Path of the segment with the given fid, zero-padded to eight digits.
pub fn vlog_segment_path(dir: &Path, fid: u32) -> PathBuf {
    dir.join(format!("{fid:08}.{VLOG_SUFFIX}"))
}

#[derive(Debug, Clone)]
pub struct VlogOptions {
    pub dir: PathBuf,
    pub segment_size: u64,
    pub io_mode: IoMode,
    pub gc_ratio: f64,
    pub gc_interval: Duration,
}

struct Segment {
    fid: u32,
    path: PathBuf,
    file: Mutex<File>,
    size: AtomicU64,
    mmap: RwLock<Option<Mmap>>,
}

impl Segment {
    fn open(dir: &Path, fid: u32) -> Result<Arc<Self>> {
        let path = vlog_segment_path(dir, fid);
        let file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let size = file.metadata()?.len();

        Ok(Arc::new(Self {
            fid,
            path,
            file: Mutex::new(file),
            size: AtomicU64::new(size),
            mmap: RwLock::new(None),
        }))
    }

    /// Maps the segment for reads. Only sealed segments are mapped, so the
    /// mapping never has to grow.
    fn map(&self) -> Result<()> {
        let file = self.file.lock()?;
        if file.metadata()?.len() == 0 {
            return Ok(());
        }
        let mmap = unsafe { Mmap::map(&*file)? };
        *self.mmap.write()? = Some(mmap);
        Ok(())
    }

    fn read_at(&self, offset: u64) -> Result<LogRecord> {
        if let Some(mmap) = self.mmap.read()?.as_ref() {
            if (offset as usize) < mmap.len() {
                let mut cursor = io::Cursor::new(&mmap[offset as usize..]);
                if let Some((record, _)) = encoding::read_record(&mut cursor)? {
                    return Ok(record);
                }
            }
            return Err(Error::CorruptedLog(format!(
                "read past end of value log segment {}",
                self.fid
            )));
        }

        let mut file = self.file.lock()?;
        file.seek(SeekFrom::Start(offset))?;
        let mut reader = BufReader::new(&mut *file);
        match encoding::read_record(&mut reader)? {
            Some((record, _)) => Ok(record),
            None => Err(Error::CorruptedLog(format!(
                "read past end of value log segment {}",
                self.fid
            ))),
        }
    }

    /// Decodes every record with its offset and encoded length.
    fn scan(&self) -> Result<Vec<(u64, LogRecord, u32)>> {
        let mut file = self.file.lock()?;
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&mut *file);

        let mut records = Vec::new();
        let mut offset = 0u64;
        while let Some((record, len)) = encoding::read_record(&mut reader)? {
            records.push((offset, record, len));
            offset += len as u64;
        }
        Ok(records)
    }
}

struct ActiveWriter {
    fid: u32,
    file: File,
    writer: BufWriter<File>,
    offset: u64,
}

fn open_writer(path: &Path) -> Result<(File, BufWriter<File>)> {
    let file = File::options().create(true).append(true).open(path)?;
    let writer = BufWriter::new(file.try_clone()?);
    Ok((file, writer))
}

/// The value log collaborator.
pub struct ValueLog {
    opts: VlogOptions,
    active: Mutex<ActiveWriter>,
    segments: RwLock<BTreeMap<u32, Arc<Segment>>>,
    pub(crate) discard: Discard,
}

impl ValueLog {
    /// Opens the value log inside `opts.dir`, recovering existing segments.
    pub fn open(opts: VlogOptions) -> Result<Self> {
        if opts.gc_ratio <= 0.0 || opts.gc_ratio >= 1.0 {
            return Err(Error::InvalidVLogGCRatio(opts.gc_ratio));
        }

        let vlog_suffix = format!(".{VLOG_SUFFIX}");
        let mut fids = Vec::new();
        for entry in std::fs::read_dir(&opts.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(&vlog_suffix) {
                continue;
            }
            let fid = parse_fid(name).ok_or_else(|| {
                Error::CorruptedLog(format!("unparseable value log file name: {name}"))
            })?;
            fids.push(fid);
        }
        fids.sort_unstable();
        if fids.is_empty() {
            fids.push(INITIAL_SEGMENT_FID);
        }

        let mut segments = BTreeMap::new();
        for fid in &fids {
            segments.insert(*fid, Segment::open(&opts.dir, *fid)?);
        }

        let active_fid = *fids.last().expect("at least one segment fid");
        if opts.io_mode == IoMode::Mmap {
            for (fid, segment) in &segments {
                if *fid != active_fid {
                    segment.map()?;
                }
            }
        }

        let active_path = vlog_segment_path(&opts.dir, active_fid);
        let (file, writer) = open_writer(&active_path)?;
        let offset = file.metadata()?.len();

        Ok(Self {
            opts,
            active: Mutex::new(ActiveWriter {
                fid: active_fid,
                file,
                writer,
                offset,
            }),
            segments: RwLock::new(segments),
            discard: Discard::new(),
        })
    }

    /// The endpoint superseded-entry notices arrive on.
    pub fn discard_sender(&self) -> crossbeam_channel::Sender<(u32, u64)> {
        self.discard.sender()
    }

    pub fn active_fid(&self) -> Result<u32> {
        Ok(self.active.lock()?.fid)
    }

    /// Appends a record, rolling the active segment over when it is full.
    /// Returns the record's `(fid, offset, size)` location.
    pub fn write(&self, record: &LogRecord) -> Result<(u32, u64, u32)> {
        let mut active = self.active.lock()?;
        let len = encoding::record_len(record.key.len(), record.value.len());
        if active.offset > 0 && active.offset + len > self.opts.segment_size {
            self.rotate(&mut active)?;
        }

        let offset = active.offset;
        let written = encoding::write_record(
            &mut active.writer,
            &record.key,
            &record.value,
            record.tombstone,
            record.expires_at,
        )?;
        active.offset += written as u64;
        if let Some(segment) = self.segments.read()?.get(&active.fid) {
            segment.size.store(active.offset, Ordering::SeqCst);
        }
        Ok((active.fid, offset, written))
    }

    fn rotate(&self, active: &mut ActiveWriter) -> Result<()> {
        active.writer.flush()?;
        active.file.sync_all()?;

        if self.opts.io_mode == IoMode::Mmap {
            if let Some(sealed) = self.segments.read()?.get(&active.fid) {
                sealed.map()?;
            }
        }

        let next_fid = active.fid + 1;
        let segment = Segment::open(&self.opts.dir, next_fid)?;
        let (file, writer) = open_writer(&segment.path)?;
        self.segments.write()?.insert(next_fid, segment);

        *active = ActiveWriter {
            fid: next_fid,
            file,
            writer,
            offset: 0,
        };
        Ok(())
    }

    /// Reads the record stored at `(fid, offset)`.
    pub fn read(&self, fid: u32, offset: u64) -> Result<LogRecord> {
        let segment = self
            .segments
            .read()?
            .get(&fid)
            .cloned()
            .ok_or_else(|| Error::CorruptedLog(format!("value log segment {fid} missing")))?;
        segment.read_at(offset)
    }

    /// Decodes a whole segment for garbage collection.
    pub fn segment_records(&self, fid: u32) -> Result<Vec<(u64, LogRecord, u32)>> {
        let segment = self
            .segments
            .read()?
            .get(&fid)
            .cloned()
            .ok_or_else(|| Error::CorruptedLog(format!("value log segment {fid} missing")))?;
        segment.scan()
    }

    /// Picks the sealed segment with the highest discarded byte count whose
    /// discard ratio is at least the configured GC ratio.
    pub fn pick_gc_candidate(&self) -> Result<Option<u32>> {
        self.discard.drain()?;
        let active_fid = self.active.lock()?.fid;
        let segments = self.segments.read()?;

        let mut best: Option<(u32, u64)> = None;
        for (fid, segment) in segments.iter() {
            if *fid == active_fid {
                continue;
            }
            let size = segment.size.load(Ordering::SeqCst);
            if size == 0 {
                continue;
            }
            let discarded = self.discard.discarded(*fid)?;
            if (discarded as f64) / (size as f64) < self.opts.gc_ratio {
                continue;
            }
            if best.map_or(true, |(_, d)| discarded > d) {
                best = Some((*fid, discarded));
            }
        }
        Ok(best.map(|(fid, _)| fid))
    }

    /// Drops a garbage-collected segment and its discard accounting.
    pub fn remove_segment(&self, fid: u32) -> Result<()> {
        let removed = self.segments.write()?.remove(&fid);
        if let Some(segment) = removed {
            std::fs::remove_file(&segment.path)?;
        }
        self.discard.clear(fid)?;
        Ok(())
    }

    /// Flushes and fsyncs the active segment.
    pub fn sync(&self) -> Result<()> {
        let mut active = self.active.lock()?;
        active.writer.flush()?;
        active.file.sync_all()?;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_opts(dir: &Path, segment_size: u64, io_mode: IoMode) -> VlogOptions {
        VlogOptions {
            dir: dir.to_path_buf(),
            segment_size,
            io_mode,
            gc_ratio: 0.5,
            gc_interval: Duration::from_secs(600),
        }
    }

    fn record(key: &[u8], value: &[u8]) -> LogRecord {
        LogRecord {
            key: key.to_vec(),
            value: value.to_vec(),
            tombstone: false,
            expires_at: 0,
        }
    }

    #[test]
    fn test_write_and_read() {
        let dir = tempdir().unwrap();
        let vlog = ValueLog::open(test_opts(dir.path(), 1024 * 1024, IoMode::Buffered)).unwrap();

        let (fid, offset, size) = vlog.write(&record(b"key1", b"value1")).unwrap();
        vlog.sync().unwrap();

        assert_eq!(fid, INITIAL_SEGMENT_FID);
        assert_eq!(size as u64, encoding::record_len(4, 6));

        let read = vlog.read(fid, offset).unwrap();
        assert_eq!(read.key, b"key1");
        assert_eq!(read.value, b"value1");
    }

    #[test]
    fn test_rejects_invalid_gc_ratio() {
        let dir = tempdir().unwrap();
        let mut opts = test_opts(dir.path(), 1024, IoMode::Buffered);
        opts.gc_ratio = 1.0;
        assert!(matches!(
            ValueLog::open(opts),
            Err(Error::InvalidVLogGCRatio(_))
        ));
    }

    #[test]
    fn test_segment_rotation() {
        let dir = tempdir().unwrap();
        let vlog = ValueLog::open(test_opts(dir.path(), 96, IoMode::Buffered)).unwrap();

        // Each record is 57 bytes, so the second write rolls over.
        let (fid1, _, _) = vlog.write(&record(b"key1", b"0123456789abcdef0123456789ab")).unwrap();
        let (fid2, offset2, _) = vlog.write(&record(b"key2", b"0123456789abcdef0123456789ab")).unwrap();
        vlog.sync().unwrap();

        assert_eq!(fid1, 1);
        assert_eq!(fid2, 2);
        assert_eq!(offset2, 0);
        assert_eq!(vlog.active_fid().unwrap(), 2);
        assert!(vlog_segment_path(dir.path(), 2).exists());
    }

    #[test]
    fn test_reopen_recovers_segments() {
        let dir = tempdir().unwrap();
        let location = {
            let vlog = ValueLog::open(test_opts(dir.path(), 96, IoMode::Buffered)).unwrap();
            vlog.write(&record(b"key1", b"0123456789abcdef0123456789ab")).unwrap();
            let loc = vlog.write(&record(b"key2", b"0123456789abcdef0123456789ab")).unwrap();
            vlog.close().unwrap();
            loc
        };

        let vlog = ValueLog::open(test_opts(dir.path(), 96, IoMode::Buffered)).unwrap();
        assert_eq!(vlog.active_fid().unwrap(), 2);
        let read = vlog.read(location.0, location.1).unwrap();
        assert_eq!(read.key, b"key2");
    }

    #[test]
    fn test_mmap_reads_sealed_segment() {
        let dir = tempdir().unwrap();
        let vlog = ValueLog::open(test_opts(dir.path(), 96, IoMode::Mmap)).unwrap();

        let (fid1, offset1, _) = vlog.write(&record(b"key1", b"0123456789abcdef0123456789ab")).unwrap();
        vlog.write(&record(b"key2", b"0123456789abcdef0123456789ab")).unwrap();

        // Segment 1 is sealed and mapped by the rotation.
        let sealed = vlog.segments.read().unwrap().get(&fid1).cloned().unwrap();
        assert!(sealed.mmap.read().unwrap().is_some());

        let read = vlog.read(fid1, offset1).unwrap();
        assert_eq!(read.key, b"key1");
    }

    #[test]
    fn test_pick_gc_candidate_respects_ratio() {
        let dir = tempdir().unwrap();
        let vlog = ValueLog::open(test_opts(dir.path(), 96, IoMode::Buffered)).unwrap();

        let (fid1, _, size1) = vlog.write(&record(b"key1", b"0123456789abcdef0123456789ab")).unwrap();
        vlog.write(&record(b"key2", b"0123456789abcdef0123456789ab")).unwrap();
        assert_ne!(vlog.active_fid().unwrap(), fid1);

        // Nothing discarded yet.
        assert_eq!(vlog.pick_gc_candidate().unwrap(), None);

        // Discarding the whole record pushes segment 1 over the 0.5 ratio.
        vlog.discard_sender().send((fid1, size1 as u64)).unwrap();
        assert_eq!(vlog.pick_gc_candidate().unwrap(), Some(fid1));
    }

    #[test]
    fn test_remove_segment() {
        let dir = tempdir().unwrap();
        let vlog = ValueLog::open(test_opts(dir.path(), 96, IoMode::Buffered)).unwrap();

        let (fid1, _, _) = vlog.write(&record(b"key1", b"0123456789abcdef0123456789ab")).unwrap();
        vlog.write(&record(b"key2", b"0123456789abcdef0123456789ab")).unwrap();

        let path = vlog_segment_path(dir.path(), fid1);
        assert!(path.exists());
        vlog.remove_segment(fid1).unwrap();
        assert!(!path.exists());
        assert!(vlog.read(fid1, 0).is_err());
    }
}
