use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::config::IoMode;
use crate::encoding::{self, LogRecord};
use crate::error::Result;

/// File extension of WAL segments.
pub const WAL_SUFFIX: &str = "wal";

/// Fid used for the first WAL segment of a fresh column family.
pub const INITIAL_LOG_FID: u32 = 1;

/// Path of the WAL segment with the given fid, zero-padded to eight digits.
pub fn segment_path(dir: &Path, fid: u32) -> PathBuf {
    dir.join(format!("{fid:08}.{WAL_SUFFIX}"))
}

/// Parses the fid out of a WAL file name such as `00000042.wal`.
pub fn parse_fid(file_name: &str) -> Option<u32> {
    file_name.split('.').next()?.parse().ok()
}

/// An append-only write-ahead log segment owned by exactly one memtable.
#[derive(Debug)]
pub struct Wal {
    fid: u32,
    path: PathBuf,
    file: File,
    writer: io::BufWriter<File>,
    io_mode: IoMode,
    bytes_flush: u64,
    unflushed: u64,
}

impl Wal {
    /// Opens (or creates) the segment for `fid` inside `dir`.
    pub fn open(dir: &Path, fid: u32, io_mode: IoMode, bytes_flush: u64) -> Result<Self> {
        let path = segment_path(dir, fid);
        let file = File::options()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let writer = io::BufWriter::new(file.try_clone()?);

        Ok(Self {
            fid,
            path,
            file,
            writer,
            io_mode,
            bytes_flush,
            unflushed: 0,
        })
    }

    pub fn fid(&self) -> u32 {
        self.fid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the segment file in bytes.
    pub fn size(&self) -> u64 {
        self.file.metadata().map_or(0, |meta| meta.len())
    }

    /// Appends one mutation. The write is buffered; durability requires
    /// [`Wal::sync`].
    pub fn append(&mut self, key: &[u8], value: &[u8], tombstone: bool, expires_at: u64) -> Result<u32> {
        let written = encoding::write_record(&mut self.writer, key, value, tombstone, expires_at)?;
        self.unflushed += written as u64;
        if self.bytes_flush > 0 && self.unflushed >= self.bytes_flush {
            self.flush()?;
        }
        Ok(written)
    }

    /// Pushes buffered writes to the OS without fsync.
    pub fn flush(&mut self) -> Result<()> {
        io::Write::flush(&mut self.writer)?;
        self.unflushed = 0;
        Ok(())
    }

    /// Flushes and fsyncs the segment.
    pub fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Replays the segment from the start.
    pub fn replay(&self) -> Result<ReplayIterator> {
        // A fresh handle keeps the replay cursor independent of the writer.
        let file = File::open(&self.path)?;
        let len = file.metadata()?.len();
        let reader: Box<dyn Read> = match self.io_mode {
            IoMode::Mmap if len > 0 => {
                let mmap = unsafe { Mmap::map(&file)? };
                Box::new(io::Cursor::new(mmap))
            }
            _ => Box::new(BufReader::new(file)),
        };
        Ok(ReplayIterator { reader })
    }

    /// Deletes the segment file.
    pub fn remove(self) -> Result<()> {
        let path = self.path.clone();
        // File handles are dropped here.
        drop(self);
        std::fs::remove_file(path)?;
        Ok(())
    }
}

/// Streams the records of a WAL segment in append order.
pub struct ReplayIterator {
    reader: Box<dyn Read>,
}

impl Iterator for ReplayIterator {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match encoding::read_record(&mut self.reader) {
            Ok(Some((record, _))) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
