use std::path::PathBuf;
use std::time::Duration;

/// How log files are read back: buffered reads or a read-only memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoMode {
    #[default]
    Buffered,
    Mmap,
}

/// Per-write options.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Fsync the WAL before the write returns (default: false).
    pub sync: bool,

    /// Skip the WAL append entirely. Crash-unsafe fast path (default: false).
    pub disable_wal: bool,

    /// Absolute expiry in seconds since the epoch; 0 never expires.
    pub expires_at: u64,
}

/// Configuration for a column family.
#[derive(Debug, Clone)]
pub struct ColumnFamilyOptions {
    /// Column family name. Required, non-empty.
    pub cf_name: String,

    /// Root directory of the database; the column family lives in
    /// `<dir_path>/<cf_name>`.
    pub dir_path: PathBuf,

    /// Directory for the index files. Defaults to the column family dir.
    pub indexer_dir: PathBuf,

    /// Directory for the value log segments. Defaults to the column family dir.
    pub value_log_dir: PathBuf,

    /// Byte budget per memtable (default: 64MB).
    pub memtable_size: u64,

    /// Total memtables: one active plus `memtable_nums - 1` frozen slots
    /// (default: 5, minimum: 2).
    pub memtable_nums: usize,

    /// Memory-map WAL files for replay (default: false).
    pub wal_mmap: bool,

    /// Bytes written between background WAL buffer flushes; 0 flushes only
    /// on sync (default: 0).
    pub wal_bytes_flush: u64,

    /// Number of index entries per put batch during flush (default: 100000).
    pub flush_batch_size: usize,

    /// Value log segment size (default: 1GB).
    pub value_log_file_size: u64,

    /// Memory-map sealed value log segments for reads (default: false).
    pub value_log_mmap: bool,

    /// Discard ratio above which a sealed value log segment is garbage
    /// collected; must be in (0.0, 1.0) exclusive (default: 0.5).
    pub value_log_gc_ratio: f64,

    /// Period of the value log GC loop (default: 10 minutes).
    pub value_log_gc_interval: Duration,

    /// Values at most this long are stored inline in the index; longer
    /// values go to the value log (default: 4KB).
    pub value_threshold: usize,

    /// Deadline for a write waiting on a frozen-queue slot (default: 100ms).
    pub mem_space_wait_timeout: Duration,
}

impl Default for ColumnFamilyOptions {
    fn default() -> Self {
        Self {
            cf_name: String::new(),
            dir_path: PathBuf::new(),
            indexer_dir: PathBuf::new(),
            value_log_dir: PathBuf::new(),
            memtable_size: 64 * 1024 * 1024, // 64MB
            memtable_nums: 5,
            wal_mmap: false,
            wal_bytes_flush: 0,
            flush_batch_size: 100_000,
            value_log_file_size: 1024 * 1024 * 1024, // 1GB
            value_log_mmap: false,
            value_log_gc_ratio: 0.5,
            value_log_gc_interval: Duration::from_secs(10 * 60),
            value_threshold: 4 * 1024, // 4KB
            mem_space_wait_timeout: Duration::from_millis(100),
        }
    }
}

impl ColumnFamilyOptions {
    /// Create options for the named column family rooted at `dir_path`.
    pub fn new(cf_name: impl Into<String>, dir_path: impl Into<PathBuf>) -> Self {
        Self {
            cf_name: cf_name.into(),
            dir_path: dir_path.into(),
            ..Default::default()
        }
    }

    /// Set the index directory.
    pub fn indexer_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.indexer_dir = dir.into();
        self
    }

    /// Set the value log directory.
    pub fn value_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.value_log_dir = dir.into();
        self
    }

    /// Set the memtable byte budget.
    pub fn memtable_size(mut self, size: u64) -> Self {
        self.memtable_size = size;
        self
    }

    /// Set the total number of memtables.
    pub fn memtable_nums(mut self, nums: usize) -> Self {
        self.memtable_nums = nums;
        self
    }

    /// Memory-map WAL files for replay.
    pub fn wal_mmap(mut self, enabled: bool) -> Self {
        self.wal_mmap = enabled;
        self
    }

    /// Set the WAL background flush threshold.
    pub fn wal_bytes_flush(mut self, bytes: u64) -> Self {
        self.wal_bytes_flush = bytes;
        self
    }

    /// Set the index put-batch size used during flush.
    pub fn flush_batch_size(mut self, size: usize) -> Self {
        self.flush_batch_size = size;
        self
    }

    /// Set the value log segment size.
    pub fn value_log_file_size(mut self, size: u64) -> Self {
        self.value_log_file_size = size;
        self
    }

    /// Memory-map sealed value log segments for reads.
    pub fn value_log_mmap(mut self, enabled: bool) -> Self {
        self.value_log_mmap = enabled;
        self
    }

    /// Set the value log GC discard ratio.
    pub fn value_log_gc_ratio(mut self, ratio: f64) -> Self {
        self.value_log_gc_ratio = ratio;
        self
    }

    /// Set the value log GC period.
    pub fn value_log_gc_interval(mut self, interval: Duration) -> Self {
        self.value_log_gc_interval = interval;
        self
    }

    /// Set the inline-vs-value-log boundary.
    pub fn value_threshold(mut self, threshold: usize) -> Self {
        self.value_threshold = threshold;
        self
    }

    /// Set the write admission deadline.
    pub fn mem_space_wait_timeout(mut self, timeout: Duration) -> Self {
        self.mem_space_wait_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = ColumnFamilyOptions::default();
        assert_eq!(opts.memtable_size, 64 * 1024 * 1024);
        assert_eq!(opts.memtable_nums, 5);
        assert_eq!(opts.value_threshold, 4 * 1024);
        assert_eq!(opts.value_log_gc_ratio, 0.5);
        assert!(!opts.wal_mmap);
        assert!(!opts.value_log_mmap);
    }

    #[test]
    fn test_options_builder() {
        let opts = ColumnFamilyOptions::new("events", "/tmp/emberdb")
            .memtable_size(32 * 1024 * 1024)
            .memtable_nums(3)
            .value_threshold(512)
            .mem_space_wait_timeout(Duration::from_millis(50));

        assert_eq!(opts.cf_name, "events");
        assert_eq!(opts.dir_path, PathBuf::from("/tmp/emberdb"));
        assert_eq!(opts.memtable_size, 32 * 1024 * 1024);
        assert_eq!(opts.memtable_nums, 3);
        assert_eq!(opts.value_threshold, 512);
        assert_eq!(opts.mem_space_wait_timeout, Duration::from_millis(50));
    }
}
