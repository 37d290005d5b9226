//! Value log garbage collection.
//!
//! The indexer reports superseded value log locations on the discard
//! stream; this loop periodically picks the sealed segment with the
//! highest discard ratio, rewrites its still-live records into the active
//! segment, and deletes it.

use crossbeam_channel::{select, tick, Receiver};
use std::sync::Weak;
use std::time::Duration;

use super::{is_expired, ColumnFamily};
use crate::error::Result;
use crate::index::IndexEntry;

pub(crate) fn run(cf: Weak<ColumnFamily>, close_rx: Receiver<()>, interval: Duration) {
    let ticker = tick(interval);
    loop {
        select! {
            recv(ticker) -> _ => {
                let Some(cf) = cf.upgrade() else { break };
                if let Err(e) = cf.run_gc() {
                    tracing::error!(error = %e, "value log gc failed");
                }
            }
            recv(close_rx) -> _ => {
                tracing::info!("value log gc shutting down");
                break;
            }
        }
    }
}

impl ColumnFamily {
    /// One garbage collection pass: rewrite the live records of the most
    /// discarded sealed segment, then drop the segment.
    pub(crate) fn run_gc(&self) -> Result<()> {
        // Exclusive with flush; both rewrite index entries pointing into
        // the value log.
        let _guard = self.flush_lock.write()?;

        let Some(victim) = self.vlog.pick_gc_candidate()? else {
            return Ok(());
        };

        let mut rewrites: Vec<(Vec<u8>, IndexEntry)> = Vec::new();
        for (offset, record, _len) in self.vlog.segment_records(victim)? {
            if record.tombstone || is_expired(record.expires_at) {
                continue;
            }
            // A record is live only while the index still points at this
            // exact location.
            let Some(entry) = self.indexer.get(&record.key)? else {
                continue;
            };
            if entry.is_inline() || entry.fid != victim || entry.offset != offset {
                continue;
            }

            let expires_at = record.expires_at;
            let (fid, new_offset, size) = self.vlog.write(&record)?;
            rewrites.push((record.key, IndexEntry::pointer(fid, new_offset, size, expires_at)));
        }

        let moved = rewrites.len();
        self.vlog.sync()?;
        self.indexer.put_batch(rewrites)?;
        self.vlog.remove_segment(victim)?;
        tracing::debug!(fid = victim, moved, "value log segment collected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ColumnFamilyOptions;
    use crate::ColumnFamily;
    use std::time::Duration;
    use tempfile::tempdir;

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !cond() {
            if std::time::Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn vlog_file_count(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.ends_with(".vlog"))
            })
            .count()
    }

    #[test]
    fn test_gc_reclaims_dead_segment() {
        let root = tempdir().unwrap();
        let opts = ColumnFamilyOptions::new("default", root.path())
            .memtable_size(256)
            .memtable_nums(3)
            .value_threshold(16)
            .value_log_file_size(256);
        let cf = ColumnFamily::open(opts).unwrap();
        let cf_dir = cf.options().dir_path.clone();

        // Eight out-of-line values, flushed through several small vlog
        // segments.
        for i in 0..8u32 {
            let key = format!("key{i:04}");
            cf.put(key.as_bytes(), &[b'a'; 64]).unwrap();
        }
        // Inline-sized filler forces the table holding the tail keys to
        // rotate and flush.
        for i in 0..10u32 {
            cf.put(format!("filla{i:03}").as_bytes(), &[b'f'; 8]).unwrap();
        }
        wait_until("initial flush", || {
            (0..8u32).all(|i| {
                cf.indexer
                    .get(format!("key{i:04}").as_bytes())
                    .unwrap()
                    .is_some()
            })
        });
        let before_overwrite = cf.indexer.get(b"key0007").unwrap().unwrap();

        // Overwrite everything; the old locations become garbage.
        for i in 0..8u32 {
            let key = format!("key{i:04}");
            cf.put(key.as_bytes(), &[b'b'; 64]).unwrap();
        }
        for i in 0..10u32 {
            cf.put(format!("fillb{i:03}").as_bytes(), &[b'f'; 8]).unwrap();
        }
        wait_until("overwrite flush", || {
            cf.indexer
                .get(b"key0007")
                .unwrap()
                .is_some_and(|entry| entry.offset != before_overwrite.offset
                    || entry.fid != before_overwrite.fid)
        });

        let before = vlog_file_count(&cf_dir);
        // Drain every eligible segment.
        for _ in 0..16 {
            cf.run_gc().unwrap();
        }
        let after = vlog_file_count(&cf_dir);
        assert!(after < before, "gc removed no segment ({before} -> {after})");

        for i in 0..8u32 {
            let key = format!("key{i:04}");
            assert_eq!(cf.get(key.as_bytes()).unwrap(), Some(vec![b'b'; 64]));
        }
        cf.close().unwrap();
    }

    #[test]
    fn test_gc_with_nothing_to_collect() {
        let root = tempdir().unwrap();
        let cf = ColumnFamily::open(ColumnFamilyOptions::new("default", root.path())).unwrap();
        cf.put(b"k", b"v").unwrap();
        cf.run_gc().unwrap();
        assert_eq!(cf.get(b"k").unwrap(), Some(b"v".to_vec()));
        cf.close().unwrap();
    }
}
