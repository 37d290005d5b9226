//! Background worker draining frozen memtables into the index and the
//! value log.

use crossbeam_channel::{select, Receiver};
use std::sync::{Arc, Weak};

use super::ColumnFamily;
use crate::encoding::LogRecord;
use crate::error::Result;
use crate::index::IndexEntry;
use crate::memtable::Memtable;

pub(crate) fn run(
    cf: Weak<ColumnFamily>,
    flush_rx: Receiver<Arc<Memtable>>,
    close_rx: Receiver<()>,
) {
    loop {
        select! {
            recv(flush_rx) -> msg => {
                let Ok(table) = msg else { break };
                let Some(cf) = cf.upgrade() else { break };
                if let Err(e) = flush_memtable(&cf, &table) {
                    // The table stays in the frozen queue and its WAL stays
                    // on disk, so the next open replays it.
                    tracing::error!(
                        fid = table.fid(),
                        error = %e,
                        "memtable flush failed, wal retained for replay"
                    );
                }
            }
            recv(close_rx) -> _ => {
                tracing::info!("flush worker shutting down");
                break;
            }
        }
    }
}

fn flush_memtable(cf: &ColumnFamily, table: &Arc<Memtable>) -> Result<()> {
    {
        // Exclude value log GC while index entries are rewritten.
        let _guard = cf.flush_lock.write()?;

        let mut batch: Vec<(Vec<u8>, IndexEntry)> = Vec::new();
        for (key, record) in table.iter() {
            if record.tombstone {
                // The delete reports any superseded value log location to
                // the discard stream.
                cf.indexer.delete(&key)?;
                continue;
            }
            let entry = if record.value.len() <= cf.opts.value_threshold {
                IndexEntry::inline(record.value, record.expires_at)
            } else {
                let (fid, offset, size) = cf.vlog.write(&LogRecord {
                    key: key.clone(),
                    value: record.value,
                    tombstone: false,
                    expires_at: record.expires_at,
                })?;
                IndexEntry::pointer(fid, offset, size, record.expires_at)
            };
            batch.push((key, entry));
            if batch.len() >= cf.opts.flush_batch_size {
                commit_batch(cf, std::mem::take(&mut batch))?;
            }
        }
        commit_batch(cf, batch)?;
    }

    // Drop the table from the visible list before deleting its WAL so no
    // read can miss a key that is already in the index.
    {
        let mut tables = cf.tables.write()?;
        if let Some(pos) = tables
            .immutables
            .iter()
            .position(|t| t.fid() == table.fid())
        {
            tables.immutables.remove(pos);
        }
    }
    table.close_wal()?;
    table.delete_wal()?;
    tracing::debug!(fid = table.fid(), "memtable flushed");
    Ok(())
}

fn commit_batch(cf: &ColumnFamily, batch: Vec<(Vec<u8>, IndexEntry)>) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    // Values must be durable before the index points at them.
    cf.vlog.sync()?;
    cf.indexer.put_batch(batch)
}
