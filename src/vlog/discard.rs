use crossbeam_channel::{bounded, Receiver, Sender};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::Result;

/// Capacity of the discard notice channel. Producers drop notices instead
/// of blocking when the channel is full.
pub const DISCARD_CHANNEL_CAP: usize = 1024;

/// Accounting of bytes superseded per value log segment.
///
/// The indexer pushes `(fid, bytes)` notices whenever an entry pointing
/// into the value log is overwritten or deleted; the GC loop drains them
/// into per-segment counters to decide what is worth rewriting.
pub struct Discard {
    tx: Sender<(u32, u64)>,
    rx: Receiver<(u32, u64)>,
    table: Mutex<HashMap<u32, u64>>,
}

impl Discard {
    pub fn new() -> Self {
        let (tx, rx) = bounded(DISCARD_CHANNEL_CAP);
        Self {
            tx,
            rx,
            table: Mutex::new(HashMap::new()),
        }
    }

    /// The endpoint handed to the indexer.
    pub fn sender(&self) -> Sender<(u32, u64)> {
        self.tx.clone()
    }

    /// Pulls every pending notice into the per-segment counters.
    pub fn drain(&self) -> Result<()> {
        let mut table = self.table.lock()?;
        while let Ok((fid, bytes)) = self.rx.try_recv() {
            *table.entry(fid).or_insert(0) += bytes;
        }
        Ok(())
    }

    /// Bytes known to be stale in the given segment.
    pub fn discarded(&self, fid: u32) -> Result<u64> {
        Ok(self.table.lock()?.get(&fid).copied().unwrap_or(0))
    }

    /// Forgets a segment, typically after it has been garbage collected.
    pub fn clear(&self, fid: u32) -> Result<()> {
        self.table.lock()?.remove(&fid);
        Ok(())
    }
}

impl Default for Discard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_accumulates_per_fid() {
        let discard = Discard::new();
        let tx = discard.sender();

        tx.send((1, 100)).unwrap();
        tx.send((1, 50)).unwrap();
        tx.send((2, 30)).unwrap();
        discard.drain().unwrap();

        assert_eq!(discard.discarded(1).unwrap(), 150);
        assert_eq!(discard.discarded(2).unwrap(), 30);
        assert_eq!(discard.discarded(3).unwrap(), 0);
    }

    #[test]
    fn test_clear_forgets_segment() {
        let discard = Discard::new();
        discard.sender().send((1, 100)).unwrap();
        discard.drain().unwrap();

        discard.clear(1).unwrap();
        assert_eq!(discard.discarded(1).unwrap(), 0);
    }
}
