//! Offline queue for mutations made while no channel can carry them.
//!
//! Bounded FIFO. A full queue evicts its oldest entry, never the newest,
//! and hands the evicted entry back so the caller can report the overflow.
//! Queued entries are replayed on reconnection through [`OfflineQueue::flush`].
//!
//! Target: 1000 queued ops replay in <50ms.

use std::collections::VecDeque;

use crate::error::MeshError;
use crate::protocol::HlcTimestamp;

/// One pending mutation with its encoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub key: String,
    /// Empty for deletes.
    pub value: Vec<u8>,
    pub timestamp: HlcTimestamp,
    /// The encoded envelope, sent verbatim on flush.
    pub packet: Vec<u8>,
}

/// Result of a [`OfflineQueue::flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushReport {
    pub sent: usize,
    pub requeued: usize,
}

pub struct OfflineQueue {
    entries: VecDeque<QueueEntry>,
    /// 0 = unbounded.
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_size.clamp(16, 1024)),
            max_size,
        }
    }

    /// Append an entry, evicting the oldest one if the queue is full.
    pub fn enqueue(&mut self, entry: QueueEntry) -> Option<QueueEntry> {
        let evicted = if self.max_size > 0 && self.entries.len() >= self.max_size {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    /// Take every entry and try `send` on each, in order.
    ///
    /// The queue is emptied before the first send. Entries whose send fails
    /// go back to the front in their original order, ahead of anything
    /// queued meanwhile.
    pub fn flush<F>(&mut self, mut send: F) -> FlushReport
    where
        F: FnMut(&QueueEntry) -> Result<(), MeshError>,
    {
        let pending = std::mem::take(&mut self.entries);
        let mut report = FlushReport::default();
        let mut failed = VecDeque::new();

        for entry in pending {
            match send(&entry) {
                Ok(()) => report.sent += 1,
                Err(e) => {
                    log::debug!("Requeueing '{}' after send failure: {e}", entry.key);
                    failed.push_back(entry);
                }
            }
        }

        report.requeued = failed.len();
        failed.append(&mut self.entries);
        self.entries = failed;
        report
    }

    /// Merge persisted entries ahead of the current ones, then evict the
    /// oldest until the queue fits.
    pub fn restore(&mut self, persisted: Vec<QueueEntry>) -> Vec<QueueEntry> {
        let mut merged: VecDeque<QueueEntry> = persisted.into();
        merged.append(&mut self.entries);
        self.entries = merged;

        let mut evicted = Vec::new();
        if self.max_size > 0 {
            while self.entries.len() > self.max_size {
                if let Some(e) = self.entries.pop_front() {
                    evicted.push(e);
                }
            }
        }
        evicted
    }

    pub fn entries(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
