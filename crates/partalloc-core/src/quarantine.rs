//! Quarantine collaborator for scan mode.
//!
//! While scanning is enabled a freed slot is handed to the quarantine instead
//! of being released. The quarantine decides when the slot is safe to reuse
//! and then calls [`PartitionRoot::reclaim`], which runs the rest of the free.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Weak;

use parking_lot::Mutex;

use crate::root::PartitionRoot;

/// A slot handed to the quarantine by `free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuarantinedSlot {
    /// The pointer the caller freed.
    pub ptr: usize,
    pub slot_start: usize,
    pub bucket: usize,
    pub slot_size: usize,
    pub usable_size: usize,
}

pub trait Quarantine: Send + Sync + fmt::Debug {
    /// Take ownership of a freed slot.
    fn move_to_quarantine(&self, root: &PartitionRoot, slot: QuarantinedSlot);

    /// Release every quarantined slot of `root` back to it.
    fn flush(&self, root: &PartitionRoot);

    fn quarantined_bytes(&self) -> usize;
}

pub const DEFAULT_QUARANTINE_BYTES: usize = 1 << 20;
pub const DEFAULT_QUARANTINE_ENTRIES: usize = 4096;

/// A queued slot and the root it must be reclaimed against.
#[derive(Debug)]
struct Entry {
    slot: QuarantinedSlot,
    root_id: u64,
    root: Weak<PartitionRoot>,
}

impl Entry {
    /// Reclaim against the owning root. Slots of a dropped root went away
    /// with its reservations.
    fn reclaim(self) {
        if let Some(root) = self.root.upgrade() {
            root.reclaim(self.slot.ptr);
        }
    }
}

#[derive(Debug, Default)]
struct Queue {
    entries: VecDeque<Entry>,
    bytes: usize,
}

/// Bounded FIFO quarantine. The oldest slots are reclaimed once either the
/// byte or the entry budget is exceeded. One queue may be shared by several
/// roots; every entry is reclaimed against the root that freed it.
#[derive(Debug)]
pub struct QuarantineQueue {
    max_bytes: usize,
    max_entries: usize,
    queue: Mutex<Queue>,
}

impl Default for QuarantineQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUARANTINE_BYTES, DEFAULT_QUARANTINE_ENTRIES)
    }
}

impl QuarantineQueue {
    #[must_use]
    pub fn new(max_bytes: usize, max_entries: usize) -> Self {
        Self {
            max_bytes,
            max_entries: max_entries.max(1),
            queue: Mutex::new(Queue::default()),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn contains(&self, ptr: usize) -> bool {
        self.queue.lock().entries.iter().any(|e| e.slot.ptr == ptr)
    }
}

impl Quarantine for QuarantineQueue {
    fn move_to_quarantine(&self, root: &PartitionRoot, slot: QuarantinedSlot) {
        let evicted = {
            let mut queue = self.queue.lock();
            queue.bytes += slot.slot_size;
            queue.entries.push_back(Entry {
                slot,
                root_id: root.id(),
                root: root.weak(),
            });
            let mut evicted = Vec::new();
            while queue.bytes > self.max_bytes || queue.entries.len() > self.max_entries {
                let Some(oldest) = queue.entries.pop_front() else {
                    break;
                };
                queue.bytes -= oldest.slot.slot_size;
                evicted.push(oldest);
            }
            evicted
        };
        for entry in evicted {
            entry.reclaim();
        }
    }

    fn flush(&self, root: &PartitionRoot) {
        let drained = {
            let mut queue = self.queue.lock();
            let (mine, others): (VecDeque<_>, VecDeque<_>) =
                std::mem::take(&mut queue.entries).into_iter().partition(|e| e.root_id == root.id());
            queue.entries = others;
            queue.bytes -= mine.iter().map(|e| e.slot.slot_size).sum::<usize>();
            mine
        };
        for entry in drained {
            entry.reclaim();
        }
    }

    fn quarantined_bytes(&self) -> usize {
        self.queue.lock().bytes
    }
}
