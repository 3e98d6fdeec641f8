//! Per-thread slot cache.
//!
//! Each thread keeps one cache per root it has touched, with a magazine of
//! recently freed slots per bucket. Allocation and free consult the magazine
//! before taking the root lock. When a magazine overflows, half of it goes
//! back to the root in one locked batch; when the thread exits its caches go
//! back to every root that is still alive.
//!
//! `purge(FORCE_ALL_FREED)` flushes the calling thread's cache at once and
//! bumps the root's flush epoch. Other threads notice the new epoch on their
//! next cache access for that root and return everything they cached then, so
//! a thread that never touches the root again keeps its slots until it exits.

use std::cell::RefCell;
use std::sync::Weak;

use partalloc_pages::geometry::SYSTEM_PAGE_SIZE;

use crate::root::PartitionRoot;
use crate::size_class::NUM_BUCKETS;
use crate::slot_span::SpanId;

/// Maximum number of cached slots per bucket per thread.
pub const MAGAZINE_CAPACITY: usize = 64;

/// Largest slot size that is cached.
pub const MAX_CACHED_SLOT_SIZE: usize = SYSTEM_PAGE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CachedSlot {
    pub slot_start: usize,
    pub span: SpanId,
}

/// Stack of cached slots of one bucket.
#[derive(Debug, Default)]
struct Magazine {
    slots: Vec<CachedSlot>,
}

impl Magazine {
    fn pop(&mut self) -> Option<CachedSlot> {
        self.slots.pop()
    }

    /// Push a slot; when the magazine is full the older half is returned so
    /// the caller can hand it back to the root.
    fn push(&mut self, slot: CachedSlot) -> Option<Vec<CachedSlot>> {
        let overflow = if self.slots.len() >= MAGAZINE_CAPACITY {
            Some(self.slots.drain(..MAGAZINE_CAPACITY / 2).collect())
        } else {
            None
        };
        self.slots.push(slot);
        overflow
    }
}

struct ThreadCache {
    root_id: u64,
    root: Weak<PartitionRoot>,
    magazines: Vec<Magazine>,
    total_cached: usize,
    /// Root flush epoch this cache last synchronized with.
    epoch: u64,
}

impl ThreadCache {
    fn new(root: &PartitionRoot) -> Self {
        Self {
            root_id: root.id(),
            root: root.weak(),
            magazines: (0..NUM_BUCKETS).map(|_| Magazine::default()).collect(),
            total_cached: 0,
            epoch: root.cache_flush_epoch(),
        }
    }

    fn pop(&mut self, bucket: usize) -> Option<CachedSlot> {
        let slot = self.magazines.get_mut(bucket)?.pop();
        if slot.is_some() {
            self.total_cached -= 1;
        }
        slot
    }

    fn push(&mut self, bucket: usize, slot: CachedSlot) -> Option<Vec<CachedSlot>> {
        let overflow = self.magazines[bucket].push(slot);
        self.total_cached += 1;
        if let Some(batch) = &overflow {
            self.total_cached -= batch.len();
        }
        overflow
    }

    fn drain(&mut self) -> Vec<CachedSlot> {
        self.total_cached = 0;
        self.magazines
            .iter_mut()
            .flat_map(|m| std::mem::take(&mut m.slots))
            .collect()
    }
}

impl Drop for ThreadCache {
    fn drop(&mut self) {
        let slots = self.drain();
        if slots.is_empty() {
            return;
        }
        if let Some(root) = self.root.upgrade() {
            root.return_cached_slots(&slots);
        }
    }
}

thread_local! {
    static CACHES: RefCell<Vec<ThreadCache>> = const { RefCell::new(Vec::new()) };
}

/// Run `f` on this thread's cache for `root`. Returns `None` during thread
/// teardown or on re-entry, and when `create` is false and no cache exists.
///
/// A cache behind the root's flush epoch returns its slots before `f` runs.
fn with_cache<R>(root: &PartitionRoot, create: bool, f: impl FnOnce(&mut ThreadCache) -> R) -> Option<R> {
    let mut dead = Vec::new();
    let mut stale = Vec::new();
    let result = CACHES
        .try_with(|caches| {
            let mut caches = caches.try_borrow_mut().ok()?;
            let index = match caches.iter().position(|c| c.root_id == root.id()) {
                Some(index) => index,
                None if create => {
                    let mut i = 0;
                    while i < caches.len() {
                        if caches[i].root.strong_count() == 0 {
                            dead.push(caches.swap_remove(i));
                        } else {
                            i += 1;
                        }
                    }
                    caches.push(ThreadCache::new(root));
                    caches.len() - 1
                }
                None => return None,
            };
            let cache = &mut caches[index];
            let epoch = root.cache_flush_epoch();
            if cache.epoch != epoch {
                cache.epoch = epoch;
                stale = cache.drain();
            }
            Some(f(cache))
        })
        .ok()
        .flatten();
    // Caches of dropped roots and stale slots are released outside the borrow.
    drop(dead);
    if !stale.is_empty() {
        root.return_cached_slots(&stale);
    }
    result
}

/// Pop a cached slot of `bucket` for `root`.
pub(crate) fn try_get(root: &PartitionRoot, bucket: usize) -> Option<CachedSlot> {
    with_cache(root, true, |cache| cache.pop(bucket)).flatten()
}

/// Cache a freed slot. Returns false if the slot must be freed to the root.
pub(crate) fn try_put(root: &PartitionRoot, bucket: usize, slot: CachedSlot) -> bool {
    if bucket >= NUM_BUCKETS {
        return false;
    }
    let Some(overflow) = with_cache(root, true, |cache| cache.push(bucket, slot)) else {
        return false;
    };
    if let Some(batch) = overflow {
        root.return_cached_slots(&batch);
    }
    true
}

/// Return every slot this thread caches for `root`.
pub(crate) fn flush_current(root: &PartitionRoot) -> usize {
    let slots = with_cache(root, false, ThreadCache::drain).unwrap_or_default();
    let count = slots.len();
    if count > 0 {
        root.return_cached_slots(&slots);
    }
    count
}

/// Number of slots this thread caches for `root`.
pub(crate) fn cached_count(root: &PartitionRoot) -> usize {
    with_cache(root, false, |cache| cache.total_cached).unwrap_or(0)
}
