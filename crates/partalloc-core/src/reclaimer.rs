//! Process-wide registry of roots for periodic memory reclaim.

use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::flags::PurgeFlags;
use crate::purge::PurgeReport;
use crate::root::PartitionRoot;

#[derive(Debug, Default)]
pub struct MemoryReclaimer {
    roots: Mutex<Vec<Weak<PartitionRoot>>>,
}

impl MemoryReclaimer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instance() -> &'static MemoryReclaimer {
        static INSTANCE: OnceLock<MemoryReclaimer> = OnceLock::new();
        INSTANCE.get_or_init(MemoryReclaimer::new)
    }

    pub fn register(&self, root: &Arc<PartitionRoot>) {
        let mut roots = self.roots.lock();
        roots.retain(|weak| weak.strong_count() > 0);
        if !roots.iter().any(|weak| weak.as_ptr() == Arc::as_ptr(root)) {
            roots.push(Arc::downgrade(root));
        }
    }

    pub fn unregister(&self, root: &PartitionRoot) {
        let target: *const PartitionRoot = root;
        self.roots
            .lock()
            .retain(|weak| weak.strong_count() > 0 && weak.as_ptr() != target);
    }

    #[must_use]
    pub fn registered_count(&self) -> usize {
        self.roots
            .lock()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Decommit empty spans and discard unused pages in every live root.
    pub fn reclaim(&self) -> PurgeReport {
        let live: Vec<Arc<PartitionRoot>> = self.roots.lock().iter().filter_map(Weak::upgrade).collect();
        let mut total = PurgeReport::default();
        for root in live {
            let report = root.purge(
                PurgeFlags::DECOMMIT_EMPTY_SLOT_SPANS | PurgeFlags::DISCARD_UNUSED_SYSTEM_PAGES,
            );
            total.decommitted_bytes += report.decommitted_bytes;
            total.discarded_bytes += report.discarded_bytes;
        }
        total
    }
}
