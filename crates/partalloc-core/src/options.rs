//! Root construction options.

use std::fmt;
use std::sync::Arc;

use partalloc_pages::{AddressSpace, CheckMode, PageAllocator, ZeroOnFree, check_mode, zero_on_free_policy};

use crate::hooks::AllocationHooks;
use crate::log::{DEFAULT_LOG_CAPACITY, LifecycleLevel};
use crate::oom::{CorruptionHandler, OomHandler, default_corruption_handler, default_oom_handler};
use crate::quarantine::Quarantine;

/// Alignment guarantee of the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Alignment {
    /// Slots are aligned to the minimum alignment; extras are allowed.
    #[default]
    Regular,
    /// `aligned_allocate` is supported; cookies and ref counts are off.
    AlignedAlloc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadCacheOption {
    #[default]
    Disabled,
    Enabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefCountOption {
    #[default]
    Disabled,
    Enabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanOption {
    /// The root can never quarantine.
    #[default]
    AlwaysDisabled,
    /// Scanning can be turned on later with `enable_scan`.
    DisabledByDefault,
    ForcedEnabledForTesting,
}

#[derive(Clone)]
pub struct PartitionOptions {
    pub name: String,
    pub alignment: Alignment,
    pub thread_cache: ThreadCacheOption,
    pub ref_count: RefCountOption,
    pub scan: ScanOption,
    pub checks: CheckMode,
    pub zero_on_free: ZeroOnFree,
    pub log_level: LifecycleLevel,
    pub log_capacity: usize,
    pub oom_handler: OomHandler,
    pub corruption_handler: CorruptionHandler,
    pub hooks: Option<Arc<AllocationHooks>>,
    /// Quarantine used in scan mode; a default queue is created when absent.
    pub quarantine: Option<Arc<dyn Quarantine>>,
    pub pages: Arc<dyn PageAllocator>,
}

impl fmt::Debug for PartitionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionOptions")
            .field("name", &self.name)
            .field("alignment", &self.alignment)
            .field("thread_cache", &self.thread_cache)
            .field("ref_count", &self.ref_count)
            .field("scan", &self.scan)
            .field("checks", &self.checks)
            .field("zero_on_free", &self.zero_on_free)
            .field("log_level", &self.log_level)
            .field("hooks", &self.hooks.is_some())
            .field("quarantine", &self.quarantine.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for PartitionOptions {
    fn default() -> Self {
        let shared: Arc<dyn PageAllocator> = AddressSpace::shared();
        Self {
            name: "partition".to_string(),
            alignment: Alignment::Regular,
            thread_cache: ThreadCacheOption::Disabled,
            ref_count: RefCountOption::Disabled,
            scan: ScanOption::AlwaysDisabled,
            checks: check_mode(),
            zero_on_free: zero_on_free_policy(),
            log_level: LifecycleLevel::Debug,
            log_capacity: DEFAULT_LOG_CAPACITY,
            oom_handler: default_oom_handler,
            corruption_handler: default_corruption_handler,
            hooks: None,
            quarantine: None,
            pages: shared,
        }
    }
}

impl PartitionOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_alignment(mut self, alignment: Alignment) -> Self {
        self.alignment = alignment;
        self
    }

    #[must_use]
    pub fn with_thread_cache(mut self, thread_cache: ThreadCacheOption) -> Self {
        self.thread_cache = thread_cache;
        self
    }

    #[must_use]
    pub fn with_ref_count(mut self, ref_count: RefCountOption) -> Self {
        self.ref_count = ref_count;
        self
    }

    #[must_use]
    pub fn with_scan(mut self, scan: ScanOption) -> Self {
        self.scan = scan;
        self
    }

    #[must_use]
    pub fn with_checks(mut self, checks: CheckMode) -> Self {
        self.checks = checks;
        self
    }

    #[must_use]
    pub fn with_zero_on_free(mut self, policy: ZeroOnFree) -> Self {
        self.zero_on_free = policy;
        self
    }

    #[must_use]
    pub fn with_log_level(mut self, level: LifecycleLevel) -> Self {
        self.log_level = level;
        self
    }

    #[must_use]
    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_oom_handler(mut self, handler: OomHandler) -> Self {
        self.oom_handler = handler;
        self
    }

    #[must_use]
    pub fn with_corruption_handler(mut self, handler: CorruptionHandler) -> Self {
        self.corruption_handler = handler;
        self
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<AllocationHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    #[must_use]
    pub fn with_quarantine(mut self, quarantine: Arc<dyn Quarantine>) -> Self {
        self.quarantine = Some(quarantine);
        self
    }

    #[must_use]
    pub fn with_pages(mut self, pages: Arc<dyn PageAllocator>) -> Self {
        self.pages = pages;
        self
    }

    /// Cookies are only placed on roots that allow extras.
    #[must_use]
    pub fn cookies_enabled(&self) -> bool {
        self.alignment == Alignment::Regular && self.checks.cookies_enabled()
    }

    #[must_use]
    pub fn ref_count_enabled(&self) -> bool {
        self.alignment == Alignment::Regular && self.ref_count == RefCountOption::Enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_alloc_turns_extras_off() {
        let options = PartitionOptions::new()
            .with_checks(CheckMode::Checked)
            .with_ref_count(RefCountOption::Enabled);
        assert!(options.cookies_enabled());
        assert!(options.ref_count_enabled());
        let aligned = options.with_alignment(Alignment::AlignedAlloc);
        assert!(!aligned.cookies_enabled());
        assert!(!aligned.ref_count_enabled());
    }

    #[test]
    fn defaults_are_conservative() {
        let options = PartitionOptions::default();
        assert_eq!(options.thread_cache, ThreadCacheOption::Disabled);
        assert_eq!(options.scan, ScanOption::AlwaysDisabled);
        assert!(options.hooks.is_none());
        assert!(format!("{options:?}").contains("PartitionOptions"));
    }
}
