//! Allocation observer and override hooks.
//!
//! Observers see every allocation and free that does not pass
//! [`AllocFlags::NO_HOOKS`](crate::AllocFlags::NO_HOOKS). Overrides may take
//! over a request entirely: an allocation override that returns an address
//! short-circuits the root, a free override that returns true claims the
//! pointer. Nothing runs while the hooks are disabled.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::flags::AllocFlags;

pub type AllocObserver = Box<dyn Fn(usize, usize, &str) + Send + Sync>;
pub type FreeObserver = Box<dyn Fn(usize) + Send + Sync>;
pub type AllocOverride = Box<dyn Fn(AllocFlags, usize, &str) -> Option<usize> + Send + Sync>;
pub type FreeOverride = Box<dyn Fn(usize) -> bool + Send + Sync>;

#[derive(Default)]
struct HookSet {
    alloc_observer: Option<AllocObserver>,
    free_observer: Option<FreeObserver>,
    alloc_override: Option<AllocOverride>,
    free_override: Option<FreeOverride>,
}

#[derive(Default)]
pub struct AllocationHooks {
    enabled: AtomicBool,
    hooks: RwLock<HookSet>,
}

impl fmt::Debug for AllocationHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hooks = self.hooks.read();
        f.debug_struct("AllocationHooks")
            .field("enabled", &self.are_enabled())
            .field("alloc_observer", &hooks.alloc_observer.is_some())
            .field("free_observer", &hooks.free_observer.is_some())
            .field("alloc_override", &hooks.alloc_override.is_some())
            .field("free_override", &hooks.free_override.is_some())
            .finish()
    }
}

impl AllocationHooks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide hook set.
    pub fn global() -> Arc<AllocationHooks> {
        static GLOBAL: OnceLock<Arc<AllocationHooks>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(AllocationHooks::new())))
    }

    #[must_use]
    pub fn are_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Install both observers, replacing any previous pair. Observers must be
    /// installed or removed as a pair.
    pub fn set_observer_hooks(&self, alloc: Option<AllocObserver>, free: Option<FreeObserver>) {
        assert_eq!(alloc.is_some(), free.is_some(), "observer hooks come in pairs");
        let mut hooks = self.hooks.write();
        hooks.alloc_observer = alloc;
        hooks.free_observer = free;
        self.refresh(&hooks);
    }

    /// Install both overrides, replacing any previous pair.
    pub fn set_override_hooks(&self, alloc: Option<AllocOverride>, free: Option<FreeOverride>) {
        assert_eq!(alloc.is_some(), free.is_some(), "override hooks come in pairs");
        let mut hooks = self.hooks.write();
        hooks.alloc_override = alloc;
        hooks.free_override = free;
        self.refresh(&hooks);
    }

    fn refresh(&self, hooks: &HookSet) {
        let any = hooks.alloc_observer.is_some() || hooks.alloc_override.is_some();
        self.enabled.store(any, Ordering::Release);
    }

    pub(crate) fn try_alloc_override(&self, flags: AllocFlags, size: usize, type_name: &str) -> Option<usize> {
        self.hooks
            .read()
            .alloc_override
            .as_ref()
            .and_then(|hook| hook(flags, size, type_name))
    }

    pub(crate) fn try_free_override(&self, ptr: usize) -> bool {
        self.hooks
            .read()
            .free_override
            .as_ref()
            .is_some_and(|hook| hook(ptr))
    }

    pub(crate) fn allocation_observed(&self, ptr: usize, size: usize, type_name: &str) {
        if let Some(hook) = self.hooks.read().alloc_observer.as_ref() {
            hook(ptr, size, type_name);
        }
    }

    pub(crate) fn free_observed(&self, ptr: usize) {
        if let Some(hook) = self.hooks.read().free_observer.as_ref() {
            hook(ptr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn disabled_until_installed() {
        let hooks = AllocationHooks::new();
        assert!(!hooks.are_enabled());
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_alloc = Arc::clone(&seen);
        hooks.set_observer_hooks(
            Some(Box::new(move |_, size, _| {
                seen_alloc.fetch_add(size, Ordering::Relaxed);
            })),
            Some(Box::new(|_| {})),
        );
        assert!(hooks.are_enabled());
        hooks.allocation_observed(0x1000, 24, "test");
        assert_eq!(seen.load(Ordering::Relaxed), 24);
        hooks.set_observer_hooks(None, None);
        assert!(!hooks.are_enabled());
    }

    #[test]
    fn overrides_claim_requests() {
        let hooks = AllocationHooks::new();
        hooks.set_override_hooks(
            Some(Box::new(|_, size, _| (size == 7).then_some(0xdead_0000))),
            Some(Box::new(|ptr| ptr == 0xdead_0000)),
        );
        assert_eq!(hooks.try_alloc_override(AllocFlags::empty(), 7, ""), Some(0xdead_0000));
        assert_eq!(hooks.try_alloc_override(AllocFlags::empty(), 8, ""), None);
        assert!(hooks.try_free_override(0xdead_0000));
        assert!(!hooks.try_free_override(0x1000));
    }

    #[test]
    #[should_panic(expected = "pairs")]
    fn unpaired_observers_rejected() {
        AllocationHooks::new().set_observer_hooks(None, Some(Box::new(|_| {})));
    }
}
