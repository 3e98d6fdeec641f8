//! Partition root: the public allocation contract.
//!
//! A root owns its buckets, spans and reservations. Memory of one root never
//! serves another: every super page carries the owning root's integrity value
//! and a pointer is only accepted by the root whose table maps it.
//!
//! Lock order: root state, then the super-page table, then the lifecycle log.
//! Failure handlers always run with no lock held.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Once, Weak};

use parking_lot::{Mutex, RwLock};
use partalloc_pages::geometry::{
    MAX_SYSTEM_PAGES_PER_SLOT_SPAN, NUM_PARTITION_PAGES_PER_SUPER_PAGE, PARTITION_PAGE_SIZE, SUPER_PAGE_SIZE,
    SYSTEM_PAGE_SIZE, super_page_base,
};
use partalloc_pages::{CheckMode, PageAllocator, PageError, ZeroOnFree};

use crate::bucket::{self, Bucket};
use crate::counters::{RootCounters, RootCountersSnapshot};
use crate::direct_map::{self, MAX_DIRECT_MAPPED};
use crate::error::{AllocError, IntegrityError};
use crate::extent::{Extents, SuperPageMetadata};
use crate::extras::{self, ExtrasLayout, FREED_BYTE, QUARANTINED_BYTE, RefCount, UNINITIALIZED_BYTE};
use crate::flags::{AllocFlags, PurgeFlags};
use crate::hooks::AllocationHooks;
use crate::log::{LifecycleLevel, LifecycleLog, LifecycleRecord};
use crate::oom::{CorruptionHandler, OomHandler};
use crate::options::{Alignment, PartitionOptions, ScanOption, ThreadCacheOption};
use crate::purge::PurgeReport;
use crate::quarantine::{Quarantine, QuarantineQueue, QuarantinedSlot};
use crate::reclaimer::MemoryReclaimer;
use crate::size_class::{self, MAX_BUCKETED, NUM_BUCKETS, SENTINEL_BUCKET};
use crate::slot_span::{EmptyRing, SpanId, SpanTable};
use crate::stats::{BucketMemoryStats, PartitionMemoryStats, StatsDumper};
use crate::thread_cache::{self, CachedSlot, MAX_CACHED_SLOT_SIZE};

static NEXT_ROOT_ID: AtomicU64 = AtomicU64::new(1);

const SCAN_DISABLED: u8 = 0;
const SCAN_ENABLED: u8 = 1;

thread_local! {
    static ZERO_ON_FREE_COUNTDOWN: Cell<u32> = const { Cell::new(0) };
}

/// Everything guarded by the root lock.
pub(crate) struct RootState {
    pub buckets: Vec<Bucket>,
    pub spans: SpanTable,
    pub extents: Extents,
    pub empty_ring: EmptyRing,
}

/// A slot taken from a span, before extras are applied.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SlotAlloc {
    pub slot_start: usize,
    pub utilized_slot_size: usize,
    pub is_already_zeroed: bool,
    pub is_direct_mapped: bool,
}

/// A pointer resolved to its slot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResolvedSlot {
    pub span: SpanId,
    pub bucket: usize,
    pub slot_start: usize,
    pub slot_size: usize,
    pub utilized_slot_size: usize,
    pub stores_raw_size: bool,
    pub is_direct_mapped: bool,
}

pub struct PartitionRoot {
    id: u64,
    /// Integrity value stored in every super page of this root.
    inverted_self: u64,
    name: String,
    self_ref: Weak<PartitionRoot>,
    pub(crate) pages: Arc<dyn PageAllocator>,
    state: Mutex<RootState>,
    super_pages: RwLock<HashMap<usize, Arc<SuperPageMetadata>>>,
    pub(crate) counters: RootCounters,
    /// Span size per bucket, for resolving pointers without the lock.
    span_bytes: Box<[usize]>,
    extras: ExtrasLayout,
    alignment: Alignment,
    thread_cache_enabled: bool,
    /// Bumped by `purge(FORCE_ALL_FREED)`; thread caches that saw an older
    /// value hand their slots back on their next access.
    cache_flush_epoch: AtomicU64,
    checks: CheckMode,
    zero_on_free: ZeroOnFree,
    scan: ScanOption,
    scan_mode: AtomicU8,
    oom_handler: OomHandler,
    corruption_handler: CorruptionHandler,
    hooks: Option<Arc<AllocationHooks>>,
    quarantine: Option<Arc<dyn Quarantine>>,
    log: LifecycleLog,
}

impl fmt::Debug for PartitionRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionRoot")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("extras", &self.extras)
            .field("checks", &self.checks)
            .field("thread_cache", &self.thread_cache_enabled)
            .field("scan", &self.scan)
            .field("counters", &self.counters.snapshot())
            .finish_non_exhaustive()
    }
}

impl PartitionRoot {
    pub(crate) fn new(options: PartitionOptions) -> Arc<Self> {
        let id = NEXT_ROOT_ID.fetch_add(1, Ordering::Relaxed);
        let extras = ExtrasLayout::new(options.cookies_enabled(), options.ref_count_enabled());
        let quarantine = match options.scan {
            ScanOption::AlwaysDisabled => None,
            _ => Some(
                options
                    .quarantine
                    .unwrap_or_else(|| Arc::new(QuarantineQueue::default()) as Arc<dyn Quarantine>),
            ),
        };
        let scan_mode = if options.scan == ScanOption::ForcedEnabledForTesting {
            SCAN_ENABLED
        } else {
            SCAN_DISABLED
        };
        let span_bytes = (0..NUM_BUCKETS)
            .map(|index| {
                if size_class::is_valid_bucket(index) {
                    Bucket::new(size_class::bucket_slot_size(index)).bytes_per_span()
                } else {
                    0
                }
            })
            .collect();

        let root = Arc::new_cyclic(|weak| Self {
            id,
            inverted_self: !id,
            name: options.name,
            self_ref: weak.clone(),
            pages: options.pages,
            state: Mutex::new(RootState {
                buckets: bucket::init_buckets(),
                spans: SpanTable::default(),
                extents: Extents::default(),
                empty_ring: EmptyRing::default(),
            }),
            super_pages: RwLock::new(HashMap::new()),
            counters: RootCounters::new(),
            span_bytes,
            extras,
            alignment: options.alignment,
            thread_cache_enabled: options.thread_cache == ThreadCacheOption::Enabled,
            cache_flush_epoch: AtomicU64::new(0),
            checks: options.checks,
            zero_on_free: options.zero_on_free,
            scan: options.scan,
            scan_mode: AtomicU8::new(scan_mode),
            oom_handler: options.oom_handler,
            corruption_handler: options.corruption_handler,
            hooks: options.hooks,
            quarantine,
            log: LifecycleLog::new(options.log_level, options.log_capacity),
        });
        root.record(
            LifecycleLevel::Info,
            "init",
            "root_init",
            None,
            None,
            None,
            "initialized",
            format!(
                "name={};extras={};thread_cache={};scan={:?}",
                root.name,
                root.extras.size(),
                root.thread_cache_enabled,
                root.scan
            ),
        );
        root
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn weak(&self) -> Weak<PartitionRoot> {
        self.self_ref.clone()
    }

    pub(crate) fn cache_flush_epoch(&self) -> u64 {
        self.cache_flush_epoch.load(Ordering::Acquire)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn record(
        &self,
        level: LifecycleLevel,
        symbol: &'static str,
        event: &'static str,
        ptr: Option<usize>,
        size: Option<usize>,
        bucket: Option<usize>,
        outcome: &'static str,
        details: impl Into<String>,
    ) {
        self.log
            .record(&self.counters, level, symbol, event, ptr, size, bucket, outcome, details);
    }

    pub(crate) fn register_super_page(&self, base: usize) -> Arc<SuperPageMetadata> {
        let meta = Arc::new(SuperPageMetadata::new(base, self.inverted_self));
        self.super_pages.write().insert(base, Arc::clone(&meta));
        meta
    }

    pub(crate) fn unregister_super_page(&self, base: usize) {
        self.super_pages.write().remove(&base);
    }

    pub(crate) fn super_page_metadata(&self, addr: usize) -> Option<Arc<SuperPageMetadata>> {
        self.super_pages.read().get(&super_page_base(addr)).cloned()
    }

    // ----- failure routing -----

    fn report_corruption(&self, err: &IntegrityError) -> ! {
        self.record(
            LifecycleLevel::Error,
            "integrity",
            "corruption",
            None,
            None,
            None,
            "fatal",
            err.to_string(),
        );
        (self.corruption_handler)(err)
    }

    /// Errors on a path that dereferences caller pointers are corruption.
    fn fail_pointer(&self, ptr: usize, err: AllocError) -> ! {
        match err {
            AllocError::Integrity(err) => self.report_corruption(&err),
            _ => self.report_corruption(&IntegrityError::SpanCorrupted {
                ptr,
                reason: "page access failed",
            }),
        }
    }

    fn handle_alloc_failure(&self, flags: AllocFlags, size: usize, err: AllocError) -> Option<usize> {
        match err {
            AllocError::Integrity(err) => self.report_corruption(&err),
            AllocError::UnsupportedAlignment { .. } => panic!("partalloc: {err}"),
            _ => {
                self.record(
                    LifecycleLevel::Warn,
                    "allocate",
                    "alloc",
                    None,
                    Some(size),
                    None,
                    "oom",
                    err.to_string(),
                );
                if flags.contains(AllocFlags::RETURN_NULL) {
                    None
                } else {
                    (self.oom_handler)(size)
                }
            }
        }
    }

    // ----- allocation -----

    /// Allocate `size` bytes; out-of-memory is fatal.
    #[must_use]
    pub fn allocate(&self, size: usize) -> Option<usize> {
        self.allocate_flags(AllocFlags::empty(), size)
    }

    #[must_use]
    pub fn allocate_flags(&self, flags: AllocFlags, size: usize) -> Option<usize> {
        match self.allocate_inner(flags, size) {
            Ok(ptr) => Some(ptr),
            Err(err) => self.handle_alloc_failure(flags, size, err),
        }
    }

    /// Allocate with `alignment` (a power of two up to a partition page).
    /// Only roots without extras support this.
    #[must_use]
    pub fn aligned_allocate(&self, alignment: usize, size: usize) -> Option<usize> {
        self.aligned_allocate_flags(AllocFlags::empty(), alignment, size)
    }

    #[must_use]
    pub fn aligned_allocate_flags(&self, flags: AllocFlags, alignment: usize, size: usize) -> Option<usize> {
        if !alignment.is_power_of_two() || alignment > PARTITION_PAGE_SIZE || !self.extras.is_empty() {
            return self.handle_alloc_failure(flags, size, AllocError::UnsupportedAlignment { alignment });
        }
        // Power-of-two slots are naturally aligned up to a partition page.
        let requested = if size < alignment {
            Some(alignment)
        } else {
            size.checked_next_power_of_two()
        };
        match requested {
            Some(requested) => self.allocate_flags(flags, requested),
            None => self.handle_alloc_failure(flags, size, AllocError::SizeOverflow { size }),
        }
    }

    fn allocate_inner(&self, flags: AllocFlags, size: usize) -> Result<usize, AllocError> {
        let hooks = self
            .hooks
            .as_deref()
            .filter(|h| !flags.contains(AllocFlags::NO_HOOKS) && h.are_enabled());
        if let Some(ptr) = hooks.and_then(|h| h.try_alloc_override(flags, size, "")) {
            return Ok(ptr);
        }

        let size = if self.extras.ref_count { size.max(1) } else { size };
        let raw_size = size
            .checked_add(self.extras.size())
            .ok_or(AllocError::SizeOverflow { size })?;
        if raw_size > MAX_DIRECT_MAPPED {
            return Err(AllocError::ExcessiveSize {
                size,
                limit: MAX_DIRECT_MAPPED,
            });
        }
        let bucket_index = size_class::bucket_index_for(raw_size);
        let slot = self.alloc_slot(bucket_index, raw_size)?;
        self.counters.note_alloc();

        let pages: &dyn PageAllocator = self.pages.as_ref();
        let usable = slot.utilized_slot_size - self.extras.size();
        let ptr = slot.slot_start + self.extras.offset();
        if flags.contains(AllocFlags::ZERO_FILL) {
            if !slot.is_already_zeroed {
                pages.fill(ptr, usable, 0)?;
            }
        } else if self.checks.poison_enabled() && !slot.is_direct_mapped {
            pages.fill(ptr, usable, UNINITIALIZED_BYTE)?;
        }
        if self.extras.cookies {
            extras::write_cookies(pages, ptr, usable)?;
        }
        if self.extras.ref_count && !slot.is_direct_mapped {
            RefCount::init(pages, slot.slot_start)?;
        }

        if let Some(hooks) = hooks {
            hooks.allocation_observed(ptr, size, "");
        }
        self.record(
            LifecycleLevel::Trace,
            "allocate",
            "alloc",
            Some(ptr),
            Some(size),
            Some(bucket_index),
            "success",
            String::new(),
        );
        Ok(ptr)
    }

    fn cacheable(&self, bucket_index: usize) -> bool {
        self.thread_cache_enabled
            && bucket_index < NUM_BUCKETS
            && size_class::bucket_slot_size(bucket_index) <= MAX_CACHED_SLOT_SIZE
    }

    fn alloc_slot(&self, bucket_index: usize, raw_size: usize) -> Result<SlotAlloc, AllocError> {
        if self.cacheable(bucket_index) {
            let cached = thread_cache::try_get(self, bucket_index);
            self.counters.note_cache(cached.is_some());
            if let Some(cached) = cached {
                return Ok(SlotAlloc {
                    slot_start: cached.slot_start,
                    utilized_slot_size: size_class::bucket_slot_size(bucket_index),
                    is_already_zeroed: false,
                    is_direct_mapped: false,
                });
            }
        }

        let mut state = self.state.lock();
        if bucket_index != SENTINEL_BUCKET {
            if let Some(id) = state.buckets[bucket_index].active_head {
                let span = state.spans.get_mut(id);
                if span.freelist_head != 0 {
                    let slot_start = span.pop_free(self.pages.as_ref())?;
                    if span.stores_raw_size() {
                        span.raw_size = raw_size;
                    }
                    return Ok(SlotAlloc {
                        slot_start,
                        utilized_slot_size: span.utilized_slot_size(),
                        is_already_zeroed: false,
                        is_direct_mapped: false,
                    });
                }
            }
        }
        self.slow_path_allocate(&mut state, bucket_index, raw_size)
    }

    // ----- pointer resolution -----

    pub(crate) fn resolve(&self, ptr: usize) -> Result<ResolvedSlot, AllocError> {
        let slot_start = ptr
            .checked_sub(self.extras.offset())
            .ok_or(IntegrityError::ForeignPointer { ptr })?;
        let meta = self
            .super_page_metadata(slot_start)
            .ok_or(IntegrityError::ForeignPointer { ptr })?;
        if meta.root_tag != self.inverted_self {
            return Err(IntegrityError::OwnerMismatch {
                ptr,
                found: meta.root_tag,
                expected: self.inverted_self,
            }
            .into());
        }
        let entry = meta
            .lookup(slot_start)
            .ok_or(IntegrityError::ForeignPointer { ptr })?;
        let span_base = SuperPageMetadata::span_base(slot_start, entry);
        if entry.bucket > SENTINEL_BUCKET {
            return Err(IntegrityError::SpanCorrupted {
                ptr,
                reason: "page table entry names an unknown bucket",
            }
            .into());
        }

        let slot_size = size_class::bucket_slot_size(entry.bucket);
        // Zero for the sentinel, which always stores its raw size.
        let raw_size_bucket =
            entry.bucket == SENTINEL_BUCKET || slot_size > MAX_SYSTEM_PAGES_PER_SLOT_SPAN * SYSTEM_PAGE_SIZE;
        if raw_size_bucket {
            let state = self.state.lock();
            let span = state.spans.get(entry.span);
            if span.base != span_base || span.bucket != entry.bucket {
                return Err(IntegrityError::ForeignPointer { ptr }.into());
            }
            if slot_start != span.base {
                return Err(IntegrityError::MisalignedSlot { ptr }.into());
            }
            return Ok(ResolvedSlot {
                span: entry.span,
                bucket: entry.bucket,
                slot_start,
                slot_size: span.slot_size,
                utilized_slot_size: span.utilized_slot_size(),
                stores_raw_size: true,
                is_direct_mapped: span.is_direct_mapped,
            });
        }

        let offset = slot_start - span_base;
        let slots_per_span = self.span_bytes[entry.bucket] / slot_size;
        if offset % slot_size != 0 || offset / slot_size >= slots_per_span {
            return Err(IntegrityError::MisalignedSlot { ptr }.into());
        }
        Ok(ResolvedSlot {
            span: entry.span,
            bucket: entry.bucket,
            slot_start,
            slot_size,
            utilized_slot_size: slot_size,
            stores_raw_size: false,
            is_direct_mapped: false,
        })
    }

    // ----- free -----

    /// Free `ptr`; null is a no-op. Corruption is fatal.
    pub fn free(&self, ptr: usize) {
        self.free_flags(AllocFlags::empty(), ptr);
    }

    /// Free honoring [`AllocFlags::NO_HOOKS`].
    pub fn free_flags(&self, flags: AllocFlags, ptr: usize) {
        if ptr == 0 {
            return;
        }
        if let Some(hooks) = self
            .hooks
            .as_deref()
            .filter(|h| !flags.contains(AllocFlags::NO_HOOKS) && h.are_enabled())
        {
            if hooks.try_free_override(ptr) {
                return;
            }
            hooks.free_observed(ptr);
        }
        if let Err(err) = self.free_inner(ptr) {
            self.fail_pointer(ptr, err);
        }
    }

    fn free_inner(&self, ptr: usize) -> Result<(), AllocError> {
        let slot = self.resolve(ptr)?;
        if !slot.is_direct_mapped && self.is_scan_enabled() {
            if let Some(quarantine) = &self.quarantine {
                let usable_size = slot.utilized_slot_size - self.extras.size();
                if self.checks.poison_enabled() {
                    self.pages.fill(ptr, usable_size, QUARANTINED_BYTE)?;
                }
                self.counters.note_quarantined();
                quarantine.move_to_quarantine(
                    self,
                    QuarantinedSlot {
                        ptr,
                        slot_start: slot.slot_start,
                        bucket: slot.bucket,
                        slot_size: slot.slot_size,
                        usable_size,
                    },
                );
                return Ok(());
            }
        }
        self.free_resolved(ptr, slot)
    }

    /// Cookie check and reference release, then the actual release.
    fn free_resolved(&self, ptr: usize, slot: ResolvedSlot) -> Result<(), AllocError> {
        let pages: &dyn PageAllocator = self.pages.as_ref();
        let usable = slot.utilized_slot_size - self.extras.size();
        if self.extras.cookies {
            extras::check_cookies(pages, ptr, usable)?;
        }
        if self.extras.ref_count
            && !slot.is_direct_mapped
            && !RefCount::release_from_allocator(pages, slot.slot_start, ptr)?
        {
            // Other references are alive; the last release completes the free.
            pages.fill(ptr, usable, QUARANTINED_BYTE)?;
            self.counters.note_deferred_free();
            self.record(
                LifecycleLevel::Trace,
                "free",
                "free",
                Some(ptr),
                Some(usable),
                Some(slot.bucket),
                "deferred",
                String::new(),
            );
            return Ok(());
        }
        self.release_slot(slot)
    }

    fn should_zero_on_free(&self) -> bool {
        match self.zero_on_free {
            ZeroOnFree::Never | ZeroOnFree::Sampled { period: 0 } => false,
            ZeroOnFree::Always => true,
            ZeroOnFree::Sampled { period } => ZERO_ON_FREE_COUNTDOWN
                .try_with(|countdown| {
                    let left = countdown.get();
                    if left <= 1 {
                        countdown.set(period);
                        true
                    } else {
                        countdown.set(left - 1);
                        false
                    }
                })
                .unwrap_or(false),
        }
    }

    /// Poison or zero the slot and give it back.
    fn release_slot(&self, slot: ResolvedSlot) -> Result<(), AllocError> {
        let pages: &dyn PageAllocator = self.pages.as_ref();
        if slot.is_direct_mapped {
            let unmap = {
                let mut state = self.state.lock();
                self.unmap_direct(&mut state, slot.span)?
            };
            unmap.run(self)?;
            self.counters.note_free();
            return Ok(());
        }

        if self.checks.poison_enabled() {
            pages.fill(slot.slot_start, slot.utilized_slot_size, FREED_BYTE)?;
        } else if self.should_zero_on_free() {
            pages.fill(slot.slot_start, slot.utilized_slot_size, 0)?;
        }
        self.counters.note_free();

        if self.cacheable(slot.bucket)
            && thread_cache::try_put(
                self,
                slot.bucket,
                CachedSlot {
                    slot_start: slot.slot_start,
                    span: slot.span,
                },
            )
        {
            return Ok(());
        }
        let mut state = self.state.lock();
        self.free_to_span(&mut state, slot.span, slot.slot_start)
    }

    /// Free slots coming back from a thread cache in one locked batch.
    pub(crate) fn return_cached_slots(&self, slots: &[CachedSlot]) {
        let result = {
            let mut state = self.state.lock();
            slots
                .iter()
                .try_for_each(|slot| self.free_to_span(&mut state, slot.span, slot.slot_start))
        };
        if let Err(err) = result {
            let ptr = slots.first().map_or(0, |s| s.slot_start);
            self.fail_pointer(ptr, err);
        }
    }

    /// Second half of a quarantined free, called by the quarantine.
    pub fn reclaim(&self, ptr: usize) {
        if let Err(err) = self.resolve(ptr).and_then(|slot| self.free_resolved(ptr, slot)) {
            self.fail_pointer(ptr, err);
        }
    }

    // ----- reallocation -----

    #[must_use]
    pub fn reallocate(&self, ptr: usize, new_size: usize) -> Option<usize> {
        self.reallocate_flags(AllocFlags::empty(), ptr, new_size)
    }

    /// Like `reallocate`, but returns null on failure and leaves `ptr` valid.
    #[must_use]
    pub fn try_reallocate(&self, ptr: usize, new_size: usize) -> Option<usize> {
        self.reallocate_flags(AllocFlags::RETURN_NULL, ptr, new_size)
    }

    #[must_use]
    pub fn reallocate_flags(&self, flags: AllocFlags, ptr: usize, new_size: usize) -> Option<usize> {
        if ptr == 0 {
            return self.allocate_flags(flags, new_size);
        }
        if new_size == 0 {
            self.free_flags(flags, ptr);
            return None;
        }
        if new_size > self.max_direct_mapped() {
            return self.handle_alloc_failure(
                flags,
                new_size,
                AllocError::ExcessiveSize {
                    size: new_size,
                    limit: self.max_direct_mapped(),
                },
            );
        }
        let slot = match self.resolve(ptr) {
            Ok(slot) => slot,
            Err(err) => self.fail_pointer(ptr, err),
        };
        match self.try_resize_in_place(ptr, slot, new_size) {
            Ok(true) => return Some(ptr),
            Ok(false) => {}
            Err(err) => self.fail_pointer(ptr, err),
        }

        let old_usable = slot.utilized_slot_size - self.extras.size();
        let new_ptr = self.allocate_flags(flags, new_size)?;
        let copied = self
            .pages
            .read_vec(ptr, old_usable.min(new_size))
            .and_then(|bytes| self.pages.write(new_ptr, &bytes));
        if let Err(err) = copied {
            self.fail_pointer(ptr, err.into());
        }
        self.free_flags(flags, ptr);
        Some(new_ptr)
    }

    fn try_resize_in_place(&self, ptr: usize, slot: ResolvedSlot, new_size: usize) -> Result<bool, AllocError> {
        let raw_size = new_size + self.extras.size();
        if slot.is_direct_mapped {
            let resized = {
                let mut state = self.state.lock();
                self.try_realloc_direct_in_place(&mut state, slot.span, raw_size)?
            };
            if resized && self.extras.cookies {
                self.pages.write(ptr + new_size, &extras::COOKIE_VALUE)?;
            }
            return Ok(resized);
        }
        if size_class::bucket_index_for(raw_size) != slot.bucket {
            return Ok(false);
        }
        if slot.stores_raw_size {
            let mut state = self.state.lock();
            state.spans.get_mut(slot.span).raw_size = raw_size;
        }
        if self.extras.cookies && slot.stores_raw_size {
            self.pages.write(ptr + new_size, &extras::COOKIE_VALUE)?;
        }
        Ok(true)
    }

    // ----- queries -----

    /// Usable bytes behind `ptr`.
    #[must_use]
    pub fn get_usable_size(&self, ptr: usize) -> usize {
        if ptr == 0 {
            return 0;
        }
        match self.resolve(ptr) {
            Ok(slot) => slot.utilized_slot_size - self.extras.size(),
            Err(err) => self.fail_pointer(ptr, err),
        }
    }

    /// Usable bytes the slot class serving `size` provides.
    #[must_use]
    pub fn actual_size(&self, size: usize) -> usize {
        let Some(raw_size) = size.checked_add(self.extras.size()) else {
            return size;
        };
        if raw_size > MAX_DIRECT_MAPPED {
            return size;
        }
        let index = size_class::bucket_index_for(raw_size);
        let slot_size = if index == SENTINEL_BUCKET {
            direct_map::direct_map_slot_size(raw_size)
        } else {
            size_class::bucket_slot_size(index)
        };
        slot_size - self.extras.size()
    }

    #[must_use]
    pub const fn max_direct_mapped(&self) -> usize {
        MAX_DIRECT_MAPPED
    }

    #[must_use]
    pub fn max_bucketed(&self) -> usize {
        MAX_BUCKETED
    }

    #[must_use]
    pub fn extras(&self) -> ExtrasLayout {
        self.extras
    }

    #[must_use]
    pub fn alignment(&self) -> Alignment {
        self.alignment
    }

    #[must_use]
    pub fn check_mode(&self) -> CheckMode {
        self.checks
    }

    // ----- reference counting -----

    /// Take an extra reference on a live slot. Returns false when the root
    /// does not count references or the slot is direct-mapped.
    pub fn acquire_ref(&self, ptr: usize) -> bool {
        if !self.extras.ref_count || ptr == 0 {
            return false;
        }
        let slot = match self.resolve(ptr) {
            Ok(slot) if !slot.is_direct_mapped => slot,
            Ok(_) => return false,
            Err(err) => self.fail_pointer(ptr, err),
        };
        if let Err(err) = RefCount::acquire(self.pages.as_ref(), slot.slot_start, ptr) {
            self.fail_pointer(ptr, err);
        }
        true
    }

    /// Drop a reference taken with `acquire_ref`; the last release of a freed
    /// slot completes its free.
    pub fn release_ref(&self, ptr: usize) -> bool {
        if !self.extras.ref_count || ptr == 0 {
            return false;
        }
        let slot = match self.resolve(ptr) {
            Ok(slot) if !slot.is_direct_mapped => slot,
            Ok(_) => return false,
            Err(err) => self.fail_pointer(ptr, err),
        };
        let result = RefCount::release(self.pages.as_ref(), slot.slot_start, ptr).and_then(|last| {
            if last { self.release_slot(slot) } else { Ok(()) }
        });
        if let Err(err) = result {
            self.fail_pointer(ptr, err);
        }
        true
    }

    #[must_use]
    pub fn has_one_ref(&self, ptr: usize) -> bool {
        if !self.extras.ref_count || ptr == 0 {
            return false;
        }
        match self.resolve(ptr) {
            Ok(slot) => RefCount::has_one_ref(self.pages.as_ref(), slot.slot_start).unwrap_or(false),
            Err(err) => self.fail_pointer(ptr, err),
        }
    }

    // ----- scan mode -----

    /// Turn on quarantining of frees. Fails on roots built without scan support.
    pub fn enable_scan(&self) -> bool {
        if self.scan == ScanOption::AlwaysDisabled || self.quarantine.is_none() {
            return false;
        }
        self.scan_mode.store(SCAN_ENABLED, Ordering::Release);
        self.record(LifecycleLevel::Info, "enable_scan", "scan", None, None, None, "enabled", String::new());
        true
    }

    #[must_use]
    pub fn is_scan_enabled(&self) -> bool {
        self.scan_mode.load(Ordering::Acquire) == SCAN_ENABLED
    }

    #[must_use]
    pub fn quarantine(&self) -> Option<&Arc<dyn Quarantine>> {
        self.quarantine.as_ref()
    }

    // ----- thread cache -----

    /// Return this thread's cached slots to the root.
    pub fn flush_thread_cache(&self) -> usize {
        if !self.thread_cache_enabled {
            return 0;
        }
        thread_cache::flush_current(self)
    }

    #[must_use]
    pub fn thread_cache_count(&self) -> usize {
        if !self.thread_cache_enabled {
            return 0;
        }
        thread_cache::cached_count(self)
    }

    // ----- purge and stats -----

    pub fn purge(&self, flags: PurgeFlags) -> PurgeReport {
        if flags.contains(PurgeFlags::FORCE_ALL_FREED) {
            // Reclaimed quarantine slots may land in this thread's cache, so
            // the quarantine drains first.
            if let Some(quarantine) = &self.quarantine {
                quarantine.flush(self);
            }
            self.flush_thread_cache();
            if self.thread_cache_enabled {
                self.cache_flush_epoch.fetch_add(1, Ordering::AcqRel);
            }
        }
        let result = {
            let mut state = self.state.lock();
            self.purge_locked(&mut state, flags)
        };
        let report = match result {
            Ok(report) => report,
            Err(err) => self.fail_pointer(0, err),
        };
        self.counters.note_purge();
        self.record(
            LifecycleLevel::Info,
            "purge",
            "purge",
            None,
            None,
            None,
            "success",
            format!(
                "flags={:#x};decommitted={};discarded={}",
                flags.bits(),
                report.decommitted_bytes,
                report.discarded_bytes
            ),
        );
        report
    }

    fn purge_locked(&self, state: &mut RootState, flags: PurgeFlags) -> Result<PurgeReport, AllocError> {
        let mut report = PurgeReport::default();
        if flags.contains(PurgeFlags::DECOMMIT_EMPTY_SLOT_SPANS) {
            report.decommitted_bytes = self.decommit_empty_slot_spans(state)?;
        }
        if flags.contains(PurgeFlags::DISCARD_UNUSED_SYSTEM_PAGES) {
            report.discarded_bytes = self.discard_unused_system_pages(state)?;
        }
        Ok(report)
    }

    fn collect_stats(&self, state: &mut RootState) -> Result<(PartitionMemoryStats, Vec<BucketMemoryStats>), AllocError> {
        let mut per_bucket: Vec<BucketMemoryStats> = state
            .buckets
            .iter()
            .take(NUM_BUCKETS)
            .map(|bucket| BucketMemoryStats {
                bucket_slot_size: bucket.slot_size,
                allocated_slot_span_size: bucket.bytes_per_span(),
                ..BucketMemoryStats::default()
            })
            .collect();
        let mut seen = vec![false; NUM_BUCKETS];
        let mut direct = Vec::new();

        for id in state.spans.ids() {
            let span = state.spans.get(id);
            if span.is_direct_mapped {
                direct.push(BucketMemoryStats {
                    is_direct_map: true,
                    bucket_slot_size: span.slot_size,
                    allocated_slot_span_size: span.slot_size,
                    active_bytes: span.raw_size,
                    resident_bytes: span.slot_size,
                    num_full_slot_spans: 1,
                    ..BucketMemoryStats::default()
                });
                continue;
            }
            let index = span.bucket;
            seen[index] = true;
            if span.is_decommitted() {
                per_bucket[index].num_decommitted_slot_spans += 1;
                continue;
            }
            let active = if span.stores_raw_size() {
                span.raw_size
            } else {
                span.num_allocated_slots * span.slot_size
            };
            let resident = partalloc_pages::geometry::align_up(
                (span.capacity - span.num_unprovisioned_slots) * span.slot_size,
                SYSTEM_PAGE_SIZE,
            );
            let (empty, full) = (span.is_empty(), span.is_full());
            let discardable = self.purge_slot_span(state, id, false)?;
            let stats = &mut per_bucket[index];
            stats.active_bytes += active;
            stats.resident_bytes += resident;
            stats.discardable_bytes += discardable;
            if empty {
                stats.decommittable_bytes += resident;
                stats.num_empty_slot_spans += 1;
            } else if full {
                stats.num_full_slot_spans += 1;
            } else {
                stats.num_active_slot_spans += 1;
            }
        }

        let mut buckets: Vec<BucketMemoryStats> = per_bucket
            .into_iter()
            .zip(seen)
            .filter_map(|(stats, seen)| seen.then_some(stats))
            .collect();
        buckets.extend(direct);

        let mut totals = PartitionMemoryStats {
            total_mmapped_bytes: self.counters.super_page_bytes() + self.counters.direct_mapped_bytes(),
            total_committed_bytes: self.counters.committed_bytes(),
            num_super_pages: state.extents.super_page_count(),
            num_direct_mapped_allocations: state.extents.direct_maps.len(),
            has_thread_cache: self.thread_cache_enabled,
            ..PartitionMemoryStats::default()
        };
        for stats in &buckets {
            totals.total_resident_bytes += stats.resident_bytes;
            totals.total_active_bytes += stats.active_bytes;
            totals.total_decommittable_bytes += stats.decommittable_bytes;
            totals.total_discardable_bytes += stats.discardable_bytes;
        }
        Ok((totals, buckets))
    }

    /// Report memory statistics. A light dump reports only the totals.
    pub fn dump_stats(&self, partition_name: &str, is_light_dump: bool, dumper: &mut dyn StatsDumper) {
        let result = {
            let mut state = self.state.lock();
            self.collect_stats(&mut state)
        };
        let (totals, buckets) = match result {
            Ok(collected) => collected,
            Err(err) => self.fail_pointer(0, err),
        };
        if !is_light_dump {
            for stats in &buckets {
                dumper.partition_bucket_stats(partition_name, stats);
            }
        }
        dumper.partition_dump_totals(partition_name, &totals);
    }

    // ----- byte access and observability -----

    pub fn read(&self, addr: usize, buf: &mut [u8]) -> Result<(), PageError> {
        self.pages.read(addr, buf)
    }

    pub fn read_vec(&self, addr: usize, len: usize) -> Result<Vec<u8>, PageError> {
        self.pages.read_vec(addr, len)
    }

    pub fn write(&self, addr: usize, data: &[u8]) -> Result<(), PageError> {
        self.pages.write(addr, data)
    }

    pub fn fill(&self, addr: usize, len: usize, byte: u8) -> Result<(), PageError> {
        self.pages.fill(addr, len, byte)
    }

    #[must_use]
    pub fn pages(&self) -> &Arc<dyn PageAllocator> {
        &self.pages
    }

    #[must_use]
    pub fn counters(&self) -> RootCountersSnapshot {
        self.counters.snapshot()
    }

    #[must_use]
    pub fn total_size_of_committed_pages(&self) -> usize {
        self.counters.committed_bytes()
    }

    #[must_use]
    pub fn total_size_of_super_pages(&self) -> usize {
        self.counters.super_page_bytes()
    }

    #[must_use]
    pub fn total_size_of_direct_mapped_pages(&self) -> usize {
        self.counters.direct_mapped_bytes()
    }

    #[must_use]
    pub fn lifecycle_logs(&self) -> Vec<LifecycleRecord> {
        self.log.snapshot()
    }

    pub fn take_lifecycle_logs(&self) -> Vec<LifecycleRecord> {
        self.log.drain()
    }

    /// Super-page extents as `(base, consecutive super pages)`.
    #[must_use]
    pub fn super_page_extents(&self) -> Vec<(usize, usize)> {
        self.state
            .lock()
            .extents
            .super_pages
            .iter()
            .map(|e| (e.super_page_base, e.number_of_consecutive_super_pages))
            .collect()
    }

    #[must_use]
    pub fn empty_ring_occupancy(&self) -> usize {
        self.state.lock().empty_ring.occupied()
    }
}

impl Drop for PartitionRoot {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for base in state.extents.super_page_bases() {
            let _ = self.pages.release(base, SUPER_PAGE_SIZE);
        }
        for extent in &state.extents.direct_maps {
            let _ = self.pages.release(extent.reservation_base, extent.reservation_size);
        }
    }
}

static GLOBAL_INIT: Once = Once::new();

fn global_init() {
    GLOBAL_INIT.call_once(|| {
        assert_eq!(SUPER_PAGE_SIZE % PARTITION_PAGE_SIZE, 0);
        assert!(NUM_PARTITION_PAGES_PER_SUPER_PAGE <= usize::from(u8::MAX) + 1);
        assert!(MAX_SYSTEM_PAGES_PER_SLOT_SPAN <= usize::from(u8::MAX));
        assert!(direct_map::direct_map_reservation_size(MAX_DIRECT_MAPPED) > MAX_DIRECT_MAPPED);
        for index in (0..NUM_BUCKETS).filter(|&i| size_class::is_valid_bucket(i)) {
            let slot_size = size_class::bucket_slot_size(index);
            let pages = bucket::system_pages_per_slot_span(slot_size);
            assert!(pages <= usize::from(u8::MAX), "bucket {index} spans {pages} system pages");
            assert!(Bucket::new(slot_size).num_partition_pages() < NUM_PARTITION_PAGES_PER_SUPER_PAGE - 1);
        }
    });
}

/// An initialized root, registered with the process memory reclaimer for
/// its lifetime.
#[derive(Debug)]
pub struct PartitionAllocator {
    root: Arc<PartitionRoot>,
}

impl PartitionAllocator {
    #[must_use]
    pub fn init(options: PartitionOptions) -> Self {
        global_init();
        let root = PartitionRoot::new(options);
        MemoryReclaimer::instance().register(&root);
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Arc<PartitionRoot> {
        &self.root
    }
}

impl Deref for PartitionAllocator {
    type Target = PartitionRoot;

    fn deref(&self) -> &PartitionRoot {
        &self.root
    }
}

impl Drop for PartitionAllocator {
    fn drop(&mut self) {
        MemoryReclaimer::instance().unregister(&self.root);
    }
}
