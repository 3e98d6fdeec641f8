//! Seeded allocation workloads.
//!
//! A workload spawns `threads` workers against one fresh partition root. Each
//! worker draws its operations from a private [`XorShift64`] stream, tags the
//! first and last bytes of every live allocation and checks the tags before
//! reallocating or freeing. After the workers exit, the root is purged with
//! `FORCE_ALL_FREED` and must hold no committed pages.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use partalloc_core::{
    AddressSpace, AllocFlags, CheckMode, CollectingStatsDumper, LifecycleLevel, MAX_BUCKETED,
    PartitionAllocator, PartitionMemoryStats, PartitionOptions, PartitionRoot, PurgeFlags, PurgeReport,
    RefCountOption, RootCountersSnapshot, ThreadCacheOption,
};
use partalloc_pages::PageMetricsSnapshot;
use serde::Serialize;

use crate::error::HarnessError;
use crate::structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};

const TAG_BYTES: usize = 16;
const FREE_PERMILLE: u64 = 350;
const MAX_DIRECT_MAP_EXTRA: u64 = 4 << 20;

/// Deterministic xorshift64* generator.
#[derive(Debug, Clone, Copy)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self { state: seed.max(1) }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Uniform-ish value in `0..bound` (`bound > 0`).
    pub fn below(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkloadConfig {
    pub name: String,
    pub seed: u64,
    pub threads: usize,
    pub ops_per_thread: usize,
    /// Largest bucketed request size drawn.
    pub max_size: usize,
    /// Chance of a direct-mapped request, per thousand allocations.
    pub direct_map_permille: u64,
    /// Chance of a reallocation, per thousand operations.
    pub realloc_permille: u64,
    /// Purge every this many operations per worker (0 disables).
    pub purge_every: usize,
    pub checks: CheckMode,
    pub thread_cache: bool,
    pub ref_count: bool,
    pub log_level: LifecycleLevel,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            name: "workload".to_string(),
            seed: 0x5EED,
            threads: 4,
            ops_per_thread: 10_000,
            max_size: 4096,
            direct_map_permille: 5,
            realloc_permille: 100,
            purge_every: 0,
            checks: CheckMode::Checked,
            thread_cache: true,
            ref_count: false,
            log_level: LifecycleLevel::Debug,
        }
    }
}

impl WorkloadConfig {
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.threads == 0 {
            return Err(HarnessError::InvalidConfig("threads must be at least 1".into()));
        }
        if self.max_size == 0 || self.max_size > MAX_BUCKETED {
            return Err(HarnessError::InvalidConfig(format!(
                "max_size must be in 1..={MAX_BUCKETED}, got {}",
                self.max_size
            )));
        }
        if self.direct_map_permille > 1000 || self.realloc_permille + FREE_PERMILLE > 1000 {
            return Err(HarnessError::InvalidConfig(
                "operation mix exceeds 1000 permille".into(),
            ));
        }
        Ok(())
    }

    fn options(&self, pages: Arc<AddressSpace>) -> PartitionOptions {
        PartitionOptions::new()
            .with_name(self.name.clone())
            .with_checks(self.checks)
            .with_thread_cache(if self.thread_cache {
                ThreadCacheOption::Enabled
            } else {
                ThreadCacheOption::Disabled
            })
            .with_ref_count(if self.ref_count {
                RefCountOption::Enabled
            } else {
                RefCountOption::Disabled
            })
            .with_log_level(self.log_level)
            .with_pages(pages)
    }
}

/// Per-worker results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ThreadSummary {
    pub thread: usize,
    pub allocations: u64,
    pub reallocations: u64,
    pub frees: u64,
    pub failed_requests: u64,
    pub corrupted_slots: u64,
    pub peak_live_bytes: usize,
    pub purge: PurgeReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkloadReport {
    pub config: WorkloadConfig,
    pub outcome: Outcome,
    pub duration_ms: u64,
    pub threads: Vec<ThreadSummary>,
    pub counters: RootCountersSnapshot,
    /// Totals after every worker exited, before the final purge.
    pub stats: PartitionMemoryStats,
    pub final_purge: PurgeReport,
    pub committed_after_purge: usize,
    pub pages: PageMetricsSnapshot,
    pub lifecycle_records: usize,
}

impl WorkloadReport {
    #[must_use]
    pub fn corrupted_slots(&self) -> u64 {
        self.threads.iter().map(|t| t.corrupted_slots).sum()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

struct LiveSlot {
    ptr: usize,
    size: usize,
    tag: u8,
}

fn draw_size(rng: &mut XorShift64, config: &WorkloadConfig) -> usize {
    if rng.below(1000) < config.direct_map_permille {
        MAX_BUCKETED + 1 + rng.below(MAX_DIRECT_MAP_EXTRA) as usize
    } else {
        1 + rng.below(config.max_size as u64) as usize
    }
}

fn stamp(root: &PartitionRoot, slot: &LiveSlot) -> Result<(), HarnessError> {
    root.fill(slot.ptr, TAG_BYTES.min(slot.size), slot.tag)?;
    root.write(slot.ptr + slot.size - 1, &[slot.tag])?;
    Ok(())
}

/// True when the head bytes (up to `head_len`) and, if `check_tail`, the last
/// byte still carry the slot tag.
fn intact(root: &PartitionRoot, slot: &LiveSlot, head_len: usize, check_tail: bool) -> Result<bool, HarnessError> {
    let head = root.read_vec(slot.ptr, head_len)?;
    if head.iter().any(|&b| b != slot.tag) {
        return Ok(false);
    }
    if check_tail {
        return Ok(root.read_vec(slot.ptr + slot.size - 1, 1)? == [slot.tag]);
    }
    Ok(true)
}

fn add_purge(total: &mut PurgeReport, report: PurgeReport) {
    total.decommitted_bytes += report.decommitted_bytes;
    total.discarded_bytes += report.discarded_bytes;
}

fn run_worker(root: &PartitionRoot, config: &WorkloadConfig, thread: usize) -> Result<ThreadSummary, HarnessError> {
    let mut rng = XorShift64::new(config.seed ^ (thread as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    let mut summary = ThreadSummary {
        thread,
        ..ThreadSummary::default()
    };
    let mut live: Vec<LiveSlot> = Vec::new();
    let mut live_bytes = 0usize;

    for op in 0..config.ops_per_thread {
        let roll = rng.below(1000);
        if !live.is_empty() && roll < FREE_PERMILLE {
            let index = rng.below(live.len() as u64) as usize;
            let slot = live.swap_remove(index);
            if !intact(root, &slot, TAG_BYTES.min(slot.size), true)? {
                summary.corrupted_slots += 1;
            }
            live_bytes -= slot.size;
            root.free(slot.ptr);
            summary.frees += 1;
        } else if !live.is_empty() && roll < FREE_PERMILLE + config.realloc_permille {
            let index = rng.below(live.len() as u64) as usize;
            let new_size = draw_size(&mut rng, config);
            let old = &live[index];
            match root.reallocate_flags(AllocFlags::RETURN_NULL, old.ptr, new_size) {
                Some(ptr) => {
                    let moved = LiveSlot {
                        ptr,
                        size: old.size,
                        tag: old.tag,
                    };
                    // The tail byte only survives when the slot grew.
                    let preserved = TAG_BYTES.min(old.size).min(new_size);
                    if !intact(root, &moved, preserved, new_size >= old.size)? {
                        summary.corrupted_slots += 1;
                    }
                    live_bytes = live_bytes - old.size + new_size;
                    let slot = LiveSlot {
                        ptr,
                        size: new_size,
                        tag: moved.tag,
                    };
                    stamp(root, &slot)?;
                    live[index] = slot;
                    summary.reallocations += 1;
                }
                None => summary.failed_requests += 1,
            }
        } else {
            let size = draw_size(&mut rng, config);
            match root.allocate_flags(AllocFlags::RETURN_NULL, size) {
                Some(ptr) => {
                    let slot = LiveSlot {
                        ptr,
                        size,
                        tag: (rng.next_u64() as u8) | 1,
                    };
                    stamp(root, &slot)?;
                    live.push(slot);
                    live_bytes += size;
                    summary.allocations += 1;
                }
                None => summary.failed_requests += 1,
            }
        }
        summary.peak_live_bytes = summary.peak_live_bytes.max(live_bytes);

        if config.purge_every > 0 && op % config.purge_every == config.purge_every - 1 {
            let report = root.purge(PurgeFlags::DECOMMIT_EMPTY_SLOT_SPANS | PurgeFlags::DISCARD_UNUSED_SYSTEM_PAGES);
            add_purge(&mut summary.purge, report);
        }
    }

    for slot in live {
        if !intact(root, &slot, TAG_BYTES.min(slot.size), true)? {
            summary.corrupted_slots += 1;
        }
        root.free(slot.ptr);
        summary.frees += 1;
    }
    Ok(summary)
}

/// Run one workload, writing harness events and the root's lifecycle records
/// to `emitter`.
pub fn run_workload(config: &WorkloadConfig, emitter: &mut LogEmitter) -> Result<WorkloadReport, HarnessError> {
    config.validate()?;
    let started = Instant::now();
    let space = Arc::new(AddressSpace::with_seed(config.seed));
    let partition = PartitionAllocator::init(config.options(space.clone()));

    emitter.emit_entry(
        LogEntry::new("", LogLevel::Info, "workload_start")
            .with_partition(&config.name)
            .with_details(serde_json::to_value(config)?),
    )?;

    let handles: Vec<_> = (0..config.threads)
        .map(|thread| {
            let root = Arc::clone(partition.root());
            let config = config.clone();
            thread::spawn(move || run_worker(&root, &config, thread))
        })
        .collect();

    let mut threads = Vec::with_capacity(handles.len());
    for (thread, handle) in handles.into_iter().enumerate() {
        let summary = handle.join().map_err(|_| HarnessError::WorkerPanicked { thread })??;
        emitter.emit_entry(
            LogEntry::new("", LogLevel::Debug, "worker_done")
                .with_partition(&config.name)
                .with_details(serde_json::to_value(&summary)?),
        )?;
        threads.push(summary);
    }

    let mut dumper = CollectingStatsDumper::new();
    partition.dump_stats(&config.name, true, &mut dumper);
    let stats = dumper.totals.unwrap_or_default();

    let final_purge = partition.purge(PurgeFlags::FORCE_ALL_FREED);
    let committed_after_purge = partition.total_size_of_committed_pages();
    let counters = partition.counters();

    let records = partition.take_lifecycle_logs();
    emitter.emit_lifecycle(&config.name, &records)?;

    let corrupted: u64 = threads.iter().map(|t| t.corrupted_slots).sum();
    let outcome = if corrupted == 0 && committed_after_purge == 0 {
        Outcome::Pass
    } else {
        Outcome::Fail
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    let report = WorkloadReport {
        config: config.clone(),
        outcome,
        duration_ms,
        threads,
        counters,
        stats,
        final_purge,
        committed_after_purge,
        pages: space.metrics().snapshot(),
        lifecycle_records: records.len(),
    };
    emitter.emit_entry(
        LogEntry::new("", LogLevel::Info, "workload_end")
            .with_partition(&config.name)
            .with_outcome(outcome)
            .with_duration_ms(duration_ms)
            .with_details(serde_json::json!({
                "corrupted_slots": corrupted,
                "committed_after_purge": committed_after_purge,
                "allocations": counters.allocations,
                "frees": counters.frees,
            })),
    )?;
    emitter.flush()?;
    Ok(report)
}
