//! Integration test: seeded workloads produce passing reports and valid logs.

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use partalloc_core::{CheckMode, LifecycleLevel};
use partalloc_harness::structured_log::{validate_log_file, validate_log_line};
use partalloc_harness::{LogEmitter, Outcome, WorkloadConfig, run_workload};

/// Shared in-memory writer so the test can read back what the emitter wrote.
#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SharedBuffer {
    fn lines(&self) -> Vec<String> {
        let bytes = self.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap().lines().map(str::to_string).collect()
    }
}

fn small_config(seed: u64) -> WorkloadConfig {
    WorkloadConfig {
        name: format!("test-{seed}"),
        seed,
        threads: 3,
        ops_per_thread: 1500,
        max_size: 3000,
        direct_map_permille: 10,
        realloc_permille: 150,
        purge_every: 400,
        checks: CheckMode::Checked,
        ..WorkloadConfig::default()
    }
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("partalloc-harness-{}-{name}", std::process::id()))
}

#[test]
fn checked_workload_passes() {
    let buffer = SharedBuffer::default();
    let mut emitter = LogEmitter::to_writer(Box::new(buffer.clone()), "checked");
    let report = run_workload(&small_config(11), &mut emitter).unwrap();

    assert_eq!(report.outcome, Outcome::Pass);
    assert_eq!(report.corrupted_slots(), 0);
    assert_eq!(report.committed_after_purge, 0);
    assert_eq!(report.threads.len(), 3);
    for thread in &report.threads {
        assert!(thread.allocations > 0);
        assert_eq!(thread.failed_requests, 0);
    }
    assert_eq!(report.counters.allocations, report.counters.frees);
    assert!(report.counters.direct_map_allocations > 0);
    assert!(report.pages.reservations > 0);

    let lines = buffer.lines();
    assert_eq!(lines.len(), emitter.lines());
    for (index, line) in lines.iter().enumerate() {
        validate_log_line(line, index + 1).unwrap();
    }
    assert!(lines[0].contains("\"event\":\"workload_start\""));
    assert!(lines.last().unwrap().contains("\"outcome\":\"pass\""));
    assert!(lines.iter().any(|l| l.contains("\"source\":\"partition\"")));
}

#[test]
fn same_seed_gives_same_single_thread_run() {
    let config = WorkloadConfig {
        threads: 1,
        thread_cache: false,
        ..small_config(12)
    };
    let a = run_workload(&config, &mut LogEmitter::to_sink("a")).unwrap();
    let b = run_workload(&config, &mut LogEmitter::to_sink("b")).unwrap();
    assert_eq!(a.threads, b.threads);
    assert_eq!(a.counters, b.counters);
}

#[test]
fn release_mode_with_ref_counts_passes() {
    let config = WorkloadConfig {
        checks: CheckMode::Release,
        ref_count: true,
        log_level: LifecycleLevel::Warn,
        ..small_config(13)
    };
    let report = run_workload(&config, &mut LogEmitter::to_sink("release")).unwrap();
    assert_eq!(report.outcome, Outcome::Pass);
    assert_eq!(report.lifecycle_records, 0);
}

#[test]
fn report_serializes_to_json() {
    let config = WorkloadConfig {
        threads: 1,
        ops_per_thread: 200,
        ..small_config(14)
    };
    let report = run_workload(&config, &mut LogEmitter::to_sink("json")).unwrap();
    let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
    assert_eq!(json["outcome"], "pass");
    assert_eq!(json["config"]["seed"], 14);
    assert_eq!(json["config"]["checks"], "checked");
    assert!(json["counters"]["allocations"].as_u64().unwrap() > 0);
    assert!(json["stats"]["total_mmapped_bytes"].as_u64().is_some());
}

#[test]
fn log_file_round_trips_through_validation() {
    let path = temp_path("run.jsonl");
    {
        let mut emitter = LogEmitter::to_file(&path, "file").unwrap();
        let config = WorkloadConfig {
            threads: 2,
            ops_per_thread: 300,
            ..small_config(15)
        };
        run_workload(&config, &mut emitter).unwrap();
    }
    let valid = validate_log_file(&path).unwrap().unwrap();
    assert!(valid >= 4);

    std::fs::write(&path, "{\"trace_id\":\"x\"}\n").unwrap();
    let errors = validate_log_file(&path).unwrap().unwrap_err();
    assert!(errors.iter().any(|e| e.field == "timestamp"));
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn invalid_config_is_rejected_before_running() {
    let config = WorkloadConfig {
        threads: 0,
        ..small_config(16)
    };
    let mut emitter = LogEmitter::to_sink("bad");
    assert!(run_workload(&config, &mut emitter).is_err());
    assert_eq!(emitter.lines(), 0);
}
