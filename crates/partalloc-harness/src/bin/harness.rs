//! CLI entrypoint for the partalloc workload harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use partalloc_core::size_class::{bucket_slot_size, is_valid_bucket};
use partalloc_core::{CheckMode, LifecycleLevel, NUM_BUCKETS};
use partalloc_harness::structured_log::validate_log_file;
use partalloc_harness::{HarnessError, LogEmitter, Outcome, WorkloadConfig, run_workload};

/// Workload tooling for the partalloc partition allocator.
#[derive(Debug, Parser)]
#[command(name = "partalloc-harness")]
#[command(about = "Seeded allocation workloads against a partition root")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a seeded workload and emit a JSON report.
    Run {
        #[arg(long, default_value_t = 0x5EED)]
        seed: u64,
        #[arg(long, default_value_t = 4)]
        threads: usize,
        /// Operations per worker thread.
        #[arg(long, default_value_t = 10_000)]
        ops: usize,
        /// Largest bucketed request size.
        #[arg(long, default_value_t = 4096)]
        max_size: usize,
        /// Direct-mapped requests per thousand allocations.
        #[arg(long, default_value_t = 5)]
        direct_map_permille: u64,
        /// Reallocations per thousand operations.
        #[arg(long, default_value_t = 100)]
        realloc_permille: u64,
        /// Purge every N operations per worker (0 disables).
        #[arg(long, default_value_t = 0)]
        purge_every: usize,
        /// `checked` or `release`.
        #[arg(long, default_value = "checked")]
        checks: String,
        /// Lifecycle log level (`trace`, `debug`, `info`, `warn`, `error`).
        #[arg(long, default_value = "debug")]
        log_level: String,
        #[arg(long)]
        no_thread_cache: bool,
        #[arg(long)]
        ref_count: bool,
        /// Output report path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
        /// Structured JSONL log path.
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Validate a structured JSONL log.
    ValidateLog {
        #[arg(long)]
        log: PathBuf,
    },
    /// Print the bucket size-class table as JSON.
    SizeClasses,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            seed,
            threads,
            ops,
            max_size,
            direct_map_permille,
            realloc_permille,
            purge_every,
            checks,
            log_level,
            no_thread_cache,
            ref_count,
            output,
            log,
        } => {
            let log_level = LifecycleLevel::from_str_loose(&log_level)
                .ok_or_else(|| HarnessError::InvalidConfig(format!("unknown log level '{log_level}'")))?;
            let config = WorkloadConfig {
                name: format!("run-{seed:x}"),
                seed,
                threads,
                ops_per_thread: ops,
                max_size,
                direct_map_permille,
                realloc_permille,
                purge_every,
                checks: CheckMode::from_str_loose(&checks),
                thread_cache: !no_thread_cache,
                ref_count,
                log_level,
            };
            let run_id = format!("{seed:016x}");
            let mut emitter = match &log {
                Some(path) => LogEmitter::to_file(path, &run_id)?,
                None => LogEmitter::to_sink(&run_id),
            };
            let report = run_workload(&config, &mut emitter)?;
            let json = report.to_json()?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)?;
                    eprintln!("report: {}", path.display());
                }
                None => println!("{json}"),
            }
            if report.outcome != Outcome::Pass {
                eprintln!(
                    "workload failed: {} corrupted slot(s), {} byte(s) committed after purge",
                    report.corrupted_slots(),
                    report.committed_after_purge
                );
                std::process::exit(1);
            }
        }
        Command::ValidateLog { log } => match validate_log_file(&log)? {
            Ok(lines) => println!("{}: {lines} valid line(s)", log.display()),
            Err(errors) => {
                for error in &errors {
                    eprintln!("{error}");
                }
                return Err(Box::new(HarnessError::InvalidLog {
                    count: errors.len(),
                    first: errors[0].to_string(),
                }));
            }
        },
        Command::SizeClasses => {
            let table: Vec<_> = (0..NUM_BUCKETS)
                .filter(|&index| is_valid_bucket(index))
                .map(|index| serde_json::json!({ "bucket": index, "slot_size": bucket_slot_size(index) }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&table)?);
        }
    }
    Ok(())
}
