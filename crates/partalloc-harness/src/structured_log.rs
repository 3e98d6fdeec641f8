//! Structured logging for harness runs.
//!
//! Provides:
//! - [`LogEntry`]: canonical JSONL log record with required + optional fields.
//! - [`LogEmitter`]: writes JSONL lines to a file or an in-memory buffer.
//! - [`validate_log_line`]: validates a single JSONL line against the schema.
//! - [`validate_log_file`]: validates an entire JSONL file.
//!
//! Root lifecycle records convert into entries with [`LogEntry::from_lifecycle`]
//! and keep their `core::partition::{symbol}::{id}` trace ids.

use std::io::Write;
use std::path::Path;

use partalloc_core::{LifecycleLevel, LifecycleRecord};
use serde::{Deserialize, Serialize};

/// Severity level for log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl From<LifecycleLevel> for LogLevel {
    fn from(level: LifecycleLevel) -> Self {
        match level {
            LifecycleLevel::Trace => Self::Trace,
            LifecycleLevel::Debug => Self::Debug,
            LifecycleLevel::Info => Self::Info,
            LifecycleLevel::Warn => Self::Warn,
            LifecycleLevel::Error => Self::Error,
        }
    }
}

/// Workload / verification outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
    Skip,
    Error,
}

/// Where an entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Harness,
    Partition,
}

/// Canonical structured log entry.
///
/// Required fields: `timestamp`, `trace_id`, `level`, `event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub trace_id: String,
    pub level: LogLevel,
    pub event: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    /// Allocator API symbol (`allocate`, `free`, `purge`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ptr: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<usize>,
    /// Allocator outcome label (`success`, `oom`, `deferred`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    /// Create a new log entry with required fields only.
    #[must_use]
    pub fn new(trace_id: impl Into<String>, level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp: unix_timestamp(),
            trace_id: trace_id.into(),
            level,
            event: event.into(),
            run_id: None,
            source: None,
            partition: None,
            symbol: None,
            decision_id: None,
            ptr: None,
            size: None,
            bucket: None,
            status: None,
            outcome: None,
            duration_ms: None,
            details: None,
        }
    }

    /// Convert a root lifecycle record, keeping its trace id.
    #[must_use]
    pub fn from_lifecycle(partition: &str, record: &LifecycleRecord) -> Self {
        let mut entry = Self::new(record.trace_id.clone(), record.level.into(), record.event)
            .with_partition(partition)
            .with_symbol(record.symbol)
            .with_status(record.outcome)
            .with_details(serde_json::json!({
                "message": record.details,
                "committed_bytes": record.committed_bytes,
                "super_page_bytes": record.super_page_bytes,
                "direct_mapped_bytes": record.direct_mapped_bytes,
                "cache_hit_rate_permille": record.cache_hit_rate_permille,
            }));
        entry.source = Some(Source::Partition);
        entry.decision_id = Some(record.decision_id);
        entry.ptr = record.ptr;
        entry.size = record.size;
        entry.bucket = record.bucket;
        entry
    }

    #[must_use]
    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    #[must_use]
    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    #[must_use]
    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Set the outcome.
    #[must_use]
    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    /// Set duration in milliseconds.
    #[must_use]
    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    /// Set free-form details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Serialize to a single JSONL line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Writes structured JSONL log entries to a file or a buffer.
pub struct LogEmitter {
    writer: Box<dyn Write + Send>,
    seq: u64,
    run_id: String,
    lines: usize,
}

impl LogEmitter {
    /// Create an emitter that writes to a file.
    pub fn to_file(path: &Path, run_id: &str) -> std::io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self::to_writer(Box::new(std::io::BufWriter::new(file)), run_id))
    }

    /// Create an emitter that discards its output after counting lines.
    #[must_use]
    pub fn to_sink(run_id: &str) -> Self {
        Self::to_writer(Box::new(std::io::sink()), run_id)
    }

    #[must_use]
    pub fn to_writer(writer: Box<dyn Write + Send>, run_id: &str) -> Self {
        Self {
            writer,
            seq: 0,
            run_id: run_id.to_string(),
            lines: 0,
        }
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Number of lines written so far.
    #[must_use]
    pub fn lines(&self) -> usize {
        self.lines
    }

    fn next_trace_id(&mut self) -> String {
        self.seq += 1;
        format!("harness::{}::{:03}", self.run_id, self.seq)
    }

    /// Emit a bare harness event with an auto-generated trace id.
    pub fn emit(&mut self, level: LogLevel, event: &str) -> std::io::Result<LogEntry> {
        let trace_id = self.next_trace_id();
        let entry = LogEntry::new(trace_id, level, event);
        self.emit_entry(entry.clone())?;
        Ok(entry)
    }

    /// Emit a fully-populated entry, filling in the trace id and run id.
    pub fn emit_entry(&mut self, mut entry: LogEntry) -> std::io::Result<()> {
        if entry.trace_id.is_empty() {
            entry.trace_id = self.next_trace_id();
        }
        if entry.run_id.is_none() {
            entry.run_id = Some(self.run_id.clone());
        }
        if entry.source.is_none() {
            entry.source = Some(Source::Harness);
        }
        let line = entry.to_jsonl().map_err(std::io::Error::other)?;
        writeln!(self.writer, "{line}")?;
        self.lines += 1;
        Ok(())
    }

    /// Emit every lifecycle record of a root, oldest first.
    pub fn emit_lifecycle(&mut self, partition: &str, records: &[LifecycleRecord]) -> std::io::Result<()> {
        for record in records {
            self.emit_entry(LogEntry::from_lifecycle(partition, record))?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// Validation error for a log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogValidationError {
    pub line_number: usize,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for LogValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: field '{}': {}", self.line_number, self.field, self.message)
    }
}

fn invalid(line_number: usize, field: &str, message: impl Into<String>) -> LogValidationError {
    LogValidationError {
        line_number,
        field: field.to_string(),
        message: message.into(),
    }
}

/// Validate a single JSONL line against the schema.
pub fn validate_log_line(line: &str, line_number: usize) -> Result<LogEntry, Vec<LogValidationError>> {
    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return Err(vec![invalid(line_number, "<json>", format!("invalid JSON: {e}"))]),
    };
    let Some(obj) = value.as_object() else {
        return Err(vec![invalid(line_number, "<root>", "expected JSON object")]);
    };

    let mut errors = Vec::new();
    for field in ["timestamp", "trace_id", "level", "event"] {
        if !obj.contains_key(field) {
            errors.push(invalid(line_number, field, "required field missing"));
        }
    }

    if let Some(level) = obj.get("level").and_then(|v| v.as_str())
        && !["trace", "debug", "info", "warn", "error", "fatal"].contains(&level)
    {
        errors.push(invalid(line_number, "level", format!("invalid level: '{level}'")));
    }

    if let Some(outcome) = obj.get("outcome").and_then(|v| v.as_str())
        && !["pass", "fail", "skip", "error"].contains(&outcome)
    {
        errors.push(invalid(line_number, "outcome", format!("invalid outcome: '{outcome}'")));
    }

    // Partition records carry the allocator's trace id shape.
    if obj.get("source").and_then(|v| v.as_str()) == Some("partition")
        && let Some(trace_id) = obj.get("trace_id").and_then(|v| v.as_str())
        && !trace_id.starts_with("core::partition::")
    {
        errors.push(invalid(
            line_number,
            "trace_id",
            format!("partition record with foreign trace id: '{trace_id}'"),
        ));
    }

    if !errors.is_empty() {
        return Err(errors);
    }
    serde_json::from_value(value).map_err(|e| vec![invalid(line_number, "<schema>", e.to_string())])
}

/// Validate every non-empty line of a JSONL file.
///
/// Returns the number of valid lines, or every validation error found.
pub fn validate_log_file(path: &Path) -> std::io::Result<Result<usize, Vec<LogValidationError>>> {
    let content = std::fs::read_to_string(path)?;
    let mut valid = 0;
    let mut errors = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match validate_log_line(line, index + 1) {
            Ok(_) => valid += 1,
            Err(mut line_errors) => errors.append(&mut line_errors),
        }
    }
    Ok(if errors.is_empty() { Ok(valid) } else { Err(errors) })
}

/// Seconds and milliseconds since the Unix epoch.
fn unix_timestamp() -> String {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:03}", duration.as_secs(), duration.subsec_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_entry_serializes_required_fields() {
        let entry = LogEntry::new("harness::run::001", LogLevel::Info, "workload_start");
        let json = entry.to_jsonl().unwrap();
        assert!(json.contains("\"trace_id\":\"harness::run::001\""));
        assert!(json.contains("\"level\":\"info\""));
        assert!(!json.contains("\"ptr\""));
    }

    #[test]
    fn emitter_numbers_trace_ids() {
        let mut emitter = LogEmitter::to_sink("r1");
        let first = emitter.emit(LogLevel::Info, "a").unwrap();
        let second = emitter.emit(LogLevel::Debug, "b").unwrap();
        assert_eq!(first.trace_id, "harness::r1::001");
        assert_eq!(second.trace_id, "harness::r1::002");
        assert_eq!(emitter.lines(), 2);
    }

    #[test]
    fn validation_rejects_missing_fields() {
        let errors = validate_log_line(r#"{"trace_id":"x","level":"info"}"#, 3).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["timestamp", "event"]);
        assert_eq!(errors[0].line_number, 3);
    }

    #[test]
    fn validation_rejects_unknown_level() {
        let line = r#"{"timestamp":"1.000","trace_id":"x","level":"loud","event":"e"}"#;
        let errors = validate_log_line(line, 1).unwrap_err();
        assert_eq!(errors[0].field, "level");
    }

    #[test]
    fn validation_checks_partition_trace_ids() {
        let line = r#"{"timestamp":"1.000","trace_id":"x","level":"info","event":"e","source":"partition"}"#;
        let errors = validate_log_line(line, 1).unwrap_err();
        assert_eq!(errors[0].field, "trace_id");

        let line = r#"{"timestamp":"1.000","trace_id":"core::partition::free::01","level":"info","event":"e","source":"partition"}"#;
        assert!(validate_log_line(line, 1).is_ok());
    }

    #[test]
    fn lifecycle_levels_map_one_to_one() {
        assert_eq!(LogLevel::from(LifecycleLevel::Warn), LogLevel::Warn);
        assert_eq!(LogLevel::from(LifecycleLevel::Trace), LogLevel::Trace);
    }
}
