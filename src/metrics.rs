//! Call metrics for monitoring and observability.
//!
//! This module provides types for collecting and reporting metrics about
//! bridge operations: per-operation call counts and timing, errors by code,
//! and the state of the module's memory and heap table.

use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Bridge operations that are metered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    /// Create an instance from source text
    Construct,
    /// Token stream of an instance
    Tokenize,
    /// Parse tree of an instance
    ParseTree,
    /// Interpreter output of an instance
    Interpret,
    /// Error flag of an instance
    HasErrors,
    /// Variable bindings of an instance
    EnvironmentDump,
    /// Release an instance
    Destroy,
}

impl Operation {
    /// Metric label
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Construct => "construct",
            Operation::Tokenize => "tokenize",
            Operation::ParseTree => "parse_tree",
            Operation::Interpret => "interpret",
            Operation::HasErrors => "has_errors",
            Operation::EnvironmentDump => "environment_dump",
            Operation::Destroy => "destroy",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregated numbers for one operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStats {
    /// Number of calls
    pub calls: u64,
    /// Number of calls that returned an error
    pub failures: u64,
    /// Cumulative time in microseconds
    pub total_time_us: u64,
}

impl CallStats {
    /// Average time per call in microseconds
    pub fn avg_time_us(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.total_time_us as f64 / self.calls as f64
        }
    }
}

/// Snapshot of a bridge's state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStats {
    /// Total metered calls
    pub total_calls: u64,

    /// Total failed calls
    pub failed_calls: u64,

    /// Instances constructed and not yet released
    pub live_instances: u64,

    /// Occupied heap table slots outside the sentinel region
    pub live_heap_slots: usize,

    /// Current linear memory size in bytes
    pub memory_bytes: usize,

    /// Current linear memory generation
    pub memory_generation: u64,

    /// Number of times cached views had to be re-derived
    pub view_refreshes: u64,
}

/// Timer for a single call
pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    /// Start a new timer
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Metrics collector for aggregating bridge metrics
pub struct MetricsCollector {
    total_calls: AtomicU64,
    failed_calls: AtomicU64,
    constructed: AtomicU64,
    destroyed: AtomicU64,
    calls: parking_lot::Mutex<HashMap<Operation, CallStats>>,
    error_counts: parking_lot::Mutex<HashMap<ErrorCode, u64>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            total_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            constructed: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            calls: parking_lot::Mutex::new(HashMap::new()),
            error_counts: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Record a finished call
    pub fn record_call(&self, operation: Operation, elapsed: Duration, error: Option<ErrorCode>) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let mut calls = self.calls.lock();
        let stats = calls.entry(operation).or_default();
        stats.calls += 1;
        stats.total_time_us += elapsed.as_micros() as u64;

        match error {
            Some(code) => {
                stats.failures += 1;
                self.failed_calls.fetch_add(1, Ordering::Relaxed);
                *self.error_counts.lock().entry(code).or_insert(0) += 1;
            }
            None => match operation {
                Operation::Construct => {
                    self.constructed.fetch_add(1, Ordering::Relaxed);
                }
                Operation::Destroy => {
                    self.destroyed.fetch_add(1, Ordering::Relaxed);
                }
                _ => {}
            },
        }
    }

    /// Get total calls
    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    /// Get failed calls
    pub fn failed_calls(&self) -> u64 {
        self.failed_calls.load(Ordering::Relaxed)
    }

    /// Instances constructed minus instances destroyed
    pub fn live_instances(&self) -> u64 {
        self.constructed
            .load(Ordering::Relaxed)
            .saturating_sub(self.destroyed.load(Ordering::Relaxed))
    }

    /// Get stats for one operation
    pub fn call_stats(&self, operation: Operation) -> CallStats {
        self.calls.lock().get(&operation).copied().unwrap_or_default()
    }

    /// Get error counts
    pub fn error_counts(&self) -> HashMap<ErrorCode, u64> {
        self.error_counts.lock().clone()
    }

    /// Export Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP rulox_bridge_calls_total Bridge calls by operation\n");
        output.push_str("# TYPE rulox_bridge_calls_total counter\n");
        let mut calls: Vec<_> = self.calls.lock().iter().map(|(op, s)| (*op, *s)).collect();
        calls.sort_by_key(|(op, _)| op.as_str());
        for (operation, stats) in &calls {
            output.push_str(&format!(
                "rulox_bridge_calls_total{{operation=\"{}\",status=\"success\"}} {}\n",
                operation,
                stats.calls - stats.failures
            ));
            output.push_str(&format!(
                "rulox_bridge_calls_total{{operation=\"{}\",status=\"error\"}} {}\n",
                operation, stats.failures
            ));
        }

        output.push_str("\n# HELP rulox_bridge_call_time_us Average call time\n");
        output.push_str("# TYPE rulox_bridge_call_time_us gauge\n");
        for (operation, stats) in &calls {
            output.push_str(&format!(
                "rulox_bridge_call_time_us{{operation=\"{}\"}} {:.2}\n",
                operation,
                stats.avg_time_us()
            ));
        }

        output.push_str("\n# HELP rulox_bridge_live_instances Instances not yet released\n");
        output.push_str("# TYPE rulox_bridge_live_instances gauge\n");
        output.push_str(&format!(
            "rulox_bridge_live_instances {}\n",
            self.live_instances()
        ));

        output.push_str("\n# HELP rulox_bridge_errors_total Error counts by code\n");
        output.push_str("# TYPE rulox_bridge_errors_total counter\n");
        let mut errors: Vec<_> = self.error_counts().into_iter().collect();
        errors.sort_by_key(|(code, _)| code.to_string());
        for (code, count) in errors {
            output.push_str(&format!(
                "rulox_bridge_errors_total{{code=\"{}\"}} {}\n",
                code, count
            ));
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_calls() {
        let collector = MetricsCollector::new();
        collector.record_call(Operation::Construct, Duration::from_micros(10), None);
        collector.record_call(Operation::Construct, Duration::from_micros(30), None);
        collector.record_call(
            Operation::Interpret,
            Duration::from_micros(5),
            Some(ErrorCode::ModuleFault),
        );

        assert_eq!(collector.total_calls(), 3);
        assert_eq!(collector.failed_calls(), 1);
        let construct = collector.call_stats(Operation::Construct);
        assert_eq!(construct.calls, 2);
        assert!((construct.avg_time_us() - 20.0).abs() < f64::EPSILON);
        assert_eq!(collector.error_counts()[&ErrorCode::ModuleFault], 1);
    }

    #[test]
    fn test_live_instances() {
        let collector = MetricsCollector::new();
        collector.record_call(Operation::Construct, Duration::ZERO, None);
        collector.record_call(Operation::Construct, Duration::ZERO, None);
        collector.record_call(Operation::Destroy, Duration::ZERO, None);
        collector.record_call(
            Operation::Destroy,
            Duration::ZERO,
            Some(ErrorCode::Trap),
        );
        assert_eq!(collector.live_instances(), 1);
    }

    #[test]
    fn test_prometheus_output() {
        let collector = MetricsCollector::new();
        collector.record_call(Operation::Tokenize, Duration::from_micros(3), None);
        collector.record_call(
            Operation::Tokenize,
            Duration::from_micros(3),
            Some(ErrorCode::DecodeError),
        );

        let output = collector.to_prometheus();
        assert!(output.contains(
            "rulox_bridge_calls_total{operation=\"tokenize\",status=\"success\"} 1"
        ));
        assert!(output.contains("rulox_bridge_errors_total{code=\"DECODE_ERROR\"} 1"));
    }

    #[test]
    fn test_execution_timer() {
        let timer = ExecutionTimer::start();
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.elapsed() >= Duration::from_millis(5));
    }
}
