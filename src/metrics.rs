use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

/// Keep at most this many operation records in memory.
const MAX_METRICS_RETENTION: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    IndexCreation,
    IndexDrop,
    IndexRebuild,
    DocumentWrite,
    ScalarQuery,
    VectorQuery,
}

/// One completed operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub timestamp: DateTime<Utc>,
    pub operation_type: OperationType,
    pub collection: String,
    pub duration_ms: f64,
    pub result_count: usize,
    pub error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct MetricsSummary {
    pub operation_count: usize,
    pub avg_duration_ms: f64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
    pub p50_duration_ms: f64,
    pub p95_duration_ms: f64,
    pub p99_duration_ms: f64,
    pub total_errors: usize,
    pub error_rate: f64,
}

/// Running aggregate of a named value passed to `track_metric`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct MetricValue {
    pub count: u64,
    pub last: f64,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
}

impl MetricValue {
    fn observe(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.last = value;
        self.sum += value;
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Thread-safe operation metrics collector
pub struct MetricsCollector {
    records: Mutex<VecDeque<OperationRecord>>,
    values: Mutex<BTreeMap<String, MetricValue>>,
    retention: usize,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::with_retention(MAX_METRICS_RETENTION)
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            values: Mutex::new(BTreeMap::new()),
            retention: retention.max(1),
        }
    }

    /// Record a finished operation
    pub fn record(
        &self,
        operation_type: OperationType,
        collection: &str,
        duration: Duration,
        result_count: usize,
        error: bool,
    ) {
        let record = OperationRecord {
            timestamp: Utc::now(),
            operation_type,
            collection: collection.to_string(),
            duration_ms: duration.as_secs_f64() * 1000.0,
            result_count,
            error,
        };
        let mut records = self.records.lock();
        if records.len() == self.retention {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Track a simple metric value
    pub fn track_metric(&self, name: &str, value: f64) {
        tracing::trace!("Metric {}: {}", name, value);
        self.values.lock().entry(name.to_string()).or_default().observe(value);
    }

    pub fn get_value(&self, name: &str) -> Option<MetricValue> {
        self.values.lock().get(name).cloned()
    }

    /// Every tracked value, by name.
    pub fn values(&self) -> BTreeMap<String, MetricValue> {
        self.values.lock().clone()
    }

    pub fn get_metrics(&self) -> Vec<OperationRecord> {
        self.records.lock().iter().cloned().collect()
    }

    /// Get metrics summary for a specific operation type
    pub fn get_summary(&self, operation_type: OperationType) -> MetricsSummary {
        let records = self.records.lock();
        let filtered: Vec<&OperationRecord> = records
            .iter()
            .filter(|r| r.operation_type == operation_type)
            .collect();

        if filtered.is_empty() {
            return MetricsSummary::default();
        }

        let durations: Vec<f64> = filtered.iter().map(|r| r.duration_ms).collect();
        let total_errors = filtered.iter().filter(|r| r.error).count();

        MetricsSummary {
            operation_count: filtered.len(),
            avg_duration_ms: durations.iter().sum::<f64>() / durations.len() as f64,
            min_duration_ms: durations.iter().fold(f64::INFINITY, |a, &b| a.min(b)),
            max_duration_ms: durations.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b)),
            p50_duration_ms: percentile(&durations, 50.0),
            p95_duration_ms: percentile(&durations, 95.0),
            p99_duration_ms: percentile(&durations, 99.0),
            total_errors,
            error_rate: total_errors as f64 / filtered.len() as f64,
        }
    }

    /// Summaries for every operation type seen so far.
    pub fn summaries(&self) -> BTreeMap<OperationType, MetricsSummary> {
        let seen: Vec<OperationType> = {
            let records = self.records.lock();
            let mut types: Vec<OperationType> = records.iter().map(|r| r.operation_type).collect();
            types.sort();
            types.dedup();
            types
        };
        seen.into_iter().map(|t| (t, self.get_summary(t))).collect()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
        self.values.lock().clear();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn percentile(data: &[f64], percentile: f64) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let mut sorted = data.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let index = (percentile / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[index.min(sorted.len() - 1)]
}

/// Global metrics collector instance
pub static METRICS_COLLECTOR: std::sync::OnceLock<MetricsCollector> = std::sync::OnceLock::new();

/// Get the global metrics collector
pub fn get_metrics_collector() -> &'static MetricsCollector {
    METRICS_COLLECTOR.get_or_init(MetricsCollector::new)
}

/// Guard that records how long the enclosing scope took as the value
/// `<name>_duration_ms`
#[macro_export]
macro_rules! measure_operation {
    ($operation_name:expr) => {{
        struct OperationTimer {
            start: std::time::Instant,
            name: &'static str,
        }

        impl Drop for OperationTimer {
            fn drop(&mut self) {
                let duration = self.start.elapsed().as_secs_f64() * 1000.0;
                $crate::metrics::get_metrics_collector()
                    .track_metric(&format!("{}_duration_ms", self.name), duration);
            }
        }

        OperationTimer {
            start: std::time::Instant::now(),
            name: $operation_name,
        }
    }};
}
