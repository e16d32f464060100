//! In-memory operation metrics (spec.md 4.9 / SPEC_FULL.md 4.9).
//!
//! Records are append-only and kept only for the life of the process: there
//! is no export path and no persistence. `snapshot()` is the only read API.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct OperationRecord {
    pub category: String,
    pub op: String,
    pub upstream: Option<String>,
    pub success: bool,
    pub cache_hit: bool,
    pub duration: Duration,
    pub estimated_tokens: u64,
    pub recorded_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_operations: u64,
    pub successes: u64,
    pub failures: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub estimated_tokens_total: u64,
    pub average_duration_ms: f64,
    pub by_category: Vec<CategoryCount>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryCount {
    pub category: String,
    pub count: u64,
}

/// Estimate token cost of a JSON value as `ceil(serializedLength / 4)`
/// (spec.md 4.9): a coarse but dependency-free proxy, good enough for
/// relative comparison across operations.
pub fn estimate_tokens(value: &Value) -> u64 {
    let serialized = serde_json::to_string(value).unwrap_or_default();
    let len = serialized.len() as u64;
    len.div_ceil(4)
}

pub struct MetricsRecorder {
    enabled: bool,
    records: Mutex<Vec<OperationRecord>>,
}

impl MetricsRecorder {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn record(&self, record: OperationRecord) {
        if !self.enabled {
            return;
        }
        self.records
            .lock()
            .expect("metrics mutex poisoned")
            .push(record);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let records = self.records.lock().expect("metrics mutex poisoned");

        let total_operations = records.len() as u64;
        let successes = records.iter().filter(|r| r.success).count() as u64;
        let failures = total_operations - successes;
        let cache_hits = records.iter().filter(|r| r.cache_hit).count() as u64;
        let cache_misses = total_operations - cache_hits;
        let estimated_tokens_total = records.iter().map(|r| r.estimated_tokens).sum();

        let average_duration_ms = if total_operations == 0 {
            0.0
        } else {
            let total_ms: f64 = records.iter().map(|r| r.duration.as_secs_f64() * 1000.0).sum();
            total_ms / total_operations as f64
        };

        let mut by_category: Vec<CategoryCount> = Vec::new();
        for record in records.iter() {
            if let Some(entry) = by_category.iter_mut().find(|c| c.category == record.category) {
                entry.count += 1;
            } else {
                by_category.push(CategoryCount {
                    category: record.category.clone(),
                    count: 1,
                });
            }
        }
        by_category.sort_by(|a, b| a.category.cmp(&b.category));

        MetricsSnapshot {
            total_operations,
            successes,
            failures,
            cache_hits,
            cache_misses,
            estimated_tokens_total,
            average_duration_ms,
            by_category,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(category: &str, success: bool, cache_hit: bool) -> OperationRecord {
        OperationRecord {
            category: category.into(),
            op: "op".into(),
            upstream: Some("serena".into()),
            success,
            cache_hit,
            duration: Duration::from_millis(10),
            estimated_tokens: 5,
            recorded_at: Instant::now(),
        }
    }

    #[test]
    fn disabled_recorder_drops_records() {
        let recorder = MetricsRecorder::new(false);
        recorder.record(record("code_operations", true, false));
        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.total_operations, 0);
    }

    #[test]
    fn snapshot_aggregates_success_and_cache_counts() {
        let recorder = MetricsRecorder::new(true);
        recorder.record(record("code_operations", true, true));
        recorder.record(record("code_operations", false, false));
        recorder.record(record("web_research", true, false));

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.total_operations, 3);
        assert_eq!(snapshot.successes, 2);
        assert_eq!(snapshot.failures, 1);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.cache_misses, 2);
        assert_eq!(snapshot.estimated_tokens_total, 15);

        let code_ops = snapshot
            .by_category
            .iter()
            .find(|c| c.category == "code_operations")
            .unwrap();
        assert_eq!(code_ops.count, 2);
    }

    #[test]
    fn token_estimate_rounds_up() {
        let value = serde_json::json!("abc");
        assert_eq!(estimate_tokens(&value), 2);
    }
}
