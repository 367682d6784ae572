use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::types::BatchRunStats;

/// Process-wide metrics collector.
///
/// Cheap to clone; the model client, the conversion cache and the
/// orchestrator all record into the same instance.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Model API
    model_calls_total: AtomicUsize,
    model_calls_success: AtomicUsize,
    model_calls_failed: AtomicUsize,
    model_tokens_input: AtomicU64,
    model_tokens_output: AtomicU64,
    model_latency_ms: RwLock<Vec<u64>>,
    calls_per_model: DashMap<String, AtomicUsize>,

    // Conversion cache
    cache_hits: AtomicUsize,
    cache_misses: AtomicUsize,
    cache_waits: AtomicUsize,
    cache_wait_timeouts: AtomicUsize,
    conversions_ready: AtomicUsize,
    conversions_failed: AtomicUsize,

    // Runs
    runs_completed: AtomicUsize,
    posts_processed: AtomicUsize,
    posts_downgraded: AtomicUsize,
    run_duration_ms: RwLock<Vec<u64>>,

    circuit_breaker_trips: AtomicUsize,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                model_calls_total: AtomicUsize::new(0),
                model_calls_success: AtomicUsize::new(0),
                model_calls_failed: AtomicUsize::new(0),
                model_tokens_input: AtomicU64::new(0),
                model_tokens_output: AtomicU64::new(0),
                model_latency_ms: RwLock::new(Vec::new()),
                calls_per_model: DashMap::new(),
                cache_hits: AtomicUsize::new(0),
                cache_misses: AtomicUsize::new(0),
                cache_waits: AtomicUsize::new(0),
                cache_wait_timeouts: AtomicUsize::new(0),
                conversions_ready: AtomicUsize::new(0),
                conversions_failed: AtomicUsize::new(0),
                runs_completed: AtomicUsize::new(0),
                posts_processed: AtomicUsize::new(0),
                posts_downgraded: AtomicUsize::new(0),
                run_duration_ms: RwLock::new(Vec::new()),
                circuit_breaker_trips: AtomicUsize::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    pub fn record_model_call(
        &self,
        model: &str,
        success: bool,
        duration: Duration,
        input_tokens: u64,
        output_tokens: u64,
    ) {
        self.inner.model_calls_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.inner.model_calls_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.model_calls_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.model_tokens_input.fetch_add(input_tokens, Ordering::Relaxed);
        self.inner.model_tokens_output.fetch_add(output_tokens, Ordering::Relaxed);
        self.inner.model_latency_ms.write().push(duration.as_millis() as u64);
        self.inner
            .calls_per_model
            .entry(model.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.inner.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_wait(&self) {
        self.inner.cache_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_wait_timeout(&self) {
        self.inner.cache_wait_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conversion(&self, ok: bool) {
        if ok {
            self.inner.conversions_ready.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.conversions_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_circuit_breaker_trip(&self) {
        self.inner.circuit_breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_run(&self, stats: &BatchRunStats) {
        self.inner.runs_completed.fetch_add(1, Ordering::Relaxed);
        self.inner.posts_processed.fetch_add(stats.total, Ordering::Relaxed);
        self.inner.posts_downgraded.fetch_add(stats.downgraded, Ordering::Relaxed);
        self.inner.run_duration_ms.write().push(stats.elapsed_ms);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let latency = self.inner.model_latency_ms.read();
        let latency_avg = avg(&latency);
        let latency_p50 = percentile(&latency, 0.5);
        let latency_p95 = percentile(&latency, 0.95);
        let latency_p99 = percentile(&latency, 0.99);
        drop(latency);

        let run_avg = avg(&self.inner.run_duration_ms.read());

        let cache_hits = self.inner.cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.inner.cache_misses.load(Ordering::Relaxed);
        let cache_total = cache_hits + cache_misses;
        let cache_hit_rate = if cache_total > 0 {
            cache_hits as f64 / cache_total as f64
        } else {
            0.0
        };

        let calls_per_model = self
            .inner
            .calls_per_model
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();

        MetricsSnapshot {
            model_calls_total: self.inner.model_calls_total.load(Ordering::Relaxed),
            model_calls_success: self.inner.model_calls_success.load(Ordering::Relaxed),
            model_calls_failed: self.inner.model_calls_failed.load(Ordering::Relaxed),
            model_tokens_input: self.inner.model_tokens_input.load(Ordering::Relaxed),
            model_tokens_output: self.inner.model_tokens_output.load(Ordering::Relaxed),
            model_latency_avg_ms: latency_avg,
            model_latency_p50_ms: latency_p50,
            model_latency_p95_ms: latency_p95,
            model_latency_p99_ms: latency_p99,
            calls_per_model,
            cache_hits,
            cache_misses,
            cache_hit_rate,
            cache_waits: self.inner.cache_waits.load(Ordering::Relaxed),
            cache_wait_timeouts: self.inner.cache_wait_timeouts.load(Ordering::Relaxed),
            conversions_ready: self.inner.conversions_ready.load(Ordering::Relaxed),
            conversions_failed: self.inner.conversions_failed.load(Ordering::Relaxed),
            runs_completed: self.inner.runs_completed.load(Ordering::Relaxed),
            posts_processed: self.inner.posts_processed.load(Ordering::Relaxed),
            posts_downgraded: self.inner.posts_downgraded.load(Ordering::Relaxed),
            run_avg_ms: run_avg,
            circuit_breaker_trips: self.inner.circuit_breaker_trips.load(Ordering::Relaxed),
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }

    /// Prometheus text exposition
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();

        let mut metric = |name: &str, kind: &str, help: &str, value: String| {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {value}\n\n"
            ));
        };

        metric("model_calls_total", "counter", "Model API calls made", s.model_calls_total.to_string());
        metric("model_calls_success", "counter", "Successful model API calls", s.model_calls_success.to_string());
        metric("model_calls_failed", "counter", "Failed model API calls", s.model_calls_failed.to_string());
        metric("model_tokens_input_total", "counter", "Prompt tokens consumed", s.model_tokens_input.to_string());
        metric("model_tokens_output_total", "counter", "Completion tokens generated", s.model_tokens_output.to_string());
        metric("model_latency_avg_ms", "gauge", "Average model latency in milliseconds", s.model_latency_avg_ms.to_string());
        metric("image_cache_hit_rate", "gauge", "Conversion cache hit rate (0.0 to 1.0)", s.cache_hit_rate.to_string());
        metric("image_cache_wait_timeouts_total", "counter", "Waits that gave up on an in-flight conversion", s.cache_wait_timeouts.to_string());
        metric("image_conversions_ready_total", "counter", "Successful image conversions", s.conversions_ready.to_string());
        metric("image_conversions_failed_total", "counter", "Failed image conversions", s.conversions_failed.to_string());
        metric("enrichment_runs_total", "counter", "Completed enrichment runs", s.runs_completed.to_string());
        metric("posts_processed_total", "counter", "Posts that received an outcome", s.posts_processed.to_string());
        metric("posts_downgraded_total", "counter", "Posts interpreted from text only after losing image context", s.posts_downgraded.to_string());
        metric("circuit_breaker_trips_total", "counter", "Model circuit breaker trips", s.circuit_breaker_trips.to_string());
        metric("uptime_seconds", "counter", "Process uptime in seconds", s.uptime_seconds.to_string());

        for (model, calls) in &s.calls_per_model {
            out.push_str(&format!("model_calls_by_model{{model=\"{}\"}} {}\n", model, calls));
        }

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub model_calls_total: usize,
    pub model_calls_success: usize,
    pub model_calls_failed: usize,
    pub model_tokens_input: u64,
    pub model_tokens_output: u64,
    pub model_latency_avg_ms: u64,
    pub model_latency_p50_ms: u64,
    pub model_latency_p95_ms: u64,
    pub model_latency_p99_ms: u64,
    pub calls_per_model: BTreeMap<String, usize>,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub cache_hit_rate: f64,
    pub cache_waits: usize,
    pub cache_wait_timeouts: usize,
    pub conversions_ready: usize,
    pub conversions_failed: usize,
    pub runs_completed: usize,
    pub posts_processed: usize,
    pub posts_downgraded: usize,
    pub run_avg_ms: u64,
    pub circuit_breaker_trips: usize,
    pub uptime_seconds: u64,
}

fn percentile(values: &[u64], p: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let idx = ((values.len() as f64 - 1.0) * p) as usize;
    sorted[idx]
}

fn avg(values: &[u64]) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.iter().sum::<u64>() / values.len() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = Metrics::new();

        metrics.record_model_call("vlm", true, Duration::from_millis(100), 500, 200);
        metrics.record_model_call("llm", false, Duration::from_millis(50), 0, 0);
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        metrics.record_conversion(true);
        metrics.record_conversion(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.model_calls_total, 2);
        assert_eq!(snapshot.model_calls_success, 1);
        assert_eq!(snapshot.model_calls_failed, 1);
        assert_eq!(snapshot.model_tokens_input, 500);
        assert_eq!(snapshot.cache_hit_rate, 0.5);
        assert_eq!(snapshot.conversions_ready, 1);
        assert_eq!(snapshot.conversions_failed, 1);
        assert_eq!(snapshot.calls_per_model.get("vlm"), Some(&1));
    }

    #[test]
    fn test_record_run_accumulates() {
        let metrics = Metrics::new();
        let stats = BatchRunStats {
            total: 4,
            downgraded: 1,
            elapsed_ms: 1200,
            ..Default::default()
        };
        metrics.record_run(&stats);
        metrics.record_run(&stats);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.runs_completed, 2);
        assert_eq!(snapshot.posts_processed, 8);
        assert_eq!(snapshot.posts_downgraded, 2);
        assert_eq!(snapshot.run_avg_ms, 1200);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.record_model_call("gpt-4.1", true, Duration::from_millis(100), 500, 200);

        let prometheus = metrics.to_prometheus();
        assert!(prometheus.contains("model_calls_total 1"));
        assert!(prometheus.contains("model_tokens_input_total 500"));
        assert!(prometheus.contains("model_calls_by_model{model=\"gpt-4.1\"} 1"));
    }
}
