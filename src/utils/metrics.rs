use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Most recent samples kept per duration series
const SAMPLE_WINDOW: usize = 1024;

/// Process-wide metrics collector.
///
/// Tracks generation calls and retries, compositor outcomes, batch
/// throughput, uploads and lookup misses. Cheap to clone; every clone
/// shares the same counters.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Generation
    generation_calls_total: AtomicUsize,
    generation_calls_failed: AtomicUsize,
    generation_retries: AtomicUsize,
    generation_latency_ms: RwLock<VecDeque<u64>>,

    // Compositor
    composites_ok: AtomicUsize,
    composites_failed: AtomicUsize,
    previews_ok: AtomicUsize,
    previews_failed: AtomicUsize,

    // Batches
    batches_completed: AtomicUsize,
    batches_aborted: AtomicUsize,
    items_processed: AtomicUsize,
    batch_duration_ms: RwLock<VecDeque<u64>>,

    uploads_ok: AtomicUsize,
    uploads_failed: AtomicUsize,
    lookup_misses: AtomicUsize,

    // Per-endpoint request counters
    endpoint_counters: DashMap<String, AtomicUsize>,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                generation_calls_total: AtomicUsize::new(0),
                generation_calls_failed: AtomicUsize::new(0),
                generation_retries: AtomicUsize::new(0),
                generation_latency_ms: RwLock::new(VecDeque::with_capacity(SAMPLE_WINDOW)),
                composites_ok: AtomicUsize::new(0),
                composites_failed: AtomicUsize::new(0),
                previews_ok: AtomicUsize::new(0),
                previews_failed: AtomicUsize::new(0),
                batches_completed: AtomicUsize::new(0),
                batches_aborted: AtomicUsize::new(0),
                items_processed: AtomicUsize::new(0),
                batch_duration_ms: RwLock::new(VecDeque::with_capacity(SAMPLE_WINDOW)),
                uploads_ok: AtomicUsize::new(0),
                uploads_failed: AtomicUsize::new(0),
                lookup_misses: AtomicUsize::new(0),
                endpoint_counters: DashMap::new(),
                start_time: Instant::now(),
            }),
        }
    }

    // Generation
    pub fn record_generation(&self, success: bool, duration: Duration) {
        self.inner.generation_calls_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.inner.generation_calls_failed.fetch_add(1, Ordering::Relaxed);
        }
        push_sample(&self.inner.generation_latency_ms, duration);
    }

    pub fn record_generation_retry(&self) {
        self.inner.generation_retries.fetch_add(1, Ordering::Relaxed);
    }

    // Compositor
    pub fn record_composite(&self, success: bool) {
        let counter = if success {
            &self.inner.composites_ok
        } else {
            &self.inner.composites_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_preview(&self, success: bool) {
        let counter = if success {
            &self.inner.previews_ok
        } else {
            &self.inner.previews_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    // Batches
    pub fn record_batch(&self, completed: bool, items: usize, duration: Duration) {
        if completed {
            self.inner.batches_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.batches_aborted.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.items_processed.fetch_add(items, Ordering::Relaxed);
        push_sample(&self.inner.batch_duration_ms, duration);
    }

    pub fn record_upload(&self, success: bool) {
        let counter = if success {
            &self.inner.uploads_ok
        } else {
            &self.inner.uploads_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lookup_miss(&self) {
        self.inner.lookup_misses.fetch_add(1, Ordering::Relaxed);
    }

    // Endpoint Metrics
    pub fn record_endpoint_request(&self, endpoint: &str) {
        self.inner
            .endpoint_counters
            .entry(endpoint.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn endpoint_requests(&self, endpoint: &str) -> usize {
        self.inner
            .endpoint_counters
            .get(endpoint)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // Get snapshot for reporting
    pub fn snapshot(&self) -> MetricsSnapshot {
        let latency = self.inner.generation_latency_ms.read();
        let generation_latency_avg_ms = avg(&latency);
        let generation_latency_p95_ms = percentile(&latency, 0.95);
        drop(latency);

        let batch_durations = self.inner.batch_duration_ms.read();
        let batch_duration_avg_ms = avg(&batch_durations);
        drop(batch_durations);

        MetricsSnapshot {
            generation_calls_total: self.inner.generation_calls_total.load(Ordering::Relaxed),
            generation_calls_failed: self.inner.generation_calls_failed.load(Ordering::Relaxed),
            generation_retries: self.inner.generation_retries.load(Ordering::Relaxed),
            generation_latency_avg_ms,
            generation_latency_p95_ms,
            composites_ok: self.inner.composites_ok.load(Ordering::Relaxed),
            composites_failed: self.inner.composites_failed.load(Ordering::Relaxed),
            previews_ok: self.inner.previews_ok.load(Ordering::Relaxed),
            previews_failed: self.inner.previews_failed.load(Ordering::Relaxed),
            batches_completed: self.inner.batches_completed.load(Ordering::Relaxed),
            batches_aborted: self.inner.batches_aborted.load(Ordering::Relaxed),
            items_processed: self.inner.items_processed.load(Ordering::Relaxed),
            batch_duration_avg_ms,
            uploads_ok: self.inner.uploads_ok.load(Ordering::Relaxed),
            uploads_failed: self.inner.uploads_failed.load(Ordering::Relaxed),
            lookup_misses: self.inner.lookup_misses.load(Ordering::Relaxed),
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }

    /// Generate Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = format!(
            r#"# HELP generation_calls_total Total image generation calls
# TYPE generation_calls_total counter
generation_calls_total {{}} {}

# HELP generation_calls_failed Failed image generation calls
# TYPE generation_calls_failed counter
generation_calls_failed {{}} {}

# HELP generation_retries_total Regenerations charged to retry budgets
# TYPE generation_retries_total counter
generation_retries_total {{}} {}

# HELP generation_latency_avg_ms Average generation latency in milliseconds
# TYPE generation_latency_avg_ms gauge
generation_latency_avg_ms {{}} {}

# HELP composites_total Keyed composites by outcome
# TYPE composites_total counter
composites_total {{result="ok"}} {}
composites_total {{result="error"}} {}

# HELP previews_total Pattern previews by outcome
# TYPE previews_total counter
previews_total {{result="ok"}} {}
previews_total {{result="none"}} {}

# HELP batches_total Bulk batches by outcome
# TYPE batches_total counter
batches_total {{result="completed"}} {}
batches_total {{result="aborted"}} {}

# HELP items_processed_total Line items submitted in bulk batches
# TYPE items_processed_total counter
items_processed_total {{}} {}

# HELP uploads_total Background uploads by outcome
# TYPE uploads_total counter
uploads_total {{result="ok"}} {}
uploads_total {{result="error"}} {}

# HELP lookup_misses_total Organization/product/color lookups that missed
# TYPE lookup_misses_total counter
lookup_misses_total {{}} {}

# HELP uptime_seconds Application uptime in seconds
# TYPE uptime_seconds counter
uptime_seconds {{}} {}
"#,
            snapshot.generation_calls_total,
            snapshot.generation_calls_failed,
            snapshot.generation_retries,
            snapshot.generation_latency_avg_ms,
            snapshot.composites_ok,
            snapshot.composites_failed,
            snapshot.previews_ok,
            snapshot.previews_failed,
            snapshot.batches_completed,
            snapshot.batches_aborted,
            snapshot.items_processed,
            snapshot.uploads_ok,
            snapshot.uploads_failed,
            snapshot.lookup_misses,
            snapshot.uptime_seconds,
        );

        let mut endpoints: Vec<(String, usize)> = self
            .inner
            .endpoint_counters
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        if !endpoints.is_empty() {
            endpoints.sort();
            out.push_str("\n# HELP http_requests_total Requests per endpoint\n");
            out.push_str("# TYPE http_requests_total counter\n");
            for (endpoint, count) in endpoints {
                out.push_str(&format!(
                    "http_requests_total {{endpoint=\"{}\"}} {}\n",
                    endpoint, count
                ));
            }
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
    pub generation_calls_total: usize,
    pub generation_calls_failed: usize,
    pub generation_retries: usize,
    pub generation_latency_avg_ms: u64,
    pub generation_latency_p95_ms: u64,
    pub composites_ok: usize,
    pub composites_failed: usize,
    pub previews_ok: usize,
    pub previews_failed: usize,
    pub batches_completed: usize,
    pub batches_aborted: usize,
    pub items_processed: usize,
    pub batch_duration_avg_ms: u64,
    pub uploads_ok: usize,
    pub uploads_failed: usize,
    pub lookup_misses: usize,
    pub uptime_seconds: u64,
}

fn push_sample(series: &RwLock<VecDeque<u64>>, duration: Duration) {
    let mut samples = series.write();
    if samples.len() == SAMPLE_WINDOW {
        samples.pop_front();
    }
    samples.push_back(duration.as_millis() as u64);
}

fn percentile(values: &VecDeque<u64>, p: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted: Vec<u64> = values.iter().copied().collect();
    sorted.sort_unstable();
    let idx = ((values.len() as f64 - 1.0) * p) as usize;
    sorted[idx]
}

fn avg(values: &VecDeque<u64>) -> u64 {
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

        metrics.record_generation(true, Duration::from_millis(100));
        metrics.record_generation(false, Duration::from_millis(300));
        metrics.record_generation_retry();
        metrics.record_composite(true);
        metrics.record_preview(false);
        metrics.record_batch(true, 10, Duration::from_secs(2));
        metrics.record_lookup_miss();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.generation_calls_total, 2);
        assert_eq!(snapshot.generation_calls_failed, 1);
        assert_eq!(snapshot.generation_retries, 1);
        assert_eq!(snapshot.generation_latency_avg_ms, 200);
        assert_eq!(snapshot.composites_ok, 1);
        assert_eq!(snapshot.previews_failed, 1);
        assert_eq!(snapshot.batches_completed, 1);
        assert_eq!(snapshot.items_processed, 10);
        assert_eq!(snapshot.lookup_misses, 1);
    }

    #[test]
    fn test_duration_series_keep_latest_window() {
        let metrics = Metrics::new();
        for _ in 0..SAMPLE_WINDOW {
            metrics.record_generation(true, Duration::from_millis(1000));
        }
        for _ in 0..SAMPLE_WINDOW {
            metrics.record_generation(true, Duration::from_millis(10));
        }

        assert_eq!(metrics.inner.generation_latency_ms.read().len(), SAMPLE_WINDOW);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.generation_calls_total, 2 * SAMPLE_WINDOW);
        assert_eq!(snapshot.generation_latency_avg_ms, 10);
        assert_eq!(snapshot.generation_latency_p95_ms, 10);
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = Metrics::new();
        let other = metrics.clone();
        other.record_upload(true);
        other.record_upload(false);
        assert_eq!(metrics.snapshot().uploads_ok, 1);
        assert_eq!(metrics.snapshot().uploads_failed, 1);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.record_generation(true, Duration::from_millis(100));
        metrics.record_batch(false, 4, Duration::from_millis(10));
        metrics.record_endpoint_request("/bulk-order");

        let prometheus = metrics.to_prometheus();
        assert!(prometheus.contains("generation_calls_total {} 1"));
        assert!(prometheus.contains("batches_total {result=\"aborted\"} 1"));
        assert!(prometheus.contains("http_requests_total {endpoint=\"/bulk-order\"} 1"));
        assert_eq!(metrics.endpoint_requests("/bulk-order"), 1);
    }
}
