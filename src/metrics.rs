//! Metrics collection for both operating modes.
//!
//! A pluggable [`MetricsBackend`] receives counters, gauges and histogram
//! observations. [`LocalMetrics`] keeps everything in memory and is what the
//! binary and the tests use; [`PipelineMetrics`] names the traffic-specific
//! measurements on top of any backend.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A pluggable metrics backend.
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    /// Increment a counter metric by the given value
    async fn increment_counter(&self, name: &str, value: u64);

    /// Set a gauge metric to the given value
    async fn set_gauge(&self, name: &str, value: f64);

    /// Record a histogram observation
    async fn record_histogram(&self, name: &str, value: f64);

    async fn get_counter(&self, name: &str) -> Option<u64>;

    async fn get_gauge(&self, name: &str) -> Option<f64>;

    async fn get_histogram_stats(&self, name: &str) -> Option<HistogramStats>;

    /// Reset all metrics
    async fn reset(&self);

    /// Export all metrics as a snapshot
    async fn snapshot(&self) -> MetricsSnapshot;
}

/// Summary statistics for a histogram metric
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramStats {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl Default for HistogramStats {
    fn default() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::MAX,
            max: f64::MIN,
            mean: 0.0,
        }
    }
}

impl HistogramStats {
    fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.mean = self.sum / self.count as f64;
    }
}

/// Snapshot of all metrics at a point in time
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, f64>,
    pub histograms: HashMap<String, HistogramStats>,
}

/// Local in-memory metrics implementation.
pub struct LocalMetrics {
    counters: RwLock<HashMap<String, u64>>,
    gauges: RwLock<HashMap<String, f64>>,
    histograms: RwLock<HashMap<String, HistogramStats>>,
}

impl LocalMetrics {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for LocalMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricsBackend for LocalMetrics {
    async fn increment_counter(&self, name: &str, value: u64) {
        let mut counters = self.counters.write().await;
        *counters.entry(name.to_string()).or_insert(0) += value;
    }

    async fn set_gauge(&self, name: &str, value: f64) {
        let mut gauges = self.gauges.write().await;
        gauges.insert(name.to_string(), value);
    }

    async fn record_histogram(&self, name: &str, value: f64) {
        let mut histograms = self.histograms.write().await;
        histograms
            .entry(name.to_string())
            .or_default()
            .record(value);
    }

    async fn get_counter(&self, name: &str) -> Option<u64> {
        self.counters.read().await.get(name).copied()
    }

    async fn get_gauge(&self, name: &str) -> Option<f64> {
        self.gauges.read().await.get(name).copied()
    }

    async fn get_histogram_stats(&self, name: &str) -> Option<HistogramStats> {
        self.histograms.read().await.get(name).cloned()
    }

    async fn reset(&self) {
        self.counters.write().await.clear();
        self.gauges.write().await.clear();
        self.histograms.write().await.clear();
    }

    async fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.read().await.clone(),
            gauges: self.gauges.read().await.clone(),
            histograms: self.histograms.read().await.clone(),
        }
    }
}

/// Predefined metric names
pub mod metric_names {
    /// Counter: events pushed into the streaming queue
    pub const EVENTS_INGESTED: &str = "traffic.events.ingested";
    /// Counter: malformed records skipped
    pub const EVENTS_SKIPPED: &str = "traffic.events.skipped";
    /// Counter: events folded into the streaming table
    pub const EVENTS_AGGREGATED: &str = "traffic.events.aggregated";
    /// Counter: records without a valid hour, dropped before dispatch
    pub const RECORDS_DROPPED: &str = "traffic.records.dropped";
    /// Counter: hour buckets sent to workers
    pub const BUCKETS_DISPATCHED: &str = "traffic.buckets.dispatched";
    /// Counter: reports received from workers
    pub const REPORTS_RECEIVED: &str = "traffic.reports.received";

    /// Gauge: most items ever buffered in the streaming queue
    pub const QUEUE_PEAK_DEPTH: &str = "traffic.queue.peak_depth";

    /// Histogram: records per dispatched bucket
    pub const BUCKET_RECORDS: &str = "traffic.bucket.records";
}

/// Traffic metrics collector wrapping a metrics backend
#[derive(Clone)]
pub struct PipelineMetrics {
    backend: Arc<dyn MetricsBackend>,
}

impl PipelineMetrics {
    pub fn new(backend: Arc<dyn MetricsBackend>) -> Self {
        Self { backend }
    }

    /// Metrics collector with a local in-memory backend
    pub fn local() -> Self {
        Self::new(Arc::new(LocalMetrics::new()))
    }

    pub fn backend(&self) -> &Arc<dyn MetricsBackend> {
        &self.backend
    }

    pub async fn record_ingested(&self, count: u64) {
        self.backend
            .increment_counter(metric_names::EVENTS_INGESTED, count)
            .await;
    }

    pub async fn record_skipped(&self, count: u64) {
        self.backend
            .increment_counter(metric_names::EVENTS_SKIPPED, count)
            .await;
    }

    pub async fn record_aggregated(&self, count: u64) {
        self.backend
            .increment_counter(metric_names::EVENTS_AGGREGATED, count)
            .await;
    }

    pub async fn set_queue_peak_depth(&self, depth: usize) {
        self.backend
            .set_gauge(metric_names::QUEUE_PEAK_DEPTH, depth as f64)
            .await;
    }

    pub async fn record_dropped(&self, count: u64) {
        self.backend
            .increment_counter(metric_names::RECORDS_DROPPED, count)
            .await;
    }

    /// Record one bucket sent to `target`
    pub async fn record_bucket_dispatched(&self, target: usize, records: usize) {
        self.backend
            .increment_counter(metric_names::BUCKETS_DISPATCHED, 1)
            .await;
        self.backend
            .increment_counter(
                &format!("{}.worker{}", metric_names::BUCKETS_DISPATCHED, target),
                1,
            )
            .await;
        self.backend
            .record_histogram(metric_names::BUCKET_RECORDS, records as f64)
            .await;
    }

    /// Record one report received from `worker`
    pub async fn record_report(&self, worker: usize) {
        self.backend
            .increment_counter(metric_names::REPORTS_RECEIVED, 1)
            .await;
        self.backend
            .increment_counter(
                &format!("{}.worker{}", metric_names::REPORTS_RECEIVED, worker),
                1,
            )
            .await;
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        self.backend.snapshot().await
    }

    pub async fn reset(&self) {
        self.backend.reset().await;
    }
}
