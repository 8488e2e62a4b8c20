//! Request metrics collector — per-backend, per-route tracking.
//!
//! Lock-free counters via atomics, with a mutex-protected sample
//! buffer for latency percentiles. Counters are cumulative (the
//! exposition format expects monotonic counters); latency percentiles
//! are computed over a bounded window of recent samples.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;

/// Bound on retained latency samples per series.
const LATENCY_WINDOW: usize = 1024;

/// Metrics for one (backend, route) series.
struct Series {
    request_count: AtomicU64,
    error_count: AtomicU64,
    /// Recent latency samples in microseconds, oldest first.
    latencies: tokio::sync::Mutex<VecDeque<u64>>,
}

impl Series {
    fn new() -> Self {
        Self {
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            latencies: tokio::sync::Mutex::new(VecDeque::new()),
        }
    }
}

/// A point-in-time reading of one series, for exposition.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSample {
    pub backend: String,
    pub route: String,
    pub requests: u64,
    pub errors: u64,
    pub latency_p50_ms: f64,
    pub latency_p99_ms: f64,
}

/// Collects request outcomes partitioned by backend address and route.
#[derive(Clone)]
pub struct RequestMetrics {
    series: Arc<RwLock<HashMap<(String, String), Arc<Series>>>>,
}

impl RequestMetrics {
    pub fn new() -> Self {
        Self {
            series: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Record one request outcome.
    pub async fn record(&self, backend: &str, route: &str, latency_us: u64, is_error: bool) {
        let key = (backend.to_string(), route.to_string());

        let series = {
            let read = self.series.read().await;
            read.get(&key).cloned()
        };
        let series = match series {
            Some(s) => s,
            None => {
                let mut write = self.series.write().await;
                write.entry(key).or_insert_with(|| Arc::new(Series::new())).clone()
            }
        };

        series.request_count.fetch_add(1, Ordering::Relaxed);
        if is_error {
            series.error_count.fetch_add(1, Ordering::Relaxed);
        }
        let mut latencies = series.latencies.lock().await;
        if latencies.len() >= LATENCY_WINDOW {
            latencies.pop_front();
        }
        latencies.push_back(latency_us);
    }

    /// Read all series for exposition, sorted by (backend, route).
    pub async fn samples(&self) -> Vec<RequestSample> {
        let series = self.series.read().await;
        let mut out = Vec::with_capacity(series.len());

        for ((backend, route), s) in series.iter() {
            let latencies = s.latencies.lock().await;
            let (p50, p99) = compute_percentiles(&latencies);
            out.push(RequestSample {
                backend: backend.clone(),
                route: route.clone(),
                requests: s.request_count.load(Ordering::Relaxed),
                errors: s.error_count.load(Ordering::Relaxed),
                latency_p50_ms: p50,
                latency_p99_ms: p99,
            });
        }

        out.sort_by(|a, b| (&a.backend, &a.route).cmp(&(&b.backend, &b.route)));
        out
    }

    /// Total request count across all series (diagnostics).
    pub async fn total_requests(&self) -> u64 {
        let series = self.series.read().await;
        series
            .values()
            .map(|s| s.request_count.load(Ordering::Relaxed))
            .sum()
    }
}

impl Default for RequestMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute P50 and P99 latency in milliseconds from samples.
///
/// Returns (0.0, 0.0) for an empty set.
fn compute_percentiles(latencies: &VecDeque<u64>) -> (f64, f64) {
    if latencies.is_empty() {
        return (0.0, 0.0);
    }

    let mut sorted: Vec<u64> = latencies.iter().copied().collect();
    sorted.sort_unstable();

    let p50_idx = (sorted.len() as f64 * 0.50) as usize;
    let p99_idx = (sorted.len() as f64 * 0.99) as usize;

    let p50 = sorted[p50_idx.min(sorted.len() - 1)] as f64 / 1000.0;
    let p99 = sorted[p99_idx.min(sorted.len() - 1)] as f64 / 1000.0;

    (p50, p99)
}
