// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide registry of named counters, meters, histograms and data
//! lists, rendered as a JSON snapshot on demand.
//!
//! Registration takes the registry write lock; individual updates go through
//! per-metric atomics (or a short per-metric mutex for reservoir inserts) so
//! the hot path never contends on the registry itself.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use rand::Rng;
use serde::Serialize;
use serde_json::json;

/// EWMA tick interval. Rates are folded in every five seconds of wall
/// clock, applied lazily from whichever thread touches the meter next.
const TICK_MICROS: u64 = 5_000_000;
const TICK_SECONDS: f64 = 5.0;

/// Default reservoir capacity for histograms.
pub const DEFAULT_RESERVOIR_CAPACITY: usize = 32_768;

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("metric '{name}' already registered as a {existing}, requested {requested}")]
    KindMismatch {
        name: String,
        existing: &'static str,
        requested: &'static str,
    },
}

/// Monotonic 64-bit counter.
pub struct Counter {
    name: String,
    value: AtomicU64,
}

impl Counter {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            value: AtomicU64::new(0),
        }
    }

    pub fn increment(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    fn clear(&self) {
        self.value.store(0, Ordering::Relaxed);
    }

    fn report(&self) -> serde_json::Value {
        json!({ "name": self.name, "count": self.value() })
    }
}

/// One exponentially-weighted moving average, codahale style.
struct Ewma {
    alpha: f64,
    rate_bits: AtomicU64,
    initialized: AtomicU64,
}

impl Ewma {
    fn for_minutes(minutes: f64) -> Self {
        Self {
            alpha: 1.0 - (-TICK_SECONDS / (minutes * 60.0)).exp(),
            rate_bits: AtomicU64::new(0f64.to_bits()),
            initialized: AtomicU64::new(0),
        }
    }

    fn tick(&self, instant_rate: f64) {
        if self.initialized.swap(1, Ordering::Relaxed) == 0 {
            self.rate_bits.store(instant_rate.to_bits(), Ordering::Relaxed);
        } else {
            let rate = f64::from_bits(self.rate_bits.load(Ordering::Relaxed));
            let next = rate + self.alpha * (instant_rate - rate);
            self.rate_bits.store(next.to_bits(), Ordering::Relaxed);
        }
    }

    fn rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Relaxed))
    }

    fn clear(&self) {
        self.rate_bits.store(0f64.to_bits(), Ordering::Relaxed);
        self.initialized.store(0, Ordering::Relaxed);
    }
}

/// Event meter exposing total count, mean rate and rolling 1/5/15-minute
/// rates in events per second.
pub struct Meter {
    name: String,
    created: Instant,
    count: AtomicU64,
    uncounted: AtomicU64,
    /// Micros since `created` at which counting (re)started.
    start_micros: AtomicU64,
    /// Micros since `created` of the last applied tick.
    last_tick_micros: AtomicU64,
    m1: Ewma,
    m5: Ewma,
    m15: Ewma,
}

impl Meter {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            created: Instant::now(),
            count: AtomicU64::new(0),
            uncounted: AtomicU64::new(0),
            start_micros: AtomicU64::new(0),
            last_tick_micros: AtomicU64::new(0),
            m1: Ewma::for_minutes(1.0),
            m5: Ewma::for_minutes(5.0),
            m15: Ewma::for_minutes(15.0),
        }
    }

    pub fn mark(&self, n: u64) {
        self.count.fetch_add(n, Ordering::Relaxed);
        self.uncounted.fetch_add(n, Ordering::Relaxed);
        self.tick_if_needed();
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn one_minute_rate(&self) -> f64 {
        self.tick_if_needed();
        self.m1.rate()
    }

    pub fn five_minute_rate(&self) -> f64 {
        self.tick_if_needed();
        self.m5.rate()
    }

    pub fn fifteen_minute_rate(&self) -> f64 {
        self.tick_if_needed();
        self.m15.rate()
    }

    pub fn mean_rate(&self) -> f64 {
        let elapsed = self.elapsed_micros();
        let start = self.start_micros.load(Ordering::Relaxed);
        let secs = (elapsed.saturating_sub(start)) as f64 / 1e6;
        if secs <= 0.0 {
            0.0
        } else {
            self.count() as f64 / secs
        }
    }

    fn elapsed_micros(&self) -> u64 {
        self.created.elapsed().as_micros() as u64
    }

    /// Applies any pending 5-second ticks. One thread wins the CAS and folds
    /// the uncounted events into the first interval; later intervals decay
    /// toward zero.
    fn tick_if_needed(&self) {
        let elapsed = self.elapsed_micros();
        let last = self.last_tick_micros.load(Ordering::Relaxed);
        let due = (elapsed.saturating_sub(last)) / TICK_MICROS;
        if due == 0 {
            return;
        }
        let next = last + due * TICK_MICROS;
        if self
            .last_tick_micros
            .compare_exchange(last, next, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let pending = self.uncounted.swap(0, Ordering::Relaxed);
        let instant_rate = pending as f64 / TICK_SECONDS;
        self.m1.tick(instant_rate);
        self.m5.tick(instant_rate);
        self.m15.tick(instant_rate);
        for _ in 1..due {
            self.m1.tick(0.0);
            self.m5.tick(0.0);
            self.m15.tick(0.0);
        }
    }

    fn clear(&self) {
        let elapsed = self.elapsed_micros();
        self.count.store(0, Ordering::Relaxed);
        self.uncounted.store(0, Ordering::Relaxed);
        self.start_micros.store(elapsed, Ordering::Relaxed);
        self.last_tick_micros.store(elapsed, Ordering::Relaxed);
        self.m1.clear();
        self.m5.clear();
        self.m15.clear();
    }

    fn report(&self) -> serde_json::Value {
        json!({
            "name": self.name,
            "unit": "events per second",
            "count": self.count(),
            "rate": self.mean_rate(),
            "one_min_rate": self.one_minute_rate(),
            "five_min_rate": self.five_minute_rate(),
            "fifteen_min_rate": self.fifteen_minute_rate(),
        })
    }
}

struct Reservoir {
    samples: Vec<i64>,
    count: u64,
}

/// Histogram backed by uniform reservoir sampling (algorithm R).
pub struct Histogram {
    name: String,
    capacity: usize,
    reservoir: Mutex<Reservoir>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HistogramStats {
    pub size: u64,
    pub min: i64,
    pub max: i64,
    pub mean: f64,
    pub std_dev: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub p999: f64,
}

impl Histogram {
    fn new(name: &str, capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            capacity,
            reservoir: Mutex::new(Reservoir {
                samples: Vec::with_capacity(capacity.min(1024)),
                count: 0,
            }),
        }
    }

    pub fn insert(&self, value: i64) {
        let mut r = self.reservoir.lock().unwrap();
        r.count += 1;
        if r.samples.len() < self.capacity {
            r.samples.push(value);
        } else {
            let count = r.count;
            let idx = rand::rng().random_range(0..count);
            if (idx as usize) < self.capacity {
                r.samples[idx as usize] = value;
            }
        }
    }

    pub fn stats(&self) -> HistogramStats {
        let r = self.reservoir.lock().unwrap();
        if r.samples.is_empty() {
            return HistogramStats::default();
        }
        let mut sorted = r.samples.clone();
        sorted.sort_unstable();
        let n = sorted.len() as f64;
        let mean = sorted.iter().map(|&v| v as f64).sum::<f64>() / n;
        let variance = sorted
            .iter()
            .map(|&v| {
                let d = v as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        let percentile = |q: f64| -> f64 {
            let rank = q * (sorted.len() - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            if lo == hi {
                sorted[lo] as f64
            } else {
                let frac = rank - lo as f64;
                sorted[lo] as f64 + frac * (sorted[hi] - sorted[lo]) as f64
            }
        };
        HistogramStats {
            size: r.count,
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            mean,
            std_dev: variance.sqrt(),
            p50: percentile(0.50),
            p90: percentile(0.90),
            p95: percentile(0.95),
            p99: percentile(0.99),
            p999: percentile(0.999),
        }
    }

    fn clear(&self) {
        let mut r = self.reservoir.lock().unwrap();
        r.samples.clear();
        r.count = 0;
    }

    fn report(&self) -> serde_json::Value {
        let stats = self.stats();
        let mut v = serde_json::to_value(stats).unwrap_or_else(|_| json!({}));
        if let Some(obj) = v.as_object_mut() {
            obj.insert("name".to_string(), json!(self.name));
        }
        v
    }
}

/// Append-only typed list of observations, reported in full.
pub struct DataList<T> {
    name: String,
    items: Mutex<Vec<T>>,
}

impl<T: Serialize + Send + 'static> DataList<T> {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            items: Mutex::new(Vec::new()),
        }
    }

    pub fn append(&self, item: T) {
        self.items.lock().unwrap().push(item);
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Type-erased view of a [`DataList`] used by the registry reporter.
trait ReportableList: Send + Sync {
    fn report(&self) -> serde_json::Value;
    fn clear(&self);
}

impl<T: Serialize + Send + Sync + 'static> ReportableList for DataList<T> {
    fn report(&self) -> serde_json::Value {
        let items = self.items.lock().unwrap();
        json!({ "name": self.name, "items": serde_json::to_value(&*items).unwrap_or_default() })
    }

    fn clear(&self) {
        self.items.lock().unwrap().clear();
    }
}

enum Metric {
    Counter(Arc<Counter>),
    Meter(Arc<Meter>),
    Histogram(Arc<Histogram>),
    DataList {
        typed: Arc<dyn Any + Send + Sync>,
        report: Arc<dyn ReportableList>,
    },
}

impl Metric {
    fn kind(&self) -> &'static str {
        match self {
            Metric::Counter(_) => "counter",
            Metric::Meter(_) => "meter",
            Metric::Histogram(_) => "histogram",
            Metric::DataList { .. } => "data_list",
        }
    }

    fn clear(&self) {
        match self {
            Metric::Counter(c) => c.clear(),
            Metric::Meter(m) => m.clear(),
            Metric::Histogram(h) => h.clear(),
            Metric::DataList { report, .. } => report.clear(),
        }
    }
}

/// The process-wide metrics registry. Constructed once during startup,
/// before any request handling, and shared by `Arc`.
pub struct MetricsRegistry {
    metrics: RwLock<HashMap<String, Metric>>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            metrics: RwLock::new(HashMap::new()),
        }
    }

    /// Idempotent by name: re-creating returns the existing handle, with a
    /// kind check that fails if the names collide across kinds.
    pub fn create_counter(&self, name: &str) -> Result<Arc<Counter>, MetricsError> {
        let mut metrics = self.metrics.write().unwrap();
        match metrics.get(name) {
            Some(Metric::Counter(c)) => Ok(c.clone()),
            Some(other) => Err(MetricsError::KindMismatch {
                name: name.to_string(),
                existing: other.kind(),
                requested: "counter",
            }),
            None => {
                let c = Arc::new(Counter::new(name));
                metrics.insert(name.to_string(), Metric::Counter(c.clone()));
                Ok(c)
            }
        }
    }

    pub fn create_meter(&self, name: &str) -> Result<Arc<Meter>, MetricsError> {
        let mut metrics = self.metrics.write().unwrap();
        match metrics.get(name) {
            Some(Metric::Meter(m)) => Ok(m.clone()),
            Some(other) => Err(MetricsError::KindMismatch {
                name: name.to_string(),
                existing: other.kind(),
                requested: "meter",
            }),
            None => {
                let m = Arc::new(Meter::new(name));
                metrics.insert(name.to_string(), Metric::Meter(m.clone()));
                Ok(m)
            }
        }
    }

    pub fn create_histogram(&self, name: &str) -> Result<Arc<Histogram>, MetricsError> {
        self.create_histogram_with_capacity(name, DEFAULT_RESERVOIR_CAPACITY)
    }

    pub fn create_histogram_with_capacity(
        &self,
        name: &str,
        capacity: usize,
    ) -> Result<Arc<Histogram>, MetricsError> {
        let mut metrics = self.metrics.write().unwrap();
        match metrics.get(name) {
            Some(Metric::Histogram(h)) => Ok(h.clone()),
            Some(other) => Err(MetricsError::KindMismatch {
                name: name.to_string(),
                existing: other.kind(),
                requested: "histogram",
            }),
            None => {
                let h = Arc::new(Histogram::new(name, capacity));
                metrics.insert(name.to_string(), Metric::Histogram(h.clone()));
                Ok(h)
            }
        }
    }

    pub fn create_data_list<T: Serialize + Send + Sync + 'static>(
        &self,
        name: &str,
    ) -> Result<Arc<DataList<T>>, MetricsError> {
        let mut metrics = self.metrics.write().unwrap();
        match metrics.get(name) {
            Some(Metric::DataList { typed, .. }) => typed
                .clone()
                .downcast::<DataList<T>>()
                .map_err(|_| MetricsError::KindMismatch {
                    name: name.to_string(),
                    existing: "data_list (different element type)",
                    requested: "data_list",
                }),
            Some(other) => Err(MetricsError::KindMismatch {
                name: name.to_string(),
                existing: other.kind(),
                requested: "data_list",
            }),
            None => {
                let list = Arc::new(DataList::<T>::new(name));
                metrics.insert(
                    name.to_string(),
                    Metric::DataList {
                        typed: list.clone(),
                        report: list.clone(),
                    },
                );
                Ok(list)
            }
        }
    }

    /// Render the full registry as a JSON string. Holding the write lock for
    /// the duration keeps concurrent reporters mutually exclusive, so a
    /// `clear` is atomic relative to other snapshots.
    pub fn report_metrics(&self, clear: bool) -> String {
        let metrics = self.metrics.write().unwrap();
        let mut counters = Vec::new();
        let mut meters = Vec::new();
        let mut histograms = Vec::new();
        let mut data_lists = Vec::new();
        let mut names: Vec<&String> = metrics.keys().collect();
        names.sort();
        for name in names {
            match &metrics[name.as_str()] {
                Metric::Counter(c) => counters.push(c.report()),
                Metric::Meter(m) => meters.push(m.report()),
                Metric::Histogram(h) => histograms.push(h.report()),
                Metric::DataList { report, .. } => data_lists.push(report.report()),
            }
        }
        let snapshot = json!({
            "counters": counters,
            "meters": meters,
            "histograms": histograms,
            "data_lists": data_lists,
        });
        if clear {
            for metric in metrics.values() {
                metric.clear();
            }
        }
        snapshot.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_create_is_idempotent() {
        let registry = MetricsRegistry::new();
        let a = registry.create_counter("frontend:requests").unwrap();
        let b = registry.create_counter("frontend:requests").unwrap();
        a.increment(3);
        b.increment(2);
        assert_eq!(a.value(), 5);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let registry = MetricsRegistry::new();
        registry.create_counter("latency").unwrap();
        assert!(matches!(
            registry.create_histogram("latency"),
            Err(MetricsError::KindMismatch { .. })
        ));
    }

    #[test]
    fn report_with_clear_resets_counters() {
        let registry = MetricsRegistry::new();
        let c = registry.create_counter("queries").unwrap();
        let m = registry.create_meter("rate").unwrap();
        let h = registry.create_histogram("lat").unwrap();
        c.increment(10);
        m.mark(4);
        h.insert(250);

        let first = registry.report_metrics(true);
        assert!(first.contains("\"count\":10"));

        let second: serde_json::Value =
            serde_json::from_str(&registry.report_metrics(false)).unwrap();
        assert_eq!(second["counters"][0]["count"], 0);
        assert_eq!(second["meters"][0]["count"], 0);
        assert_eq!(second["histograms"][0]["size"], 0);
    }

    #[test]
    fn histogram_stats_cover_percentiles() {
        let registry = MetricsRegistry::new();
        let h = registry.create_histogram("lat").unwrap();
        for v in 1..=100 {
            h.insert(v);
        }
        let stats = h.stats();
        assert_eq!(stats.size, 100);
        assert_eq!(stats.min, 1);
        assert_eq!(stats.max, 100);
        assert!((stats.mean - 50.5).abs() < 1e-9);
        assert!(stats.p50 > 49.0 && stats.p50 < 52.0);
        assert!(stats.p99 > 98.0);
    }

    #[test]
    fn reservoir_caps_at_capacity() {
        let registry = MetricsRegistry::new();
        let h = registry
            .create_histogram_with_capacity("small", 16)
            .unwrap();
        for v in 0..1000 {
            h.insert(v);
        }
        let stats = h.stats();
        assert_eq!(stats.size, 1000);
        assert_eq!(h.reservoir.lock().unwrap().samples.len(), 16);
    }

    #[test]
    fn data_list_reports_in_full() {
        let registry = MetricsRegistry::new();
        let list = registry.create_data_list::<u64>("wrap_offsets").unwrap();
        list.append(7);
        list.append(11);
        let report: serde_json::Value =
            serde_json::from_str(&registry.report_metrics(false)).unwrap();
        assert_eq!(report["data_lists"][0]["items"], json!([7, 11]));

        // Same name, wrong element type.
        assert!(registry.create_data_list::<String>("wrap_offsets").is_err());
    }

    #[test]
    fn meter_counts_and_rates() {
        let registry = MetricsRegistry::new();
        let m = registry.create_meter("events").unwrap();
        m.mark(5);
        m.mark(5);
        assert_eq!(m.count(), 10);
        // No tick has elapsed yet; rolling rates are still zero but the
        // mean rate reflects the elapsed wall clock.
        assert!(m.mean_rate() >= 0.0);
    }
}
