//! Fixed-capacity rolling window of weighted samples.
//!
//! The window keeps the most recent `capacity` samples in a circular buffer
//! and maintains a running weighted total so `mean()` is O(1). Order
//! statistics (min, max, median, percentiles) are computed over a sorted copy
//! of the resident values; the live buffer is never reordered.
//!
//! Every metric in the engine is backed by one of these: tick rate, tick
//! duration, ping round-trip and CPU load.
//!
//! # Example
//!
//! ```ignore
//! let mut window = RollingWindow::new(3);
//! window.add_unweighted(10.0);
//! window.add_unweighted(20.0);
//! window.add_unweighted(30.0);
//! window.add_unweighted(40.0); // evicts 10.0
//! assert_eq!(window.mean()?, 30.0);
//! ```

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Sample
// =============================================================================

/// One observation fed into a window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub value: f64,
    /// How much the value counts towards the weighted mean.
    pub weight: Duration,
    pub timestamp: Instant,
}

impl Sample {
    #[must_use]
    pub fn new(value: f64, weight: Duration) -> Self {
        Self {
            value,
            weight,
            timestamp: Instant::now(),
        }
    }

    fn contribution(&self) -> f64 {
        self.value * self.weight.as_secs_f64()
    }
}

/// Weight used by [`RollingWindow::add_unweighted`].
pub const UNIT_WEIGHT: Duration = Duration::from_secs(1);

// =============================================================================
// RollingWindow
// =============================================================================

/// Circular buffer of weighted samples with incremental weighted mean.
///
/// Invariant: `total == Σ(value × weight)` and `total_weight == Σ(weight)`
/// over the resident samples, up to floating-point rounding.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    buf: Vec<Option<Sample>>,
    capacity: usize,
    head: usize,
    len: usize,
    total: f64,
    total_weight: f64,
    pushed: u64,
}

impl RollingWindow {
    /// Create an empty window holding at most `capacity` samples.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        Self {
            buf: vec![None; capacity],
            capacity,
            head: 0,
            len: 0,
            total: 0.0,
            total_weight: 0.0,
            pushed: 0,
        }
    }

    /// Window sized for `seconds` of data at `rate_per_second` samples.
    #[must_use]
    pub fn for_duration(seconds: u64, rate_per_second: u32) -> Self {
        let capacity = usize::try_from(seconds.saturating_mul(u64::from(rate_per_second)))
            .unwrap_or(usize::MAX)
            .max(1);
        Self::new(capacity)
    }

    /// Insert a sample, evicting the oldest when full.
    ///
    /// Returns the evicted sample, if any.
    pub fn add(&mut self, value: f64, weight: Duration) -> Option<Sample> {
        self.push(Sample::new(value, weight))
    }

    /// Insert a sample with [`UNIT_WEIGHT`], so `mean()` is a plain average.
    pub fn add_unweighted(&mut self, value: f64) -> Option<Sample> {
        self.add(value, UNIT_WEIGHT)
    }

    /// Insert a pre-built sample.
    pub fn push(&mut self, sample: Sample) -> Option<Sample> {
        let evicted = self.buf[self.head].take();
        if let Some(old) = &evicted {
            self.total -= old.contribution();
            self.total_weight -= old.weight.as_secs_f64();
        }
        self.total += sample.contribution();
        self.total_weight += sample.weight.as_secs_f64();
        self.buf[self.head] = Some(sample);
        self.head = (self.head + 1) % self.capacity;
        self.pushed += 1;
        if self.len < self.capacity {
            self.len += 1;
        } else if self.pushed % (self.capacity as u64) == 0 {
            // Once per full rotation, re-derive the totals so subtract/add
            // rounding error cannot accumulate. Amortised O(1).
            self.recompute_totals();
        }
        evicted
    }

    fn recompute_totals(&mut self) {
        self.total = self.iter().map(Sample::contribution).sum();
        self.total_weight = self.iter().map(|s| s.weight.as_secs_f64()).sum();
    }

    /// Weighted mean of the resident samples.
    pub fn mean(&self) -> Result<f64> {
        if self.len == 0 || self.total_weight <= 0.0 {
            return Err(Error::InsufficientData("rolling window has no weighted samples"));
        }
        Ok(self.total / self.total_weight)
    }

    pub fn min(&self) -> Result<f64> {
        self.iter()
            .map(|s| s.value)
            .reduce(f64::min)
            .ok_or(Error::InsufficientData("rolling window is empty"))
    }

    pub fn max(&self) -> Result<f64> {
        self.iter()
            .map(|s| s.value)
            .reduce(f64::max)
            .ok_or(Error::InsufficientData("rolling window is empty"))
    }

    /// Median of the resident values (mean of the two middle values when the
    /// count is even).
    pub fn median(&self) -> Result<f64> {
        let sorted = self.sorted_values()?;
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            Ok((sorted[mid - 1] + sorted[mid]) / 2.0)
        } else {
            Ok(sorted[mid])
        }
    }

    /// Nearest-rank percentile, `p` in `[0.0, 1.0]`.
    pub fn percentile(&self, p: f64) -> Result<f64> {
        if !(0.0..=1.0).contains(&p) {
            return Err(Error::InvalidConfiguration(format!(
                "percentile must be within 0.0..=1.0, got {p}"
            )));
        }
        let sorted = self.sorted_values()?;
        Ok(sorted[percentile_rank(sorted.len(), p)])
    }

    /// 95th percentile.
    pub fn percentile_95(&self) -> Result<f64> {
        self.percentile(0.95)
    }

    /// Resident values sorted ascending (a copy; the buffer is untouched).
    fn sorted_values(&self) -> Result<Vec<f64>> {
        if self.len == 0 {
            return Err(Error::InsufficientData("rolling window is empty"));
        }
        let mut values: Vec<f64> = self.iter().map(|s| s.value).collect();
        values.sort_by(f64::total_cmp);
        Ok(values)
    }

    /// Summary of every statistic at once (one sort).
    pub fn summary(&self) -> Result<RollingSummary> {
        let sorted = self.sorted_values()?;
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };
        Ok(RollingSummary {
            count: self.len,
            mean: self.mean()?,
            min: sorted[0],
            median,
            p95: sorted[percentile_rank(sorted.len(), 0.95)],
            max: sorted[sorted.len() - 1],
        })
    }

    /// Iterate from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        let start = if self.len < self.capacity { 0 } else { self.head };
        (0..self.len).filter_map(move |i| self.buf[(start + i) % self.capacity].as_ref())
    }

    /// Most recently added sample.
    #[must_use]
    pub fn latest(&self) -> Option<&Sample> {
        if self.len == 0 {
            return None;
        }
        let idx = if self.head == 0 {
            self.capacity - 1
        } else {
            self.head - 1
        };
        self.buf[idx].as_ref()
    }

    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples ever added, including evicted ones.
    #[must_use]
    pub fn total_added(&self) -> u64 {
        self.pushed
    }

    /// Running weighted total, `Σ(value × weight_secs)`.
    #[must_use]
    pub fn weighted_total(&self) -> f64 {
        self.total
    }

    /// Running weight in seconds.
    #[must_use]
    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    pub fn clear(&mut self) {
        for slot in &mut self.buf {
            *slot = None;
        }
        self.head = 0;
        self.len = 0;
        self.total = 0.0;
        self.total_weight = 0.0;
    }
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn percentile_rank(len: usize, p: f64) -> usize {
    let rank = ((len - 1) as f64 * p).ceil() as usize;
    rank.min(len - 1)
}

// =============================================================================
// RollingSummary
// =============================================================================

/// Point-in-time statistics of a window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RollingSummary {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub median: f64,
    pub p95: f64,
    pub max: f64,
}

// =============================================================================
// SharedRollingWindow
// =============================================================================

/// A window shared between one writer and any number of readers.
///
/// Writers hold the lock only for the O(1) insert; readers clone the buffer
/// under the lock and compute statistics on the copy, so a query never sees a
/// half-written buffer and never blocks the writer for a sort.
#[derive(Debug, Clone)]
pub struct SharedRollingWindow {
    inner: Arc<Mutex<RollingWindow>>,
}

impl SharedRollingWindow {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::from_window(RollingWindow::new(capacity))
    }

    #[must_use]
    pub fn from_window(window: RollingWindow) -> Self {
        Self {
            inner: Arc::new(Mutex::new(window)),
        }
    }

    pub fn add(&self, value: f64, weight: Duration) {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.add(value, weight);
    }

    pub fn add_unweighted(&self, value: f64) {
        self.add(value, UNIT_WEIGHT);
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> RollingWindow {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn mean(&self) -> Result<f64> {
        // mean is O(1), no copy needed
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .mean()
    }

    pub fn median(&self) -> Result<f64> {
        self.snapshot().median()
    }

    pub fn percentile(&self, p: f64) -> Result<f64> {
        self.snapshot().percentile(p)
    }

    pub fn summary(&self) -> Result<RollingSummary> {
        self.snapshot().summary()
    }

    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .sample_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn empty_window_reports_insufficient_data() {
        let window = RollingWindow::new(4);
        assert!(matches!(window.mean(), Err(Error::InsufficientData(_))));
        assert!(matches!(window.median(), Err(Error::InsufficientData(_))));
        assert!(matches!(window.min(), Err(Error::InsufficientData(_))));
        assert!(matches!(window.summary(), Err(Error::InsufficientData(_))));
        assert_eq!(window.sample_count(), 0);
    }

    #[test]
    fn zero_weight_samples_do_not_divide_by_zero() {
        let mut window = RollingWindow::new(4);
        window.add(5.0, Duration::ZERO);
        assert!(window.mean().unwrap_err().is_transient());
        // order statistics still work
        assert!(close(window.max().unwrap(), 5.0));
    }

    #[test]
    fn weighted_mean_over_partial_window() {
        let mut window = RollingWindow::new(10);
        window.add(10.0, Duration::from_secs(1));
        window.add(40.0, Duration::from_secs(3));
        // (10*1 + 40*3) / 4
        assert!(close(window.mean().unwrap(), 32.5));
        assert_eq!(window.sample_count(), 2);
        assert!(!window.is_full());
    }

    #[test]
    fn eviction_removes_oldest_contribution() {
        let mut window = RollingWindow::new(3);
        window.add_unweighted(1000.0);
        window.add_unweighted(1.0);
        window.add_unweighted(2.0);
        let evicted = window.add_unweighted(3.0).unwrap();
        assert!(close(evicted.value, 1000.0));
        assert!(close(window.mean().unwrap(), 2.0));
        assert!(close(window.max().unwrap(), 3.0));
        assert_eq!(window.total_added(), 4);
    }

    #[test]
    fn median_even_and_odd() {
        let mut window = RollingWindow::new(8);
        for v in [5.0, 1.0, 3.0] {
            window.add_unweighted(v);
        }
        assert!(close(window.median().unwrap(), 3.0));
        window.add_unweighted(7.0);
        assert!(close(window.median().unwrap(), 4.0));
    }

    #[test]
    fn percentile_nearest_rank() {
        let mut window = RollingWindow::new(100);
        for v in 1..=100 {
            window.add_unweighted(f64::from(v));
        }
        assert!(close(window.percentile(0.0).unwrap(), 1.0));
        assert!(close(window.percentile(1.0).unwrap(), 100.0));
        assert!(close(window.percentile_95().unwrap(), 96.0));
        assert!(window.percentile(1.5).is_err());
    }

    #[test]
    fn queries_do_not_reorder_buffer() {
        let mut window = RollingWindow::new(4);
        for v in [4.0, 2.0, 3.0, 1.0] {
            window.add_unweighted(v);
        }
        let _ = window.median().unwrap();
        let order: Vec<f64> = window.iter().map(|s| s.value).collect();
        assert_eq!(order, vec![4.0, 2.0, 3.0, 1.0]);
        assert!(close(window.latest().unwrap().value, 1.0));
    }

    #[test]
    fn summary_matches_individual_queries() {
        let mut window = RollingWindow::new(16);
        for v in [12.0, 48.0, 50.5, 7.25, 33.0] {
            window.add_unweighted(v);
        }
        let summary = window.summary().unwrap();
        assert_eq!(summary.count, 5);
        assert!(close(summary.min, window.min().unwrap()));
        assert!(close(summary.max, window.max().unwrap()));
        assert!(close(summary.median, window.median().unwrap()));
        assert!(close(summary.p95, window.percentile_95().unwrap()));
        assert!(close(summary.mean, window.mean().unwrap()));
    }

    #[test]
    fn clear_resets_totals() {
        let mut window = RollingWindow::new(2);
        window.add_unweighted(3.0);
        window.clear();
        assert!(window.is_empty());
        assert!(close(window.weighted_total(), 0.0));
        window.add_unweighted(9.0);
        assert!(close(window.mean().unwrap(), 9.0));
    }

    #[test]
    fn for_duration_sizes_capacity() {
        assert_eq!(RollingWindow::for_duration(10, 20).capacity(), 200);
        assert_eq!(RollingWindow::for_duration(0, 20).capacity(), 1);
    }

    #[test]
    #[should_panic(expected = "capacity must be > 0")]
    fn zero_capacity_panics() {
        let _ = RollingWindow::new(0);
    }

    #[test]
    fn shared_window_concurrent_writer_and_reader() {
        let shared = SharedRollingWindow::new(64);
        let writer = {
            let shared = shared.clone();
            std::thread::spawn(move || {
                for i in 0..1_000 {
                    shared.add_unweighted(f64::from(i % 10));
                }
            })
        };
        for _ in 0..100 {
            if let Ok(summary) = shared.summary() {
                assert!(summary.min >= 0.0 && summary.max <= 9.0);
                assert!(summary.count <= 64);
            }
        }
        writer.join().unwrap();
        assert_eq!(shared.sample_count(), 64);
    }
}
