//! Garbage-collection notifications and per-collector statistics.
//!
//! The host runtime publishes [`GcEvent`]s into a [`GcHub`]. The hub fans them
//! out to subscribers (tick monitor, GC reporter) and keeps cumulative
//! per-collector totals so the `gc` summary can subtract the startup baseline.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::display::MessageSink;
use crate::format;

const GC_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// Event model
// =============================================================================

/// Generation a collection ran against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcKind {
    Young,
    Old,
    #[default]
    Unknown,
}

impl GcKind {
    /// Best-effort classification from a collector name.
    #[must_use]
    pub fn classify(collector: &str) -> Self {
        let name = collector.to_ascii_lowercase();
        const YOUNG: [&str; 6] = ["young", "minor", "scavenge", "copy", "parnew", "eden"];
        const OLD: [&str; 5] = ["old", "major", "marksweep", "full", "tenured"];
        if YOUNG.iter().any(|k| name.contains(k)) {
            Self::Young
        } else if OLD.iter().any(|k| name.contains(k)) {
            Self::Old
        } else {
            Self::Unknown
        }
    }
}

impl fmt::Display for GcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Young => "Young Gen",
            Self::Old => "Old Gen",
            Self::Unknown => "Unknown",
        })
    }
}

/// Bytes used in one memory region before and after a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionUsage {
    pub before: u64,
    pub after: u64,
}

impl RegionUsage {
    #[must_use]
    pub const fn new(before: u64, after: u64) -> Self {
        Self { before, after }
    }

    /// Positive when memory was freed, negative when the region grew.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn freed(&self) -> i64 {
        self.before as i64 - self.after as i64
    }
}

/// One completed garbage collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GcEvent {
    pub collector: String,
    pub kind: GcKind,
    pub cause: Option<String>,
    pub duration_ms: f64,
    #[serde(default)]
    pub regions: BTreeMap<String, RegionUsage>,
}

impl GcEvent {
    /// Event whose kind is classified from the collector name.
    #[must_use]
    pub fn new(collector: impl Into<String>, duration_ms: f64) -> Self {
        let collector = collector.into();
        Self {
            kind: GcKind::classify(&collector),
            collector,
            cause: None,
            duration_ms,
            regions: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>, usage: RegionUsage) -> Self {
        self.regions.insert(region.into(), usage);
        self
    }

    /// Lines announcing this collection: a headline then one pair of lines per
    /// region whose usage changed.
    #[must_use]
    pub fn report_lines(&self) -> Vec<String> {
        let cause = self.cause.as_deref().unwrap_or("unknown");
        let mut lines = vec![format!(
            "{} GC lasting {} ms. (cause = {cause})",
            self.kind,
            format::decimal(self.duration_ms)
        )];
        for (region, usage) in &self.regions {
            let diff = usage.freed();
            if diff > 0 {
                lines.push(format!(
                    "  {} freed from {region}",
                    format::bytes(diff.unsigned_abs())
                ));
                #[allow(clippy::cast_precision_loss)]
                let pct = format::percent(diff as f64, usage.before as f64);
                lines.push(format!(
                    "    {} → {} ({pct})",
                    format::bytes(usage.before),
                    format::bytes(usage.after)
                ));
            } else if diff < 0 {
                lines.push(format!(
                    "  {} moved to {region}",
                    format::bytes(diff.unsigned_abs())
                ));
                lines.push(format!(
                    "    {} → {}",
                    format::bytes(usage.before),
                    format::bytes(usage.after)
                ));
            }
        }
        lines
    }
}

// =============================================================================
// Collector statistics
// =============================================================================

/// Cumulative totals for one collector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectorStats {
    pub collection_count: u64,
    pub collection_time_ms: f64,
}

impl CollectorStats {
    #[must_use]
    pub fn subtract(&self, baseline: &Self) -> Self {
        Self {
            collection_count: self.collection_count.saturating_sub(baseline.collection_count),
            collection_time_ms: (self.collection_time_ms - baseline.collection_time_ms).max(0.0),
        }
    }

    /// Mean time per collection.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn average_time_ms(&self) -> Option<f64> {
        (self.collection_count > 0).then(|| self.collection_time_ms / self.collection_count as f64)
    }

    /// Mean wall time between collections over `uptime`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn average_frequency_ms(&self, uptime: Duration) -> Option<f64> {
        if self.collection_count == 0 {
            return None;
        }
        let uptime_ms = uptime.as_secs_f64() * 1000.0;
        Some(((uptime_ms - self.collection_time_ms) / self.collection_count as f64).max(0.0))
    }
}

/// Subtract per-collector baselines; collectors absent from the baseline are
/// reported in full.
#[must_use]
pub fn subtract_baseline(
    current: &BTreeMap<String, CollectorStats>,
    baseline: &BTreeMap<String, CollectorStats>,
) -> BTreeMap<String, CollectorStats> {
    current
        .iter()
        .map(|(name, stats)| {
            let adjusted = baseline
                .get(name)
                .map_or(*stats, |base| stats.subtract(base));
            (name.clone(), adjusted)
        })
        .collect()
}

/// The `gc` summary lines.
#[must_use]
pub fn collector_report(
    stats: &BTreeMap<String, CollectorStats>,
    uptime: Duration,
) -> Vec<String> {
    if stats.is_empty() {
        return vec!["No garbage collectors are reporting data.".to_string()];
    }
    let mut lines = Vec::with_capacity(stats.len() * 3);
    for (name, collector) in stats {
        let kind = GcKind::classify(name);
        lines.push(format!("{name} collector ({kind}):"));
        match (
            collector.average_time_ms(),
            collector.average_frequency_ms(uptime),
        ) {
            (Some(avg), Some(freq)) => {
                lines.push(format!(
                    "  {} ms avg, {} total collections",
                    format::decimal(avg),
                    collector.collection_count
                ));
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let every = (freq / 1000.0).round() as u64;
                lines.push(format!("  {} avg frequency", format::seconds(every)));
            }
            _ => lines.push("  0 collections".to_string()),
        }
    }
    lines
}

// =============================================================================
// Hub
// =============================================================================

/// Fan-out point for GC notifications from the host runtime.
#[derive(Debug)]
pub struct GcHub {
    events: broadcast::Sender<GcEvent>,
    totals: Mutex<BTreeMap<String, CollectorStats>>,
    baseline: Mutex<BTreeMap<String, CollectorStats>>,
}

impl Default for GcHub {
    fn default() -> Self {
        Self::new()
    }
}

impl GcHub {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(GC_CHANNEL_CAPACITY);
        Self {
            events,
            totals: Mutex::new(BTreeMap::new()),
            baseline: Mutex::new(BTreeMap::new()),
        }
    }

    /// Record a collection and notify subscribers.
    pub fn publish(&self, event: GcEvent) {
        {
            let mut totals = self.totals.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = totals.entry(event.collector.clone()).or_default();
            entry.collection_count += 1;
            entry.collection_time_ms += event.duration_ms;
        }
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GcEvent> {
        self.events.subscribe()
    }

    /// Freeze current totals as the baseline for [`Self::stats_since_baseline`].
    pub fn capture_baseline(&self) {
        let snapshot = self.totals();
        *self.baseline.lock().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    #[must_use]
    pub fn totals(&self) -> BTreeMap<String, CollectorStats> {
        self.totals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn stats_since_baseline(&self) -> BTreeMap<String, CollectorStats> {
        let baseline = self
            .baseline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        subtract_baseline(&self.totals(), &baseline)
    }
}

/// Broadcast a report for every collection until the hub closes or the task
/// is aborted.
pub fn spawn_gc_reporter(
    mut events: broadcast::Receiver<GcEvent>,
    sink: Arc<dyn MessageSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    for line in event.report_lines() {
                        sink.broadcast_prefixed(&line);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "GC reporter fell behind; notifications dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("GC event stream closed");
                    break;
                }
            }
        }
    })
}
