//! Tick feed and the tick/GC correlation monitor.
//!
//! [`TickHub`] is where the host reports tick boundaries. It fans ticks out
//! as [`TickEvent`]s (for the monitor and statistics) and as [`TickReport`]s
//! on a watch channel (for samplers that keep only slow ticks).
//!
//! [`TickGcMonitor`] is a pure state machine over [`MonitorEvent`]s. It first
//! learns a baseline tick duration (Setup), then reports ticks that exceed the
//! configured [`ReportPredicate`] and GCs that land inside a tick
//! (Monitoring). [`spawn_tick_monitor`] drives it from the two channels.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::TickMonitorSettings;
use crate::display::MessageSink;
use crate::format;
use crate::gc::{GcEvent, GcKind};

const TICK_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// Tick feed
// =============================================================================

/// Duration of one completed tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub index: u64,
    pub duration: Duration,
}

impl TickReport {
    #[must_use]
    pub const fn new(index: u64, duration: Duration) -> Self {
        Self { index, duration }
    }
}

/// A tick boundary as seen by subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickEvent {
    pub index: u64,
    pub at: Instant,
    pub duration: Duration,
}

impl TickEvent {
    #[must_use]
    pub const fn report(&self) -> TickReport {
        TickReport::new(self.index, self.duration)
    }
}

/// Source of tick notifications.
pub trait TickSource: Send + Sync {
    /// Index of the most recent tick.
    fn current_tick(&self) -> u64;

    fn subscribe(&self) -> broadcast::Receiver<TickEvent>;

    /// Latest tick-end report; a receiver only sees ticks after it was created.
    fn reports(&self) -> watch::Receiver<TickReport>;
}

/// The host calls [`TickHub::on_tick`] (or [`TickHub::on_tick_with_duration`]
/// when it measures tick work itself) once per tick.
#[derive(Debug)]
pub struct TickHub {
    current: AtomicU64,
    last_at: Mutex<Option<Instant>>,
    events: broadcast::Sender<TickEvent>,
    reports: watch::Sender<TickReport>,
}

impl Default for TickHub {
    fn default() -> Self {
        Self::new()
    }
}

impl TickHub {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(TICK_CHANNEL_CAPACITY);
        let (reports, _) = watch::channel(TickReport::default());
        Self {
            current: AtomicU64::new(0),
            last_at: Mutex::new(None),
            events,
            reports,
        }
    }

    /// Record a tick whose duration is the time since the previous tick.
    pub fn on_tick(&self) -> TickEvent {
        let now = Instant::now();
        let previous = self
            .last_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(now);
        let duration = previous.map_or(Duration::ZERO, |p| now.saturating_duration_since(p));
        self.publish(now, duration)
    }

    /// Record a tick that took `duration` of work.
    pub fn on_tick_with_duration(&self, duration: Duration) -> TickEvent {
        let now = Instant::now();
        *self.last_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(now);
        self.publish(now, duration)
    }

    fn publish(&self, at: Instant, duration: Duration) -> TickEvent {
        let index = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        let event = TickEvent {
            index,
            at,
            duration,
        };
        let _ = self.events.send(event);
        self.reports.send_replace(event.report());
        event
    }
}

impl TickSource for TickHub {
    fn current_tick(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    fn subscribe(&self) -> broadcast::Receiver<TickEvent> {
        self.events.subscribe()
    }

    fn reports(&self) -> watch::Receiver<TickReport> {
        self.reports.subscribe()
    }
}

// =============================================================================
// Monitor state machine
// =============================================================================

/// Input to [`TickGcMonitor`]. Tick timestamps are monotonic milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    Tick { index: u64, at_ms: f64 },
    Gc(GcEvent),
}

/// When a monitored tick is worth reporting. Both variants only fire when the
/// tick was slower than the baseline average.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportPredicate {
    /// Increase over the average exceeds this percentage.
    PercentIncrease(f64),
    /// Tick duration exceeds this many milliseconds.
    DurationOver(f64),
}

impl ReportPredicate {
    #[must_use]
    pub fn from_settings(settings: &TickMonitorSettings) -> Self {
        match settings.duration_threshold_ms {
            Some(ms) => Self::DurationOver(ms),
            None => Self::PercentIncrease(settings.percent_increase_threshold),
        }
    }

    #[must_use]
    pub fn should_report(&self, duration_ms: f64, increase_ms: f64, percent_change: f64) -> bool {
        if increase_ms <= 0.0 {
            return false;
        }
        match *self {
            Self::PercentIncrease(threshold) => percent_change > threshold,
            Self::DurationOver(threshold) => duration_ms > threshold,
        }
    }

    #[must_use]
    pub fn monitoring_start_message(&self) -> String {
        match *self {
            Self::PercentIncrease(pct) => format!(
                "Starting now, any ticks with >{}% increase in duration compared to the average will be reported.",
                format::decimal(pct)
            ),
            Self::DurationOver(ms) => format!(
                "Starting now, any ticks with duration >{} ms will be reported.",
                format::decimal(ms)
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorPhase {
    Setup,
    Monitoring,
}

/// Running min/max/mean of Setup deltas.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TickBaseline {
    pub samples: u32,
    pub min_ms: f64,
    pub max_ms: f64,
    pub total_ms: f64,
}

impl TickBaseline {
    fn accept(&mut self, duration_ms: f64) {
        if self.samples == 0 {
            self.min_ms = duration_ms;
            self.max_ms = duration_ms;
        } else {
            self.min_ms = self.min_ms.min(duration_ms);
            self.max_ms = self.max_ms.max(duration_ms);
        }
        self.samples += 1;
        self.total_ms += duration_ms;
    }

    #[must_use]
    pub fn mean_ms(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.total_ms / f64::from(self.samples)
        }
    }
}

/// Something the monitor wants the operator to see.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorAlert {
    Started {
        setup_ticks: u32,
    },
    SetupComplete {
        max_ms: f64,
        min_ms: f64,
        average_ms: f64,
    },
    MonitoringStarted(ReportPredicate),
    SlowTick {
        tick: u64,
        duration_ms: f64,
        percent_increase: f64,
    },
    GcDuringTick {
        tick: u64,
        gc_duration_ms: f64,
        kind: GcKind,
    },
}

impl MonitorAlert {
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        match self {
            Self::Started { setup_ticks } => vec![format!(
                "Tick monitor started. Before the monitor becomes fully active, the average tick duration will be calculated over a period of {setup_ticks} ticks."
            )],
            Self::SetupComplete {
                max_ms,
                min_ms,
                average_ms,
            } => vec![
                "Analysis is now complete.".to_string(),
                format!("> Max: {} ms", format::decimal(*max_ms)),
                format!("> Min: {} ms", format::decimal(*min_ms)),
                format!("> Average: {} ms", format::decimal(*average_ms)),
            ],
            Self::MonitoringStarted(predicate) => vec![predicate.monitoring_start_message()],
            Self::SlowTick {
                tick,
                duration_ms,
                percent_increase,
            } => vec![format!(
                "Tick #{tick} lasted {} ms. ({}% increase from avg)",
                format::decimal(*duration_ms),
                format::decimal(*percent_increase)
            )],
            Self::GcDuringTick {
                tick,
                gc_duration_ms,
                kind,
            } => vec![format!(
                "Tick #{tick} included GC lasting {} ms. (type = {kind})",
                format::decimal(*gc_duration_ms)
            )],
        }
    }
}

/// Baseline-then-alert tick monitor.
///
/// The first tick only initialises. Each later tick yields a delta. In Setup,
/// deltas accumulate until `setup_ticks` have been seen, then the mean becomes
/// the fixed average and the phase switches to Monitoring; that same delta is
/// evaluated in Monitoring too. A GC during Setup clears the last-tick marker
/// so the delta spanning the pause is dropped. A GC before the first tick, or
/// during Monitoring, is reported against the current tick.
#[derive(Debug, Clone)]
pub struct TickGcMonitor {
    predicate: ReportPredicate,
    setup_ticks: u32,
    zero_tick: u64,
    current_tick: u64,
    phase: Option<MonitorPhase>,
    last_tick_ms: Option<f64>,
    baseline: TickBaseline,
    average_tick_ms: Option<f64>,
}

impl TickGcMonitor {
    /// Tick numbers in alerts are relative to `zero_tick`.
    #[must_use]
    pub fn new(predicate: ReportPredicate, setup_ticks: u32, zero_tick: u64) -> Self {
        Self {
            predicate,
            setup_ticks: setup_ticks.max(1),
            zero_tick,
            current_tick: zero_tick,
            phase: None,
            last_tick_ms: None,
            baseline: TickBaseline::default(),
            average_tick_ms: None,
        }
    }

    #[must_use]
    pub fn from_settings(settings: &TickMonitorSettings, zero_tick: u64) -> Self {
        Self::new(
            ReportPredicate::from_settings(settings),
            settings.setup_ticks,
            zero_tick,
        )
    }

    /// `None` until the first tick.
    #[must_use]
    pub const fn phase(&self) -> Option<MonitorPhase> {
        self.phase
    }

    #[must_use]
    pub const fn baseline(&self) -> &TickBaseline {
        &self.baseline
    }

    /// Fixed once Monitoring begins.
    #[must_use]
    pub const fn average_tick_ms(&self) -> Option<f64> {
        self.average_tick_ms
    }

    #[must_use]
    pub const fn predicate(&self) -> ReportPredicate {
        self.predicate
    }

    pub fn handle(&mut self, event: &MonitorEvent) -> Vec<MonitorAlert> {
        match event {
            MonitorEvent::Tick { index, at_ms } => self.on_tick(*index, *at_ms),
            MonitorEvent::Gc(gc) => self.on_gc(gc),
        }
    }

    /// Drop the in-flight delta, e.g. after missed tick notifications.
    pub fn discard_pending_delta(&mut self) {
        self.last_tick_ms = None;
    }

    fn relative_tick(&self) -> u64 {
        self.current_tick.saturating_sub(self.zero_tick)
    }

    fn on_tick(&mut self, index: u64, now_ms: f64) -> Vec<MonitorAlert> {
        self.current_tick = index;

        let Some(mut phase) = self.phase else {
            self.phase = Some(MonitorPhase::Setup);
            self.last_tick_ms = Some(now_ms);
            return vec![MonitorAlert::Started {
                setup_ticks: self.setup_ticks,
            }];
        };

        let Some(last) = self.last_tick_ms.replace(now_ms) else {
            return Vec::new();
        };
        let duration_ms = (now_ms - last).max(0.0);
        let mut alerts = Vec::new();

        if phase == MonitorPhase::Setup {
            self.baseline.accept(duration_ms);
            if self.baseline.samples >= self.setup_ticks {
                let average_ms = self.baseline.mean_ms();
                self.average_tick_ms = Some(average_ms);
                alerts.push(MonitorAlert::SetupComplete {
                    max_ms: self.baseline.max_ms,
                    min_ms: self.baseline.min_ms,
                    average_ms,
                });
                alerts.push(MonitorAlert::MonitoringStarted(self.predicate));
                phase = MonitorPhase::Monitoring;
                self.phase = Some(phase);
                debug!(average_ms, "Tick monitor baseline established");
            }
        }

        if phase == MonitorPhase::Monitoring {
            let average = self.average_tick_ms.unwrap_or(0.0);
            let increase = duration_ms - average;
            let percent = if average > 0.0 {
                increase * 100.0 / average
            } else {
                0.0
            };
            if self.predicate.should_report(duration_ms, increase, percent) {
                alerts.push(MonitorAlert::SlowTick {
                    tick: self.relative_tick(),
                    duration_ms,
                    percent_increase: percent,
                });
            }
        }
        alerts
    }

    fn on_gc(&mut self, gc: &GcEvent) -> Vec<MonitorAlert> {
        match self.phase {
            Some(MonitorPhase::Setup) => {
                self.last_tick_ms = None;
                Vec::new()
            }
            None | Some(MonitorPhase::Monitoring) => vec![MonitorAlert::GcDuringTick {
                tick: self.relative_tick(),
                gc_duration_ms: gc.duration_ms,
                kind: gc.kind,
            }],
        }
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Running monitor task. Dropping the handle stops it.
#[derive(Debug)]
pub struct TickMonitorHandle {
    task: JoinHandle<()>,
}

impl TickMonitorHandle {
    pub fn stop(self) {
        self.task.abort();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for TickMonitorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn next_gc(
    gcs: &mut Option<broadcast::Receiver<GcEvent>>,
) -> Result<GcEvent, broadcast::error::RecvError> {
    match gcs {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Feed `monitor` from the tick and (optional) GC channels, broadcasting
/// every alert line through `sink`.
pub fn spawn_tick_monitor(
    mut monitor: TickGcMonitor,
    mut ticks: broadcast::Receiver<TickEvent>,
    mut gcs: Option<broadcast::Receiver<GcEvent>>,
    sink: Arc<dyn MessageSink>,
) -> TickMonitorHandle {
    let origin = Instant::now();
    let task = tokio::spawn(async move {
        loop {
            let alerts = tokio::select! {
                tick = ticks.recv() => match tick {
                    Ok(tick) => {
                        let at_ms = tick.at.saturating_duration_since(origin).as_secs_f64() * 1000.0;
                        monitor.handle(&MonitorEvent::Tick { index: tick.index, at_ms })
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Tick monitor fell behind; resetting tick delta");
                        monitor.discard_pending_delta();
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Tick stream closed; tick monitor exiting");
                        break;
                    }
                },
                gc = next_gc(&mut gcs) => match gc {
                    Ok(gc) => monitor.handle(&MonitorEvent::Gc(gc)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Tick monitor missed GC notifications");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        gcs = None;
                        continue;
                    }
                },
            };
            for alert in alerts {
                for line in alert.lines() {
                    sink.broadcast_prefixed(&line);
                }
            }
        }
    });
    TickMonitorHandle { task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::CollectingSink;

    fn tick(index: u64, at_ms: f64) -> MonitorEvent {
        MonitorEvent::Tick { index, at_ms }
    }

    /// Feed the init tick plus `n` deltas of `delta_ms`; returns the next
    /// (index, time).
    fn feed_steady(monitor: &mut TickGcMonitor, n: u64, delta_ms: f64) -> (u64, f64) {
        monitor.handle(&tick(1, 0.0));
        let mut at = 0.0;
        for i in 0..n {
            at += delta_ms;
            monitor.handle(&tick(i + 2, at));
        }
        (n + 2, at)
    }

    #[test]
    fn first_tick_only_initialises() {
        let mut monitor = TickGcMonitor::new(ReportPredicate::PercentIncrease(100.0), 120, 0);
        assert_eq!(monitor.phase(), None);
        let alerts = monitor.handle(&tick(1, 0.0));
        assert_eq!(alerts, vec![MonitorAlert::Started { setup_ticks: 120 }]);
        assert_eq!(monitor.phase(), Some(MonitorPhase::Setup));
        assert_eq!(monitor.baseline().samples, 0);
    }

    #[test]
    fn stays_in_setup_for_119_samples() {
        let mut monitor = TickGcMonitor::new(ReportPredicate::PercentIncrease(100.0), 120, 0);
        feed_steady(&mut monitor, 119, 50.0);
        assert_eq!(monitor.phase(), Some(MonitorPhase::Setup));
        assert_eq!(monitor.baseline().samples, 119);
        assert_eq!(monitor.average_tick_ms(), None);
    }

    #[test]
    fn transitions_on_120th_sample_with_mean() {
        let mut monitor = TickGcMonitor::new(ReportPredicate::PercentIncrease(100.0), 120, 0);
        let (next, at) = feed_steady(&mut monitor, 119, 50.0);
        let alerts = monitor.handle(&tick(next, at + 170.0));
        assert_eq!(monitor.phase(), Some(MonitorPhase::Monitoring));
        let expected_mean = (119.0 * 50.0 + 170.0) / 120.0;
        let average = monitor.average_tick_ms().unwrap();
        assert!((average - expected_mean).abs() < 1e-9);
        assert!(matches!(alerts[0], MonitorAlert::SetupComplete { max_ms, min_ms, .. } if max_ms == 170.0 && min_ms == 50.0));
        assert_eq!(
            alerts[0].lines()[0],
            "Analysis is now complete."
        );
        assert!(matches!(alerts[1], MonitorAlert::MonitoringStarted(_)));
        // the completing delta is evaluated against its own mean: 170 vs 51 is +233%
        assert!(matches!(alerts[2], MonitorAlert::SlowTick { tick: 121, .. }));
    }

    #[test]
    fn gc_during_setup_drops_the_spanning_delta() {
        let mut monitor = TickGcMonitor::new(ReportPredicate::PercentIncrease(100.0), 120, 0);
        monitor.handle(&tick(1, 0.0));
        let mut at = 0.0;
        for i in 2..=50u64 {
            at += 50.0;
            monitor.handle(&tick(i, at));
        }
        assert_eq!(monitor.baseline().samples, 49);

        assert!(monitor.handle(&MonitorEvent::Gc(GcEvent::new("old", 400.0))).is_empty());
        // this delta would include the pause; it only re-arms the marker
        at += 450.0;
        monitor.handle(&tick(51, at));
        assert_eq!(monitor.baseline().samples, 49);

        for i in 52..=122u64 {
            at += 50.0;
            monitor.handle(&tick(i, at));
        }
        assert_eq!(monitor.phase(), Some(MonitorPhase::Monitoring));
        assert_eq!(monitor.average_tick_ms(), Some(50.0));
        assert_eq!(monitor.baseline().max_ms, 50.0);
    }

    #[test]
    fn slow_tick_reported_with_percent_increase() {
        let mut monitor = TickGcMonitor::new(ReportPredicate::PercentIncrease(100.0), 120, 0);
        let (next, at) = feed_steady(&mut monitor, 120, 50.0);
        assert_eq!(monitor.average_tick_ms(), Some(50.0));

        // +80% is under the threshold
        assert!(monitor.handle(&tick(next, at + 90.0)).is_empty());

        let alerts = monitor.handle(&tick(next + 1, at + 90.0 + 150.0));
        assert_eq!(alerts.len(), 1);
        assert_eq!(
            alerts[0].lines(),
            vec!["Tick #123 lasted 150 ms. (200% increase from avg)"]
        );
    }

    #[test]
    fn duration_predicate_requires_an_increase() {
        let predicate = ReportPredicate::DurationOver(40.0);
        // slower than 40ms but faster than the average
        assert!(!predicate.should_report(45.0, -5.0, -10.0));
        assert!(predicate.should_report(45.0, 5.0, 12.5));
        assert!(!predicate.should_report(35.0, 5.0, 16.0));

        let pct = ReportPredicate::PercentIncrease(50.0);
        assert!(!pct.should_report(100.0, 0.0, 0.0));
        assert!(pct.should_report(100.0, 50.0, 100.0));
    }

    #[test]
    fn gc_during_monitoring_is_correlated() {
        let mut monitor = TickGcMonitor::new(ReportPredicate::PercentIncrease(100.0), 10, 100);
        monitor.handle(&tick(101, 0.0));
        let mut at = 0.0;
        for i in 102..=111u64 {
            at += 50.0;
            monitor.handle(&tick(i, at));
        }
        assert_eq!(monitor.phase(), Some(MonitorPhase::Monitoring));
        let gc = GcEvent::new("G1 Young Generation", 12.0);
        let alerts = monitor.handle(&MonitorEvent::Gc(gc));
        assert_eq!(
            alerts[0].lines(),
            vec!["Tick #11 included GC lasting 12 ms. (type = Young Gen)"]
        );
    }

    #[test]
    fn gc_before_first_tick_is_reported_against_tick_zero() {
        let mut monitor = TickGcMonitor::new(ReportPredicate::PercentIncrease(100.0), 10, 40);
        let alerts = monitor.handle(&MonitorEvent::Gc(GcEvent::new("G1 Young Generation", 3.0)));
        assert_eq!(
            alerts[0].lines(),
            vec!["Tick #0 included GC lasting 3 ms. (type = Young Gen)"]
        );
        // the monitor still waits for its first tick
        assert_eq!(monitor.phase(), None);
        assert!(matches!(
            monitor.handle(&tick(41, 0.0))[0],
            MonitorAlert::Started { setup_ticks: 10 }
        ));
    }

    #[test]
    fn predicate_from_settings() {
        let mut settings = TickMonitorSettings::default();
        assert_eq!(
            ReportPredicate::from_settings(&settings),
            ReportPredicate::PercentIncrease(100.0)
        );
        settings.duration_threshold_ms = Some(60.0);
        let predicate = ReportPredicate::from_settings(&settings);
        assert_eq!(predicate, ReportPredicate::DurationOver(60.0));
        assert_eq!(
            predicate.monitoring_start_message(),
            "Starting now, any ticks with duration >60 ms will be reported."
        );
    }

    #[tokio::test]
    async fn hub_numbers_ticks_and_publishes_reports() {
        let hub = TickHub::new();
        let mut events = hub.subscribe();
        let mut reports = hub.reports();
        assert!(!reports.has_changed().unwrap());

        let first = hub.on_tick();
        assert_eq!(first.index, 1);
        assert_eq!(first.duration, Duration::ZERO);
        hub.on_tick_with_duration(Duration::from_millis(70));
        assert_eq!(hub.current_tick(), 2);

        assert_eq!(events.recv().await.unwrap().index, 1);
        assert_eq!(events.recv().await.unwrap().duration, Duration::from_millis(70));
        assert!(reports.has_changed().unwrap());
        assert_eq!(*reports.borrow_and_update(), TickReport::new(2, Duration::from_millis(70)));
    }

    #[tokio::test(start_paused = true)]
    async fn driver_broadcasts_alerts() {
        let hub = TickHub::new();
        let gc_hub = crate::gc::GcHub::new();
        let sink = Arc::new(CollectingSink::default());
        let monitor = TickGcMonitor::new(ReportPredicate::PercentIncrease(100.0), 3, hub.current_tick());
        let handle = spawn_tick_monitor(monitor, hub.subscribe(), Some(gc_hub.subscribe()), sink.clone());

        for _ in 0..4 {
            hub.on_tick();
            tokio::time::advance(Duration::from_millis(50)).await;
        }
        // let the driver drain the channel before the GC arrives
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        gc_hub.publish(GcEvent::new("PS Scavenge", 8.0));
        drop(hub);
        drop(gc_hub);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(sink.contains("Tick monitor started."));
        assert!(sink.contains("Analysis is now complete."));
        assert!(sink.contains("> Average: 50 ms"));
        assert!(sink.contains("Tick #4 included GC lasting 8 ms. (type = Young Gen)"));
        assert!(handle.is_finished());
    }
}
