//! Rolling tick-rate and tick-duration statistics.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::rolling_window::{RollingSummary, RollingWindow, SharedRollingWindow};
use crate::tick_monitor::TickEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TpsWindow {
    Seconds5,
    Seconds10,
    Minutes1,
    Minutes5,
    Minutes15,
}

impl TpsWindow {
    pub const ALL: [Self; 5] = [
        Self::Seconds5,
        Self::Seconds10,
        Self::Minutes1,
        Self::Minutes5,
        Self::Minutes15,
    ];

    #[must_use]
    pub const fn seconds(self) -> u64 {
        match self {
            Self::Seconds5 => 5,
            Self::Seconds10 => 10,
            Self::Minutes1 => 60,
            Self::Minutes5 => 300,
            Self::Minutes15 => 900,
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Seconds5 => "5s",
            Self::Seconds10 => "10s",
            Self::Minutes1 => "1m",
            Self::Minutes5 => "5m",
            Self::Minutes15 => "15m",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationWindow {
    Seconds10,
    Minutes1,
    Minutes5,
}

impl DurationWindow {
    pub const ALL: [Self; 3] = [Self::Seconds10, Self::Minutes1, Self::Minutes5];

    #[must_use]
    pub const fn seconds(self) -> u64 {
        match self {
            Self::Seconds10 => 10,
            Self::Minutes1 => 60,
            Self::Minutes5 => 300,
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Seconds10 => "10s",
            Self::Minutes1 => "1m",
            Self::Minutes5 => "5m",
        }
    }
}

/// TPS averages weighted by tick length, and tick-duration distributions.
///
/// Each TPS sample is `1s / Δt` weighted by `Δt`, so a window's weighted mean
/// is ticks-per-elapsed-second rather than an average of instantaneous rates.
#[derive(Debug, Clone)]
pub struct TickStatistics {
    ticks_per_second: u32,
    tps: Vec<(TpsWindow, SharedRollingWindow)>,
    durations: Vec<(DurationWindow, SharedRollingWindow)>,
    last_at: Arc<Mutex<Option<Instant>>>,
}

impl TickStatistics {
    #[must_use]
    pub fn new(ticks_per_second: u32) -> Self {
        let rate = ticks_per_second.max(1);
        let window = |secs| SharedRollingWindow::from_window(RollingWindow::for_duration(secs, rate));
        Self {
            ticks_per_second: rate,
            tps: TpsWindow::ALL
                .iter()
                .map(|w| (*w, window(w.seconds())))
                .collect(),
            durations: DurationWindow::ALL
                .iter()
                .map(|w| (*w, window(w.seconds())))
                .collect(),
            last_at: Arc::new(Mutex::new(None)),
        }
    }

    #[must_use]
    pub const fn ticks_per_second(&self) -> u32 {
        self.ticks_per_second
    }

    /// Per-tick time budget in milliseconds.
    #[must_use]
    pub fn tick_budget_ms(&self) -> f64 {
        1000.0 / f64::from(self.ticks_per_second)
    }

    pub fn record(&self, event: &TickEvent) {
        let previous = self
            .last_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(event.at);
        if let Some(previous) = previous {
            self.record_interval(event.at.saturating_duration_since(previous));
        }
        self.record_duration(event.duration);
    }

    /// Add one inter-tick interval to the TPS windows.
    pub fn record_interval(&self, delta: Duration) {
        if delta.is_zero() {
            return;
        }
        let tps = 1.0 / delta.as_secs_f64();
        for (_, window) in &self.tps {
            window.add(tps, delta);
        }
    }

    /// Add one tick's duration to the duration windows.
    pub fn record_duration(&self, duration: Duration) {
        let ms = duration.as_secs_f64() * 1000.0;
        for (_, window) in &self.durations {
            window.add_unweighted(ms);
        }
    }

    pub fn tps(&self, window: TpsWindow) -> Result<f64> {
        self.tps
            .iter()
            .find(|(w, _)| *w == window)
            .map_or_else(
                || Err(Error::InsufficientData("unknown tps window")),
                |(_, w)| w.mean(),
            )
    }

    pub fn durations(&self, window: DurationWindow) -> Result<RollingSummary> {
        self.durations
            .iter()
            .find(|(w, _)| *w == window)
            .map_or_else(
                || Err(Error::InsufficientData("unknown duration window")),
                |(_, w)| w.summary(),
            )
    }

    /// Record every tick from `events` until the stream closes.
    pub fn spawn_collector(&self, mut events: broadcast::Receiver<TickEvent>) -> JoinHandle<()> {
        let stats = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => stats.record(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Tick statistics fell behind");
                        *stats.last_at.lock().unwrap_or_else(PoisonError::into_inner) = None;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Tick stream closed; statistics collector exiting");
                        break;
                    }
                }
            }
        })
    }
}
