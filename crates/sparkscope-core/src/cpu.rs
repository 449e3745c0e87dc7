//! CPU usage windows for the whole system and for this process.
//!
//! - **Linux**: [`ProcStatCpuSource`] diffs `/proc/stat` and
//!   `/proc/self/stat` jiffies between polls.
//! - **Other**: the proc source reports no data; hosts can plug in their own
//!   [`CpuLoadSource`].

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Error, Result};
use crate::rolling_window::{RollingWindow, SharedRollingWindow};

// =============================================================================
// Load source
// =============================================================================

/// CPU usage since the previous sample, as fractions in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CpuLoad {
    pub system: f64,
    pub process: f64,
}

pub trait CpuLoadSource: Send + Sync {
    /// Usage since the previous call. The first call may report
    /// `InsufficientData`.
    fn sample(&self) -> Result<CpuLoad>;
}

/// Aggregate jiffies from the `cpu` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuTimes {
    pub total: u64,
    pub idle: u64,
}

/// Parse the aggregate `cpu` line: `cpu user nice system idle iowait irq
/// softirq steal ...`. Idle time includes iowait.
#[must_use]
pub fn parse_proc_stat(contents: &str) -> Option<CpuTimes> {
    let line = contents.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(str::parse)
        .collect::<std::result::Result<_, _>>()
        .ok()?;
    if fields.len() < 4 {
        return None;
    }
    // guest time is already counted in user/nice
    let total = fields.iter().take(8).sum();
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes { total, idle })
}

/// Parse `utime + stime` jiffies from `/proc/self/stat`. The command name
/// (field 2) may contain spaces, so fields are counted after the last `)`.
#[must_use]
pub fn parse_proc_self_stat(contents: &str) -> Option<u64> {
    let rest = &contents[contents.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // rest starts at field 3 (state); utime and stime are fields 14 and 15
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

/// Load computed from two consecutive readings.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn load_between(
    before: (CpuTimes, u64),
    after: (CpuTimes, u64),
) -> Option<CpuLoad> {
    let total = after.0.total.checked_sub(before.0.total)?;
    if total == 0 {
        return None;
    }
    let idle = after.0.idle.saturating_sub(before.0.idle).min(total);
    let process = after.1.saturating_sub(before.1);
    let total = total as f64;
    Some(CpuLoad {
        system: ((total - idle as f64) / total).clamp(0.0, 1.0),
        process: (process as f64 / total).clamp(0.0, 1.0),
    })
}

/// Reads procfs on Linux.
#[derive(Debug, Default)]
pub struct ProcStatCpuSource {
    previous: Mutex<Option<(CpuTimes, u64)>>,
}

impl ProcStatCpuSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(target_os = "linux")]
    fn read() -> Result<(CpuTimes, u64)> {
        let stat = std::fs::read_to_string("/proc/stat")?;
        let own = std::fs::read_to_string("/proc/self/stat")?;
        let times = parse_proc_stat(&stat)
            .ok_or_else(|| Error::CaptureFailure("unrecognised /proc/stat".to_string()))?;
        let process = parse_proc_self_stat(&own)
            .ok_or_else(|| Error::CaptureFailure("unrecognised /proc/self/stat".to_string()))?;
        Ok((times, process))
    }

    #[cfg(not(target_os = "linux"))]
    fn read() -> Result<(CpuTimes, u64)> {
        Err(Error::CaptureFailure(
            "CPU usage is only available on Linux".to_string(),
        ))
    }
}

impl CpuLoadSource for ProcStatCpuSource {
    fn sample(&self) -> Result<CpuLoad> {
        let current = Self::read()?;
        let previous = self
            .previous
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(current);
        previous
            .and_then(|before| load_between(before, current))
            .ok_or(Error::InsufficientData("first CPU sample"))
    }
}

// =============================================================================
// Windows
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CpuWindow {
    Seconds10,
    Minutes1,
    Minutes15,
}

impl CpuWindow {
    pub const ALL: [Self; 3] = [Self::Seconds10, Self::Minutes1, Self::Minutes15];

    #[must_use]
    pub const fn seconds(self) -> u64 {
        match self {
            Self::Seconds10 => 10,
            Self::Minutes1 => 60,
            Self::Minutes15 => 900,
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Seconds10 => "10s",
            Self::Minutes1 => "1m",
            Self::Minutes15 => "15m",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CpuStatistics {
    poll_interval: Duration,
    system: Vec<(CpuWindow, SharedRollingWindow)>,
    process: Vec<(CpuWindow, SharedRollingWindow)>,
}

impl CpuStatistics {
    #[must_use]
    pub fn new(poll_interval: Duration) -> Self {
        let poll_interval = poll_interval.max(Duration::from_secs(1));
        let step = poll_interval.as_secs().max(1);
        let windows = || {
            CpuWindow::ALL
                .iter()
                .map(|w| {
                    let polls = (w.seconds() / step).max(1);
                    (*w, SharedRollingWindow::from_window(RollingWindow::for_duration(polls, 1)))
                })
                .collect()
        };
        Self {
            poll_interval,
            system: windows(),
            process: windows(),
        }
    }

    pub fn record(&self, load: CpuLoad) {
        for (_, w) in &self.system {
            w.add_unweighted(load.system);
        }
        for (_, w) in &self.process {
            w.add_unweighted(load.process);
        }
    }

    fn mean_of(windows: &[(CpuWindow, SharedRollingWindow)], window: CpuWindow) -> Result<f64> {
        windows
            .iter()
            .find(|(w, _)| *w == window)
            .ok_or(Error::InsufficientData("unknown cpu window"))?
            .1
            .mean()
    }

    pub fn system_load(&self, window: CpuWindow) -> Result<f64> {
        Self::mean_of(&self.system, window)
    }

    pub fn process_load(&self, window: CpuWindow) -> Result<f64> {
        Self::mean_of(&self.process, window)
    }

    /// Poll `source` on the configured interval until aborted.
    pub fn spawn(&self, source: Arc<dyn CpuLoadSource>) -> JoinHandle<()> {
        let stats = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(stats.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match source.sample() {
                    Ok(load) => stats.record(load),
                    Err(e) => debug!(error = %e, "CPU sample unavailable"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROC_STAT: &str = "cpu  100 0 50 800 50 0 0 0 0 0\n\
                             cpu0 50 0 25 400 25 0 0 0 0 0\n\
                             intr 12345\n";

    #[test]
    fn parses_aggregate_cpu_line() {
        let times = parse_proc_stat(PROC_STAT).unwrap();
        assert_eq!(times.total, 1000);
        assert_eq!(times.idle, 850);
        assert!(parse_proc_stat("garbage").is_none());
    }

    #[test]
    fn parses_process_times_with_spaces_in_name() {
        let stat = "4242 (my (weird) proc) S 1 4242 4242 0 -1 4194560 100 0 0 0 37 13 0 0 20 0 1 0";
        assert_eq!(parse_proc_self_stat(stat), Some(50));
        assert_eq!(parse_proc_self_stat("4242 (x) S"), None);
    }

    #[test]
    fn load_from_deltas() {
        let before = (CpuTimes { total: 1000, idle: 800 }, 10);
        let after = (CpuTimes { total: 1200, idle: 900 }, 60);
        let load = load_between(before, after).unwrap();
        assert!((load.system - 0.5).abs() < 1e-9);
        assert!((load.process - 0.25).abs() < 1e-9);
        assert!(load_between(after, after).is_none());
    }

    #[test]
    fn windows_average_samples() {
        let stats = CpuStatistics::new(Duration::from_secs(1));
        assert!(stats.system_load(CpuWindow::Seconds10).is_err());
        for i in 0..20 {
            stats.record(CpuLoad {
                system: if i < 10 { 0.0 } else { 1.0 },
                process: 0.5,
            });
        }
        // 10s window only holds the last ten (busy) samples
        assert!((stats.system_load(CpuWindow::Seconds10).unwrap() - 1.0).abs() < 1e-9);
        assert!((stats.system_load(CpuWindow::Minutes1).unwrap() - 0.5).abs() < 1e-9);
        assert!((stats.process_load(CpuWindow::Minutes15).unwrap() - 0.5).abs() < 1e-9);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn proc_source_needs_two_samples() {
        let source = ProcStatCpuSource::new();
        assert!(matches!(source.sample(), Err(Error::InsufficientData(_))));
        std::thread::sleep(Duration::from_millis(20));
        // a second read either yields a load or no elapsed jiffies yet
        match source.sample() {
            Ok(load) => {
                assert!((0.0..=1.0).contains(&load.system));
                assert!((0.0..=1.0).contains(&load.process));
            }
            Err(e) => assert!(e.is_transient()),
        }
    }
}
