//! Player ping statistics.
//!
//! The host exposes current round-trip times through [`PingProvider`]. A
//! polling task snapshots them periodically; each poll's median feeds a
//! 15-minute rolling average.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Error, Result};
use crate::rolling_window::{RollingSummary, RollingWindow, SharedRollingWindow};

/// Seconds covered by the rolling ping average.
const AVERAGE_WINDOW_SECS: u64 = 15 * 60;

/// Current round-trip time per player, in milliseconds.
pub trait PingProvider: Send + Sync {
    fn poll(&self) -> HashMap<String, u32>;
}

#[derive(Debug, Clone)]
pub struct PingStatistics {
    average: SharedRollingWindow,
    latest: Arc<Mutex<HashMap<String, u32>>>,
    poll_interval: Duration,
}

impl PingStatistics {
    #[must_use]
    pub fn new(poll_interval: Duration) -> Self {
        let poll_interval = poll_interval.max(Duration::from_secs(1));
        let polls = AVERAGE_WINDOW_SECS / poll_interval.as_secs().max(1);
        Self {
            average: SharedRollingWindow::from_window(RollingWindow::for_duration(polls, 1)),
            latest: Arc::new(Mutex::new(HashMap::new())),
            poll_interval,
        }
    }

    fn latest(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take one snapshot from `provider`.
    pub fn poll_once(&self, provider: &dyn PingProvider) {
        let values = provider.poll();
        if let Ok(summary) = summarize(values.values().copied()) {
            self.average.add_unweighted(summary.median);
        }
        *self.latest() = values;
    }

    /// Distribution of the most recent poll.
    pub fn current_summary(&self) -> Result<RollingSummary> {
        let values: Vec<u32> = self.latest().values().copied().collect();
        summarize(values)
    }

    /// Distribution of per-poll medians over the last 15 minutes.
    pub fn average_summary(&self) -> Result<RollingSummary> {
        self.average.summary()
    }

    /// Last known ping of `player` (case-insensitive).
    #[must_use]
    pub fn query(&self, player: &str) -> Option<u32> {
        self.latest()
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(player))
            .map(|(_, rtt)| *rtt)
    }

    pub fn spawn(&self, provider: Arc<dyn PingProvider>) -> JoinHandle<()> {
        let stats = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(stats.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                stats.poll_once(provider.as_ref());
                debug!(players = stats.latest().len(), "Ping statistics polled");
            }
        })
    }
}

fn summarize(values: impl IntoIterator<Item = u32>) -> Result<RollingSummary> {
    let values: Vec<u32> = values.into_iter().collect();
    if values.is_empty() {
        return Err(Error::InsufficientData("no ping data"));
    }
    let mut window = RollingWindow::new(values.len());
    for v in values {
        window.add_unweighted(f64::from(v));
    }
    window.summary()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedPings(Mutex<HashMap<String, u32>>);

    impl FixedPings {
        fn new(pairs: &[(&str, u32)]) -> Self {
            Self(Mutex::new(
                pairs.iter().map(|(n, p)| ((*n).to_string(), *p)).collect(),
            ))
        }

        fn set(&self, pairs: &[(&str, u32)]) {
            *self.0.lock().unwrap() = pairs.iter().map(|(n, p)| ((*n).to_string(), *p)).collect();
        }
    }

    impl PingProvider for FixedPings {
        fn poll(&self) -> HashMap<String, u32> {
            self.0.lock().unwrap().clone()
        }
    }

    #[test]
    fn no_data_before_first_poll() {
        let stats = PingStatistics::new(Duration::from_secs(1));
        assert!(stats.current_summary().is_err());
        assert!(stats.average_summary().is_err());
        assert_eq!(stats.query("alex"), None);
    }

    #[test]
    fn current_summary_and_query() {
        let stats = PingStatistics::new(Duration::from_secs(1));
        let provider = FixedPings::new(&[("Alex", 20), ("Sam", 80), ("Kai", 250)]);
        stats.poll_once(&provider);

        let summary = stats.current_summary().unwrap();
        assert_eq!(summary.count, 3);
        assert!((summary.min - 20.0).abs() < 1e-9);
        assert!((summary.median - 80.0).abs() < 1e-9);
        assert!((summary.max - 250.0).abs() < 1e-9);
        assert_eq!(stats.query("alex"), Some(20));
        assert_eq!(stats.query("nobody"), None);
    }

    #[test]
    fn average_tracks_poll_medians() {
        let stats = PingStatistics::new(Duration::from_secs(1));
        let provider = FixedPings::new(&[("a", 10), ("b", 30)]);
        stats.poll_once(&provider);
        provider.set(&[("a", 50)]);
        stats.poll_once(&provider);
        // medians 20 and 50
        let avg = stats.average_summary().unwrap();
        assert_eq!(avg.count, 2);
        assert!((avg.mean - 35.0).abs() < 1e-9);

        // an empty poll clears current data but keeps the average
        provider.set(&[]);
        stats.poll_once(&provider);
        assert!(stats.current_summary().is_err());
        assert_eq!(stats.average_summary().unwrap().count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_task_runs_on_interval() {
        let stats = PingStatistics::new(Duration::from_secs(1));
        let provider = Arc::new(FixedPings::new(&[("a", 40)]));
        let task = stats.spawn(provider);
        tokio::time::sleep(Duration::from_millis(3500)).await;
        task.abort();
        // immediate first tick plus three more
        assert_eq!(stats.average_summary().unwrap().count, 4);
    }
}
