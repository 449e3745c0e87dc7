//! Health report text.

use crate::cpu::{CpuStatistics, CpuWindow};
use crate::format::{self, Formatted, TpsThresholds};
use crate::ping::PingStatistics;
use crate::tick_stats::{DurationWindow, TickStatistics, TpsWindow};

/// Shown in place of a value whose window has no samples yet.
const NO_DATA: &str = "-";

fn or_no_data(value: Option<String>) -> String {
    value.unwrap_or_else(|| NO_DATA.to_string())
}

#[must_use]
pub fn tps_lines(stats: &TickStatistics) -> Vec<String> {
    let thresholds = TpsThresholds::for_rate(stats.ticks_per_second());
    let labels: Vec<_> = TpsWindow::ALL.iter().map(|w| w.label()).collect();
    let values: Vec<String> = TpsWindow::ALL
        .iter()
        .map(|w| {
            or_no_data(
                stats
                    .tps(*w)
                    .ok()
                    .map(|v| format::tps(v, &thresholds).text),
            )
        })
        .collect();
    vec![
        format!("TPS from last {}:", labels.join(", ")),
        format!(" {}", values.join(", ")),
    ]
}

#[must_use]
pub fn tick_duration_lines(stats: &TickStatistics, windows: &[DurationWindow]) -> Vec<String> {
    let budget = stats.tick_budget_ms();
    let labels: Vec<_> = windows.iter().map(|w| w.label()).collect();
    let values: Vec<String> = windows
        .iter()
        .map(|w| {
            or_no_data(
                stats
                    .durations(*w)
                    .ok()
                    .map(|s| format::tick_durations(&s, budget)),
            )
        })
        .collect();
    vec![
        format!(
            "Tick durations (min/med/95%ile/max ms) from last {}:",
            labels.join(", ")
        ),
        format!(" {}", values.join(";  ")),
    ]
}

#[must_use]
pub fn cpu_lines(stats: &CpuStatistics) -> Vec<String> {
    let labels: Vec<_> = CpuWindow::ALL.iter().map(|w| w.label()).collect();
    let row = |load: &dyn Fn(CpuWindow) -> Option<f64>| -> String {
        CpuWindow::ALL
            .iter()
            .map(|w| or_no_data(load(*w).map(|v| format::cpu_usage(v).text)))
            .collect::<Vec<_>>()
            .join(", ")
    };
    vec![
        format!("CPU usage from last {}:", labels.join(", ")),
        format!(" {}  (system)", row(&|w| stats.system_load(w).ok())),
        format!(" {}  (process)", row(&|w| stats.process_load(w).ok())),
    ]
}

/// Ping lines; with `player`, just that player's ping.
#[must_use]
pub fn ping_lines(stats: &PingStatistics, player: Option<&str>) -> Vec<String> {
    if let Some(player) = player {
        return vec![match stats.query(player) {
            Some(rtt) => {
                let formatted: Formatted = format::ping_rtt(f64::from(rtt));
                format!("Player {player} has {formatted} ms ping.")
            }
            None => format!("Ping data is not available for '{player}'."),
        }];
    }

    let current = stats.current_summary().ok();
    let average = stats.average_summary().ok();
    if current.is_none() && average.is_none() {
        return vec![
            "There is not enough data to show ping averages yet. Please try again later."
                .to_string(),
        ];
    }
    vec![
        "Average Pings (min/med/95%ile/max ms) from now, last 15m:".to_string(),
        format!(
            " {};  {}",
            or_no_data(current.map(|s| format::ping_rtts(&s))),
            or_no_data(average.map(|s| format::ping_rtts(&s)))
        ),
    ]
}

/// Sources for the full health report; missing sources are skipped.
#[derive(Debug, Clone, Copy)]
pub struct HealthSources<'a> {
    pub ticks: Option<&'a TickStatistics>,
    pub cpu: Option<&'a CpuStatistics>,
    pub ping: Option<&'a PingStatistics>,
}

/// Every section, separated by blank lines.
#[must_use]
pub fn health_report(sources: HealthSources<'_>) -> Vec<String> {
    let mut sections: Vec<Vec<String>> = Vec::new();
    if let Some(ticks) = sources.ticks {
        sections.push(tps_lines(ticks));
        sections.push(tick_duration_lines(
            ticks,
            &[DurationWindow::Seconds10, DurationWindow::Minutes1],
        ));
    }
    if let Some(cpu) = sources.cpu {
        sections.push(cpu_lines(cpu));
    }
    if let Some(ping) = sources.ping {
        sections.push(ping_lines(ping, None));
    }

    let mut lines = Vec::new();
    for (i, section) in sections.into_iter().enumerate() {
        if i > 0 {
            lines.push(String::new());
        }
        lines.extend(section);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuLoad;
    use crate::ping::PingProvider;
    use std::collections::HashMap;
    use std::time::Duration;

    struct OnePlayer;

    impl PingProvider for OnePlayer {
        fn poll(&self) -> HashMap<String, u32> {
            HashMap::from([("Alex".to_string(), 42)])
        }
    }

    #[test]
    fn tps_section() {
        let stats = TickStatistics::new(20);
        for _ in 0..10 {
            stats.record_interval(Duration::from_millis(50));
        }
        let lines = tps_lines(&stats);
        assert_eq!(lines[0], "TPS from last 5s, 10s, 1m, 5m, 15m:");
        assert_eq!(lines[1], " 20, 20, 20, 20, 20");
    }

    #[test]
    fn empty_sections_show_placeholders() {
        let stats = TickStatistics::new(20);
        assert_eq!(tps_lines(&stats)[1], " -, -, -, -, -");
        let durations =
            tick_duration_lines(&stats, &[DurationWindow::Seconds10, DurationWindow::Minutes1]);
        assert_eq!(
            durations[0],
            "Tick durations (min/med/95%ile/max ms) from last 10s, 1m:"
        );
        assert_eq!(durations[1], " -;  -");
    }

    #[test]
    fn cpu_section() {
        let stats = CpuStatistics::new(Duration::from_secs(1));
        stats.record(CpuLoad {
            system: 0.5,
            process: 0.25,
        });
        let lines = cpu_lines(&stats);
        assert_eq!(lines[0], "CPU usage from last 10s, 1m, 15m:");
        assert_eq!(lines[1], " 50%, 50%, 50%  (system)");
        assert_eq!(lines[2], " 25%, 25%, 25%  (process)");
    }

    #[test]
    fn ping_section() {
        let stats = PingStatistics::new(Duration::from_secs(1));
        assert_eq!(
            ping_lines(&stats, None),
            vec!["There is not enough data to show ping averages yet. Please try again later."]
        );
        assert_eq!(
            ping_lines(&stats, Some("Alex")),
            vec!["Ping data is not available for 'Alex'."]
        );

        stats.poll_once(&OnePlayer);
        assert_eq!(ping_lines(&stats, Some("alex")), vec!["Player alex has 42 ms ping."]);
        let lines = ping_lines(&stats, None);
        assert_eq!(lines[0], "Average Pings (min/med/95%ile/max ms) from now, last 15m:");
        assert_eq!(lines[1], " 42/42/42/42;  42/42/42/42");
    }

    #[test]
    fn full_report_separates_sections() {
        let ticks = TickStatistics::new(20);
        let ping = PingStatistics::new(Duration::from_secs(1));
        let lines = health_report(HealthSources {
            ticks: Some(&ticks),
            cpu: None,
            ping: Some(&ping),
        });
        assert_eq!(lines.len(), 2 + 1 + 2 + 1 + 1);
        assert_eq!(lines[2], "");
        assert_eq!(lines[5], "");
    }
}
