//! Plain-text formatting for statistics.
//!
//! Colour and markup belong to the display collaborator, so every formatter
//! here returns the text together with a [`Severity`] the renderer can map to
//! a colour.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::rolling_window::RollingSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Good,
    Warning,
    Critical,
}

/// A formatted value and how alarming it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Formatted {
    pub text: String,
    pub severity: Severity,
}

impl Formatted {
    fn new(text: String, severity: Severity) -> Self {
        Self { text, severity }
    }
}

impl fmt::Display for Formatted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Join formatted values with a separator.
#[must_use]
pub fn join(values: &[Formatted], sep: &str) -> String {
    values
        .iter()
        .map(|v| v.text.as_str())
        .collect::<Vec<_>>()
        .join(sep)
}

// =============================================================================
// Statistic formatters
// =============================================================================

/// TPS colouring bands, derived from the expected tick rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TpsThresholds {
    pub good_above: f64,
    pub warning_above: f64,
    /// Displayed values are capped here.
    pub cap: f64,
    /// Values above this are flagged with `*` (the server is catching up).
    pub flag_above: f64,
}

impl TpsThresholds {
    #[must_use]
    pub fn for_rate(ticks_per_second: u32) -> Self {
        let rate = f64::from(ticks_per_second);
        Self {
            good_above: rate * 0.9,
            warning_above: rate * 0.8,
            cap: rate,
            flag_above: rate * 1.05,
        }
    }
}

#[must_use]
pub fn tps(value: f64, thresholds: &TpsThresholds) -> Formatted {
    let severity = if value > thresholds.good_above {
        Severity::Good
    } else if value > thresholds.warning_above {
        Severity::Warning
    } else {
        Severity::Critical
    };
    let flag = if value > thresholds.flag_above { "*" } else { "" };
    let shown = ((value * 100.0).round() / 100.0).min(thresholds.cap);
    Formatted::new(format!("{flag}{}", decimal(shown)), severity)
}

/// Tick duration in ms against the per-tick budget (`1000 / tps`).
#[must_use]
pub fn tick_duration(ms: f64, budget_ms: f64) -> Formatted {
    let severity = if ms >= budget_ms {
        Severity::Critical
    } else if ms >= budget_ms * 0.8 {
        Severity::Warning
    } else {
        Severity::Good
    };
    Formatted::new(format!("{ms:.1}"), severity)
}

/// `min/med/95%ile/max` of a tick-duration window.
#[must_use]
pub fn tick_durations(summary: &RollingSummary, budget_ms: f64) -> String {
    join(
        &[
            tick_duration(summary.min, budget_ms),
            tick_duration(summary.median, budget_ms),
            tick_duration(summary.p95, budget_ms),
            tick_duration(summary.max, budget_ms),
        ],
        "/",
    )
}

/// CPU usage as a fraction in `[0, 1]`.
#[must_use]
pub fn cpu_usage(usage: f64) -> Formatted {
    let severity = if usage > 0.9 {
        Severity::Critical
    } else if usage > 0.65 {
        Severity::Warning
    } else {
        Severity::Good
    };
    Formatted::new(percent(usage, 1.0), severity)
}

#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn ping_rtt(ms: f64) -> Formatted {
    let severity = if ms >= 200.0 {
        Severity::Critical
    } else if ms >= 100.0 {
        Severity::Warning
    } else {
        Severity::Good
    };
    Formatted::new(format!("{}", ms.ceil() as i64), severity)
}

/// `min/med/95%ile/max` of ping round-trip times.
#[must_use]
pub fn ping_rtts(summary: &RollingSummary) -> String {
    join(
        &[
            ping_rtt(summary.min),
            ping_rtt(summary.median),
            ping_rtt(summary.p95),
            ping_rtt(summary.max),
        ],
        "/",
    )
}

// =============================================================================
// Units
// =============================================================================

/// Up to two decimal places, trailing zeros dropped (`12.5`, `3`, `0.07`).
#[must_use]
pub fn decimal(value: f64) -> String {
    let rounded = (value * 100.0).round() / 100.0;
    let text = format!("{rounded:.2}");
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text == "-0" {
        "0".to_string()
    } else {
        text.to_string()
    }
}

/// Whole-number percentage of `value / total`.
#[must_use]
pub fn percent(value: f64, total: f64) -> String {
    if total <= 0.0 {
        return "0%".to_string();
    }
    format!("{:.0}%", value * 100.0 / total)
}

const BYTE_UNITS: [&str; 5] = ["bytes", "KB", "MB", "GB", "TB"];

#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn bytes(value: u64) -> String {
    if value < 1024 {
        return format!("{value} bytes");
    }
    let mut exp = 0;
    let mut scaled = value as f64;
    while scaled >= 1024.0 && exp < BYTE_UNITS.len() - 1 {
        scaled /= 1024.0;
        exp += 1;
    }
    format!("{scaled:.1} {}", BYTE_UNITS[exp])
}

/// `1h 2m 3s` style; zero units are omitted, zero overall is `0s`.
#[must_use]
pub fn seconds(total: u64) -> String {
    if total == 0 {
        return "0s".to_string();
    }
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;
    let mut parts = Vec::with_capacity(3);
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 {
        parts.push(format!("{minutes}m"));
    }
    if secs > 0 {
        parts.push(format!("{secs}s"));
    }
    parts.join(" ")
}
