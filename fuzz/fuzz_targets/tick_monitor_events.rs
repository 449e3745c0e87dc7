#![no_main]

use libfuzzer_sys::fuzz_target;
use sparkscope_core::gc::GcEvent;
use sparkscope_core::tick_monitor::{
    MonitorAlert, MonitorEvent, MonitorPhase, ReportPredicate, TickGcMonitor,
};

// Each byte is one event: high bit set means a GC, otherwise a tick whose
// gap from the previous tick is the low bits in milliseconds.
fuzz_target!(|data: &[u8]| {
    let Some((&setup, events)) = data.split_first() else {
        return;
    };
    let setup_ticks = u32::from(setup % 32) + 1;
    let mut monitor = TickGcMonitor::new(ReportPredicate::PercentIncrease(100.0), setup_ticks, 0);

    let mut index = 0u64;
    let mut at_ms = 0.0f64;
    let mut setup_completions = 0;
    let mut monitoring_seen = false;

    for &byte in events {
        let event = if byte & 0x80 != 0 {
            MonitorEvent::Gc(GcEvent::new("G1 Old Generation", f64::from(byte & 0x7f)))
        } else {
            index += 1;
            at_ms += f64::from(byte);
            MonitorEvent::Tick { index, at_ms }
        };

        for alert in monitor.handle(&event) {
            match alert {
                MonitorAlert::SetupComplete { min_ms, max_ms, average_ms } => {
                    setup_completions += 1;
                    assert!(min_ms <= average_ms + 1e-9 && average_ms <= max_ms + 1e-9);
                }
                MonitorAlert::SlowTick { duration_ms, percent_increase, .. } => {
                    assert!(monitoring_seen || setup_completions == 1);
                    assert!(duration_ms.is_finite() && percent_increase > 100.0);
                }
                MonitorAlert::GcDuringTick { .. } => {
                    // Setup swallows GCs; before the first tick and in Monitoring they are reported
                    assert_ne!(monitor.phase(), Some(MonitorPhase::Setup));
                }
                MonitorAlert::Started { .. } | MonitorAlert::MonitoringStarted(_) => {}
            }
            for line in alert.lines() {
                assert!(!line.contains("NaN"));
            }
        }

        if monitor.phase() == Some(MonitorPhase::Monitoring) {
            monitoring_seen = true;
            assert!(monitor.average_tick_ms().is_some());
        }
        assert!(setup_completions <= 1);
    }
});
