//! Background CPU usage sampler.
//!
//! Reads `/proc/stat` every three seconds and diffs the aggregate counters
//! against the previous sample. The first sample reports zero because there
//! is no baseline yet. Readers never block the sampler; the latest value
//! sits behind a short-lived mutex.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::warn;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(3);
const PROC_STAT: &str = "/proc/stat";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuCounters {
    pub idle: u64,
    pub total: u64,
}

#[derive(Debug, Default)]
struct GaugeState {
    prev: CpuCounters,
    usage: f64,
}

/// Latest instantaneous CPU usage, double-buffered behind a mutex.
#[derive(Debug, Default)]
pub struct CpuGauge {
    state: Mutex<GaugeState>,
}

impl CpuGauge {
    /// Current usage percentage; zero until two samples exist.
    pub fn usage(&self) -> f64 {
        self.state.lock().usage
    }

    pub fn record(&self, next: CpuCounters) {
        let mut state = self.state.lock();
        let prev = state.prev;
        if prev.total > 0 && next.total > prev.total {
            let diff_total = (next.total - prev.total) as f64;
            let diff_idle = next.idle.saturating_sub(prev.idle) as f64;
            state.usage = (diff_total - diff_idle) / diff_total * 100.0;
        }
        state.prev = next;
    }
}

pub async fn cpu_sampler_loop(
    gauge: Arc<CpuGauge>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                match tokio::fs::read_to_string(PROC_STAT).await {
                    Ok(contents) => {
                        if let Some(counters) = parse_proc_stat(&contents) {
                            gauge.record(counters);
                        }
                    }
                    Err(err) => warn!(?err, "failed to read {PROC_STAT}"),
                }
            }
        }
    }

    Ok(())
}

/// Extracts the aggregate `cpu` line counters. The idle column is the
/// fourth counter after the label.
pub fn parse_proc_stat(contents: &str) -> Option<CpuCounters> {
    for line in contents.lines() {
        let mut fields = line.split_whitespace();
        if fields.next() != Some("cpu") {
            continue;
        }

        let mut counters = CpuCounters::default();
        for (index, field) in fields.enumerate() {
            let value: u64 = field.parse().unwrap_or(0);
            counters.total += value;
            if index == 3 {
                counters.idle = value;
            }
        }
        return Some(counters);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT_FIXTURE: &str = "\
cpu  100 0 100 700 0 0 0 0 0 0
cpu0 50 0 50 350 0 0 0 0 0 0
intr 12345
";

    #[test]
    fn parses_aggregate_cpu_line() {
        let counters = parse_proc_stat(STAT_FIXTURE).expect("cpu line");
        assert_eq!(counters.total, 900);
        assert_eq!(counters.idle, 700);
    }

    #[test]
    fn missing_cpu_line_yields_none() {
        assert_eq!(parse_proc_stat("intr 1\nctxt 2\n"), None);
    }

    #[test]
    fn first_sample_reports_zero() {
        let gauge = CpuGauge::default();
        gauge.record(CpuCounters { idle: 700, total: 900 });
        assert_eq!(gauge.usage(), 0.0);
    }

    #[test]
    fn usage_is_computed_from_the_delta() {
        let gauge = CpuGauge::default();
        gauge.record(CpuCounters { idle: 700, total: 900 });
        // +100 total, +50 idle => 50% busy over the window
        gauge.record(CpuCounters { idle: 750, total: 1000 });
        let usage = gauge.usage();
        assert!((usage - 50.0).abs() < f64::EPSILON, "usage = {usage}");
    }

    #[test]
    fn counter_wraparound_does_not_panic() {
        let gauge = CpuGauge::default();
        gauge.record(CpuCounters { idle: 700, total: 900 });
        gauge.record(CpuCounters { idle: 10, total: 20 });
        // stale sample is ignored; previous usage kept
        assert_eq!(gauge.usage(), 0.0);
    }
}
