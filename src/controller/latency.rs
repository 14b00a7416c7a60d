//! Inter-arrival latency tracking for input reports.
//!
//! Records the gap between consecutive report arrivals and summarizes every
//! 100 samples as average / jitter / min / max. Useful for comparing USB
//! (~4 ms gaps) against BLE (~15-30 ms depending on the negotiated connection
//! interval). Disabled by default; a disabled monitor does nothing on
//! `record`, so frame delivery is unaffected either way.

use std::time::Instant;

/// Samples per emitted window.
pub const WINDOW_LEN: usize = 100;

/// Summary over one full window, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyStats {
    pub avg_ms: f64,
    pub jitter_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

#[derive(Debug)]
pub struct LatencyMonitor {
    enabled: bool,
    last_arrival: Option<Instant>,
    gaps_ms: Vec<f64>,
}

impl LatencyMonitor {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            last_arrival: None,
            gaps_ms: Vec::with_capacity(if enabled { WINDOW_LEN } else { 0 }),
        }
    }

    /// Records one arrival. Returns the window summary when the 100th gap
    /// lands, then starts a fresh window.
    pub fn record(&mut self, arrival: Instant) -> Option<LatencyStats> {
        if !self.enabled {
            return None;
        }

        let stats = if let Some(last) = self.last_arrival {
            let gap_ms = arrival.duration_since(last).as_secs_f64() * 1000.0;
            self.gaps_ms.push(gap_ms);
            if self.gaps_ms.len() == WINDOW_LEN {
                let summary = summarize(&self.gaps_ms);
                self.gaps_ms.clear();
                Some(summary)
            } else {
                None
            }
        } else {
            None
        };

        self.last_arrival = Some(arrival);
        stats
    }
}

fn summarize(gaps_ms: &[f64]) -> LatencyStats {
    let count = gaps_ms.len() as f64;
    let avg_ms = gaps_ms.iter().sum::<f64>() / count;
    let jitter_ms = (gaps_ms
        .iter()
        .map(|gap| (gap - avg_ms) * (gap - avg_ms))
        .sum::<f64>()
        / count)
        .sqrt();
    let min_ms = gaps_ms.iter().copied().fold(f64::INFINITY, f64::min);
    let max_ms = gaps_ms.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    LatencyStats {
        avg_ms,
        jitter_ms,
        min_ms,
        max_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn emits_after_full_window_and_resets() {
        let mut monitor = LatencyMonitor::new(true);
        let start = Instant::now();

        // First arrival has no predecessor, so it produces no gap.
        assert!(monitor.record(start).is_none());

        let mut at = start;
        for i in 0..WINDOW_LEN {
            at += Duration::from_millis(4);
            let stats = monitor.record(at);
            if i == WINDOW_LEN - 1 {
                let stats = stats.expect("summary at window boundary");
                assert!((stats.avg_ms - 4.0).abs() < 0.01);
                assert!(stats.jitter_ms < 0.01);
                assert!((stats.min_ms - 4.0).abs() < 0.01);
                assert!((stats.max_ms - 4.0).abs() < 0.01);
            } else {
                assert!(stats.is_none());
            }
        }

        // The window restarts: another 99 gaps stay quiet.
        for _ in 0..WINDOW_LEN - 1 {
            at += Duration::from_millis(4);
            assert!(monitor.record(at).is_none());
        }
        at += Duration::from_millis(4);
        assert!(monitor.record(at).is_some());
    }

    #[test]
    fn uneven_gaps_produce_jitter_and_range() {
        let mut monitor = LatencyMonitor::new(true);
        let start = Instant::now();
        monitor.record(start);

        let mut at = start;
        let mut last = None;
        for i in 0..WINDOW_LEN {
            let gap = if i % 2 == 0 { 2 } else { 6 };
            at += Duration::from_millis(gap);
            last = monitor.record(at);
        }
        let stats = last.unwrap();
        assert!((stats.avg_ms - 4.0).abs() < 0.01);
        assert!((stats.jitter_ms - 2.0).abs() < 0.01);
        assert!((stats.min_ms - 2.0).abs() < 0.01);
        assert!((stats.max_ms - 6.0).abs() < 0.01);
    }

    #[test]
    fn disabled_monitor_stays_silent() {
        let mut monitor = LatencyMonitor::new(false);
        let mut at = Instant::now();
        for _ in 0..WINDOW_LEN * 2 {
            at += Duration::from_millis(4);
            assert!(monitor.record(at).is_none());
        }
    }
}
