//! Latency and throughput statistics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use log::debug;
use parking_lot::Mutex;

/// Aggregated latency of one probe point.
#[derive(Debug, Clone, Copy)]
pub struct LatencyStatistic {
    /// Units recorded.
    pub unit_cnt: u32,
    /// Sum of recorded values, in milliseconds.
    pub total: f64,
    /// Largest recorded value.
    pub max: f32,
    /// Smallest recorded value.
    pub min: f32,
}

impl Default for LatencyStatistic {
    fn default() -> Self {
        Self { unit_cnt: 0, total: 0.0, max: 0.0, min: f32::MAX }
    }
}

impl LatencyStatistic {
    pub fn record(&mut self, unit_cnt: u32, value: f32) {
        self.unit_cnt += unit_cnt;
        self.total += value as f64;
        if value > self.max {
            self.max = value;
        }
        if value < self.min {
            self.min = value;
        }
    }

    /// Mean value per unit, 0 when nothing was recorded.
    pub fn average(&self) -> f64 {
        if self.unit_cnt == 0 { 0.0 } else { self.total / self.unit_cnt as f64 }
    }
}

/// Request and item throughput of one session.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThroughputStatistic {
    /// Total requests responded.
    pub request_cnt: u32,
    /// Total items responded.
    pub unit_cnt: u32,
    /// Requests per second since session start.
    pub rps: f32,
    /// Items per second since session start.
    pub ups: f32,
    /// Requests per second over the last update window.
    pub rps_rt: f32,
    /// Items per second over the last update window.
    pub ups_rt: f32,
}

/// Tagged latency aggregation.
#[derive(Default)]
pub(crate) struct LatencyRecorder {
    stats: Mutex<HashMap<String, LatencyStatistic>>,
}

impl LatencyRecorder {
    pub(crate) fn record(&self, name: &str, unit_cnt: u32, value: f32) {
        let mut stats = self.stats.lock();
        stats.entry(name.to_string()).or_default().record(unit_cnt, value);
    }

    pub(crate) fn performance(&self) -> HashMap<String, LatencyStatistic> {
        self.stats.lock().clone()
    }

    pub(crate) fn log_performance(&self, owner: &str) {
        for (name, stat) in self.stats.lock().iter() {
            debug!(
                "[{owner}] {name}: cnt {} | avg {:.3} ms | max {:.3} ms | min {:.3} ms",
                stat.unit_cnt,
                stat.average(),
                stat.max,
                if stat.unit_cnt == 0 { 0.0 } else { stat.min },
            );
        }
    }
}

struct Window {
    start: Instant,
    requests: u32,
    units: u32,
    rps: f32,
    ups: f32,
}

/// Session throughput counter with a realtime window refreshed by the
/// perf timer.
pub(crate) struct Profiler {
    start: Instant,
    total_requests: AtomicU32,
    total_units: AtomicU32,
    window: Mutex<Window>,
}

impl Default for Profiler {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            total_requests: AtomicU32::new(0),
            total_units: AtomicU32::new(0),
            window: Mutex::new(Window { start: now, requests: 0, units: 0, rps: 0.0, ups: 0.0 }),
        }
    }
}

impl Profiler {
    pub(crate) fn request_end(&self, units: u32) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_units.fetch_add(units, Ordering::Relaxed);
        let mut window = self.window.lock();
        window.requests += 1;
        window.units += units;
    }

    /// Close the realtime window and start a fresh one.
    pub(crate) fn update(&self) {
        let mut window = self.window.lock();
        let secs = window.start.elapsed().as_secs_f32();
        if secs > 0.0 {
            window.rps = window.requests as f32 / secs;
            window.ups = window.units as f32 / secs;
        }
        window.requests = 0;
        window.units = 0;
        window.start = Instant::now();
    }

    pub(crate) fn summary(&self) -> ThroughputStatistic {
        let secs = self.start.elapsed().as_secs_f32().max(f32::EPSILON);
        let requests = self.total_requests.load(Ordering::Relaxed);
        let units = self.total_units.load(Ordering::Relaxed);
        let window = self.window.lock();
        ThroughputStatistic {
            request_cnt: requests,
            unit_cnt: units,
            rps: requests as f32 / secs,
            ups: units as f32 / secs,
            rps_rt: window.rps,
            ups_rt: window.ups,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_tracks_extremes() {
        let mut stat = LatencyStatistic::default();
        stat.record(1, 5.0);
        stat.record(2, 1.0);
        stat.record(1, 9.0);
        assert_eq!(stat.unit_cnt, 4);
        assert_eq!(stat.max, 9.0);
        assert_eq!(stat.min, 1.0);
        assert!((stat.average() - 15.0 / 4.0).abs() < 1e-9);
    }

    #[test]
    fn recorder_aggregates_by_name() {
        let rec = LatencyRecorder::default();
        rec.record("Predictor", 4, 2.0);
        rec.record("Predictor", 4, 4.0);
        rec.record("RequestLatency", 1, 10.0);
        let perf = rec.performance();
        assert_eq!(perf["Predictor"].unit_cnt, 8);
        assert_eq!(perf["RequestLatency"].unit_cnt, 1);
    }

    #[test]
    fn profiler_counts_requests_and_units() {
        let prof = Profiler::default();
        prof.request_end(8);
        prof.request_end(2);
        let sum = prof.summary();
        assert_eq!(sum.request_cnt, 2);
        assert_eq!(sum.unit_cnt, 10);
        prof.update();
        let sum = prof.summary();
        assert_eq!(sum.request_cnt, 2);
    }
}
