use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Sliding-window frame rate over recorded monotonic timestamps.
pub struct WindowedFpsCalculator {
    timestamps: VecDeque<u64>,
    window_ns: u64,
}

impl WindowedFpsCalculator {
    /// Panics if the window is zero.
    pub fn new(window: Duration) -> Self {
        assert!(!window.is_zero(), "window size must be positive");
        Self {
            timestamps: VecDeque::new(),
            window_ns: window.as_nanos() as u64,
        }
    }

    pub fn record(&mut self, timestamp_ns: u64) {
        self.timestamps.push_back(timestamp_ns);
        while self
            .timestamps
            .front()
            .is_some_and(|&oldest| timestamp_ns.saturating_sub(oldest) > self.window_ns)
        {
            self.timestamps.pop_front();
        }
    }

    /// 0.0 until at least two frames fall inside the window.
    pub fn fps(&self) -> f64 {
        if self.timestamps.len() < 2 {
            return 0.0;
        }
        let first = *self.timestamps.front().unwrap_or(&0);
        let last = *self.timestamps.back().unwrap_or(&0);
        if last <= first {
            return 0.0;
        }
        (self.timestamps.len() - 1) as f64 * 1_000_000_000.0 / (last - first) as f64
    }

    pub fn reset(&mut self) {
        self.timestamps.clear();
    }
}

/// Point-in-time copy of the pipeline counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    pub captured: u64,
    pub converted: u64,
    pub convert_failures: u64,
    pub dropped: u64,
    pub published: u64,
    pub skipped: u64,
    pub capture_fps: f64,
}

/// Counters shared by the pipeline workers. Reset at session start; the
/// drop counter is copied over from the router by the reporter task and
/// once more at teardown.
pub struct PipelineMetrics {
    captured: AtomicU64,
    converted: AtomicU64,
    convert_failures: AtomicU64,
    dropped: AtomicU64,
    published: AtomicU64,
    skipped: AtomicU64,
    capture_fps: Mutex<WindowedFpsCalculator>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            captured: AtomicU64::new(0),
            converted: AtomicU64::new(0),
            convert_failures: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            published: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            capture_fps: Mutex::new(WindowedFpsCalculator::new(Duration::from_secs(1))),
        }
    }

    fn fps(&self) -> MutexGuard<'_, WindowedFpsCalculator> {
        self.capture_fps.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_captured(&self, timestamp_ns: u64) {
        self.captured.fetch_add(1, Ordering::Relaxed);
        self.fps().record(timestamp_ns);
    }

    pub fn record_converted(&self) {
        self.converted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_convert_failure(&self) {
        self.convert_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_dropped(&self, dropped: u64) {
        self.dropped.store(dropped, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            captured: self.captured.load(Ordering::Relaxed),
            converted: self.converted.load(Ordering::Relaxed),
            convert_failures: self.convert_failures.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            capture_fps: self.fps().fps(),
        }
    }

    pub fn reset(&self) {
        self.captured.store(0, Ordering::Relaxed);
        self.converted.store(0, Ordering::Relaxed);
        self.convert_failures.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
        self.published.store(0, Ordering::Relaxed);
        self.skipped.store(0, Ordering::Relaxed);
        self.fps().reset();
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND_NS: u64 = 1_000_000_000;

    #[test]
    fn no_timestamps_yields_zero_fps() {
        let calc = WindowedFpsCalculator::new(Duration::from_secs(1));
        assert_eq!(calc.fps(), 0.0);
    }

    #[test]
    fn one_timestamp_yields_zero_fps() {
        let mut calc = WindowedFpsCalculator::new(Duration::from_secs(1));
        calc.record(123);
        assert_eq!(calc.fps(), 0.0);
    }

    #[test]
    fn two_timestamps_one_second_apart_yield_one_fps() {
        let mut calc = WindowedFpsCalculator::new(Duration::from_secs(2));
        calc.record(0);
        calc.record(SECOND_NS);
        assert!((calc.fps() - 1.0).abs() < 0.01);
    }

    #[test]
    fn three_timestamps_over_one_second_yield_two_fps() {
        let mut calc = WindowedFpsCalculator::new(Duration::from_secs(2));
        calc.record(0);
        calc.record(SECOND_NS / 2);
        calc.record(SECOND_NS);
        assert!((calc.fps() - 2.0).abs() < 0.01);
    }

    #[test]
    fn sixty_fps_stream_measures_sixty() {
        let mut calc = WindowedFpsCalculator::new(Duration::from_millis(1500));
        let interval = SECOND_NS / 60;
        for i in 0..=60 {
            calc.record(i * interval);
        }
        assert!((calc.fps() - 60.0).abs() < 0.01);
    }

    #[test]
    fn old_timestamps_fall_out_of_the_window() {
        let mut calc = WindowedFpsCalculator::new(Duration::from_secs(1));
        let interval = 100_000_000; // 10 fps
        for i in 0..10 {
            calc.record(i * interval);
        }
        assert!((calc.fps() - 10.0).abs() < 0.01);

        // Keep recording; rate should hold steady as the window slides.
        for i in 10..22 {
            calc.record(i * interval);
            assert!((calc.fps() - 10.0).abs() < 0.1);
        }
    }

    #[test]
    fn irregular_timestamps_average_over_the_window() {
        let mut calc = WindowedFpsCalculator::new(Duration::from_secs(1));
        calc.record(0);
        calc.record(100_000_000);
        calc.record(600_000_000);
        calc.record(800_000_000);
        // 4 frames over 0.8 s -> 3 intervals / 0.8 s = 3.75 fps.
        assert!((calc.fps() - 3.75).abs() < 0.01);
    }

    #[test]
    fn reset_clears_the_window() {
        let mut calc = WindowedFpsCalculator::new(Duration::from_secs(1));
        calc.record(0);
        calc.record(SECOND_NS / 2);
        calc.reset();
        assert_eq!(calc.fps(), 0.0);
    }

    #[test]
    #[should_panic(expected = "window size must be positive")]
    fn zero_window_panics() {
        WindowedFpsCalculator::new(Duration::ZERO);
    }

    #[test]
    fn snapshot_reflects_recorded_counters() {
        let metrics = PipelineMetrics::new();
        metrics.record_captured(0);
        metrics.record_captured(SECOND_NS / 30);
        metrics.record_converted();
        metrics.record_published();
        metrics.record_skipped();
        metrics.set_dropped(4);

        let snap = metrics.snapshot();
        assert_eq!(snap.captured, 2);
        assert_eq!(snap.converted, 1);
        assert_eq!(snap.published, 1);
        assert_eq!(snap.skipped, 1);
        assert_eq!(snap.dropped, 4);
        assert!(snap.capture_fps > 0.0);

        metrics.reset();
        assert_eq!(metrics.snapshot().captured, 0);
        assert_eq!(metrics.snapshot().capture_fps, 0.0);
    }
}
