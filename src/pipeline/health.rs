//! Health monitoring and metrics for the engines

use chrono::{DateTime, Utc};
use log::{info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use crate::utils::sos::SignalOfStop;

/// Health metrics for one engine
///
/// All fields use atomic operations so the engine thread records while the
/// reporter and status queries read.
pub struct EngineHealth {
    /// Frames committed (capture) or handed to the device (playout)
    pub frames_processed: AtomicU64,

    /// Video bytes moved
    pub bytes_processed: AtomicU64,

    /// Transfers the device rejected
    pub transfer_failures: AtomicU64,

    /// Ring full (capture) or ring empty (playout) after a full wait
    pub ring_backpressure: AtomicU64,

    /// Frames pulled off the device and thrown away
    pub frames_discarded: AtomicU64,

    /// Polls that found the device not ready
    pub device_waits: AtomicU64,

    /// Drop counter last reported by the device
    pub device_dropped: AtomicU64,

    /// Device buffer level at the last poll
    pub device_level: AtomicU64,

    /// Timestamp (Unix microseconds) of the last processed frame
    pub last_frame_time: AtomicI64,
}

fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

impl EngineHealth {
    pub fn new() -> Self {
        Self {
            frames_processed: AtomicU64::new(0),
            bytes_processed: AtomicU64::new(0),
            transfer_failures: AtomicU64::new(0),
            ring_backpressure: AtomicU64::new(0),
            frames_discarded: AtomicU64::new(0),
            device_waits: AtomicU64::new(0),
            device_dropped: AtomicU64::new(0),
            device_level: AtomicU64::new(0),
            last_frame_time: AtomicI64::new(now_micros()),
        }
    }

    pub fn record_frame(&self, size: usize) {
        self.last_frame_time.store(now_micros(), Ordering::Relaxed);
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        self.bytes_processed.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn record_transfer_failure(&self) {
        self.transfer_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backpressure(&self) {
        self.ring_backpressure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discard(&self) {
        self.frames_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_device_wait(&self) {
        self.device_waits.fetch_add(1, Ordering::Relaxed);
    }

    /// Latest device counters from a status poll.
    pub fn observe_device(&self, dropped: u64, level: u16) {
        self.device_dropped.store(dropped, Ordering::Relaxed);
        self.device_level.store(u64::from(level), Ordering::Relaxed);
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed.load(Ordering::Relaxed)
    }

    pub fn transfer_failures(&self) -> u64 {
        self.transfer_failures.load(Ordering::Relaxed)
    }

    pub fn ring_backpressure(&self) -> u64 {
        self.ring_backpressure.load(Ordering::Relaxed)
    }

    pub fn frames_discarded(&self) -> u64 {
        self.frames_discarded.load(Ordering::Relaxed)
    }

    pub fn device_waits(&self) -> u64 {
        self.device_waits.load(Ordering::Relaxed)
    }

    pub fn device_dropped(&self) -> u64 {
        self.device_dropped.load(Ordering::Relaxed)
    }

    pub fn device_level(&self) -> u64 {
        self.device_level.load(Ordering::Relaxed)
    }

    /// Frames lost for any reason: dropped by the device or discarded here.
    pub fn frames_dropped(&self) -> u64 {
        self.device_dropped() + self.frames_discarded()
    }

    pub fn last_frame_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_micros(self.last_frame_time.load(Ordering::Relaxed))
    }

    /// Dropped frames as a percentage of everything seen
    pub fn frame_drop_rate(&self) -> f64 {
        let drops = self.frames_dropped();
        let total = drops + self.frames_processed();
        if total == 0 {
            return 0.0;
        }
        (drops as f64 / total as f64) * 100.0
    }

    /// No frame for longer than `threshold`
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        let elapsed = now_micros().saturating_sub(self.last_frame_time.load(Ordering::Relaxed));
        elapsed > threshold.as_micros() as i64
    }

    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            frames_processed: self.frames_processed(),
            frames_dropped: self.frames_dropped(),
            transfer_failures: self.transfer_failures(),
            ring_backpressure: self.ring_backpressure(),
            device_waits: self.device_waits(),
            bytes_processed: self.bytes_processed(),
            frame_drop_rate: self.frame_drop_rate(),
        }
    }
}

impl Default for EngineHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSummary {
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub transfer_failures: u64,
    pub ring_backpressure: u64,
    pub device_waits: u64,
    pub bytes_processed: u64,
    pub frame_drop_rate: f64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} frames ({} dropped, {:.2}%), {} transfer failures, {} ring waits, {} device waits, {} bytes",
            self.frames_processed,
            self.frames_dropped,
            self.frame_drop_rate,
            self.transfer_failures,
            self.ring_backpressure,
            self.device_waits,
            self.bytes_processed
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HealthAlert {
    /// No frames for the stall threshold
    Stalled { duration: Duration },

    HighDropRate { rate: f64 },

    /// New transfer failures since the last check
    TransferFailures { count: u64 },
}

impl std::fmt::Display for HealthAlert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthAlert::Stalled { duration } => {
                write!(f, "stalled for {:?}", duration)
            }
            HealthAlert::HighDropRate { rate } => {
                write!(f, "high frame drop rate: {:.2}%", rate)
            }
            HealthAlert::TransferFailures { count } => {
                write!(f, "{} new transfer failures", count)
            }
        }
    }
}

struct Watched {
    name: &'static str,
    health: Arc<EngineHealth>,
    last_failures: u64,
}

/// Periodic health reporter
///
/// Logs a summary line per engine every interval and warns on alerts.
pub struct HealthMonitor {
    engines: Vec<Watched>,
    check_interval: Duration,
    stall_threshold: Duration,
    drop_rate_threshold: f64,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            engines: Vec::new(),
            check_interval: Duration::from_secs(5),
            stall_threshold: Duration::from_secs(2),
            drop_rate_threshold: 10.0, // 10% drop rate
        }
    }

    pub fn watch(mut self, name: &'static str, health: Arc<EngineHealth>) -> Self {
        self.engines.push(Watched {
            name,
            health,
            last_failures: 0,
        });
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = threshold;
        self
    }

    pub fn with_drop_rate_threshold(mut self, threshold: f64) -> Self {
        self.drop_rate_threshold = threshold;
        self
    }

    /// One pass over every watched engine.
    pub fn check(&mut self) -> Vec<(&'static str, HealthAlert)> {
        let mut alerts = Vec::new();
        for engine in &mut self.engines {
            if engine.health.is_stalled(self.stall_threshold) {
                alerts.push((
                    engine.name,
                    HealthAlert::Stalled {
                        duration: self.stall_threshold,
                    },
                ));
            }

            let rate = engine.health.frame_drop_rate();
            if rate > self.drop_rate_threshold {
                alerts.push((engine.name, HealthAlert::HighDropRate { rate }));
            }

            let failures = engine.health.transfer_failures();
            if failures > engine.last_failures {
                alerts.push((
                    engine.name,
                    HealthAlert::TransferFailures {
                        count: failures - engine.last_failures,
                    },
                ));
                engine.last_failures = failures;
            }
        }
        alerts
    }

    /// Report until `sos` is cancelled (blocking loop).
    pub fn run(&mut self, sos: &SignalOfStop) {
        while !sos.wait_timeout(self.check_interval) {
            for engine in &self.engines {
                info!("{}: {}", engine.name, engine.health.summary());
            }
            for (name, alert) in self.check() {
                warn!("{}: {}", name, alert);
            }
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_metrics() {
        let health = EngineHealth::new();

        health.record_frame(1000);
        health.record_frame(2000);
        health.record_frame(1500);

        assert_eq!(health.frames_processed(), 3);
        assert_eq!(health.bytes_processed(), 4500);
        assert_eq!(health.frames_dropped(), 0);

        health.record_discard();
        health.observe_device(2, 5);

        assert_eq!(health.frames_dropped(), 3);
        assert_eq!(health.device_level(), 5);
        assert!((health.frame_drop_rate() - 50.0).abs() < f64::EPSILON);
        assert!(health.last_frame_time().is_some());
    }

    #[test]
    fn test_stall_detection() {
        let health = EngineHealth::new();

        assert!(!health.is_stalled(Duration::from_secs(1)));

        health.record_frame(1000);
        std::thread::sleep(Duration::from_millis(150));

        assert!(health.is_stalled(Duration::from_millis(100)));
    }

    #[test]
    fn test_monitor_reports_new_failures_once() {
        let health = Arc::new(EngineHealth::new());
        let mut monitor = HealthMonitor::new()
            .watch("CaptureEngine", Arc::clone(&health))
            .with_stall_threshold(Duration::from_secs(60));

        health.record_frame(10);
        assert!(monitor.check().is_empty());

        health.record_transfer_failure();
        health.record_transfer_failure();
        let alerts = monitor.check();
        assert_eq!(
            alerts,
            vec![("CaptureEngine", HealthAlert::TransferFailures { count: 2 })]
        );
        assert!(monitor.check().is_empty());
    }

    #[test]
    fn test_monitor_stops_on_cancel() {
        let sos = SignalOfStop::new();
        let mut monitor = HealthMonitor::new()
            .watch("PlayoutEngine", Arc::new(EngineHealth::new()))
            .with_check_interval(Duration::from_millis(5));
        let stopper = sos.clone();
        let handle = std::thread::spawn(move || monitor.run(&stopper));
        std::thread::sleep(Duration::from_millis(30));
        sos.cancel();
        handle.join().unwrap();
    }
}
