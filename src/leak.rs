//! Sampling leak detection for outstanding buffers.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::config::LeakConfig;

struct Sample {
    capacity: usize,
    direct: bool,
    created: Instant,
    backtrace: Backtrace,
}

/// A sampled buffer that has been outstanding for too long.
#[derive(Debug, Clone)]
pub struct LeakReport {
    /// Allocation serial of the buffer within its pool.
    pub serial: u64,
    /// Requested capacity in bytes.
    pub capacity: usize,
    /// Whether the buffer lives in direct memory.
    pub direct: bool,
    /// How long the buffer has been outstanding.
    pub age: Duration,
    /// Allocation backtrace, when captured (see `RUST_BACKTRACE`).
    pub backtrace: Option<String>,
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "buffer #{} ({} bytes, {}) outstanding for {:?}",
            self.serial,
            self.capacity,
            if self.direct { "direct" } else { "heap" },
            self.age
        )?;
        if let Some(backtrace) = &self.backtrace {
            write!(f, "\nallocated at:\n{backtrace}")?;
        }
        Ok(())
    }
}

/// Tracks every `sample_interval`-th allocation until it is returned.
///
/// Tracking costs one map insert per sampled allocation; nothing is done for
/// the others.
pub struct LeakDetector {
    interval: u64,
    samples: HashMap<u64, Sample>,
}

impl LeakDetector {
    /// Creates a detector from a validated configuration.
    #[must_use]
    pub fn new(config: &LeakConfig) -> Self {
        Self {
            interval: config.sample_interval.max(1),
            samples: HashMap::new(),
        }
    }

    /// Starts tracking allocation `serial` if it falls on the sampling
    /// interval.
    pub fn track(&mut self, serial: u64, capacity: usize, direct: bool) {
        if serial % self.interval != 0 {
            return;
        }
        self.samples.insert(
            serial,
            Sample {
                capacity,
                direct,
                created: Instant::now(),
                backtrace: Backtrace::capture(),
            },
        );
    }

    /// Stops tracking `serial`; a no-op for unsampled allocations.
    pub fn untrack(&mut self, serial: u64) {
        self.samples.remove(&serial);
    }

    /// Number of sampled buffers still outstanding.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.samples.len()
    }

    /// Reports, and logs, every sample outstanding for at least `older_than`.
    ///
    /// Reports are ordered by serial.
    pub fn scan(&self, older_than: Duration) -> Vec<LeakReport> {
        let now = Instant::now();
        let mut reports: Vec<_> = self
            .samples
            .iter()
            .filter(|(_, sample)| now.duration_since(sample.created) >= older_than)
            .map(|(&serial, sample)| report(serial, sample, now))
            .collect();
        reports.sort_unstable_by_key(|report| report.serial);
        for report in &reports {
            warn!(
                serial = report.serial,
                capacity = report.capacity,
                direct = report.direct,
                age = ?report.age,
                "possible buffer leak: {report}"
            );
        }
        reports
    }
}

fn report(serial: u64, sample: &Sample, now: Instant) -> LeakReport {
    LeakReport {
        serial,
        capacity: sample.capacity,
        direct: sample.direct,
        age: now.duration_since(sample.created),
        backtrace: (sample.backtrace.status() == BacktraceStatus::Captured)
            .then(|| sample.backtrace.to_string()),
    }
}

impl Drop for LeakDetector {
    fn drop(&mut self) {
        if !self.samples.is_empty() {
            warn!(
                outstanding = self.samples.len(),
                "pool dropped with sampled buffers still outstanding"
            );
            self.scan(Duration::ZERO);
        }
    }
}

impl fmt::Debug for LeakDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeakDetector")
            .field("interval", &self.interval)
            .field("outstanding", &self.samples.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampling_interval() {
        let mut detector = LeakDetector::new(&LeakConfig { sample_interval: 4 });
        for serial in 1..=12 {
            detector.track(serial, 64, true);
        }
        assert_eq!(detector.outstanding(), 3);

        detector.untrack(8);
        detector.untrack(9);
        assert_eq!(detector.outstanding(), 2);
    }

    #[test]
    fn test_scan_reports_old_samples() {
        let mut detector = LeakDetector::new(&LeakConfig { sample_interval: 1 });
        detector.track(2, 100, false);
        detector.track(1, 50, true);

        let reports = detector.scan(Duration::ZERO);
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].serial, 1);
        assert!(reports[0].direct);
        assert_eq!(reports[1].capacity, 100);
        assert!(reports[1].to_string().starts_with("buffer #2 (100 bytes, heap)"));

        assert!(detector.scan(Duration::from_secs(3600)).is_empty());
    }
}
