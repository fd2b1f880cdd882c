//! Run-level processing metrics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Counters and timings for one processing run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingMetrics {
    pub total_files: usize,
    pub processed_files: usize,
    pub failed_files: usize,
    /// Files served from cache instead of being parsed
    pub skipped_files: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Peak of the admission ledger
    pub peak_memory_mb: f64,
    pub recovery_count: u64,
}

impl ProcessingMetrics {
    pub fn new(total_files: usize) -> Self {
        Self {
            total_files,
            processed_files: 0,
            failed_files: 0,
            skipped_files: 0,
            started_at: Utc::now(),
            finished_at: None,
            peak_memory_mb: 0.0,
            recovery_count: 0,
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Share of attempted files that succeeded, in percent
    pub fn success_rate(&self) -> f64 {
        let attempted = self.processed_files + self.failed_files;
        if attempted == 0 {
            100.0
        } else {
            (self.processed_files as f64 / attempted as f64) * 100.0
        }
    }

    /// Wall time of the run (up to now if unfinished)
    pub fn duration(&self) -> Duration {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).to_std().unwrap_or_default()
    }

    /// Processed files per second
    pub fn throughput(&self) -> f64 {
        let secs = self.duration().as_secs_f64();
        if secs > 0.0 {
            self.processed_files as f64 / secs
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rate() {
        let mut metrics = ProcessingMetrics::new(4);
        assert_eq!(metrics.success_rate(), 100.0);

        metrics.processed_files = 3;
        metrics.failed_files = 1;
        assert_eq!(metrics.success_rate(), 75.0);
    }

    #[test]
    fn test_duration_and_throughput() {
        let mut metrics = ProcessingMetrics::new(10);
        metrics.started_at = Utc::now() - chrono::Duration::seconds(2);
        metrics.processed_files = 10;
        metrics.finish();

        assert!(metrics.duration() >= Duration::from_secs(2));
        let throughput = metrics.throughput();
        assert!(throughput > 0.0 && throughput <= 5.0);
    }
}
