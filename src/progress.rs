//! Progress reporting for long rewrites.

use tracing::info;

/// Default reporting step, in percent of the expected total.
pub const DEFAULT_STEP_PERCENT: u64 = 10;

/// Logs progress each time another step of the expected total is reached.
#[derive(Debug)]
pub struct ProgressReporter {
    total: u64,
    processed: u64,
    step_percent: u64,
    last_step: u64,
    reports: u64,
}

impl ProgressReporter {
    /// Creates a reporter expecting `total` units of work.
    pub fn new(total: u64) -> Self {
        Self::with_step_percent(total, DEFAULT_STEP_PERCENT)
    }

    /// Creates a reporter that logs every `step_percent` percent.
    pub fn with_step_percent(total: u64, step_percent: u64) -> Self {
        Self {
            total,
            processed: 0,
            step_percent: step_percent.clamp(1, 100),
            last_step: 0,
            reports: 0,
        }
    }

    /// Records `n` more processed units.
    pub fn advance(&mut self, n: u64) {
        self.processed = self.processed.saturating_add(n);
        if self.total == 0 {
            return;
        }

        let percent = (self.processed.saturating_mul(100) / self.total).min(100);
        let step = percent / self.step_percent;
        if step > self.last_step {
            self.last_step = step;
            self.reports += 1;
            info!(
                processed = self.processed,
                total = self.total,
                percent,
                "series processed"
            );
        }
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Number of progress lines emitted so far.
    pub fn reports(&self) -> u64 {
        self.reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_once_per_step() {
        let mut progress = ProgressReporter::new(1000);
        for _ in 0..1000 {
            progress.advance(1);
        }
        assert_eq!(progress.processed(), progress.total());
        assert_eq!(progress.reports(), 10);
    }

    #[test]
    fn test_large_advance_reports_once() {
        let mut progress = ProgressReporter::new(10);
        progress.advance(10);
        assert_eq!(progress.reports(), 1);
    }

    #[test]
    fn test_zero_total_never_reports() {
        let mut progress = ProgressReporter::new(0);
        progress.advance(5);
        assert_eq!(progress.processed(), 5);
        assert_eq!(progress.reports(), 0);
    }

    #[test]
    fn test_overshooting_total_does_not_report_again() {
        let mut progress = ProgressReporter::with_step_percent(4, 50);
        progress.advance(2);
        progress.advance(2);
        assert_eq!(progress.reports(), 2);
        progress.advance(1);
        assert_eq!(progress.reports(), 2);
    }
}
