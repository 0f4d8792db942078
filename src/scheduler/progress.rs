use std::fmt;
use std::time::Duration;

/// Reported after each candidate a worker completes. Purely informational.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub worker: usize,
    pub processed: u64,
    pub total: u64,
    pub elapsed: Duration,
    /// Oracle calls spent on this candidate (0 when resolved without probing)
    pub requests: usize,
}

impl ProgressUpdate {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.processed as f64 * 100.0 / self.total as f64
    }

    /// Linear estimate from the average time per processed candidate
    pub fn remaining(&self) -> Option<Duration> {
        if self.processed == 0 {
            return None;
        }
        let left = self.total.saturating_sub(self.processed);
        let per_item = self.elapsed.as_secs_f64() / self.processed as f64;
        Some(Duration::from_secs_f64(per_item * left as f64))
    }
}

/// `worker-id: processed/total, percent%, time-remaining (requests, elapsed)`
impl fmt::Display for ProgressUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let remaining = self
            .remaining()
            .map(format_duration)
            .unwrap_or_else(|| "?".to_owned());
        write!(
            f,
            "{}: {}/{}, {:.1}%, {} ({} requests, {})",
            self.worker,
            self.processed,
            self.total,
            self.percent(),
            remaining,
            self.requests,
            format_duration(self.elapsed)
        )
    }
}

/// `1h02m03s`, `4m05s`, `6s`
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m:02}m{s:02}s")
    } else if m > 0 {
        format!("{m}m{s:02}s")
    } else {
        format!("{s}s")
    }
}
