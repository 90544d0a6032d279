use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

pub const ETA_WINDOW: usize = 50;

/// Processed/total counts and an ETA from the rolling mean of the most
/// recent record durations.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total: usize,
    processed: usize,
    window: VecDeque<Duration>,
    capacity: usize,
}

impl ProgressTracker {
    pub fn new(total: usize, window: usize) -> Self {
        let capacity = window.max(1);
        Self {
            total,
            processed: 0,
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, elapsed: Duration) {
        self.processed += 1;
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(elapsed);
    }

    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.processed)
    }

    pub fn average(&self) -> Option<Duration> {
        if self.window.is_empty() {
            return None;
        }
        let sum: Duration = self.window.iter().sum();
        Some(sum / self.window.len() as u32)
    }

    pub fn eta(&self) -> Option<Duration> {
        self.average().map(|avg| avg * self.remaining() as u32)
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.processed as f64 * 100.0 / self.total as f64
    }
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m:02}m {s:02}s")
    } else if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{s}s")
    }
}

impl fmt::Display for ProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({:.1}%)", self.processed, self.total, self.percent())?;
        if let Some(eta) = self.eta() {
            write!(f, ", eta {}", format_duration(eta))?;
        }
        Ok(())
    }
}
