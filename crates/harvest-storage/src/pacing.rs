use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Enforces a minimum interval between consecutive navigations.
#[derive(Debug)]
pub struct FetchPacer {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl FetchPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// Sleeps until `min_interval` has passed since the previous call returned.
    /// The first call never waits.
    pub async fn wait(&self) -> Duration {
        let mut last = self.last.lock().await;
        let mut waited = Duration::ZERO;
        if let Some(previous) = *last {
            let due = previous + self.min_interval;
            let now = Instant::now();
            if due > now {
                waited = due - now;
                tokio::time::sleep_until(due).await;
            }
        }
        *last = Some(Instant::now());
        waited
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn second_call_waits_for_the_interval() {
        let pacer = FetchPacer::new(Duration::from_secs(2));
        assert_eq!(pacer.wait().await, Duration::ZERO);
        let waited = pacer.wait().await;
        assert!(waited > Duration::from_millis(1900));
        assert!(waited <= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn zero_interval_never_waits() {
        let pacer = FetchPacer::new(Duration::ZERO);
        pacer.wait().await;
        assert_eq!(pacer.wait().await, Duration::ZERO);
    }
}
