use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Success/failure units since the previous snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorDelta {
    pub success: u64,
    pub failure: u64,
}

/// Throughput counters for one business stream
///
/// Senders bump the counters concurrently with atomic adds. A poller calls
/// [`Monitor::snapshot`] to get the delta since its previous call; the stored
/// snapshot sits behind a mutex so two pollers cannot double-count.
#[derive(Debug, Default)]
pub struct Monitor {
    success: AtomicU64,
    failure: AtomicU64,
    last: Mutex<(u64, u64)>,
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, units: u64) {
        self.success.fetch_add(units, Ordering::Relaxed);
    }

    pub fn record_failure(&self, units: u64) {
        self.failure.fetch_add(units, Ordering::Relaxed);
    }

    /// Lifetime totals as `(success, failure)`
    pub fn totals(&self) -> (u64, u64) {
        (
            self.success.load(Ordering::Relaxed),
            self.failure.load(Ordering::Relaxed),
        )
    }

    /// Delta since the previous snapshot; advances the stored snapshot
    pub fn snapshot(&self) -> MonitorDelta {
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let (success, failure) = self.totals();
        let delta = MonitorDelta {
            success: success.saturating_sub(last.0),
            failure: failure.saturating_sub(last.1),
        };
        *last = (success, failure);
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_snapshot_delta() {
        let monitor = Monitor::new();
        assert_eq!(monitor.snapshot(), MonitorDelta::default());

        monitor.record_success(300);
        monitor.record_success(300);
        monitor.record_failure(300);
        assert_eq!(
            monitor.snapshot(),
            MonitorDelta {
                success: 600,
                failure: 300
            }
        );

        // Nothing new since the last poll
        assert_eq!(monitor.snapshot(), MonitorDelta::default());

        monitor.record_failure(5);
        assert_eq!(monitor.snapshot().failure, 5);
        assert_eq!(monitor.totals(), (600, 305));
    }

    #[test]
    fn test_concurrent_increments() {
        let monitor = Arc::new(Monitor::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let monitor = Arc::clone(&monitor);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        monitor.record_success(3);
                        monitor.record_failure(1);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(
            monitor.snapshot(),
            MonitorDelta {
                success: 24_000,
                failure: 8_000
            }
        );
    }
}
