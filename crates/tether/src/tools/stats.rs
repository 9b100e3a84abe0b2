//! Per-tool call statistics.
//!
//! Every registered tool owns a [`ToolStatsCell`] of atomic counters. The
//! registry's dispatch path is the only writer; parallel dispatch workers
//! update the counters concurrently without a lock. Readers take a
//! [`ToolStats`] snapshot.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Point-in-time copy of one tool's counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolStats {
    pub call_count: u64,
    pub error_count: u64,
    pub total_duration: Duration,
    pub last_called_at: Option<DateTime<Utc>>,
}

impl ToolStats {
    /// Mean duration per call, zero when the tool was never called.
    pub fn average_duration(&self) -> Duration {
        if self.call_count == 0 {
            Duration::ZERO
        } else {
            let nanos = self.total_duration.as_nanos() / u128::from(self.call_count);
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
        }
    }

    /// Fraction of calls that failed, in `0.0..=1.0`.
    pub fn error_rate(&self) -> f64 {
        if self.call_count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.call_count as f64
        }
    }
}

/// Lock-free counters backing [`ToolStats`].
#[derive(Debug, Default)]
pub struct ToolStatsCell {
    call_count: AtomicU64,
    error_count: AtomicU64,
    total_duration_us: AtomicU64,
    /// Milliseconds since the epoch; 0 = never called.
    last_called_ms: AtomicI64,
}

impl ToolStatsCell {
    /// Record one completed call.
    pub fn record(&self, duration: Duration, failed: bool) {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.total_duration_us.fetch_add(micros, Ordering::Relaxed);
        self.last_called_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ToolStats {
        let last_ms = self.last_called_ms.load(Ordering::Relaxed);
        ToolStats {
            call_count: self.call_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            total_duration: Duration::from_micros(self.total_duration_us.load(Ordering::Relaxed)),
            last_called_at: if last_ms == 0 {
                None
            } else {
                Utc.timestamp_millis_opt(last_ms).single()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn record_accumulates() {
        let cell = ToolStatsCell::default();
        assert_eq!(cell.snapshot(), ToolStats::default());

        cell.record(Duration::from_millis(10), false);
        cell.record(Duration::from_millis(30), true);

        let stats = cell.snapshot();
        assert_eq!(stats.call_count, 2);
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.total_duration, Duration::from_millis(40));
        assert_eq!(stats.average_duration(), Duration::from_millis(20));
        assert!((stats.error_rate() - 0.5).abs() < f64::EPSILON);
        assert!(stats.last_called_at.is_some());
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let cell = Arc::new(ToolStatsCell::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cell = cell.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        cell.record(Duration::from_micros(1), false);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cell.snapshot().call_count, 8000);
    }

    #[test]
    fn average_survives_counts_past_u32() {
        let stats = ToolStats {
            call_count: u64::from(u32::MAX) + 1,
            total_duration: Duration::from_secs(1 << 32),
            ..ToolStats::default()
        };
        assert_eq!(stats.average_duration(), Duration::from_secs(1));
    }
}
