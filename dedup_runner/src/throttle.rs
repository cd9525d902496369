use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

/// Window used by every loop that may fail repeatedly.
pub const WARN_INTERVAL_MS: u64 = 5_000;

/// Lets one warning through per window and counts the rest.
///
/// One throttle per failure category; windows are not shared.
#[derive(Debug)]
pub struct WarnThrottle {
    label: &'static str,
    interval_ms: u64,
    total: AtomicU64,
    suppressed: AtomicU64,
    last_log_millis: AtomicU64,
}

impl WarnThrottle {
    pub fn new(label: &'static str) -> Self {
        Self::with_interval(label, WARN_INTERVAL_MS)
    }

    pub fn with_interval(label: &'static str, interval_ms: u64) -> Self {
        Self {
            label,
            interval_ms,
            total: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
            last_log_millis: AtomicU64::new(0),
        }
    }

    /// Records one failure and emits `warn!` if the window is open.
    /// Returns whether the message was emitted.
    pub fn warn(&self, message: impl std::fmt::Display) -> bool {
        let total = self.total.fetch_add(1, Ordering::Relaxed) + 1;
        if !self.admit(current_millis()) {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let suppressed = self.suppressed.swap(0, Ordering::Relaxed);
        warn!(
            "[{}] {} (total errors={}, suppressed since last report={}), will continue",
            self.label, message, total, suppressed
        );
        true
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    fn admit(&self, now_ms: u64) -> bool {
        let last = self.last_log_millis.load(Ordering::Relaxed);
        if last != 0 && now_ms.saturating_sub(last) < self.interval_ms {
            return false;
        }
        self.last_log_millis
            .compare_exchange(last, now_ms.max(1), Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_failure_is_reported_then_window_closes() {
        let throttle = WarnThrottle::new("test");
        assert!(throttle.warn("boom"));
        assert!(!throttle.warn("boom again"));
        assert!(!throttle.warn("and again"));
        assert_eq!(throttle.total(), 3);
        assert_eq!(throttle.suppressed.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn window_reopens_after_interval() {
        let throttle = WarnThrottle::with_interval("test", 5_000);
        assert!(throttle.admit(10_000));
        assert!(!throttle.admit(14_999));
        assert!(throttle.admit(15_000));
    }

    #[test]
    fn suppressed_count_resets_when_reported() {
        let throttle = WarnThrottle::with_interval("test", 0);
        throttle.warn("one");
        throttle.suppressed.store(4, Ordering::Relaxed);
        assert!(throttle.warn("two"));
        assert_eq!(throttle.suppressed.load(Ordering::Relaxed), 0);
    }
}
