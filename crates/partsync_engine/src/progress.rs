//! Throttled progress reporting.
//!
//! The engine produces far more events than anyone downstream wants to see;
//! emissions are capped at one per two seconds, except that phase-final
//! emissions bypass the throttle so the last numbers of a phase are never
//! lost.

use partsync_protocol::defaults::PROGRESS_THROTTLE_MS;
use partsync_protocol::types::ProgressUpdate;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub type ProgressCallback = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

pub struct ProgressThrottle {
    callback: ProgressCallback,
    min_interval: Duration,
    last_emit: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(callback: ProgressCallback) -> Self {
        Self::with_interval(callback, Duration::from_millis(PROGRESS_THROTTLE_MS))
    }

    pub fn with_interval(callback: ProgressCallback, min_interval: Duration) -> Self {
        Self {
            callback,
            min_interval,
            last_emit: None,
        }
    }

    /// Emit an update unless one was emitted within the throttle window.
    /// `force` bypasses the window for phase-final emissions. Returns
    /// whether the update went out.
    pub fn emit(&mut self, update: ProgressUpdate, force: bool) -> bool {
        let now = Instant::now();
        let due = match self.last_emit {
            Some(last) => now.duration_since(last) >= self.min_interval,
            None => true,
        };

        if force || due {
            (self.callback)(update);
            self.last_emit = Some(now);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_callback() -> (ProgressCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        let callback: ProgressCallback = Arc::new(move |_update| {
            inner.fetch_add(1, Ordering::SeqCst);
        });
        (callback, count)
    }

    #[test]
    fn updates_within_window_are_suppressed() {
        let (callback, count) = counting_callback();
        let mut throttle =
            ProgressThrottle::with_interval(callback, Duration::from_secs(60));

        assert!(throttle.emit(ProgressUpdate::default(), false));
        for _ in 0..10 {
            assert!(!throttle.emit(ProgressUpdate::default(), false));
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn forced_updates_bypass_the_window() {
        let (callback, count) = counting_callback();
        let mut throttle =
            ProgressThrottle::with_interval(callback, Duration::from_secs(60));

        assert!(throttle.emit(ProgressUpdate::default(), false));
        assert!(throttle.emit(ProgressUpdate::default(), true));
        assert!(throttle.emit(ProgressUpdate::default(), true));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn updates_flow_again_after_the_window() {
        let (callback, count) = counting_callback();
        let mut throttle =
            ProgressThrottle::with_interval(callback, Duration::from_millis(0));

        assert!(throttle.emit(ProgressUpdate::default(), false));
        assert!(throttle.emit(ProgressUpdate::default(), false));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
