use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Tracks the timestamp of the last read serviced on a socket peer's
/// connection.
///
/// The multiplexer touches this on every read it pumps, at high frequency,
/// so the timestamp lives in its own watch channel rather than under the
/// structural link locks. Contention checks read it to report how long a
/// console's current writer has been idle.
///
/// Each touch increments a monotonic generation counter so observers can
/// tell "no activity" apart from "activity at the same instant".
#[derive(Clone)]
pub struct ActivityTracker {
    tx: Arc<watch::Sender<Instant>>,
    generation: Arc<AtomicU64>,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTracker {
    /// Create a new tracker seeded with the current instant.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Instant::now());
        Self {
            tx: Arc::new(tx),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record a read. Safe to call from blocking threads.
    pub fn touch(&self) {
        self.generation.fetch_add(1, Ordering::Release);
        self.tx.send_replace(Instant::now());
    }

    /// Current generation counter value.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// How long the tracked connection has gone without a read.
    pub fn idle(&self) -> Duration {
        self.tx.borrow().elapsed()
    }

    /// Subscribe to activity changes. Returns a watch receiver that gets
    /// notified each time `touch()` is called.
    pub fn subscribe(&self) -> watch::Receiver<Instant> {
        self.tx.subscribe()
    }
}

/// Render an idle duration for busy-console listings.
///
/// Shows the two most significant units, e.g. `45s`, `5m12s`, `3h04m`,
/// `2d11h`, `1w3d`.
pub fn format_idle(idle: Duration) -> String {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    const DAY: u64 = 24 * HOUR;
    const WEEK: u64 = 7 * DAY;

    let secs = idle.as_secs();
    if secs < MINUTE {
        format!("{secs}s")
    } else if secs < HOUR {
        format!("{}m{:02}s", secs / MINUTE, secs % MINUTE)
    } else if secs < DAY {
        format!("{}h{:02}m", secs / HOUR, (secs % HOUR) / MINUTE)
    } else if secs < WEEK {
        format!("{}d{}h", secs / DAY, (secs % DAY) / HOUR)
    } else {
        format!("{}w{}d", secs / WEEK, (secs % WEEK) / DAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn touch_updates_idle() {
        let tracker = ActivityTracker::new();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(tracker.idle() >= Duration::from_millis(25));
        tracker.touch();
        assert!(tracker.idle() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn touch_increments_generation() {
        let tracker = ActivityTracker::new();
        assert_eq!(tracker.generation(), 0);
        tracker.touch();
        tracker.touch();
        assert_eq!(tracker.generation(), 2);
    }

    #[tokio::test]
    async fn subscribers_observe_touches() {
        let tracker = ActivityTracker::new();
        let mut rx = tracker.subscribe();
        tracker.touch();
        assert!(rx.has_changed().unwrap());
    }

    #[test]
    fn format_seconds() {
        assert_eq!(format_idle(Duration::from_secs(0)), "0s");
        assert_eq!(format_idle(Duration::from_secs(45)), "45s");
    }

    #[test]
    fn format_minutes() {
        assert_eq!(format_idle(Duration::from_secs(5 * 60 + 12)), "5m12s");
        assert_eq!(format_idle(Duration::from_secs(60)), "1m00s");
    }

    #[test]
    fn format_hours() {
        assert_eq!(format_idle(Duration::from_secs(3 * 3600 + 4 * 60)), "3h04m");
    }

    #[test]
    fn format_days() {
        assert_eq!(
            format_idle(Duration::from_secs(2 * 86400 + 11 * 3600)),
            "2d11h"
        );
    }

    #[test]
    fn format_weeks() {
        assert_eq!(format_idle(Duration::from_secs(10 * 86400)), "1w3d");
    }
}
