use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Per-source sliding window admission control.
///
/// Each source keeps the instants of its admitted requests inside the
/// trailing window. A request is admitted while fewer than `max_requests`
/// instants remain after dropping those at least one window old, so a
/// slot frees up exactly one window after the admission that used it.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    entries: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
}

impl RateLimiter {
    /// Create a new rate limiter
    ///
    /// # Arguments
    /// * `max_requests` - Admissions allowed per source within one window
    /// * `window` - Length of the rolling window
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, source: IpAddr) -> bool {
        self.check_at(source, Instant::now())
    }

    /// Admit or reject one request from `source` at `now`.
    ///
    /// Rejected requests do not consume a slot.
    pub fn check_at(&self, source: IpAddr, now: Instant) -> bool {
        let mut entries = self.entries.lock();
        let admitted = entries.entry(source).or_default();
        trim(admitted, self.window, now);

        if admitted.len() >= self.max_requests {
            trace!(%source, in_window = admitted.len(), "Rate limit reached");
            return false;
        }

        admitted.push_back(now);
        true
    }

    /// Number of admissions of `source` still inside the window at `now`.
    pub fn in_window(&self, source: IpAddr, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        entries
            .get_mut(&source)
            .map(|admitted| {
                trim(admitted, self.window, now);
                admitted.len()
            })
            .unwrap_or(0)
    }

    /// Time from `now` until the oldest admission of `source` leaves the
    /// window, which is when the next slot frees up. Zero when a slot is
    /// already free.
    pub fn retry_after_at(&self, source: IpAddr, now: Instant) -> Duration {
        let mut entries = self.entries.lock();
        let Some(admitted) = entries.get_mut(&source) else {
            return Duration::ZERO;
        };
        trim(admitted, self.window, now);
        if admitted.len() < self.max_requests {
            return Duration::ZERO;
        }
        admitted
            .front()
            .map(|&oldest| (oldest + self.window).saturating_duration_since(now))
            .unwrap_or_default()
    }

    /// Drop sources with no admissions left inside the window.
    ///
    /// Returns the number of sources removed.
    pub fn compact(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, admitted| {
            trim(admitted, self.window, now);
            !admitted.is_empty()
        });
        before - entries.len()
    }

    pub fn tracked_sources(&self) -> usize {
        self.entries.lock().len()
    }
}

fn trim(admitted: &mut VecDeque<Instant>, window: Duration, now: Instant) {
    while let Some(&oldest) = admitted.front() {
        if now.saturating_duration_since(oldest) < window {
            break;
        }
        admitted.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const A: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    const B: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

    #[test]
    fn test_admits_exactly_n_per_window() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let t0 = Instant::now();

        assert!(limiter.check_at(A, t0));
        assert!(limiter.check_at(A, t0 + Duration::from_secs(10)));
        assert!(limiter.check_at(A, t0 + Duration::from_secs(20)));
        assert!(!limiter.check_at(A, t0 + Duration::from_secs(30)));

        // Other sources are independent.
        assert!(limiter.check_at(B, t0 + Duration::from_secs(30)));
    }

    #[test]
    fn test_slot_restored_one_window_after_oldest() {
        let window = Duration::from_secs(60);
        let limiter = RateLimiter::new(2, window);
        let t0 = Instant::now();

        assert!(limiter.check_at(A, t0));
        assert!(limiter.check_at(A, t0 + Duration::from_secs(30)));
        assert!(!limiter.check_at(A, t0 + window - Duration::from_millis(1)));

        // Exactly one slot comes back when the oldest admission ages out.
        assert!(limiter.check_at(A, t0 + window));
        assert!(!limiter.check_at(A, t0 + window + Duration::from_secs(1)));

        // The second slot returns one window after the second admission.
        assert!(limiter.check_at(A, t0 + Duration::from_secs(90)));
    }

    #[test]
    fn test_window_is_sliding_not_fixed() {
        let window = Duration::from_secs(60);
        let limiter = RateLimiter::new(2, window);
        let t0 = Instant::now();

        assert!(limiter.check_at(A, t0 + Duration::from_secs(50)));
        assert!(limiter.check_at(A, t0 + Duration::from_secs(55)));
        // A fixed bucket reset at t0 + 60s would admit here.
        assert!(!limiter.check_at(A, t0 + Duration::from_secs(65)));
        assert_eq!(limiter.in_window(A, t0 + Duration::from_secs(65)), 2);
        assert_eq!(limiter.in_window(A, t0 + Duration::from_secs(112)), 1);
    }

    #[test]
    fn test_retry_after_tracks_oldest_admission() {
        let window = Duration::from_secs(600);
        let limiter = RateLimiter::new(2, window);
        let t0 = Instant::now();

        assert_eq!(limiter.retry_after_at(A, t0), Duration::ZERO);
        assert!(limiter.check_at(A, t0));
        assert_eq!(limiter.retry_after_at(A, t0), Duration::ZERO);
        assert!(limiter.check_at(A, t0 + Duration::from_secs(100)));

        let now = t0 + Duration::from_secs(150);
        assert!(!limiter.check_at(A, now));
        assert_eq!(limiter.retry_after_at(A, now), Duration::from_secs(450));
        assert!(limiter.check_at(A, now + Duration::from_secs(450)));
    }

    #[test]
    fn test_compact_drops_idle_sources() {
        let window = Duration::from_secs(60);
        let limiter = RateLimiter::new(5, window);
        let t0 = Instant::now();

        limiter.check_at(A, t0);
        limiter.check_at(B, t0 + Duration::from_secs(30));
        assert_eq!(limiter.tracked_sources(), 2);

        assert_eq!(limiter.compact(t0 + window), 1);
        assert_eq!(limiter.tracked_sources(), 1);
        assert_eq!(limiter.in_window(B, t0 + window), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_uses_runtime_clock() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));

        assert!(limiter.check(A));
        assert!(!limiter.check(A));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(limiter.check(A));
    }
}
