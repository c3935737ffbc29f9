use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::Instant;

/// Failed-authentication cooldown, keyed by source address.
///
/// After a failure, every request from the same source is refused until
/// `cooldown` has passed, whatever token it presents.
#[derive(Debug)]
pub struct Backoff {
    cooldown: Duration,
    last_failure: Mutex<HashMap<IpAddr, Instant>>,
}

impl Backoff {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_failure: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_failure_at(&self, source: IpAddr, now: Instant) {
        self.last_failure.lock().insert(source, now);
    }

    pub fn is_cooling_down_at(&self, source: IpAddr, now: Instant) -> bool {
        self.remaining_at(source, now).is_some()
    }

    /// Time left in the cooldown of `source`, `None` when it is not cooling down.
    pub fn remaining_at(&self, source: IpAddr, now: Instant) -> Option<Duration> {
        let last = *self.last_failure.lock().get(&source)?;
        let elapsed = now.saturating_duration_since(last);
        (elapsed < self.cooldown).then(|| self.cooldown - elapsed)
    }

    /// Forget failures older than the cooldown. Returns how many were removed.
    pub fn compact(&self, now: Instant) -> usize {
        let mut failures = self.last_failure.lock();
        let before = failures.len();
        failures.retain(|_, last| now.saturating_duration_since(*last) < self.cooldown);
        before - failures.len()
    }

    pub fn tracked_sources(&self) -> usize {
        self.last_failure.lock().len()
    }
}
