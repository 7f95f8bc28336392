//! Per-recipient alert cooldown.
//!
//! Check and update happen under one lock (`try_acquire`), so two dispatches
//! racing for the same recipient cannot both get through inside the window.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use stockwatch_core::traits::Clock;
use stockwatch_core::types::RecipientId;

/// Reservation of a recipient's alert slot.
///
/// Keep it after a successful send; hand it back through
/// [`RateLimiter::release`] when the send did not go through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatePermit {
    pub recipient: RecipientId,
    acquired_at: DateTime<Utc>,
    previous: Option<DateTime<Utc>>,
}

pub struct RateLimiter {
    cooldown: chrono::Duration,
    clock: Arc<dyn Clock>,
    last_sent: Mutex<HashMap<RecipientId, DateTime<Utc>>>,
}

impl RateLimiter {
    pub fn new(cooldown: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            cooldown: chrono::Duration::from_std(cooldown)
                .unwrap_or_else(|_| chrono::Duration::days(365)),
            clock,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    fn map(&self) -> MutexGuard<'_, HashMap<RecipientId, DateTime<Utc>>> {
        self.last_sent.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn within_window(&self, last: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - last < self.cooldown
    }

    /// True if an alert was recorded for `recipient` inside the window.
    pub fn is_limited(&self, recipient: RecipientId) -> bool {
        let now = self.clock.now();
        self.map()
            .get(&recipient)
            .is_some_and(|last| self.within_window(*last, now))
    }

    /// Store "now" as the recipient's last delivery.
    pub fn record_sent(&self, recipient: RecipientId) {
        let now = self.clock.now();
        self.map().insert(recipient, now);
    }

    /// Atomically check the window and, if free, claim it.
    pub fn try_acquire(&self, recipient: RecipientId) -> Option<RatePermit> {
        let now = self.clock.now();
        let mut map = self.map();
        if let Some(last) = map.get(&recipient) {
            if self.within_window(*last, now) {
                return None;
            }
        }
        let previous = map.insert(recipient, now);
        Some(RatePermit {
            recipient,
            acquired_at: now,
            previous,
        })
    }

    /// Undo a claim whose send failed. A newer claim is left untouched.
    pub fn release(&self, permit: RatePermit) {
        let mut map = self.map();
        if map.get(&permit.recipient) != Some(&permit.acquired_at) {
            return;
        }
        match permit.previous {
            Some(prev) => {
                map.insert(permit.recipient, prev);
            }
            None => {
                map.remove(&permit.recipient);
            }
        }
    }

    /// Drop entries that no longer limit anyone. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let now = self.clock.now();
        let mut map = self.map();
        let before = map.len();
        map.retain(|_, last| now - *last < self.cooldown);
        before - map.len()
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockwatch_core::traits::ManualClock;

    fn limiter() -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (RateLimiter::new(Duration::from_millis(60_000), clock.clone()), clock)
    }

    #[test]
    fn test_unknown_recipient_not_limited() {
        let (rl, _) = limiter();
        assert!(!rl.is_limited(RecipientId(42)));
    }

    #[test]
    fn test_record_then_limited_until_window_passes() {
        let (rl, clock) = limiter();
        rl.record_sent(RecipientId(42));
        assert!(rl.is_limited(RecipientId(42)));
        assert!(!rl.is_limited(RecipientId(7)));

        clock.advance(chrono::Duration::milliseconds(59_999));
        assert!(rl.is_limited(RecipientId(42)));
        clock.advance(chrono::Duration::milliseconds(1));
        assert!(!rl.is_limited(RecipientId(42)));
    }

    #[test]
    fn test_try_acquire_is_exclusive() {
        let (rl, _) = limiter();
        assert!(rl.try_acquire(RecipientId(1)).is_some());
        assert!(rl.try_acquire(RecipientId(1)).is_none());
        assert!(rl.try_acquire(RecipientId(2)).is_some());
    }

    #[test]
    fn test_release_restores_previous() {
        let (rl, clock) = limiter();
        assert!(rl.try_acquire(RecipientId(1)).is_some());
        clock.advance(chrono::Duration::seconds(61));

        let permit = rl.try_acquire(RecipientId(1)).unwrap();
        rl.release(permit);
        // The restored timestamp is the old, expired one.
        assert!(!rl.is_limited(RecipientId(1)));
        assert_eq!(rl.len(), 1);

        let permit = rl.try_acquire(RecipientId(9)).unwrap();
        rl.release(permit);
        assert_eq!(rl.len(), 1);
    }

    #[test]
    fn test_release_ignores_superseded_permit() {
        let (rl, clock) = limiter();
        let stale = rl.try_acquire(RecipientId(1)).unwrap();
        clock.advance(chrono::Duration::seconds(1));
        rl.record_sent(RecipientId(1));
        rl.release(stale);
        assert!(rl.is_limited(RecipientId(1)));
    }

    #[test]
    fn test_prune_expired() {
        let (rl, clock) = limiter();
        rl.record_sent(RecipientId(1));
        clock.advance(chrono::Duration::seconds(30));
        rl.record_sent(RecipientId(2));
        clock.advance(chrono::Duration::seconds(31));
        assert_eq!(rl.prune(), 1);
        assert!(rl.is_limited(RecipientId(2)));
        assert_eq!(rl.len(), 1);
    }

    #[test]
    fn test_concurrent_acquire_single_winner() {
        let (rl, _) = limiter();
        let rl = Arc::new(rl);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let rl = rl.clone();
                std::thread::spawn(move || rl.try_acquire(RecipientId(5)).is_some())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
