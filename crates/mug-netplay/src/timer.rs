//! Named deadlines.
//!
//! Every timer in the participant core lives in a [`TimerSet`]. Arming a key
//! that is already pending replaces the old deadline, so there is never more
//! than one live timer per key.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Instant;

#[derive(Debug)]
pub struct TimerSet<K> {
    deadlines: HashMap<K, Instant>,
}

impl<K> Default for TimerSet<K> {
    fn default() -> Self {
        Self {
            deadlines: HashMap::new(),
        }
    }
}

impl<K: Copy + Eq + Hash + std::fmt::Debug> TimerSet<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `key` to fire at `deadline`. A pending timer with the same key is
    /// cancelled first.
    pub fn arm(&mut self, key: K, deadline: Instant) {
        if self.deadlines.insert(key, deadline).is_some() {
            tracing::trace!(timer = ?key, "Re-armed pending timer");
        }
    }

    /// Cancel `key`. Returns true if it was pending.
    pub fn cancel(&mut self, key: K) -> bool {
        self.deadlines.remove(&key).is_some()
    }

    pub fn cancel_all(&mut self) {
        self.deadlines.clear();
    }

    pub fn is_armed(&self, key: K) -> bool {
        self.deadlines.contains_key(&key)
    }

    pub fn deadline(&self, key: K) -> Option<Instant> {
        self.deadlines.get(&key).copied()
    }

    /// Number of pending timers.
    pub fn pending(&self) -> usize {
        self.deadlines.len()
    }

    /// Earliest pending deadline, for drivers that sleep until the next timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return the keys whose deadline is at or before `now`,
    /// earliest first.
    pub fn poll_expired(&mut self, now: Instant) -> Vec<K> {
        let mut fired: Vec<(Instant, K)> = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(k, at)| (*at, *k))
            .collect();
        fired.sort_by_key(|(at, _)| *at);
        for (_, k) in &fired {
            self.deadlines.remove(k);
        }
        fired.into_iter().map(|(_, k)| k).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum T {
        Reconnect,
        Grace,
    }

    #[test]
    fn rearming_keeps_a_single_timer() {
        let t0 = Instant::now();
        let mut timers = TimerSet::new();
        timers.arm(T::Reconnect, t0 + Duration::from_millis(100));
        timers.arm(T::Reconnect, t0 + Duration::from_millis(200));
        assert_eq!(timers.pending(), 1);

        // The first deadline was cancelled by the re-arm.
        assert!(timers.poll_expired(t0 + Duration::from_millis(150)).is_empty());
        assert_eq!(
            timers.poll_expired(t0 + Duration::from_millis(250)),
            vec![T::Reconnect]
        );
        assert!(timers.poll_expired(t0 + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn expired_in_deadline_order() {
        let t0 = Instant::now();
        let mut timers = TimerSet::new();
        timers.arm(T::Reconnect, t0 + Duration::from_millis(20));
        timers.arm(T::Grace, t0 + Duration::from_millis(10));
        assert_eq!(timers.next_deadline(), Some(t0 + Duration::from_millis(10)));
        assert_eq!(
            timers.poll_expired(t0 + Duration::from_millis(30)),
            vec![T::Grace, T::Reconnect]
        );
        assert_eq!(timers.pending(), 0);
    }

    #[test]
    fn cancel_reports_pending() {
        let mut timers = TimerSet::new();
        assert!(!timers.cancel(T::Grace));
        timers.arm(T::Grace, Instant::now());
        assert!(timers.cancel(T::Grace));
        assert!(!timers.is_armed(T::Grace));
    }
}
