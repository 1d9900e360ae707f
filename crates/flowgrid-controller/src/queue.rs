//! WorkQueue — deduplicating step queue with per-step serialization.
//!
//! A key is in at most one of three places: waiting in `ready`, being
//! reconciled (`active`), or neither. Adding a key that is active marks it
//! dirty instead, and it is queued again when its reconcile finishes. Failed
//! reconciles come back after an exponential backoff.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use flowgrid_state::StepKey;

const BASE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Delay before retry number `failures` (1-based): 1s, 2s, 4s, ... capped at 60s.
pub fn backoff(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(6);
    BASE_BACKOFF.saturating_mul(1 << exponent).min(MAX_BACKOFF)
}

#[derive(Debug, Default)]
pub struct WorkQueue {
    ready: VecDeque<StepKey>,
    queued: HashSet<StepKey>,
    active: HashSet<StepKey>,
    dirty: HashSet<StepKey>,
    failures: HashMap<StepKey, u32>,
    retries: HashMap<StepKey, Instant>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a step for reconciliation.
    pub fn add(&mut self, key: StepKey) {
        if self.active.contains(&key) {
            self.dirty.insert(key);
        } else if self.queued.insert(key.clone()) {
            self.ready.push_back(key);
        }
    }

    /// Take the next step to reconcile and mark it active.
    pub fn pop(&mut self) -> Option<StepKey> {
        let key = self.ready.pop_front()?;
        self.queued.remove(&key);
        self.active.insert(key.clone());
        Some(key)
    }

    /// Record the end of a reconcile. Returns the backoff applied on failure.
    pub fn done(&mut self, key: &StepKey, succeeded: bool, now: Instant) -> Option<Duration> {
        self.active.remove(key);
        let delay = if succeeded {
            self.failures.remove(key);
            self.retries.remove(key);
            None
        } else {
            let failures = self.failures.entry(key.clone()).or_insert(0);
            *failures += 1;
            let delay = backoff(*failures);
            self.retries.insert(key.clone(), now + delay);
            Some(delay)
        };
        if self.dirty.remove(key) {
            self.add(key.clone());
        }
        delay
    }

    /// Queue every step whose retry is due.
    pub fn promote_due(&mut self, now: Instant) {
        let due: Vec<StepKey> = self
            .retries
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in due {
            self.retries.remove(&key);
            self.add(key);
        }
    }

    /// Earliest pending retry, if any.
    pub fn next_retry(&self) -> Option<Instant> {
        self.retries.values().min().copied()
    }

    pub fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.active.is_empty()
    }

    pub fn active(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> StepKey {
        StepKey::new("default", name)
    }

    #[test]
    fn backoff_doubles_up_to_a_minute() {
        assert_eq!(backoff(1), Duration::from_secs(1));
        assert_eq!(backoff(2), Duration::from_secs(2));
        assert_eq!(backoff(3), Duration::from_secs(4));
        assert_eq!(backoff(6), Duration::from_secs(32));
        assert_eq!(backoff(7), Duration::from_secs(60));
        assert_eq!(backoff(50), Duration::from_secs(60));
    }

    #[test]
    fn duplicate_adds_collapse() {
        let mut q = WorkQueue::new();
        q.add(key("a"));
        q.add(key("a"));
        q.add(key("b"));
        assert_eq!(q.pop(), Some(key("a")));
        assert_eq!(q.pop(), Some(key("b")));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn active_key_is_not_handed_out_twice() {
        let mut q = WorkQueue::new();
        q.add(key("a"));
        assert_eq!(q.pop(), Some(key("a")));
        q.add(key("a"));
        assert_eq!(q.pop(), None);

        q.done(&key("a"), true, Instant::now());
        assert_eq!(q.pop(), Some(key("a")));
    }

    #[test]
    fn failures_back_off_and_reset_on_success() {
        let mut q = WorkQueue::new();
        let start = Instant::now();
        q.add(key("a"));
        q.pop();
        assert_eq!(q.done(&key("a"), false, start), Some(Duration::from_secs(1)));
        assert_eq!(q.next_retry(), Some(start + Duration::from_secs(1)));

        q.promote_due(start);
        assert_eq!(q.pop(), None);
        q.promote_due(start + Duration::from_secs(1));
        assert_eq!(q.pop(), Some(key("a")));
        assert_eq!(q.done(&key("a"), false, start), Some(Duration::from_secs(2)));

        q.promote_due(start + Duration::from_secs(2));
        q.pop();
        assert_eq!(q.done(&key("a"), true, start), None);
        assert_eq!(q.next_retry(), None);

        q.add(key("a"));
        q.pop();
        assert_eq!(q.done(&key("a"), false, start), Some(Duration::from_secs(1)));
    }

    #[test]
    fn idle_tracks_ready_and_active() {
        let mut q = WorkQueue::new();
        assert!(q.is_idle());
        q.add(key("a"));
        assert!(!q.is_idle());
        q.pop();
        assert_eq!(q.active(), 1);
        q.done(&key("a"), true, Instant::now());
        assert!(q.is_idle());
    }
}
