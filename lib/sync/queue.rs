//! The debounce map owned by the sync worker.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::path::VirtualPath;

/// Paths waiting for their quiet period to end. Re-pushing a path restarts its timer, so a burst
/// of writes produces one sync.
#[derive(Debug)]
pub(super) struct DebounceQueue {
    delay: Duration,
    due: HashMap<VirtualPath, Instant>,
}

impl DebounceQueue {
    pub(super) fn new(delay: Duration) -> Self {
        Self {
            delay,
            due: HashMap::new(),
        }
    }

    pub(super) fn push(&mut self, vp: VirtualPath, now: Instant) {
        self.due.insert(vp, now + self.delay);
    }

    /// Schedule `vp` at `at` unless it is already due sooner.
    pub(super) fn push_at(&mut self, vp: VirtualPath, at: Instant) {
        self.due
            .entry(vp)
            .and_modify(|d| *d = (*d).min(at))
            .or_insert(at);
    }

    pub(super) fn next_deadline(&self) -> Option<Instant> {
        self.due.values().min().copied()
    }

    /// Remove and return every path whose timer has run out, in path order.
    pub(super) fn take_due(&mut self, now: Instant) -> Vec<VirtualPath> {
        let mut ready: Vec<VirtualPath> = self
            .due
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(vp, _)| vp.clone())
            .collect();
        ready.sort();
        for vp in &ready {
            self.due.remove(vp);
        }
        ready
    }

    pub(super) fn take_all(&mut self) -> Vec<VirtualPath> {
        let mut all: Vec<VirtualPath> = self.due.drain().map(|(vp, _)| vp).collect();
        all.sort();
        all
    }

    pub(super) fn len(&self) -> usize {
        self.due.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vp(s: &str) -> VirtualPath {
        VirtualPath::new(s).unwrap()
    }

    #[test]
    fn bursts_coalesce_into_one_entry() {
        let t0 = Instant::now();
        let mut q = DebounceQueue::new(Duration::from_secs(5));
        for i in 0..10 {
            q.push(vp("a"), t0 + Duration::from_millis(i * 100));
        }
        assert_eq!(q.len(), 1);
        assert_eq!(q.next_deadline(), Some(t0 + Duration::from_millis(5900)));
    }

    #[test]
    fn only_expired_timers_are_taken() {
        let t0 = Instant::now();
        let mut q = DebounceQueue::new(Duration::from_secs(5));
        q.push(vp("early"), t0);
        q.push(vp("late"), t0 + Duration::from_secs(3));
        assert!(q.take_due(t0 + Duration::from_secs(4)).is_empty());
        assert_eq!(q.take_due(t0 + Duration::from_secs(5)), vec![vp("early")]);
        assert_eq!(q.take_all(), vec![vp("late")]);
        assert_eq!(q.next_deadline(), None);
    }

    #[test]
    fn push_at_never_delays_an_earlier_deadline() {
        let t0 = Instant::now();
        let mut q = DebounceQueue::new(Duration::from_secs(5));
        q.push(vp("a"), t0);
        q.push_at(vp("a"), t0 + Duration::from_secs(60));
        assert_eq!(q.next_deadline(), Some(t0 + Duration::from_secs(5)));
        q.push_at(vp("a"), t0);
        assert_eq!(q.next_deadline(), Some(t0));
    }
}
