use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;

pub fn now_epoch_secs() -> i64 {
    Utc::now().timestamp()
}

/// Last-seen timestamps per session. The request pipeline is the only
/// writer of new entries, the reaper the only remover.
#[derive(Default)]
pub struct ActivityTracker {
    entries: Mutex<HashMap<i64, i64>>,
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn touch(&self, session_id: i64, timestamp: i64) {
        lock_unpoisoned(&self.entries).insert(session_id, timestamp);
    }

    /// Point-in-time copy so the reaper can scan without holding the lock
    /// across its per-session work.
    pub fn snapshot(&self) -> HashMap<i64, i64> {
        lock_unpoisoned(&self.entries).clone()
    }

    pub fn remove(&self, session_id: i64) {
        lock_unpoisoned(&self.entries).remove(&session_id);
    }

    pub fn last_seen(&self, session_id: i64) -> Option<i64> {
        lock_unpoisoned(&self.entries).get(&session_id).copied()
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_overwrites_the_previous_timestamp() {
        let tracker = ActivityTracker::new();
        tracker.touch(42, 100);
        tracker.touch(42, 250);
        assert_eq!(tracker.last_seen(42), Some(250));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn snapshot_is_detached_from_later_mutation() {
        let tracker = ActivityTracker::new();
        tracker.touch(1, 10);
        let snapshot = tracker.snapshot();
        tracker.touch(2, 20);
        tracker.remove(1);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(&1), Some(&10));
    }

    #[test]
    fn remove_is_idempotent() {
        let tracker = ActivityTracker::new();
        tracker.touch(7, 1);
        tracker.remove(7);
        tracker.remove(7);
        assert!(tracker.is_empty());
    }
}
