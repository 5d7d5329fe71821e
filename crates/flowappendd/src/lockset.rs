//! Hourly-file lock (§4.10 step 6 / §5): an in-memory ordered set of
//! destination basenames currently being appended to, so two appender
//! threads never write the same hourly file concurrently. Grounded on
//! the name-keyed lock map in the teacher's `LockManager`, adapted from
//! its async `Notify` to a blocking `Condvar` since appender workers run
//! on plain OS threads, matching the `Mutex`+`Condvar` shape already
//! used by the directory poller.

use std::collections::BTreeSet;
use std::sync::{Condvar, Mutex};

pub struct HourlyLockSet {
    held: Mutex<BTreeSet<String>>,
    cv: Condvar,
}

impl HourlyLockSet {
    pub fn new() -> Self {
        Self {
            held: Mutex::new(BTreeSet::new()),
            cv: Condvar::new(),
        }
    }

    /// Block until `basename` is not held, then take it. Returns `None`
    /// if `should_abandon` starts returning true while waiting.
    pub fn acquire(&self, basename: &str, should_abandon: impl Fn() -> bool) -> Option<()> {
        let mut held = self.held.lock().unwrap();
        loop {
            if !held.contains(basename) {
                held.insert(basename.to_string());
                return Some(());
            }
            if should_abandon() {
                return None;
            }
            let (guard, timeout) = self
                .cv
                .wait_timeout(held, std::time::Duration::from_millis(200))
                .unwrap();
            held = guard;
            let _ = timeout;
        }
    }

    pub fn release(&self, basename: &str) {
        let mut held = self.held.lock().unwrap();
        held.remove(basename);
        drop(held);
        self.cv.notify_all();
    }
}

impl Default for HourlyLockSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn second_acquire_waits_for_release() {
        let locks = Arc::new(HourlyLockSet::new());
        locks.acquire("ft1-s1-H0", || false).unwrap();

        let locks2 = locks.clone();
        let handle = std::thread::spawn(move || {
            locks2.acquire("ft1-s1-H0", || false).unwrap();
        });

        std::thread::sleep(std::time::Duration::from_millis(50));
        locks.release("ft1-s1-H0");
        handle.join().unwrap();
    }

    #[test]
    fn abandons_when_told_to() {
        let locks = HourlyLockSet::new();
        locks.acquire("x", || false).unwrap();
        let abandoned = AtomicBool::new(true);
        let result = locks.acquire("x", || abandoned.load(Ordering::SeqCst));
        assert!(result.is_none());
    }
}
