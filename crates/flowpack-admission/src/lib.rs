//! # flowpack-admission
//!
//! File-Handle Admission (§4.1): a process-wide counting semaphore that
//! bounds concurrent input-file opens. Every ingest path that opens a
//! fresh input file must hold one permit for the lifetime of that open
//! file descriptor.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("shutdown observed while waiting for a permit")]
    Shutdown,
}

struct State {
    available: usize,
    max: usize,
}

/// Compute `max = floor(cache_size / 8)`, bounded below by 2.
pub fn compute_max(cache_size: usize) -> usize {
    (cache_size / 8).max(2)
}

/// The admission controller. Shared (via `Arc`) across every ingest
/// worker in the process.
pub struct Admission {
    state: Mutex<State>,
    notify: Notify,
    shutdown: AtomicBool,
}

impl Admission {
    pub fn new(cache_size: usize) -> Self {
        let max = compute_max(cache_size);
        Self {
            state: Mutex::new(State {
                available: max,
                max,
            }),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Acquire one permit, blocking until one is available or shutdown is
    /// observed.
    pub async fn acquire(&self) -> Result<AdmissionPermit<'_>, AdmissionError> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Err(AdmissionError::Shutdown);
            }
            {
                let mut state = self.state.lock();
                if state.available > 0 {
                    state.available -= 1;
                    return Ok(AdmissionPermit { admission: self });
                }
            }
            self.notify.notified().await;
        }
    }

    fn release_permit(&self) {
        let mut state = self.state.lock();
        state.available += 1;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Atomic reconfiguration: apply the permit delta in-place so
    /// in-flight holders are unaffected.
    pub fn set_max(&self, new_max: usize) {
        let mut state = self.state.lock();
        let delta = new_max as i64 - state.max as i64;
        state.max = new_max;
        if delta > 0 {
            state.available += delta as usize;
        } else {
            state.available = state.available.saturating_sub((-delta) as usize);
        }
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn max(&self) -> usize {
        self.state.lock().max
    }

    pub fn available(&self) -> usize {
        self.state.lock().available
    }

    /// Wake every waiter so blocked `acquire` calls observe shutdown.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// RAII handle for one admitted file open. Releasing is automatic on
/// drop; call [`AdmissionPermit::release`] to do so explicitly and
/// match the contract's named `release()` operation.
pub struct AdmissionPermit<'a> {
    admission: &'a Admission,
}

impl AdmissionPermit<'_> {
    pub fn release(self) {
        drop(self)
    }
}

impl Drop for AdmissionPermit<'_> {
    fn drop(&mut self) {
        self.admission.release_permit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn compute_max_respects_floor_of_two() {
        assert_eq!(compute_max(0), 2);
        assert_eq!(compute_max(8), 2);
        assert_eq!(compute_max(128), 16);
    }

    #[tokio::test]
    async fn acquire_and_release_round_trips_available_count() {
        let admission = Admission::new(128);
        assert_eq!(admission.available(), 16);
        let permit = admission.acquire().await.unwrap();
        assert_eq!(admission.available(), 15);
        permit.release();
        assert_eq!(admission.available(), 16);
    }

    #[tokio::test]
    async fn acquire_blocks_until_release() {
        let admission = Arc::new(Admission::new(16)); // max = 2
        let p1 = admission.acquire().await.unwrap();
        let p2 = admission.acquire().await.unwrap();
        assert_eq!(admission.available(), 0);

        let admission2 = admission.clone();
        let waiter = tokio::spawn(async move { admission2.acquire().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(p1);
        let permit = waiter.await.unwrap().unwrap();
        assert_eq!(admission.available(), 0);
        drop(permit);
        drop(p2);
        assert_eq!(admission.available(), 2);
    }

    #[tokio::test]
    async fn shutdown_wakes_blocked_waiters_with_error() {
        let admission = Arc::new(Admission::new(16)); // max = 2
        let _p1 = admission.acquire().await.unwrap();
        let _p2 = admission.acquire().await.unwrap();

        let admission2 = admission.clone();
        let waiter = tokio::spawn(async move { admission2.acquire().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        admission.shutdown();

        let result = waiter.await.unwrap();
        assert_eq!(result, Err(AdmissionError::Shutdown));
    }

    #[test]
    fn set_max_increasing_adds_available_permits() {
        let admission = Admission::new(16); // max=2
        admission.set_max(5);
        assert_eq!(admission.max(), 5);
        assert_eq!(admission.available(), 5);
    }
}
