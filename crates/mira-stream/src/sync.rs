//! Stop-aware counting semaphore.
//!
//! A mutex/condvar semaphore with two extensions the streaming layer needs:
//! `stop()` permanently releases every waiter with `ThreadStopped`, and
//! `acquire` takes an optional deadline that raises `Timeout` on expiry.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use mira_core::{MiraError, Result};

pub(crate) struct Semaphore {
    inner: Mutex<Inner>,
    cvar: Condvar,
}

struct Inner {
    permits: usize,
    stopped: bool,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self { inner: Mutex::new(Inner { permits, stopped: false }), cvar: Condvar::new() }
    }

    /// Take one permit, blocking until one is available. Returns
    /// `ThreadStopped` once `stop()` has been called, `Timeout` if the
    /// optional deadline passes first.
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|d| (Instant::now() + d, d));
        let mut inner = self.lock();
        loop {
            if inner.stopped {
                return Err(MiraError::ThreadStopped);
            }
            if inner.permits > 0 {
                inner.permits -= 1;
                return Ok(());
            }
            inner = wait(&self.cvar, inner, deadline)?;
        }
    }

    /// Take one permit without blocking.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        if inner.stopped || inner.permits == 0 {
            return false;
        }
        inner.permits -= 1;
        true
    }

    /// Release one permit.
    pub fn post(&self) {
        self.lock().permits += 1;
        self.cvar.notify_one();
    }

    /// Permanently release all current and future waiters.
    pub fn stop(&self) {
        self.lock().stopped = true;
        self.cvar.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One condvar wait step under an optional deadline. Callers re-check their
/// predicate in a loop; once the deadline has passed this returns `Timeout`.
pub(crate) fn wait<'a, T>(
    cvar: &Condvar,
    guard: MutexGuard<'a, T>,
    deadline: Option<(Instant, Duration)>,
) -> Result<MutexGuard<'a, T>> {
    match deadline {
        None => Ok(cvar.wait(guard).unwrap_or_else(|e| e.into_inner())),
        Some((at, total)) => {
            let Some(remaining) = at.checked_duration_since(Instant::now()) else {
                return Err(MiraError::Timeout(total));
            };
            let (guard, _) = cvar.wait_timeout(guard, remaining).unwrap_or_else(|e| e.into_inner());
            Ok(guard)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn permits_are_counted() {
        let sem = Semaphore::new(2);
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
        sem.post();
        assert!(sem.try_acquire());
    }

    #[test]
    fn acquire_blocks_until_post() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.acquire(None))
        };
        thread::sleep(Duration::from_millis(20));
        sem.post();
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn stop_releases_blocked_waiters() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.acquire(None))
        };
        thread::sleep(Duration::from_millis(20));
        sem.stop();
        assert!(matches!(waiter.join().unwrap(), Err(MiraError::ThreadStopped)));
        // Stopped semaphores refuse new acquires too.
        assert!(matches!(sem.acquire(None), Err(MiraError::ThreadStopped)));
    }

    #[test]
    fn acquire_times_out() {
        let sem = Semaphore::new(0);
        let start = Instant::now();
        let result = sem.acquire(Some(Duration::from_millis(30)));
        assert!(matches!(result, Err(MiraError::Timeout(_))));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
