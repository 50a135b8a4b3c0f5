//! Shared stop source for cooperative cancellation
//!
//! A `CancellationToken` is the one multi-writer/multi-reader primitive in the
//! execution core. Requesting stop is monotonic: once set, the flag is never
//! cleared. Readers either poll (`stop_requested`, lock-free) or block
//! (`wait`, `wait_timeout`) until some thread requests stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Monotonic stop source shared by cooperating tasks.
///
/// Cloning is cheap and all clones observe the same flag. `request_stop` is
/// idempotent; concurrent calls from any number of threads are equivalent to
/// a single call.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<StopState>,
}

struct StopState {
    /// Monotonic stop flag
    stopped: AtomicBool,

    /// Guards the sleep/notify handshake for blocking waiters
    lock: Mutex<()>,
    notify: Condvar,
}

impl CancellationToken {
    /// Create a new token with the stop flag clear.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StopState {
                stopped: AtomicBool::new(false),
                lock: Mutex::new(()),
                notify: Condvar::new(),
            }),
        }
    }

    /// Request stop. Idempotent; wakes all blocked waiters.
    pub fn request_stop(&self) {
        // The store must happen under the lock so a waiter cannot check the
        // flag, miss the store, and then sleep past the notification.
        let guard = self.inner.lock.lock().unwrap();
        self.inner.stopped.store(true, Ordering::Release);
        drop(guard);
        self.inner.notify.notify_all();
    }

    /// Non-blocking query of the stop flag.
    #[inline]
    pub fn stop_requested(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Block the calling thread until stop is requested.
    pub fn wait(&self) {
        let mut guard = self.inner.lock.lock().unwrap();
        while !self.inner.stopped.load(Ordering::Acquire) {
            guard = self.inner.notify.wait(guard).unwrap();
        }
    }

    /// Block until stop is requested or `timeout` elapses.
    ///
    /// Returns `true` if stop was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut guard = self.inner.lock.lock().unwrap();
        loop {
            if self.inner.stopped.load(Ordering::Acquire) {
                return true;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (g, _res) = self
                .inner
                .notify
                .wait_timeout(guard, deadline - now)
                .unwrap();
            guard = g;
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("stop_requested", &self.stop_requested())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_basic_stop() {
        let token = CancellationToken::new();
        assert!(!token.stop_requested());

        token.request_stop();
        assert!(token.stop_requested());
    }

    #[test]
    fn test_idempotent() {
        let token = CancellationToken::new();
        token.request_stop();
        token.request_stop();
        assert!(token.stop_requested());
    }

    #[test]
    fn test_clone_shares_state() {
        let a = CancellationToken::new();
        let b = a.clone();

        a.request_stop();
        assert!(b.stop_requested());
    }

    #[test]
    fn test_wait_wakes_blocked_thread() {
        let token = CancellationToken::new();
        let remote = token.clone();

        let waiter = thread::spawn(move || {
            remote.wait();
            remote.stop_requested()
        });

        thread::sleep(Duration::from_millis(10));
        token.request_stop();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_wait_timeout_expires() {
        let token = CancellationToken::new();
        let start = Instant::now();
        assert!(!token.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wait_timeout_observes_stop() {
        let token = CancellationToken::new();
        token.request_stop();
        assert!(token.wait_timeout(Duration::from_secs(5)));
    }
}
