//! Signal of stop: the one cancellation primitive shared by both engines.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Cloneable stop flag with a wakeup for threads parked in [`SignalOfStop::wait_timeout`].
///
/// Every clone observes the same flag. Once cancelled it never resets; a new
/// pipeline run gets a new signal.
#[derive(Debug)]
pub struct SignalOfStop {
    shared: Arc<SharedState>,
}

#[derive(Debug)]
struct SharedState {
    closing: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl SignalOfStop {
    pub fn new() -> SignalOfStop {
        SignalOfStop {
            shared: Arc::new(SharedState {
                closing: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.shared.closing.store(true, Ordering::Release);

        // Lock briefly so a waiter between its flag check and its wait cannot miss the notify
        let _guard = self.shared.mutex.lock();
        self.shared.condvar.notify_all();
    }

    pub fn cancelled(&self) -> bool {
        self.shared.closing.load(Ordering::Acquire)
    }

    /// Block until cancelled.
    pub fn wait_cancellation(&self) {
        let mut guard = self.shared.mutex.lock();
        while !self.cancelled() {
            self.shared.condvar.wait(&mut guard);
        }
    }

    /// Sleep for up to `timeout`, returning early when cancelled.
    ///
    /// Returns `true` if the signal was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.shared.mutex.lock();
        while !self.cancelled() {
            if self
                .shared
                .condvar
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                break;
            }
        }
        self.cancelled()
    }
}

impl Default for SignalOfStop {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for SignalOfStop {
    fn clone(&self) -> SignalOfStop {
        SignalOfStop {
            shared: Arc::clone(&self.shared),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_flag() {
        let sos = SignalOfStop::new();
        let other = sos.clone();
        assert!(!other.cancelled());
        sos.cancel();
        assert!(other.cancelled());
    }

    #[test]
    fn test_wait_timeout_expires_without_cancel() {
        let sos = SignalOfStop::new();
        let started = Instant::now();
        assert!(!sos.wait_timeout(Duration::from_millis(20)));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_cancel_wakes_waiter() {
        let sos = SignalOfStop::new();
        let waiter = sos.clone();
        let handle = std::thread::spawn(move || {
            let started = Instant::now();
            let cancelled = waiter.wait_timeout(Duration::from_secs(10));
            (cancelled, started.elapsed())
        });
        std::thread::sleep(Duration::from_millis(20));
        sos.cancel();
        let (cancelled, elapsed) = handle.join().unwrap();
        assert!(cancelled);
        assert!(elapsed < Duration::from_secs(5));
    }
}
