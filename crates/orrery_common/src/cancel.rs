//! Cooperative cancellation for background work.
//!
//! A scheduler hands a `CancelSignal` to every unit of work it runs. Work
//! that waits on something external (a child process, a retry interval)
//! sleeps through `wait_timeout()` so cancellation wakes it at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Clone)]
pub struct CancelSignal {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    flag: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                flag: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Request cancellation and wake every waiter.
    pub fn cancel(&self) {
        // Taking the mutex orders the store before any waiter's re-check.
        let _guard = self.inner.mutex.lock();
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Sleep for at most `duration`. Returns `true` if cancellation was
    /// requested, in which case the caller should stop.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let mut guard = self.inner.mutex.lock();
        if self.is_cancelled() {
            return true;
        }
        self.inner.condvar.wait_for(&mut guard, duration);
        self.is_cancelled()
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSignal")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
