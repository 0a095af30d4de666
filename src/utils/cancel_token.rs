use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Upper bound on a single condvar wait. Long sleeps run in bounded chunks
/// so that even multi-day delays remain promptly cancellable.
pub const DEFAULT_SLEEP_CHUNK: Duration = Duration::from_secs(3600);

struct CancelState {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    wakeup: Condvar,
}

/// Cancellation token pairing an atomic flag with a condvar.
///
/// Cloning is cheap; all clones observe the same flag. `cancel` releases any
/// worker currently sleeping on the token, so cancellation is prompt but not
/// preemptive: a running callback always finishes first.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            state: Arc::new(CancelState {
                cancelled: AtomicBool::new(false),
                lock: Mutex::new(()),
                wakeup: Condvar::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
        // taking the lock orders the store before any waiter re-checks
        let _guard = self.state.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.state.wakeup.notify_all();
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Sleep until cancelled or `total` has elapsed. Returns `false` when the
    /// token was cancelled before the full duration passed.
    pub fn sleep_for(&self, total: Duration) -> bool {
        self.sleep_for_chunked(total, DEFAULT_SLEEP_CHUNK)
    }

    /// As [`sleep_for`](Self::sleep_for), waiting in chunks of at most `chunk`.
    pub fn sleep_for_chunked(&self, total: Duration, chunk: Duration) -> bool {
        let chunk = chunk.max(Duration::from_millis(1));
        let mut remaining = total;
        while remaining > Duration::ZERO {
            if self.is_cancelled() {
                return false;
            }
            let step = remaining.min(chunk);
            let guard = self.state.lock.lock().unwrap_or_else(|e| e.into_inner());
            let (_guard, timeout) = self
                .state
                .wakeup
                .wait_timeout_while(guard, step, |_| {
                    !self.state.cancelled.load(Ordering::Acquire)
                })
                .unwrap_or_else(|e| e.into_inner());
            if !timeout.timed_out() {
                return false;
            }
            remaining = remaining.saturating_sub(step);
        }
        !self.is_cancelled()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("is_cancelled", &self.is_cancelled())
            .finish()
    }
}
