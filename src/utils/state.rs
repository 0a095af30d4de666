use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Lock-free snapshot cell with a change sequence.
///
/// The worker thread publishes new snapshots while readers on arbitrary
/// threads observe the current one without blocking. The sequence counter
/// lets polling observers detect changes without comparing snapshots.
#[derive(Debug)]
pub struct StateCell<S> {
    snap: ArcSwap<S>,
    seq: AtomicU64,
}

impl<S> StateCell<S> {
    pub fn new(init: S) -> Self {
        Self {
            snap: ArcSwap::from(Arc::new(init)),
            seq: AtomicU64::new(1),
        }
    }

    /// Replace the snapshot, returning the previous one.
    pub fn swap(&self, next: S) -> Arc<S> {
        let previous = self.snap.swap(Arc::new(next));
        self.seq.fetch_add(1, Ordering::Release);
        previous
    }

    /// Current snapshot as an owned [`Arc`].
    #[inline]
    pub fn load(&self) -> Arc<S> {
        self.snap.load_full()
    }

    /// Current sequence number.
    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Check whether the snapshot changed since `last`.
    #[inline]
    pub fn changed_since(&self, last: u64) -> bool {
        self.seq() != last
    }
}
