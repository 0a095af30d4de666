use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Immutable payload carrier passed between ports.
///
/// The runtime never inspects the payload; it only moves the shared handle
/// from a source port to its destinations. A single event may sit on several
/// input queues at once and is released when the last queue drops it.
#[derive(Clone)]
pub struct Event {
    payload: Arc<dyn Any + Send + Sync>,
}

impl Event {
    pub fn new<T: Send + Sync + 'static>(payload: T) -> Self {
        Self {
            payload: Arc::new(payload),
        }
    }

    /// An event with no meaningful payload, for pure triggers.
    pub fn empty() -> Self {
        Self::new(())
    }

    /// Borrow the payload as `T`, or `None` when the event carries a
    /// different type.
    pub fn payload<T: 'static>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // the payload is opaque to the runtime, so it stays opaque in logs
        f.debug_struct("Event").finish_non_exhaustive()
    }
}
