//! The director manages the model's global callback queue. There is one
//! director per host. Callbacks are ordered first by next execution time,
//! then by the scheduling accessor's priority, and last by a monotonically
//! issued callback id, so two callbacks scheduled in order by one accessor
//! execute in that order. Execution time comes from a logical clock loosely
//! tied to wall time: the clock jumps from instant to instant while the due
//! callbacks run synchronously, which makes reactions appear atomic and
//! concurrent to the model without threads or locks.

use crate::accessor::ErasedHook;
use crate::error::Result;
use crate::event::Event;
use crate::port::{AccessorId, PortId};
use crate::utils::time::posix_utc_millis;
use std::collections::BTreeMap;

/// Identifier of a scheduled callback, unique for the life of a director.
pub type CallbackId = u64;

/// Priority of the dedicated model-update callback; one less than the host
/// priority so updates preempt every reaction at the same logical instant.
pub(crate) const UPDATE_MODEL_PRIORITY: i32 = 0;
pub(crate) const HOST_PRIORITY: i32 = UPDATE_MODEL_PRIORITY + 1;
/// Priority of accessors that have not been through assignment yet.
pub(crate) const DEFAULT_PRIORITY: i32 = i32::MAX;

pub(crate) enum CallbackAction {
    /// Run a user callback against its owner's state.
    User { owner: AccessorId, hook: ErasedHook },
    /// Deliver a previously produced output event to a port's destinations.
    Emit { port: PortId, event: Event },
    /// Drain the pending-children queue of the root composite.
    ProcessChildQueue { composite: AccessorId },
    /// Recompute priorities and initialize newly added accessors.
    UpdateModel,
}

pub(crate) struct ScheduledCallback {
    pub(crate) action: CallbackAction,
    pub(crate) delay_ms: i64,
    pub(crate) periodic: bool,
    pub(crate) priority: i32,
    pub(crate) next_execution_ms: i64,
}

pub(crate) struct Director {
    next_callback_id: CallbackId,
    callbacks: BTreeMap<CallbackId, ScheduledCallback>,
    /// Callback ids sorted by `(next_execution_ms, priority, id)`.
    queue: Vec<CallbackId>,
    current_logical_time_ms: i64,
    start_time_ms: i64,
    running: Option<CallbackId>,
    running_cleared: bool,
}

impl Director {
    pub(crate) fn new() -> Result<Self> {
        let now = posix_utc_millis()?;
        Ok(Self {
            next_callback_id: 0,
            callbacks: BTreeMap::new(),
            queue: Vec::new(),
            current_logical_time_ms: now,
            start_time_ms: now,
            running: None,
            running_cleared: false,
        })
    }

    pub(crate) fn logical_time_ms(&self) -> i64 {
        self.current_logical_time_ms
    }

    pub(crate) fn schedule(
        &mut self,
        action: CallbackAction,
        delay_ms: i64,
        periodic: bool,
        priority: i32,
    ) -> CallbackId {
        let id = self.next_callback_id;
        self.next_callback_id += 1;
        let callback = ScheduledCallback {
            action,
            delay_ms,
            periodic,
            priority,
            next_execution_ms: self.current_logical_time_ms + delay_ms,
        };
        tracing::trace!(id, delay_ms, periodic, priority, "scheduling callback");
        self.callbacks.insert(id, callback);
        self.enqueue(id);
        id
    }

    fn sort_key(&self, id: CallbackId) -> (i64, i32, CallbackId) {
        let callback = &self.callbacks[&id];
        (callback.next_execution_ms, callback.priority, id)
    }

    fn enqueue(&mut self, id: CallbackId) {
        let key = self.sort_key(id);
        let at = self
            .queue
            .partition_point(|&queued| self.sort_key(queued) < key);
        self.queue.insert(at, id);
    }

    /// Remove a callback. Draining the queue entirely resets the director:
    /// the logical clock rebases to wall time and ids restart from zero.
    pub(crate) fn clear(&mut self, id: CallbackId) -> Result<()> {
        if self.running == Some(id) {
            self.running_cleared = true;
        }
        if let Some(at) = self.queue.iter().position(|&queued| queued == id) {
            self.queue.remove(at);
        }
        self.callbacks.remove(&id);
        if self.needs_reset() {
            self.reset()?;
        }
        Ok(())
    }

    /// Rewrite callbacks carrying `old` priority to `new` and re-sort them.
    /// Used when a dynamic model update changes accessor priorities while
    /// callbacks are already queued.
    pub(crate) fn handle_priority_update(&mut self, old: i32, new: i32) {
        let affected: Vec<CallbackId> = self
            .callbacks
            .iter()
            .filter(|(_, callback)| callback.priority == old)
            .map(|(&id, _)| id)
            .collect();
        for id in affected {
            if let Some(callback) = self.callbacks.get_mut(&id) {
                callback.priority = new;
            }
            if let Some(at) = self.queue.iter().position(|&queued| queued == id) {
                self.queue.remove(at);
                self.enqueue(id);
            }
        }
    }

    pub(crate) fn next_queued_time_ms(&self) -> Option<i64> {
        self.queue
            .first()
            .map(|id| self.callbacks[id].next_execution_ms)
    }

    pub(crate) fn begin_instant(&mut self, instant_ms: i64) {
        self.current_logical_time_ms = instant_ms;
        tracing::debug!(
            logical_ms = instant_ms - self.start_time_ms,
            "logical clock advanced"
        );
    }

    /// Pop the head of the queue when it is due at or before `upto_ms`.
    /// The record is checked out to the caller; [`finish`](Self::finish)
    /// decides whether a periodic callback goes back in.
    pub(crate) fn pop_due(&mut self, upto_ms: i64) -> Option<(CallbackId, ScheduledCallback)> {
        let &head = self.queue.first()?;
        if self.callbacks[&head].next_execution_ms > upto_ms {
            return None;
        }
        self.queue.remove(0);
        let callback = self.callbacks.remove(&head)?;
        self.running = Some(head);
        self.running_cleared = false;
        Some((head, callback))
    }

    /// Return a checked-out callback. Periodic callbacks that neither
    /// failed nor cancelled themselves advance by their fixed delay from
    /// the previous execution time, drift-free.
    pub(crate) fn finish(&mut self, id: CallbackId, mut callback: ScheduledCallback, failed: bool) {
        self.running = None;
        if failed || self.running_cleared || !callback.periodic {
            return;
        }
        callback.next_execution_ms += callback.delay_ms;
        self.callbacks.insert(id, callback);
        self.enqueue(id);
    }

    pub(crate) fn needs_reset(&self) -> bool {
        self.queue.is_empty() || self.callbacks.is_empty()
    }

    pub(crate) fn reset(&mut self) -> Result<()> {
        // a reset while a callback is checked out also cancels it
        if self.running.is_some() {
            self.running_cleared = true;
        }
        self.queue.clear();
        self.callbacks.clear();
        self.next_callback_id = 0;
        self.current_logical_time_ms = posix_utc_millis()?;
        self.start_time_ms = self.current_logical_time_ms;
        tracing::debug!("director reset; logical clock rebased");
        Ok(())
    }
}
