use crate::event::Event;
use std::collections::VecDeque;

/// Index of a port in the model arena. Stable for the life of the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct PortId(pub(crate) usize);

/// Index of an accessor in the model arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct AccessorId(pub(crate) usize);

#[derive(Debug)]
pub(crate) enum PortKind {
    /// Owns a FIFO of pending events. `waiting_for_handler` is true iff the
    /// head of the queue still awaits a reaction; it is the predicate that
    /// gates reaction scheduling, one pending reaction per accessor no
    /// matter how deep the queue is.
    Input {
        queue: VecDeque<Event>,
        waiting_for_handler: bool,
    },
    /// Spontaneous outputs depend on no input and accept no source.
    Output { spontaneous: bool },
}

/// A named event endpoint. A destination port has at most one source; a
/// source port relays each sent event to every destination in order.
#[derive(Debug)]
pub(crate) struct PortNode {
    pub(crate) name: String,
    pub(crate) owner: AccessorId,
    pub(crate) source: Option<PortId>,
    pub(crate) destinations: Vec<PortId>,
    pub(crate) kind: PortKind,
}

impl PortNode {
    pub(crate) fn input(name: String, owner: AccessorId) -> Self {
        Self {
            name,
            owner,
            source: None,
            destinations: Vec::new(),
            kind: PortKind::Input {
                queue: VecDeque::new(),
                waiting_for_handler: false,
            },
        }
    }

    pub(crate) fn output(name: String, owner: AccessorId, spontaneous: bool) -> Self {
        Self {
            name,
            owner,
            source: None,
            destinations: Vec::new(),
            kind: PortKind::Output { spontaneous },
        }
    }

    pub(crate) fn is_input(&self) -> bool {
        matches!(self.kind, PortKind::Input { .. })
    }

    pub(crate) fn is_spontaneous(&self) -> bool {
        matches!(self.kind, PortKind::Output { spontaneous: true })
    }

    pub(crate) fn waiting_for_handler(&self) -> bool {
        matches!(
            self.kind,
            PortKind::Input {
                waiting_for_handler: true,
                ..
            }
        )
    }

    pub(crate) fn queue_len(&self) -> usize {
        match &self.kind {
            PortKind::Input { queue, .. } => queue.len(),
            PortKind::Output { .. } => 0,
        }
    }

    /// Shared handle to the event at the head of the input queue.
    pub(crate) fn head_event(&self) -> Option<Event> {
        match &self.kind {
            PortKind::Input { queue, .. } => queue.front().cloned(),
            PortKind::Output { .. } => None,
        }
    }

    pub(crate) fn enqueue(&mut self, event: Event) {
        if let PortKind::Input {
            queue,
            waiting_for_handler,
        } = &mut self.kind
        {
            queue.push_back(event);
            *waiting_for_handler = true;
        }
    }

    /// Pop the head after its handlers ran; the waiting flag tracks whether
    /// another event is already lined up behind it.
    pub(crate) fn dequeue_head(&mut self) {
        if let PortKind::Input {
            queue,
            waiting_for_handler,
        } = &mut self.kind
        {
            queue.pop_front();
            *waiting_for_handler = !queue.is_empty();
        }
    }
}
