//! The dispatch engine.
//!
//! One engine per host couples the model arena with its director. Every
//! callback the director pops runs through [`Engine::dispatch`]: user
//! callbacks and hooks run against their accessor's checked-out state,
//! output emissions relay through the port graph, and composite reactions
//! drain the pending-children queue in priority order. User code observes
//! all of it through [`ReactionContext`].

use crate::accessor::{erase_handler, erase_hook, ConnectionDecl, IntoAccessorSpec, PortRole};
use crate::director::{
    CallbackAction, CallbackId, Director, ScheduledCallback, UPDATE_MODEL_PRIORITY,
};
use crate::error::{Result, RuntimeError};
use crate::event::Event;
use crate::graph::{ModelGraph, NodeKind};
use crate::port::AccessorId;
use crate::priority::compute_priorities;
use crate::utils::time::posix_utc_millis;

pub(crate) struct Engine {
    pub(crate) graph: ModelGraph,
    pub(crate) director: Director,
    pub(crate) root: AccessorId,
    pub(crate) additional_setup: Option<crate::accessor::ErasedHook>,
}

impl Engine {
    pub(crate) fn new(root_spec: crate::accessor::AccessorSpec) -> Result<Self> {
        let mut graph = ModelGraph::default();
        let root = graph.instantiate(None, root_spec)?;
        Ok(Self {
            graph,
            director: Director::new()?,
            root,
            additional_setup: None,
        })
    }

    /// Host setup: user wiring first, then the topological analysis over
    /// the finished graph, then depth-first initialization.
    pub(crate) fn setup(&mut self) -> Result<()> {
        if let Some(mut hook) = self.additional_setup.take() {
            let result = self.run_hook(self.root, &mut hook);
            self.additional_setup = Some(hook);
            result?;
        }
        compute_priorities(&mut self.graph, self.root, None)?;
        self.initialize_tree(self.root)
    }

    pub(crate) fn next_queued_time_ms(&self) -> Option<i64> {
        self.director.next_queued_time_ms()
    }

    /// Execute every logical instant that is due by wall time. Callbacks
    /// scheduled at delay zero while an instant drains belong to that same
    /// instant and run before it completes.
    pub(crate) fn run_due_instants(&mut self) -> Result<()> {
        let now = posix_utc_millis()?;
        let mut executed = false;
        while let Some(instant) = self.director.next_queued_time_ms() {
            if instant > now {
                break;
            }
            self.execute_callbacks(instant)?;
            executed = true;
        }
        if executed && self.director.needs_reset() {
            self.director.reset()?;
        }
        Ok(())
    }

    fn execute_callbacks(&mut self, instant_ms: i64) -> Result<()> {
        self.director.begin_instant(instant_ms);
        while let Some((id, mut callback)) = self.director.pop_due(instant_ms) {
            let result = self.dispatch(&mut callback);
            self.director.finish(id, callback, result.is_err());
            result?;
        }
        Ok(())
    }

    fn dispatch(&mut self, callback: &mut ScheduledCallback) -> Result<()> {
        match &mut callback.action {
            CallbackAction::Emit { port, event } => {
                let port = *port;
                let event = event.clone();
                self.graph.send_from_port(&mut self.director, port, &event);
                Ok(())
            }
            CallbackAction::ProcessChildQueue { composite } => {
                let composite = *composite;
                self.process_child_event_queue(composite)
            }
            CallbackAction::UpdateModel => self.update_model(),
            CallbackAction::User { owner, hook } => {
                let owner = *owner;
                self.run_hook(owner, hook)
            }
        }
    }

    /// Run an erased hook against its owner's checked-out state. While the
    /// state is out, the context may borrow the arena freely.
    fn run_hook(
        &mut self,
        owner: AccessorId,
        hook: &mut crate::accessor::ErasedHook,
    ) -> Result<()> {
        let mut state = self.graph.take_state(owner)?;
        let result = {
            let mut cx = ReactionContext {
                graph: &mut self.graph,
                director: &mut self.director,
                accessor: owner,
            };
            hook(state.as_mut(), &mut cx)
        };
        self.graph.put_state(owner, state);
        result.map_err(|source| RuntimeError::handler(self.graph.full_accessor_name(owner), source))
    }

    /// Drain pending children in priority order. Composite children recurse
    /// into their own queues; atomic children react. A child that requests
    /// another reaction while the drain runs is merely re-enqueued, so it
    /// still holds at most one entry.
    fn process_child_event_queue(&mut self, composite: AccessorId) -> Result<()> {
        loop {
            let next = match &mut self.graph.accessor_mut(composite).kind {
                NodeKind::Composite(parts) => parts.pending.pop(),
                NodeKind::Atomic(_) => None,
            };
            let Some(child) = next else { break };
            if self.graph.accessor(child).detached {
                continue;
            }
            if self.graph.accessor(child).is_composite() {
                self.process_child_event_queue(child)?;
            } else {
                self.process_inputs(child)?;
            }
        }
        if let NodeKind::Composite(parts) = &mut self.graph.accessor_mut(composite).kind {
            parts.reaction_requested = false;
        }
        Ok(())
    }

    /// One reaction of an atomic accessor: service each input port in
    /// declared order, then fire once.
    fn process_inputs(&mut self, accessor: AccessorId) -> Result<()> {
        let stateful = matches!(
            &self.graph.accessor(accessor).kind,
            NodeKind::Atomic(parts) if parts.state_depends_on_input
        );
        tracing::debug!(
            accessor = %self.graph.full_accessor_name(accessor),
            stateful,
            "reacting to pending inputs"
        );
        let input_ports = self.graph.accessor(accessor).inputs.clone();
        for port in input_ports {
            if !self.graph.port(port).waiting_for_handler() {
                continue;
            }
            self.invoke_input_handlers(accessor, port)?;
            self.graph.port_mut(port).dequeue_head();
            if self.graph.port(port).waiting_for_handler() {
                // more events queued: react again within this instant and
                // re-relay the new head along feedback paths
                let priority = self.graph.accessor(accessor).priority;
                if let Some(parent) = self.graph.accessor(accessor).parent {
                    self.graph
                        .schedule_reaction(&mut self.director, parent, accessor, priority);
                }
                if let Some(head) = self.graph.port(port).head_event() {
                    self.graph.send_from_port(&mut self.director, port, &head);
                }
            }
        }

        let fire = match &mut self.graph.accessor_mut(accessor).kind {
            NodeKind::Atomic(parts) => parts.fire_fn.take(),
            NodeKind::Composite(_) => None,
        };
        if let Some(mut hook) = fire {
            let result = self.run_hook(accessor, &mut hook);
            if let NodeKind::Atomic(parts) = &mut self.graph.accessor_mut(accessor).kind {
                parts.fire_fn = Some(hook);
            }
            result?;
        }
        Ok(())
    }

    /// Invoke every handler registered on `port` against the head event, in
    /// registration order. A failing handler is removed from the port before
    /// the failure propagates out of the reaction.
    fn invoke_input_handlers(&mut self, accessor: AccessorId, port: crate::port::PortId) -> Result<()> {
        let Some(event) = self.graph.port(port).head_event() else {
            return Ok(());
        };
        let mut handlers = self.graph.take_handlers(accessor, port);
        if handlers.is_empty() {
            self.graph.put_handlers(accessor, port, handlers);
            return Ok(());
        }
        let mut state = self.graph.take_state(accessor)?;
        let mut failure: Option<(usize, anyhow::Error)> = None;
        for (index, handler) in handlers.iter_mut().enumerate() {
            let result = {
                let mut cx = ReactionContext {
                    graph: &mut self.graph,
                    director: &mut self.director,
                    accessor,
                };
                handler(state.as_mut(), &event, &mut cx)
            };
            if let Err(error) = result {
                failure = Some((index, error));
                break;
            }
        }
        self.graph.put_state(accessor, state);
        if let Some((index, error)) = failure {
            handlers.remove(index);
            self.graph.put_handlers(accessor, port, handlers);
            return Err(RuntimeError::handler(
                self.graph.full_accessor_name(accessor),
                error,
            ));
        }
        self.graph.put_handlers(accessor, port, handlers);
        Ok(())
    }

    /// The model-update callback: re-run the causality analysis, rewriting
    /// queued callback priorities, then initialize accessors added since.
    fn update_model(&mut self) -> Result<()> {
        tracing::debug!("updating model");
        compute_priorities(&mut self.graph, self.root, Some(&mut self.director))?;
        self.initialize_new(self.root)
    }

    fn initialize_new(&mut self, accessor: AccessorId) -> Result<()> {
        if self.graph.accessor(accessor).detached {
            return Ok(());
        }
        if !self.graph.accessor(accessor).initialized {
            return self.initialize_tree(accessor);
        }
        let children = match &self.graph.accessor(accessor).kind {
            NodeKind::Composite(parts) => parts.children.clone(),
            NodeKind::Atomic(_) => Vec::new(),
        };
        for child in children {
            self.initialize_new(child)?;
        }
        Ok(())
    }

    /// Depth-first initialization: children before their composite, the
    /// accessor's own hook last, the initialized flag after the hook so
    /// outputs stay rejected until initialization completed.
    pub(crate) fn initialize_tree(&mut self, accessor: AccessorId) -> Result<()> {
        if self.graph.accessor(accessor).initialized || self.graph.accessor(accessor).detached {
            return Ok(());
        }
        let children = match &self.graph.accessor(accessor).kind {
            NodeKind::Composite(parts) => parts.children.clone(),
            NodeKind::Atomic(_) => Vec::new(),
        };
        for child in children {
            self.initialize_tree(child)?;
        }
        if let Some(mut hook) = self.graph.accessor_mut(accessor).init_fn.take() {
            let result = self.run_hook(accessor, &mut hook);
            self.graph.accessor_mut(accessor).init_fn = Some(hook);
            result?;
        }
        self.graph.accessor_mut(accessor).initialized = true;
        tracing::trace!(accessor = %self.graph.full_accessor_name(accessor), "initialized");
        Ok(())
    }
}

/// Execution-side view handed to input handlers, hooks, and scheduled
/// callbacks. Everything an accessor may legally do during a reaction goes
/// through here.
pub struct ReactionContext<'a> {
    pub(crate) graph: &'a mut ModelGraph,
    pub(crate) director: &'a mut Director,
    pub(crate) accessor: AccessorId,
}

impl ReactionContext<'_> {
    /// Name of the accessor whose code is running.
    pub fn name(&self) -> &str {
        &self.graph.accessor(self.accessor).name
    }

    /// Milliseconds on the logical clock, since the epoch.
    pub fn logical_time_ms(&self) -> i64 {
        self.director.logical_time_ms()
    }

    /// Send an event through one of my output ports. Delivery happens via a
    /// delay-zero callback at my priority, still within the current logical
    /// instant.
    pub fn send_output(&mut self, port: &str, event: Event) -> Result<()> {
        if !self.graph.accessor(self.accessor).initialized {
            return Err(RuntimeError::NotInitialized {
                accessor: self.graph.full_accessor_name(self.accessor),
            });
        }
        let Some(port_id) = self.graph.output_port(self.accessor, port) else {
            return Err(self.unknown_port("output", port));
        };
        let priority = self.graph.accessor(self.accessor).priority;
        let id = self.director.schedule(
            CallbackAction::Emit {
                port: port_id,
                event,
            },
            0,
            false,
            priority,
        );
        self.graph.accessor_mut(self.accessor).callback_ids.insert(id);
        Ok(())
    }

    /// Head event of one of my input queues, if any.
    pub fn latest_input(&self, port: &str) -> Option<Event> {
        let port = self.graph.input_port(self.accessor, port)?;
        self.graph.port(port).head_event()
    }

    /// Number of events pending on one of my input ports.
    pub fn input_queue_len(&self, port: &str) -> usize {
        self.graph
            .input_port(self.accessor, port)
            .map(|p| self.graph.port(p).queue_len())
            .unwrap_or(0)
    }

    /// Schedule a callback under the deterministic temporal semantics.
    /// The returned id can cancel it later.
    pub fn schedule_callback<S, F>(&mut self, delay_ms: i64, repeat: bool, f: F) -> Result<CallbackId>
    where
        S: Send + 'static,
        F: FnMut(&mut S, &mut ReactionContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        let hook = erase_hook(f);
        let priority = self.graph.accessor(self.accessor).priority;
        let id = self.director.schedule(
            CallbackAction::User {
                owner: self.accessor,
                hook,
            },
            delay_ms,
            repeat,
            priority,
        );
        self.graph.accessor_mut(self.accessor).callback_ids.insert(id);
        Ok(id)
    }

    pub fn clear_scheduled_callback(&mut self, id: CallbackId) -> Result<()> {
        self.director.clear(id)?;
        self.graph.accessor_mut(self.accessor).callback_ids.remove(&id);
        Ok(())
    }

    pub fn clear_all_scheduled_callbacks(&mut self) -> Result<()> {
        let ids: Vec<CallbackId> = self
            .graph
            .accessor(self.accessor)
            .callback_ids
            .iter()
            .copied()
            .collect();
        for id in ids {
            self.director.clear(id)?;
        }
        self.graph.accessor_mut(self.accessor).callback_ids.clear();
        Ok(())
    }

    // ---- dynamic structure on the running accessor --------------------

    pub fn add_input_port(&mut self, name: &str) -> Result<()> {
        self.graph
            .add_port(self.accessor, name, PortRole::Input)
            .map(|_| ())
    }

    pub fn add_output_port(&mut self, name: &str) -> Result<()> {
        self.graph
            .add_port(self.accessor, name, PortRole::Output)
            .map(|_| ())
    }

    pub fn add_spontaneous_output_port(&mut self, name: &str) -> Result<()> {
        self.graph
            .add_port(self.accessor, name, PortRole::SpontaneousOutput)
            .map(|_| ())
    }

    pub fn add_input_handler<S, F>(&mut self, port: &str, f: F) -> Result<()>
    where
        S: Send + 'static,
        F: FnMut(&mut S, &Event, &mut ReactionContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        let Some(port_id) = self.graph.input_port(self.accessor, port) else {
            return Err(self.unknown_port("input", port));
        };
        let handler = erase_handler(f);
        match &mut self.graph.accessor_mut(self.accessor).kind {
            NodeKind::Atomic(parts) => {
                parts.handlers.entry(port_id).or_default().push(handler);
                Ok(())
            }
            NodeKind::Composite(_) => Err(RuntimeError::structure(format!(
                "composite accessor '{}' cannot handle inputs",
                self.graph.full_accessor_name(self.accessor)
            ))),
        }
    }

    /// Declare that this accessor's state changes on input from `input`.
    pub fn accessor_state_depends_on(&mut self, input: &str) -> Result<()> {
        if self.graph.input_port(self.accessor, input).is_none() {
            return Err(self.unknown_port("input", input));
        }
        if let NodeKind::Atomic(parts) = &mut self.graph.accessor_mut(self.accessor).kind {
            parts.state_depends_on_input = true;
        }
        Ok(())
    }

    pub fn remove_dependency(&mut self, input: &str, output: &str) -> Result<()> {
        let Some(input) = self.graph.input_port(self.accessor, input) else {
            return Err(self.unknown_port("input", input));
        };
        let Some(output) = self.graph.output_port(self.accessor, output) else {
            return Err(self.unknown_port("output", output));
        };
        self.graph.remove_dependency_ids(self.accessor, input, output)
    }

    // ---- composite operations -----------------------------------------

    /// Add a child to the running composite. The child stays uninitialized
    /// (its events are dropped) until [`children_changed`](Self::children_changed)
    /// triggers a model update.
    pub fn add_child<C: IntoAccessorSpec>(&mut self, child: C) -> Result<()> {
        self.graph
            .instantiate(Some(self.accessor), child.into_spec())
            .map(|_| ())
    }

    pub fn remove_child(&mut self, name: &str) -> Result<()> {
        self.graph
            .remove_child(&mut *self.director, self.accessor, name)
    }

    pub fn connect_children(
        &mut self,
        source_child: &str,
        source_port: &str,
        destination_child: &str,
        destination_port: &str,
    ) -> Result<()> {
        let connection = ConnectionDecl::Children {
            source_child: source_child.to_string(),
            source_port: source_port.to_string(),
            destination_child: destination_child.to_string(),
            destination_port: destination_port.to_string(),
        };
        self.graph.apply_connection(self.accessor, &connection)
    }

    /// Announce that children or connections changed. A model update runs
    /// at the next instant before any reaction, recomputing priorities and
    /// initializing whatever was added.
    pub fn children_changed(&mut self) {
        let id = self
            .director
            .schedule(CallbackAction::UpdateModel, 0, false, UPDATE_MODEL_PRIORITY);
        self.graph.accessor_mut(self.accessor).callback_ids.insert(id);
    }

    fn unknown_port(&self, kind: &str, port: &str) -> RuntimeError {
        RuntimeError::structure(format!(
            "accessor '{}' has no {kind} port named '{port}'",
            self.graph.full_accessor_name(self.accessor)
        ))
    }
}
