//! The model arena: every accessor and port of one host lives here, keyed by
//! stable indices. Parent links are plain ids, so the ownership tree stays a
//! tree while back-references stay cheap. The arena also carries the event
//! relay (`send`/`receive`) and the reaction-request path that bubbles from
//! an alerted input port up to the root composite.

use crate::accessor::{
    validate_name, AccessorSpec, AtomicSpec, CompositeAccessor, ConnectionDecl, ErasedHandler,
    ErasedHook, ErasedState, PortRole, SpecInner,
};
use crate::director::{CallbackAction, CallbackId, Director, DEFAULT_PRIORITY};
use crate::error::{Result, RuntimeError};
use crate::event::Event;
use crate::port::{AccessorId, PortId, PortNode};
use crate::utils::UniquePriorityQueue;
use std::collections::{BTreeSet, HashMap};

pub(crate) struct AtomicParts {
    pub(crate) handlers: HashMap<PortId, Vec<ErasedHandler>>,
    pub(crate) fire_fn: Option<ErasedHook>,
    /// Outputs that no longer causally depend on an input, and the inverse.
    /// By default every input is assumed to reach every output; these maps
    /// remove edges.
    pub(crate) forward_pruned: HashMap<PortId, BTreeSet<PortId>>,
    pub(crate) backward_pruned: HashMap<PortId, BTreeSet<PortId>>,
    pub(crate) state_depends_on_input: bool,
}

impl Default for AtomicParts {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
            fire_fn: None,
            forward_pruned: HashMap::new(),
            backward_pruned: HashMap::new(),
            state_depends_on_input: false,
        }
    }
}

#[derive(Default)]
pub(crate) struct CompositeParts {
    pub(crate) children: Vec<AccessorId>,
    /// Children whose reaction is pending, at most one entry per child.
    pub(crate) pending: UniquePriorityQueue<AccessorId>,
    pub(crate) reaction_requested: bool,
}

pub(crate) enum NodeKind {
    Atomic(AtomicParts),
    Composite(CompositeParts),
}

pub(crate) struct AccessorNode {
    pub(crate) name: String,
    pub(crate) parent: Option<AccessorId>,
    pub(crate) priority: i32,
    pub(crate) initialized: bool,
    /// Set when the accessor was removed from the model; the arena slot
    /// stays so ids remain stable.
    pub(crate) detached: bool,
    pub(crate) state: Option<ErasedState>,
    pub(crate) init_fn: Option<ErasedHook>,
    pub(crate) callback_ids: BTreeSet<CallbackId>,
    pub(crate) inputs: Vec<PortId>,
    pub(crate) outputs: Vec<PortId>,
    pub(crate) kind: NodeKind,
}

impl AccessorNode {
    pub(crate) fn is_composite(&self) -> bool {
        matches!(self.kind, NodeKind::Composite(_))
    }
}

#[derive(Default)]
pub(crate) struct ModelGraph {
    pub(crate) accessors: Vec<AccessorNode>,
    pub(crate) ports: Vec<PortNode>,
}

impl ModelGraph {
    pub(crate) fn accessor(&self, id: AccessorId) -> &AccessorNode {
        &self.accessors[id.0]
    }

    pub(crate) fn accessor_mut(&mut self, id: AccessorId) -> &mut AccessorNode {
        &mut self.accessors[id.0]
    }

    pub(crate) fn port(&self, id: PortId) -> &PortNode {
        &self.ports[id.0]
    }

    pub(crate) fn port_mut(&mut self, id: PortId) -> &mut PortNode {
        &mut self.ports[id.0]
    }

    /// Dotted path from the root, for errors and logs.
    pub(crate) fn full_accessor_name(&self, id: AccessorId) -> String {
        let mut segments = vec![self.accessor(id).name.as_str()];
        let mut current = self.accessor(id).parent;
        while let Some(parent) = current {
            segments.push(self.accessor(parent).name.as_str());
            current = self.accessor(parent).parent;
        }
        segments.reverse();
        segments.join(".")
    }

    pub(crate) fn full_port_name(&self, id: PortId) -> String {
        let port = self.port(id);
        format!("{}.{}", self.full_accessor_name(port.owner), port.name)
    }

    pub(crate) fn input_port(&self, accessor: AccessorId, name: &str) -> Option<PortId> {
        self.accessor(accessor)
            .inputs
            .iter()
            .copied()
            .find(|&p| self.port(p).name == name)
    }

    pub(crate) fn output_port(&self, accessor: AccessorId, name: &str) -> Option<PortId> {
        self.accessor(accessor)
            .outputs
            .iter()
            .copied()
            .find(|&p| self.port(p).name == name)
    }

    pub(crate) fn any_port(&self, accessor: AccessorId, name: &str) -> Option<PortId> {
        self.input_port(accessor, name)
            .or_else(|| self.output_port(accessor, name))
    }

    pub(crate) fn child_by_name(&self, composite: AccessorId, name: &str) -> Option<AccessorId> {
        match &self.accessor(composite).kind {
            NodeKind::Composite(parts) => parts
                .children
                .iter()
                .copied()
                .find(|&c| self.accessor(c).name == name),
            NodeKind::Atomic(_) => None,
        }
    }

    // ---- structure ----------------------------------------------------

    pub(crate) fn add_port(
        &mut self,
        owner: AccessorId,
        name: &str,
        role: PortRole,
    ) -> Result<PortId> {
        validate_name(name)?;
        if self.any_port(owner, name).is_some() {
            return Err(RuntimeError::Name {
                name: name.to_string(),
            });
        }
        let id = PortId(self.ports.len());
        let node = match role {
            PortRole::Input => PortNode::input(name.to_string(), owner),
            PortRole::Output => PortNode::output(name.to_string(), owner, false),
            PortRole::SpontaneousOutput => PortNode::output(name.to_string(), owner, true),
        };
        tracing::trace!(port = %format!("{}.{}", self.full_accessor_name(owner), name), ?role, "adding port");
        self.ports.push(node);
        match role {
            PortRole::Input => self.accessor_mut(owner).inputs.push(id),
            PortRole::Output | PortRole::SpontaneousOutput => {
                self.accessor_mut(owner).outputs.push(id)
            }
        }
        if role == PortRole::SpontaneousOutput {
            // spontaneous outputs depend on no input
            let inputs = self.accessor(owner).inputs.clone();
            for input in inputs {
                self.remove_dependency_ids(owner, input, id)?;
            }
        }
        Ok(id)
    }

    pub(crate) fn remove_dependency_ids(
        &mut self,
        owner: AccessorId,
        input: PortId,
        output: PortId,
    ) -> Result<()> {
        match &mut self.accessors[owner.0].kind {
            NodeKind::Atomic(parts) => {
                parts.forward_pruned.entry(input).or_default().insert(output);
                parts.backward_pruned.entry(output).or_default().insert(input);
                Ok(())
            }
            NodeKind::Composite(_) => Err(RuntimeError::structure(format!(
                "composite accessor '{}' carries no port dependencies",
                self.full_accessor_name(owner)
            ))),
        }
    }

    /// A destination may have at most one source, and a spontaneous output
    /// may have none. Connecting the same pair twice is a no-op.
    pub(crate) fn connect(&mut self, source: PortId, destination: PortId) -> Result<()> {
        if let Some(existing) = self.port(destination).source {
            if existing != source {
                return Err(RuntimeError::structure(format!(
                    "destination port '{}' is already connected to source port '{}'",
                    self.full_port_name(destination),
                    self.full_port_name(existing)
                )));
            }
        }
        if self.port(destination).is_spontaneous() {
            return Err(RuntimeError::structure(format!(
                "spontaneous output port '{}' cannot be a destination",
                self.full_port_name(destination)
            )));
        }
        tracing::trace!(
            source = %self.full_port_name(source),
            destination = %self.full_port_name(destination),
            "connecting ports"
        );
        self.port_mut(destination).source = Some(source);
        let destinations = &mut self.port_mut(source).destinations;
        if !destinations.contains(&destination) {
            destinations.push(destination);
        }
        Ok(())
    }

    pub(crate) fn instantiate(
        &mut self,
        parent: Option<AccessorId>,
        spec: AccessorSpec,
    ) -> Result<AccessorId> {
        match spec.0 {
            SpecInner::Atomic(atomic) => self.instantiate_atomic(parent, atomic),
            SpecInner::Composite(composite) => self.instantiate_composite(parent, composite),
        }
    }

    fn new_node(
        &mut self,
        parent: Option<AccessorId>,
        name: String,
        state: ErasedState,
        init_fn: Option<ErasedHook>,
        kind: NodeKind,
    ) -> Result<AccessorId> {
        validate_name(&name)?;
        if let Some(parent) = parent {
            if self.accessor(parent).name == name || self.child_by_name(parent, &name).is_some() {
                return Err(RuntimeError::Name { name });
            }
            if !self.accessor(parent).is_composite() {
                return Err(RuntimeError::structure(format!(
                    "accessor '{}' is atomic and cannot own children",
                    self.full_accessor_name(parent)
                )));
            }
        }
        let id = AccessorId(self.accessors.len());
        self.accessors.push(AccessorNode {
            name,
            parent,
            priority: DEFAULT_PRIORITY,
            initialized: false,
            detached: false,
            state: Some(state),
            init_fn,
            callback_ids: BTreeSet::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            kind,
        });
        if let Some(parent) = parent {
            if let NodeKind::Composite(parts) = &mut self.accessors[parent.0].kind {
                parts.children.push(id);
            }
        }
        Ok(id)
    }

    fn instantiate_atomic(
        &mut self,
        parent: Option<AccessorId>,
        spec: AtomicSpec,
    ) -> Result<AccessorId> {
        let id = self.new_node(
            parent,
            spec.name,
            spec.state,
            spec.init_fn,
            NodeKind::Atomic(AtomicParts {
                fire_fn: spec.fire_fn,
                ..AtomicParts::default()
            }),
        )?;
        for decl in &spec.ports {
            self.add_port(id, &decl.name, decl.role)?;
        }
        for (port, handler) in spec.handlers {
            let port_id = self.input_port(id, &port).ok_or_else(|| {
                RuntimeError::structure(format!(
                    "accessor '{}' has no input port named '{port}'",
                    self.full_accessor_name(id)
                ))
            })?;
            if let NodeKind::Atomic(parts) = &mut self.accessors[id.0].kind {
                parts.handlers.entry(port_id).or_default().push(handler);
            }
        }
        for (input, output) in &spec.pruned {
            let input = self.require_input(id, input)?;
            let output = self.require_output(id, output)?;
            self.remove_dependency_ids(id, input, output)?;
        }
        for name in &spec.state_inputs {
            self.require_input(id, name)?;
        }
        if !spec.state_inputs.is_empty() {
            if let NodeKind::Atomic(parts) = &mut self.accessors[id.0].kind {
                parts.state_depends_on_input = true;
            }
        }
        for (source, destination) in &spec.self_connections {
            let source = self.require_any_port(id, source)?;
            let destination = self.require_any_port(id, destination)?;
            self.connect(source, destination)?;
        }
        Ok(id)
    }

    fn instantiate_composite(
        &mut self,
        parent: Option<AccessorId>,
        spec: CompositeAccessor,
    ) -> Result<AccessorId> {
        let state = spec.state.unwrap_or_else(|| Box::new(()));
        let id = self.new_node(
            parent,
            spec.name,
            state,
            spec.init_fn,
            NodeKind::Composite(CompositeParts::default()),
        )?;
        for decl in &spec.ports {
            self.add_port(id, &decl.name, decl.role)?;
        }
        for child in spec.children {
            self.instantiate(Some(id), child)?;
        }
        for connection in &spec.connections {
            self.apply_connection(id, connection)?;
        }
        Ok(id)
    }

    pub(crate) fn apply_connection(
        &mut self,
        composite: AccessorId,
        connection: &ConnectionDecl,
    ) -> Result<()> {
        match connection {
            ConnectionDecl::Children {
                source_child,
                source_port,
                destination_child,
                destination_port,
            } => {
                let source_child = self.require_child(composite, source_child)?;
                let destination_child = self.require_child(composite, destination_child)?;
                let source = self.require_output(source_child, source_port)?;
                let destination = self.require_input(destination_child, destination_port)?;
                self.connect(source, destination)
            }
            ConnectionDecl::MyInputToChildInput {
                my_input,
                child,
                child_input,
            } => {
                let source = self.require_input(composite, my_input)?;
                let child = self.require_child(composite, child)?;
                let destination = self.require_input(child, child_input)?;
                self.connect(source, destination)
            }
            ConnectionDecl::ChildOutputToMyOutput {
                child,
                child_output,
                my_output,
            } => {
                let child = self.require_child(composite, child)?;
                let source = self.require_output(child, child_output)?;
                let destination = self.require_output(composite, my_output)?;
                self.connect(source, destination)
            }
        }
    }

    fn require_child(&self, composite: AccessorId, name: &str) -> Result<AccessorId> {
        self.child_by_name(composite, name).ok_or_else(|| {
            RuntimeError::structure(format!(
                "composite '{}' has no child named '{name}'",
                self.full_accessor_name(composite)
            ))
        })
    }

    fn require_input(&self, accessor: AccessorId, name: &str) -> Result<PortId> {
        self.input_port(accessor, name).ok_or_else(|| {
            RuntimeError::structure(format!(
                "accessor '{}' has no input port named '{name}'",
                self.full_accessor_name(accessor)
            ))
        })
    }

    fn require_output(&self, accessor: AccessorId, name: &str) -> Result<PortId> {
        self.output_port(accessor, name).ok_or_else(|| {
            RuntimeError::structure(format!(
                "accessor '{}' has no output port named '{name}'",
                self.full_accessor_name(accessor)
            ))
        })
    }

    fn require_any_port(&self, accessor: AccessorId, name: &str) -> Result<PortId> {
        self.any_port(accessor, name).ok_or_else(|| {
            RuntimeError::structure(format!(
                "accessor '{}' has no port named '{name}'",
                self.full_accessor_name(accessor)
            ))
        })
    }

    // ---- event flow ---------------------------------------------------

    /// Deliver `event` to every destination of `port`, in connection order.
    pub(crate) fn send_from_port(
        &mut self,
        director: &mut Director,
        port: PortId,
        event: &Event,
    ) {
        let destinations = self.port(port).destinations.clone();
        if !destinations.is_empty() {
            tracing::trace!(port = %self.full_port_name(port), "relaying event");
        }
        for destination in destinations {
            self.receive(director, destination, event);
        }
    }

    /// Events arriving before the owner is initialized are dropped; output
    /// ports and composite inputs relay unchanged; atomic inputs enqueue
    /// and, on the empty-to-non-empty transition, request a reaction.
    pub(crate) fn receive(&mut self, director: &mut Director, port: PortId, event: &Event) {
        let owner = self.port(port).owner;
        if !self.accessor(owner).initialized {
            tracing::trace!(
                port = %self.full_port_name(port),
                "dropping event for uninitialized accessor"
            );
            return;
        }
        if !self.port(port).is_input() || self.accessor(owner).is_composite() {
            self.send_from_port(director, port, event);
            return;
        }
        let was_waiting = self.port(port).waiting_for_handler();
        self.port_mut(port).enqueue(event.clone());
        if !was_waiting {
            self.alert_new_input(director, owner);
            self.send_from_port(director, port, event);
        }
    }

    fn alert_new_input(&mut self, director: &mut Director, accessor: AccessorId) {
        if let Some(parent) = self.accessor(accessor).parent {
            let priority = self.accessor(accessor).priority;
            self.schedule_reaction(director, parent, accessor, priority);
        }
    }

    /// Bubble a reaction request up the composition tree. Only the root
    /// talks to the director, and only when no reaction is pending yet.
    pub(crate) fn schedule_reaction(
        &mut self,
        director: &mut Director,
        composite: AccessorId,
        child: AccessorId,
        priority: i32,
    ) {
        let priority = if priority == DEFAULT_PRIORITY {
            self.accessor(composite).priority
        } else {
            priority
        };
        let parent = self.accessor(composite).parent;
        if let NodeKind::Composite(parts) = &mut self.accessors[composite.0].kind {
            if parent.is_some() {
                parts.pending.push(priority, child);
            } else if !parts.reaction_requested {
                parts.reaction_requested = true;
                parts.pending.push(priority, child);
                director.schedule(
                    CallbackAction::ProcessChildQueue { composite },
                    0,
                    false,
                    priority,
                );
            } else {
                parts.pending.push(priority, child);
            }
        }
        if let Some(parent) = parent {
            self.schedule_reaction(director, parent, composite, priority);
        }
    }

    // ---- state and handler slots --------------------------------------

    /// Take the accessor's state out for the duration of a handler or hook
    /// invocation; the context may then borrow the arena freely.
    pub(crate) fn take_state(&mut self, accessor: AccessorId) -> Result<ErasedState> {
        self.accessors[accessor.0].state.take().ok_or_else(|| {
            RuntimeError::structure(format!(
                "state of accessor '{}' is unavailable",
                self.full_accessor_name(accessor)
            ))
        })
    }

    pub(crate) fn put_state(&mut self, accessor: AccessorId, state: ErasedState) {
        self.accessors[accessor.0].state = Some(state);
    }

    pub(crate) fn take_handlers(
        &mut self,
        accessor: AccessorId,
        port: PortId,
    ) -> Vec<ErasedHandler> {
        match &mut self.accessors[accessor.0].kind {
            NodeKind::Atomic(parts) => parts.handlers.remove(&port).unwrap_or_default(),
            NodeKind::Composite(_) => Vec::new(),
        }
    }

    /// Handlers registered while the port's list was checked out are
    /// appended after the existing ones, preserving registration order.
    pub(crate) fn put_handlers(
        &mut self,
        accessor: AccessorId,
        port: PortId,
        mut handlers: Vec<ErasedHandler>,
    ) {
        if let NodeKind::Atomic(parts) = &mut self.accessors[accessor.0].kind {
            if let Some(added) = parts.handlers.remove(&port) {
                handlers.extend(added);
            }
            parts.handlers.insert(port, handlers);
        }
    }

    // ---- pruned dependency queries ------------------------------------

    /// Outputs still causally reachable from `input`.
    pub(crate) fn dependent_outputs(&self, accessor: AccessorId, input: PortId) -> Vec<PortId> {
        let node = self.accessor(accessor);
        match &node.kind {
            NodeKind::Atomic(parts) => match parts.forward_pruned.get(&input) {
                None => node.outputs.clone(),
                Some(pruned) => node
                    .outputs
                    .iter()
                    .copied()
                    .filter(|p| !pruned.contains(p))
                    .collect(),
            },
            NodeKind::Composite(_) => Vec::new(),
        }
    }

    /// Inputs `output` still causally depends on.
    pub(crate) fn input_dependencies(&self, accessor: AccessorId, output: PortId) -> Vec<PortId> {
        let node = self.accessor(accessor);
        match &node.kind {
            NodeKind::Atomic(parts) => match parts.backward_pruned.get(&output) {
                None => node.inputs.clone(),
                Some(pruned) => node
                    .inputs
                    .iter()
                    .copied()
                    .filter(|p| !pruned.contains(p))
                    .collect(),
            },
            NodeKind::Composite(_) => Vec::new(),
        }
    }

    /// Input ports of one atomic accessor that reach a common output with
    /// `input` through the pruned dependency graph. With nothing pruned, a
    /// single input, or no outputs, every input is trivially equivalent.
    pub(crate) fn equivalent_ports(&self, accessor: AccessorId, input: PortId) -> Vec<PortId> {
        let node = self.accessor(accessor);
        let trivially_equivalent = match &node.kind {
            NodeKind::Atomic(parts) => parts.forward_pruned.is_empty(),
            NodeKind::Composite(_) => return vec![input],
        };
        if trivially_equivalent || node.inputs.len() == 1 || node.outputs.is_empty() {
            return node.inputs.clone();
        }
        let mut equivalent: BTreeSet<PortId> = BTreeSet::new();
        let mut dependent_outputs: BTreeSet<PortId> = BTreeSet::new();
        let mut frontier = vec![input];
        while let Some(current) = frontier.pop() {
            if !equivalent.insert(current) {
                continue;
            }
            for output in self.dependent_outputs(accessor, current) {
                if dependent_outputs.insert(output) {
                    frontier.extend(self.input_dependencies(accessor, output));
                }
            }
        }
        equivalent.into_iter().collect()
    }

    // ---- dynamic removal ----------------------------------------------

    /// Detach a child subtree: clear its scheduled callbacks, disconnect
    /// its ports, and drop it from the parent's child list. Arena slots are
    /// retired in place so ids elsewhere stay valid.
    pub(crate) fn remove_child(
        &mut self,
        director: &mut Director,
        composite: AccessorId,
        child_name: &str,
    ) -> Result<()> {
        let child = self.require_child(composite, child_name)?;
        if let NodeKind::Composite(parts) = &mut self.accessors[composite.0].kind {
            parts.children.retain(|&c| c != child);
        }
        tracing::debug!(child = %self.full_accessor_name(child), "removing child");
        self.retire_subtree(director, child)
    }

    fn retire_subtree(&mut self, director: &mut Director, accessor: AccessorId) -> Result<()> {
        let callback_ids: Vec<CallbackId> =
            self.accessors[accessor.0].callback_ids.iter().copied().collect();
        for id in callback_ids {
            director.clear(id)?;
        }
        self.accessors[accessor.0].callback_ids.clear();

        let mut ports = self.accessor(accessor).inputs.clone();
        ports.extend(self.accessor(accessor).outputs.clone());
        for port in ports {
            self.disconnect_all(port);
        }

        self.accessors[accessor.0].detached = true;
        self.accessors[accessor.0].initialized = false;

        let children = match &mut self.accessors[accessor.0].kind {
            NodeKind::Composite(parts) => std::mem::take(&mut parts.children),
            NodeKind::Atomic(_) => Vec::new(),
        };
        for child in children {
            self.retire_subtree(director, child)?;
        }
        Ok(())
    }

    fn disconnect_all(&mut self, port: PortId) {
        if let Some(source) = self.port(port).source {
            self.port_mut(source).destinations.retain(|&d| d != port);
            self.port_mut(port).source = None;
        }
        let destinations = std::mem::take(&mut self.port_mut(port).destinations);
        for destination in destinations {
            self.port_mut(destination).source = None;
        }
    }
}
