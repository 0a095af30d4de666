//! Builders for the two accessor variants.
//!
//! An accessor is an actor with named ports. [`AtomicAccessor`] is a leaf:
//! it owns user state, input handlers, and a fire hook. [`CompositeAccessor`]
//! is a branch: it owns children and relays events unchanged. Builders
//! collect declarations and are replayed into the model arena when the
//! accessor is added to a composite or a host.

use crate::error::{Result, RuntimeError};
use crate::event::Event;
use crate::reaction::ReactionContext;
use std::any::Any;

/// A name cannot be empty and cannot contain periods or whitespace.
pub fn name_is_valid(name: &str) -> bool {
    !name.is_empty() && !name.contains(['.', ' ', '\t', '\r', '\n'])
}

pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name_is_valid(name) {
        Ok(())
    } else {
        Err(RuntimeError::Name {
            name: name.to_string(),
        })
    }
}

/// User state carried by an accessor, type-erased in the model arena.
pub(crate) type ErasedState = Box<dyn Any + Send>;

/// Input handler over erased state. Registered per input port, invoked in
/// registration order on the head event of the port's queue.
pub(crate) type ErasedHandler = Box<
    dyn FnMut(&mut (dyn Any + Send), &Event, &mut ReactionContext<'_>) -> anyhow::Result<()>
        + Send,
>;

/// Initialize hooks, fire hooks, and user scheduled callbacks.
pub(crate) type ErasedHook =
    Box<dyn FnMut(&mut (dyn Any + Send), &mut ReactionContext<'_>) -> anyhow::Result<()> + Send>;

pub(crate) fn erase_hook<S, F>(mut f: F) -> ErasedHook
where
    S: Send + 'static,
    F: FnMut(&mut S, &mut ReactionContext<'_>) -> anyhow::Result<()> + Send + 'static,
{
    Box::new(move |state, cx| {
        let state = state
            .downcast_mut::<S>()
            .ok_or_else(|| anyhow::anyhow!("accessor state has an unexpected type"))?;
        f(state, cx)
    })
}

pub(crate) fn erase_handler<S, F>(mut f: F) -> ErasedHandler
where
    S: Send + 'static,
    F: FnMut(&mut S, &Event, &mut ReactionContext<'_>) -> anyhow::Result<()> + Send + 'static,
{
    Box::new(move |state, event, cx| {
        let state = state
            .downcast_mut::<S>()
            .ok_or_else(|| anyhow::anyhow!("accessor state has an unexpected type"))?;
        f(state, event, cx)
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PortRole {
    Input,
    Output,
    SpontaneousOutput,
}

/// Port declaration, replayed in order at instantiation time. Declaring a
/// spontaneous output prunes dependencies from every input declared so far,
/// same as adding it on a live accessor would.
pub(crate) struct PortDecl {
    pub(crate) name: String,
    pub(crate) role: PortRole,
}

/// Builder for a leaf accessor.
///
/// `S` is the accessor's state type; handlers and hooks receive `&mut S`
/// together with a [`ReactionContext`] for outputs, scheduling, and dynamic
/// port growth.
pub struct AtomicAccessor<S> {
    pub(crate) name: String,
    pub(crate) state: S,
    pub(crate) ports: Vec<PortDecl>,
    pub(crate) handlers: Vec<(String, ErasedHandler)>,
    pub(crate) init_fn: Option<ErasedHook>,
    pub(crate) fire_fn: Option<ErasedHook>,
    pub(crate) pruned: Vec<(String, String)>,
    pub(crate) state_inputs: Vec<String>,
    pub(crate) self_connections: Vec<(String, String)>,
}

impl<S: Send + 'static> AtomicAccessor<S> {
    pub fn new(name: impl Into<String>, state: S) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            name,
            state,
            ports: Vec::new(),
            handlers: Vec::new(),
            init_fn: None,
            fire_fn: None,
            pruned: Vec::new(),
            state_inputs: Vec::new(),
            self_connections: Vec::new(),
        })
    }

    pub fn add_input_port(mut self, name: &str) -> Result<Self> {
        self.declare_port(name, PortRole::Input)?;
        Ok(self)
    }

    pub fn add_output_port(mut self, name: &str) -> Result<Self> {
        self.declare_port(name, PortRole::Output)?;
        Ok(self)
    }

    /// An output that depends on no input, e.g. a timer-driven reading.
    pub fn add_spontaneous_output_port(mut self, name: &str) -> Result<Self> {
        self.declare_port(name, PortRole::SpontaneousOutput)?;
        Ok(self)
    }

    /// Register a handler invoked on every event arriving at `port`.
    /// A port may carry several handlers; they run in registration order.
    pub fn add_input_handler<F>(mut self, port: &str, f: F) -> Result<Self>
    where
        F: FnMut(&mut S, &Event, &mut ReactionContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.expect_port(port, PortRole::Input)?;
        self.handlers.push((port.to_string(), erase_handler(f)));
        Ok(self)
    }

    /// Hook run once during host setup, before the model starts reacting.
    pub fn on_initialize<F>(mut self, f: F) -> Self
    where
        F: FnMut(&mut S, &mut ReactionContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.init_fn = Some(erase_hook(f));
        self
    }

    /// Hook run once per reaction after all pending ports were serviced;
    /// the place to produce derived outputs.
    pub fn on_fire<F>(mut self, f: F) -> Self
    where
        F: FnMut(&mut S, &mut ReactionContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.fire_fn = Some(erase_hook(f));
        self
    }

    /// Remove the assumed causal dependency between `input` and `output`.
    pub fn remove_dependency(mut self, input: &str, output: &str) -> Result<Self> {
        self.expect_port(input, PortRole::Input)?;
        self.expect_output(output)?;
        self.pruned.push((input.to_string(), output.to_string()));
        Ok(self)
    }

    /// Declare that this accessor's state changes on input from `input`.
    pub fn accessor_state_depends_on(mut self, input: &str) -> Result<Self> {
        self.expect_port(input, PortRole::Input)?;
        self.state_inputs.push(input.to_string());
        Ok(self)
    }

    /// Feedforward: wire one of my inputs straight to one of my outputs.
    pub fn connect_my_input_to_my_output(mut self, input: &str, output: &str) -> Result<Self> {
        self.expect_port(input, PortRole::Input)?;
        self.expect_output(output)?;
        self.self_connections
            .push((input.to_string(), output.to_string()));
        Ok(self)
    }

    /// Feedback: wire one of my outputs back into one of my inputs.
    pub fn connect_my_output_to_my_input(mut self, output: &str, input: &str) -> Result<Self> {
        self.expect_output(output)?;
        self.expect_port(input, PortRole::Input)?;
        self.self_connections
            .push((output.to_string(), input.to_string()));
        Ok(self)
    }

    fn declare_port(&mut self, name: &str, role: PortRole) -> Result<()> {
        validate_name(name)?;
        if self.ports.iter().any(|p| p.name == name) {
            return Err(RuntimeError::Name {
                name: name.to_string(),
            });
        }
        self.ports.push(PortDecl {
            name: name.to_string(),
            role,
        });
        Ok(())
    }

    fn expect_port(&self, name: &str, role: PortRole) -> Result<()> {
        if self.ports.iter().any(|p| p.name == name && p.role == role) {
            Ok(())
        } else {
            Err(RuntimeError::structure(format!(
                "accessor '{}' has no port named '{name}' of the required kind",
                self.name
            )))
        }
    }

    fn expect_output(&self, name: &str) -> Result<()> {
        if self
            .ports
            .iter()
            .any(|p| p.name == name && p.role != PortRole::Input)
        {
            Ok(())
        } else {
            Err(RuntimeError::structure(format!(
                "accessor '{}' has no output port named '{name}'",
                self.name
            )))
        }
    }
}

/// Connection declared on a composite, resolved at instantiation time.
pub(crate) enum ConnectionDecl {
    Children {
        source_child: String,
        source_port: String,
        destination_child: String,
        destination_port: String,
    },
    MyInputToChildInput {
        my_input: String,
        child: String,
        child_input: String,
    },
    ChildOutputToMyOutput {
        child: String,
        child_output: String,
        my_output: String,
    },
}

/// Builder for a branch accessor: children plus the wiring between them and
/// the composite's own relay ports. Composites carry no handlers and no
/// fire hook.
pub struct CompositeAccessor {
    pub(crate) name: String,
    pub(crate) state: Option<ErasedState>,
    pub(crate) init_fn: Option<ErasedHook>,
    pub(crate) ports: Vec<PortDecl>,
    pub(crate) children: Vec<AccessorSpec>,
    pub(crate) connections: Vec<ConnectionDecl>,
}

impl CompositeAccessor {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            name,
            state: None,
            init_fn: None,
            ports: Vec::new(),
            children: Vec::new(),
            connections: Vec::new(),
        })
    }

    /// Attach user state to the composite; hooks registered with a matching
    /// type receive it mutably.
    pub fn with_state<S: Send + 'static>(name: impl Into<String>, state: S) -> Result<Self> {
        let mut composite = Self::new(name)?;
        composite.state = Some(Box::new(state));
        Ok(composite)
    }

    pub fn add_input_port(mut self, name: &str) -> Result<Self> {
        self.declare_port(name, PortRole::Input)?;
        Ok(self)
    }

    pub fn add_output_port(mut self, name: &str) -> Result<Self> {
        self.declare_port(name, PortRole::Output)?;
        Ok(self)
    }

    /// A child's name must differ from the parent's and from every sibling's.
    pub fn add_child<C: IntoAccessorSpec>(mut self, child: C) -> Result<Self> {
        let spec = child.into_spec();
        let child_name = spec.name().to_string();
        validate_name(&child_name)?;
        if child_name == self.name || self.children.iter().any(|c| c.name() == child_name) {
            return Err(RuntimeError::Name { name: child_name });
        }
        self.children.push(spec);
        Ok(self)
    }

    pub fn connect_children(
        mut self,
        source_child: &str,
        source_port: &str,
        destination_child: &str,
        destination_port: &str,
    ) -> Result<Self> {
        self.expect_child(source_child)?;
        self.expect_child(destination_child)?;
        self.connections.push(ConnectionDecl::Children {
            source_child: source_child.to_string(),
            source_port: source_port.to_string(),
            destination_child: destination_child.to_string(),
            destination_port: destination_port.to_string(),
        });
        Ok(self)
    }

    pub fn connect_my_input_to_child_input(
        mut self,
        my_input: &str,
        child: &str,
        child_input: &str,
    ) -> Result<Self> {
        self.expect_child(child)?;
        self.connections.push(ConnectionDecl::MyInputToChildInput {
            my_input: my_input.to_string(),
            child: child.to_string(),
            child_input: child_input.to_string(),
        });
        Ok(self)
    }

    pub fn connect_child_output_to_my_output(
        mut self,
        child: &str,
        child_output: &str,
        my_output: &str,
    ) -> Result<Self> {
        self.expect_child(child)?;
        self.connections
            .push(ConnectionDecl::ChildOutputToMyOutput {
                child: child.to_string(),
                child_output: child_output.to_string(),
                my_output: my_output.to_string(),
            });
        Ok(self)
    }

    /// Hook run once during host setup, after all children initialized.
    pub fn on_initialize<S, F>(mut self, f: F) -> Self
    where
        S: Send + 'static,
        F: FnMut(&mut S, &mut ReactionContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.init_fn = Some(erase_hook(f));
        self
    }

    fn declare_port(&mut self, name: &str, role: PortRole) -> Result<()> {
        validate_name(name)?;
        if self.ports.iter().any(|p| p.name == name) {
            return Err(RuntimeError::Name {
                name: name.to_string(),
            });
        }
        self.ports.push(PortDecl {
            name: name.to_string(),
            role,
        });
        Ok(())
    }

    fn expect_child(&self, name: &str) -> Result<()> {
        if self.children.iter().any(|c| c.name() == name) {
            Ok(())
        } else {
            Err(RuntimeError::structure(format!(
                "composite '{}' has no child named '{name}'",
                self.name
            )))
        }
    }
}

pub(crate) struct AtomicSpec {
    pub(crate) name: String,
    pub(crate) state: ErasedState,
    pub(crate) ports: Vec<PortDecl>,
    pub(crate) handlers: Vec<(String, ErasedHandler)>,
    pub(crate) init_fn: Option<ErasedHook>,
    pub(crate) fire_fn: Option<ErasedHook>,
    pub(crate) pruned: Vec<(String, String)>,
    pub(crate) state_inputs: Vec<String>,
    pub(crate) self_connections: Vec<(String, String)>,
}

pub(crate) enum SpecInner {
    Atomic(AtomicSpec),
    Composite(CompositeAccessor),
}

/// Type-erased accessor under construction, ready to be added to a
/// composite or host.
pub struct AccessorSpec(pub(crate) SpecInner);

impl AccessorSpec {
    pub(crate) fn name(&self) -> &str {
        match &self.0 {
            SpecInner::Atomic(spec) => &spec.name,
            SpecInner::Composite(spec) => &spec.name,
        }
    }
}

/// Anything that can become a child of a composite.
pub trait IntoAccessorSpec {
    fn into_spec(self) -> AccessorSpec;
}

impl<S: Send + 'static> IntoAccessorSpec for AtomicAccessor<S> {
    fn into_spec(self) -> AccessorSpec {
        AccessorSpec(SpecInner::Atomic(AtomicSpec {
            name: self.name,
            state: Box::new(self.state),
            ports: self.ports,
            handlers: self.handlers,
            init_fn: self.init_fn,
            fire_fn: self.fire_fn,
            pruned: self.pruned,
            state_inputs: self.state_inputs,
            self_connections: self.self_connections,
        }))
    }
}

impl IntoAccessorSpec for CompositeAccessor {
    fn into_spec(self) -> AccessorSpec {
        AccessorSpec(SpecInner::Composite(self))
    }
}

impl IntoAccessorSpec for AccessorSpec {
    fn into_spec(self) -> AccessorSpec {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_name() {
        assert!(name_is_valid("TargetName"));
    }

    #[test]
    fn empty_name_is_invalid() {
        assert!(!name_is_valid(""));
    }

    #[test]
    fn name_with_periods_is_invalid() {
        assert!(!name_is_valid("Target.Name"));
    }

    #[test]
    fn name_with_whitespace_is_invalid() {
        assert!(!name_is_valid("Target Name"));
        assert!(!name_is_valid("Target\tName"));
        assert!(!name_is_valid("Target\nName"));
        assert!(!name_is_valid("Target\rName"));
    }

    #[test]
    fn duplicate_port_names_are_rejected() {
        let builder = AtomicAccessor::new("Target", ())
            .unwrap()
            .add_input_port("In")
            .unwrap();
        assert!(matches!(
            builder.add_output_port("In"),
            Err(RuntimeError::Name { .. })
        ));
    }

    #[test]
    fn duplicate_child_names_are_rejected() {
        let child = |name: &str| AtomicAccessor::new(name, ()).unwrap();
        let composite = CompositeAccessor::new("Parent")
            .unwrap()
            .add_child(child("Kid"))
            .unwrap();
        assert!(composite.add_child(child("Kid")).is_err());
    }

    #[test]
    fn child_cannot_share_parent_name() {
        let composite = CompositeAccessor::new("Parent").unwrap();
        let child = AtomicAccessor::new("Parent", ()).unwrap();
        assert!(composite.add_child(child).is_err());
    }
}
