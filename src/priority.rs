//! Topological analysis of the model's causality graph.
//!
//! Port connections imply an execution order: an accessor must react before
//! anything consuming its outputs and after everything producing its inputs.
//! This module assigns each accessor an integer priority consistent with
//! that partial order by computing port depths over the pruned dependency
//! graph. A directed cycle in that graph cannot be scheduled and fails the
//! analysis with an error naming an involved port.

use crate::director::{Director, HOST_PRIORITY};
use crate::error::{Result, RuntimeError};
use crate::graph::{ModelGraph, NodeKind};
use crate::port::{AccessorId, PortId};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Assign deterministic priorities to every accessor reachable from `root`.
///
/// Accessors group into buckets by depth; walking buckets in ascending
/// order, composites take the running value and every accessor consumes one
/// slot. With a `director` given, callbacks queued under an old priority are
/// re-sorted under the new one before it takes effect.
pub(crate) fn compute_priorities(
    graph: &mut ModelGraph,
    root: AccessorId,
    mut director: Option<&mut Director>,
) -> Result<()> {
    let mut port_depths: HashMap<PortId, i32> = HashMap::new();
    let mut buckets: BTreeMap<i32, Vec<AccessorId>> = BTreeMap::new();
    accessor_depth(graph, root, &mut port_depths, &mut buckets)?;

    let mut priority = HOST_PRIORITY;
    for (depth, accessors) in buckets {
        priority = priority.max(depth);
        for accessor in accessors {
            if let Some(director) = director.as_deref_mut() {
                let old = graph.accessor(accessor).priority;
                if old != priority {
                    director.handle_priority_update(old, priority);
                }
            }
            tracing::trace!(
                accessor = %graph.full_accessor_name(accessor),
                priority,
                "assigned priority"
            );
            graph.accessor_mut(accessor).priority = priority;
            priority += 1;
        }
    }
    Ok(())
}

fn accessor_depth(
    graph: &ModelGraph,
    accessor: AccessorId,
    port_depths: &mut HashMap<PortId, i32>,
    buckets: &mut BTreeMap<i32, Vec<AccessorId>>,
) -> Result<i32> {
    match &graph.accessor(accessor).kind {
        NodeKind::Composite(_) => composite_depth(graph, accessor, port_depths, buckets),
        NodeKind::Atomic(_) => atomic_depth(graph, accessor, port_depths, buckets),
    }
}

/// A composite is as early as its earliest child. Composites land at the
/// front of their bucket so a branch is priced before its leaves.
fn composite_depth(
    graph: &ModelGraph,
    composite: AccessorId,
    port_depths: &mut HashMap<PortId, i32>,
    buckets: &mut BTreeMap<i32, Vec<AccessorId>>,
) -> Result<i32> {
    let children = match &graph.accessor(composite).kind {
        NodeKind::Composite(parts) => parts.children.clone(),
        NodeKind::Atomic(_) => Vec::new(),
    };
    let mut min_child_depth = i32::MAX;
    for child in children {
        let child_depth = accessor_depth(graph, child, port_depths, buckets)?;
        min_child_depth = min_child_depth.min(child_depth);
    }
    let depth = if min_child_depth == i32::MAX {
        0
    } else {
        min_child_depth
    };
    buckets.entry(depth).or_default().insert(0, composite);
    Ok(depth)
}

/// An atomic accessor with outputs must precede any consumer of its
/// earliest output; one without outputs must follow every producer of its
/// latest input.
fn atomic_depth(
    graph: &ModelGraph,
    accessor: AccessorId,
    port_depths: &mut HashMap<PortId, i32>,
    buckets: &mut BTreeMap<i32, Vec<AccessorId>>,
) -> Result<i32> {
    let mut max_input_depth = 0;
    for input in graph.accessor(accessor).inputs.clone() {
        if !port_depths.contains_key(&input) {
            let mut visited_inputs = HashSet::new();
            let mut visited_outputs = HashSet::new();
            input_port_depth(
                graph,
                input,
                port_depths,
                &mut visited_inputs,
                &mut visited_outputs,
            )?;
        }
        max_input_depth = max_input_depth.max(port_depths[&input]);
    }

    let mut min_output_depth = i32::MAX;
    for output in graph.accessor(accessor).outputs.clone() {
        if !port_depths.contains_key(&output) {
            let mut visited_inputs = HashSet::new();
            let mut visited_outputs = HashSet::new();
            output_port_depth(
                graph,
                output,
                port_depths,
                &mut visited_inputs,
                &mut visited_outputs,
            )?;
        }
        min_output_depth = min_output_depth.min(port_depths[&output]);
    }

    let depth = if graph.accessor(accessor).outputs.is_empty() {
        max_input_depth
    } else {
        min_output_depth
    };
    buckets.entry(depth).or_default().push(accessor);
    Ok(depth)
}

/// An input sits one past the deepest source output reachable from its
/// equivalence class; every port of the class shares that depth.
fn input_port_depth(
    graph: &ModelGraph,
    input: PortId,
    port_depths: &mut HashMap<PortId, i32>,
    visited_inputs: &mut HashSet<PortId>,
    visited_outputs: &mut HashSet<PortId>,
) -> Result<()> {
    let owner = graph.port(input).owner;
    let equivalents = graph.equivalent_ports(owner, input);
    let mut depth = 0;
    for &equivalent in &equivalents {
        visited_inputs.insert(equivalent);
        let Some(source) = source_output_port(graph, equivalent) else {
            continue;
        };
        if !port_depths.contains_key(&source) {
            if visited_outputs.contains(&source) {
                return Err(RuntimeError::CausalityLoop {
                    port: graph.full_port_name(source),
                });
            }
            output_port_depth(graph, source, port_depths, visited_inputs, visited_outputs)?;
        }
        depth = depth.max(port_depths[&source] + 1);
    }
    for &equivalent in &equivalents {
        port_depths.insert(equivalent, depth);
    }
    Ok(())
}

/// An output is as deep as the deepest input it depends on; a spontaneous
/// output depends on nothing and sits at depth zero.
fn output_port_depth(
    graph: &ModelGraph,
    output: PortId,
    port_depths: &mut HashMap<PortId, i32>,
    visited_inputs: &mut HashSet<PortId>,
    visited_outputs: &mut HashSet<PortId>,
) -> Result<()> {
    visited_outputs.insert(output);
    let owner = graph.port(output).owner;
    let mut depth = 0;
    for dependency in graph.input_dependencies(owner, output) {
        if !port_depths.contains_key(&dependency) {
            if visited_inputs.contains(&dependency) {
                return Err(RuntimeError::CausalityLoop {
                    port: graph.full_port_name(dependency),
                });
            }
            input_port_depth(graph, dependency, port_depths, visited_inputs, visited_outputs)?;
        }
        depth = depth.max(port_depths[&dependency]);
    }
    port_depths.insert(output, depth);
    Ok(())
}

/// Walk an input's source chain through composite relay ports to the
/// underlying atomic output, or `None` when the chain dead-ends.
fn source_output_port(graph: &ModelGraph, input: PortId) -> Option<PortId> {
    let mut source = graph.port(input).source?;
    while graph.accessor(graph.port(source).owner).is_composite() {
        source = graph.port(source).source?;
    }
    Some(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessor::{AtomicAccessor, CompositeAccessor, IntoAccessorSpec};
    use crate::port::AccessorId;

    fn stage(name: &str) -> AtomicAccessor<()> {
        AtomicAccessor::new(name, ())
            .unwrap()
            .add_input_port("In")
            .unwrap()
            .add_output_port("Out")
            .unwrap()
    }

    fn assemble(spec: CompositeAccessor) -> (ModelGraph, AccessorId) {
        let mut graph = ModelGraph::default();
        let root = graph.instantiate(None, spec.into_spec()).unwrap();
        (graph, root)
    }

    #[test]
    fn chain_orders_upstream_before_downstream() {
        let spec = CompositeAccessor::new("Root")
            .unwrap()
            .add_child(stage("First"))
            .unwrap()
            .add_child(stage("Second"))
            .unwrap()
            .connect_children("First", "Out", "Second", "In")
            .unwrap();
        let (mut graph, root) = assemble(spec);
        compute_priorities(&mut graph, root, None).unwrap();

        let first = graph.child_by_name(root, "First").unwrap();
        let second = graph.child_by_name(root, "Second").unwrap();
        assert!(graph.accessor(root).priority < graph.accessor(first).priority);
        assert!(graph.accessor(first).priority < graph.accessor(second).priority);
    }

    #[test]
    fn insertion_order_does_not_mask_causality() {
        // the downstream stage is added first, priorities must still follow
        // the connection direction
        let spec = CompositeAccessor::new("Root")
            .unwrap()
            .add_child(stage("Sink"))
            .unwrap()
            .add_child(stage("Source"))
            .unwrap()
            .connect_children("Source", "Out", "Sink", "In")
            .unwrap();
        let (mut graph, root) = assemble(spec);
        compute_priorities(&mut graph, root, None).unwrap();

        let sink = graph.child_by_name(root, "Sink").unwrap();
        let source = graph.child_by_name(root, "Source").unwrap();
        assert!(graph.accessor(source).priority < graph.accessor(sink).priority);
    }

    #[test]
    fn two_stage_cycle_is_detected() {
        let spec = CompositeAccessor::new("Root")
            .unwrap()
            .add_child(stage("One"))
            .unwrap()
            .add_child(stage("Two"))
            .unwrap()
            .connect_children("One", "Out", "Two", "In")
            .unwrap()
            .connect_children("Two", "Out", "One", "In")
            .unwrap();
        let (mut graph, root) = assemble(spec);
        assert!(matches!(
            compute_priorities(&mut graph, root, None),
            Err(RuntimeError::CausalityLoop { .. })
        ));
    }

    #[test]
    fn pruned_dependency_breaks_the_cycle() {
        let broken = AtomicAccessor::new("One", ())
            .unwrap()
            .add_input_port("In")
            .unwrap()
            .add_output_port("Out")
            .unwrap()
            .remove_dependency("In", "Out")
            .unwrap();
        let spec = CompositeAccessor::new("Root")
            .unwrap()
            .add_child(broken)
            .unwrap()
            .add_child(stage("Two"))
            .unwrap()
            .connect_children("One", "Out", "Two", "In")
            .unwrap()
            .connect_children("Two", "Out", "One", "In")
            .unwrap();
        let (mut graph, root) = assemble(spec);
        compute_priorities(&mut graph, root, None).unwrap();

        let one = graph.child_by_name(root, "One").unwrap();
        let two = graph.child_by_name(root, "Two").unwrap();
        // One's output no longer depends on its input, so One fires first
        assert!(graph.accessor(one).priority < graph.accessor(two).priority);
    }

    #[test]
    fn empty_composite_is_priced_at_host_priority() {
        let (mut graph, root) = assemble(CompositeAccessor::new("Root").unwrap());
        compute_priorities(&mut graph, root, None).unwrap();
        assert_eq!(HOST_PRIORITY, graph.accessor(root).priority);
    }
}
