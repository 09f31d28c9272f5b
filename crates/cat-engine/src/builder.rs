//! Tree builder: flat step descriptors to a validated protocol graph
//!
//! The batch comes from an external language-understanding service and is
//! treated as untrusted. Parent links and depths are derived here, never
//! taken from the input. Construction is all-or-nothing.

use std::collections::{BTreeSet, HashMap, HashSet};

use uuid::Uuid;

use crate::error::StructuralError;
use crate::graph::ProtocolGraph;
use crate::types::{LocalId, Step, StepDescriptor, StepId, StepKind};
use crate::validation::{self, arity_violation, compute_depths, find_cycle, unreachable_steps};

/// Default upper bound on steps per protocol
pub const DEFAULT_MAX_STEPS: usize = 500;

/// Builds [`ProtocolGraph`]s from descriptor batches
///
/// Pure and synchronous; one builder can serve concurrent callers.
#[derive(Debug, Clone)]
pub struct TreeBuilder {
    max_steps: usize,
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
        }
    }
}

impl TreeBuilder {
    /// Create a builder with the default step limit
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of steps accepted in one batch
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    /// The configured step limit
    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    /// Build a protocol graph from a descriptor batch
    pub fn build(&self, descriptors: &[StepDescriptor]) -> Result<ProtocolGraph, StructuralError> {
        if descriptors.is_empty() {
            return Err(StructuralError::EmptyProtocol);
        }
        if descriptors.len() > self.max_steps {
            return Err(StructuralError::ProtocolTooLarge {
                count: descriptors.len(),
                max: self.max_steps,
            });
        }

        // Fresh global ids
        let mut ids: HashMap<LocalId, StepId> = HashMap::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let id = Uuid::new_v4().to_string();
            if ids.insert(descriptor.local_id, id).is_some() {
                return Err(StructuralError::DuplicateLocalId(descriptor.local_id));
            }
        }

        // Resolve declared children
        let mut children: Vec<Vec<StepId>> = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let mut seen = HashSet::new();
            let mut resolved = Vec::with_capacity(descriptor.child_local_ids.len());
            for &child in &descriptor.child_local_ids {
                let child_id = ids
                    .get(&child)
                    .ok_or(StructuralError::DanglingReference(child))?;
                if !seen.insert(child) {
                    return Err(StructuralError::DuplicateChild {
                        parent: descriptor.local_id,
                        child,
                    });
                }
                resolved.push(child_id.clone());
            }
            children.push(resolved);
        }

        // Parents are the inverse of the declared children
        let mut parents: HashMap<&str, BTreeSet<StepId>> = HashMap::new();
        for (descriptor, child_ids) in descriptors.iter().zip(&children) {
            let parent_id = &ids[&descriptor.local_id];
            for child_id in child_ids {
                parents
                    .entry(child_id.as_str())
                    .or_default()
                    .insert(parent_id.clone());
            }
        }

        let steps: Vec<Step> = descriptors
            .iter()
            .zip(children.iter())
            .map(|(descriptor, child_ids)| {
                let id = ids[&descriptor.local_id].clone();
                Step {
                    parent_ids: parents.get(id.as_str()).cloned().unwrap_or_default(),
                    id,
                    local_id: descriptor.local_id,
                    kind: descriptor.kind,
                    content: descriptor.content.clone(),
                    depth: 0,
                    child_ids: child_ids.clone(),
                }
            })
            .collect();

        let provisional = ProtocolGraph::from_parts(Uuid::new_v4().to_string(), steps);

        // A cycle leaves no well-defined root or depth, so report it first
        if let Some(path) = find_cycle(&provisional) {
            return Err(StructuralError::CycleDetected(path));
        }

        let depths: HashMap<StepId, u32> = {
            let root = provisional.root_of()?;
            let depths = compute_depths(&provisional, root);
            let unreachable = unreachable_steps(&provisional, &depths);
            if !unreachable.is_empty() {
                return Err(StructuralError::UnreachableSteps(unreachable));
            }
            depths.into_iter().map(|(id, d)| (id.to_string(), d)).collect()
        };

        for descriptor in descriptors {
            let computed = depths[&ids[&descriptor.local_id]];
            if i64::from(computed) != descriptor.depth {
                log::debug!(
                    "Step {}: declared depth {} ignored, computed {}",
                    descriptor.local_id,
                    descriptor.depth,
                    computed
                );
            }
        }

        let steps = provisional
            .steps()
            .iter()
            .cloned()
            .map(|mut step| {
                step.depth = depths[&step.id];
                step
            })
            .collect();
        let graph = ProtocolGraph::from_parts(provisional.id(), steps);

        if let Some(err) = graph.steps().iter().find_map(arity_violation) {
            return Err(err);
        }

        validation::validate(&graph)?;

        log::debug!(
            "Built protocol graph '{}' with {} steps (root: {})",
            graph.id(),
            graph.len(),
            graph.root_of().map(|r| r.local_id).unwrap_or_default()
        );

        Ok(graph)
    }
}

/// Build a protocol graph with the default builder settings
pub fn build_protocol(descriptors: &[StepDescriptor]) -> Result<ProtocolGraph, StructuralError> {
    TreeBuilder::default().build(descriptors)
}

/// Fluent builder for descriptor batches
///
/// # Example
///
/// ```ignore
/// let graph = DescriptorBatch::new()
///     .condition(0, "saignement ?", [1, 2])
///     .action(1, "compression, appeler chirurgien", [])
///     .wait(2, "attendre 2h", [])
///     .build()?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct DescriptorBatch {
    descriptors: Vec<StepDescriptor>,
}

impl DescriptorBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a step of any kind
    pub fn step(
        mut self,
        local_id: LocalId,
        kind: StepKind,
        content: impl Into<String>,
        children: impl IntoIterator<Item = LocalId>,
    ) -> Self {
        self.descriptors
            .push(StepDescriptor::new(local_id, kind, content).with_children(children));
        self
    }

    /// Add an Action step
    pub fn action(
        self,
        local_id: LocalId,
        content: impl Into<String>,
        children: impl IntoIterator<Item = LocalId>,
    ) -> Self {
        self.step(local_id, StepKind::Action, content, children)
    }

    /// Add a Condition step
    pub fn condition(
        self,
        local_id: LocalId,
        content: impl Into<String>,
        children: impl IntoIterator<Item = LocalId>,
    ) -> Self {
        self.step(local_id, StepKind::Condition, content, children)
    }

    /// Add a Wait step
    pub fn wait(
        self,
        local_id: LocalId,
        content: impl Into<String>,
        children: impl IntoIterator<Item = LocalId>,
    ) -> Self {
        self.step(local_id, StepKind::Wait, content, children)
    }

    /// Set the depth hint on the most recently added step
    ///
    /// Must be called immediately after adding a step.
    pub fn with_depth(mut self, depth: i64) -> Self {
        if let Some(descriptor) = self.descriptors.last_mut() {
            descriptor.depth = depth;
        }
        self
    }

    /// The descriptors collected so far
    pub fn descriptors(&self) -> &[StepDescriptor] {
        &self.descriptors
    }

    /// Take the collected descriptors
    pub fn into_descriptors(self) -> Vec<StepDescriptor> {
        self.descriptors
    }

    /// Build with the default [`TreeBuilder`]
    pub fn build(self) -> Result<ProtocolGraph, StructuralError> {
        build_protocol(&self.descriptors)
    }
}
