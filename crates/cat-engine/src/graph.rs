//! Protocol graph model
//!
//! A [`ProtocolGraph`] is the immutable output of the tree builder: a DAG of
//! typed steps with a single root. Traversals here are plain BFS/DFS over
//! the adjacency lists; protocols are tens to low hundreds of steps.

use std::collections::{BTreeSet, HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::StructuralError;
use crate::types::{GraphId, Step, StepId};
use crate::validation;

/// An immutable, validated protocol graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolGraph {
    id: GraphId,
    steps: Vec<Step>,
}

impl ProtocolGraph {
    /// Reassemble a graph from stored parts without validating it
    ///
    /// Used when loading from storage. Callers run [`validate`](Self::validate)
    /// before trusting the result.
    pub fn from_parts(id: impl Into<GraphId>, steps: Vec<Step>) -> Self {
        Self {
            id: id.into(),
            steps,
        }
    }

    /// The graph's unique identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// All steps, in the order of the originating batch
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Number of steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the graph has no steps
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Lookup table from step id to step
    pub(crate) fn index(&self) -> HashMap<&str, &Step> {
        self.steps.iter().map(|s| (s.id.as_str(), s)).collect()
    }

    /// The unique step without parents
    pub fn root_of(&self) -> Result<&Step, StructuralError> {
        let roots: Vec<&Step> = self.steps.iter().filter(|s| s.is_root()).collect();
        match roots.as_slice() {
            [root] => Ok(root),
            [] => Err(StructuralError::NoRoot),
            many => Err(StructuralError::MultipleRoots(
                many.iter().map(|s| s.local_id).collect(),
            )),
        }
    }

    /// Steps without children
    pub fn leaves(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| s.is_leaf())
    }

    /// Every step from which `step_id` can be reached (excluding itself)
    pub fn ancestors_of(&self, step_id: &str) -> BTreeSet<StepId> {
        self.walk(step_id, |step| step.parent_ids.iter().cloned().collect())
    }

    /// Every step reachable from `step_id` (excluding itself)
    pub fn descendants_of(&self, step_id: &str) -> BTreeSet<StepId> {
        self.walk(step_id, |step| step.child_ids.clone())
    }

    /// BFS from `start` following `next`; unknown ids yield an empty set
    fn walk<F>(&self, start: &str, next: F) -> BTreeSet<StepId>
    where
        F: Fn(&Step) -> Vec<StepId>,
    {
        let index = self.index();
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<StepId> = index
            .get(start)
            .map(|&s| next(s).into())
            .unwrap_or_default();

        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(&step) = index.get(id.as_str()) {
                queue.extend(next(step));
            }
        }
        seen
    }

    /// Steps in topological order (parents before children)
    ///
    /// Uses Kahn's algorithm with batch order as tie-breaker. Returns `None`
    /// if the graph contains a cycle.
    pub fn topological_order(&self) -> Option<Vec<&Step>> {
        let index = self.index();
        let mut in_degree: HashMap<&str, usize> = self
            .steps
            .iter()
            .map(|s| (s.id.as_str(), s.parent_ids.len()))
            .collect();

        let mut queue: VecDeque<&Step> = self.steps.iter().filter(|s| s.is_root()).collect();
        let mut order = Vec::with_capacity(self.steps.len());

        while let Some(step) = queue.pop_front() {
            order.push(step);
            for child_id in &step.child_ids {
                if let Some(deg) = in_degree.get_mut(child_id.as_str()) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 {
                        if let Some(&child) = index.get(child_id.as_str()) {
                            queue.push_back(child);
                        }
                    }
                }
            }
        }

        (order.len() == self.steps.len()).then_some(order)
    }

    /// Re-verify every graph invariant
    pub fn validate(&self) -> Result<(), StructuralError> {
        validation::validate(self)
    }
}
