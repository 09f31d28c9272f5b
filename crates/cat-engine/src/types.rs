//! Core types for protocol graphs
//!
//! These types describe the steps of a clinical protocol: the flat
//! descriptors handed over by the language-understanding collaborator, and
//! the validated steps that make up a built graph.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Globally unique identifier for a step
pub type StepId = String;

/// Globally unique identifier for a protocol graph
pub type GraphId = String;

/// Identifier of a step within one descriptor batch
pub type LocalId = i64;

/// Position of a branch in a Condition's child list
pub type ChildIndex = usize;

/// The kind of a protocol step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Something staff must do, split into sub-tasks
    Action,
    /// A two-way branch resolved by staff
    Condition,
    /// A pause resolved by elapsed time or acknowledgment
    Wait,
}

impl StepKind {
    /// Stable lowercase name, used in storage and messages
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Action => "action",
            StepKind::Condition => "condition",
            StepKind::Wait => "wait",
        }
    }

    /// Check whether a step of this kind may have `count` children
    pub fn allows_child_count(&self, count: usize) -> bool {
        match self {
            StepKind::Action => true,
            StepKind::Condition => count == 0 || count == 2,
            StepKind::Wait => count <= 1,
        }
    }

    /// Human-readable arity rule for this kind
    pub fn arity_description(&self) -> &'static str {
        match self {
            StepKind::Action => "any number of children",
            StepKind::Condition => "0 or 2 children",
            StepKind::Wait => "at most 1 child",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "action" => Ok(StepKind::Action),
            "condition" => Ok(StepKind::Condition),
            "wait" => Ok(StepKind::Wait),
            other => Err(format!("unknown step kind '{}'", other)),
        }
    }
}

/// One step as produced by the language-understanding collaborator
///
/// Untrusted input: local ids are only unique within the batch and
/// `depth` is a hint that the builder recomputes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDescriptor {
    pub local_id: LocalId,
    pub kind: StepKind,
    pub content: String,
    #[serde(default)]
    pub child_local_ids: Vec<LocalId>,
    #[serde(default)]
    pub depth: i64,
}

impl StepDescriptor {
    /// Create a descriptor with no children
    pub fn new(local_id: LocalId, kind: StepKind, content: impl Into<String>) -> Self {
        Self {
            local_id,
            kind,
            content: content.into(),
            child_local_ids: Vec::new(),
            depth: 0,
        }
    }

    /// Set the declared children
    pub fn with_children(mut self, children: impl IntoIterator<Item = LocalId>) -> Self {
        self.child_local_ids = children.into_iter().collect();
        self
    }

    /// Set the depth hint
    pub fn with_depth(mut self, depth: i64) -> Self {
        self.depth = depth;
        self
    }
}

/// A validated step inside a [`ProtocolGraph`](crate::ProtocolGraph)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: StepId,
    /// Local id from the descriptor batch, kept for diagnostics
    pub local_id: LocalId,
    pub kind: StepKind,
    pub content: String,
    /// Distance from the root
    pub depth: u32,
    pub parent_ids: BTreeSet<StepId>,
    /// Ordered as declared; branch 0 of a Condition comes first
    pub child_ids: Vec<StepId>,
}

impl Step {
    /// Whether this step has no parents
    pub fn is_root(&self) -> bool {
        self.parent_ids.is_empty()
    }

    /// Whether this step has no children
    pub fn is_leaf(&self) -> bool {
        self.child_ids.is_empty()
    }

    /// Sub-tasks of an Action step, in order
    ///
    /// Non-Action steps have a single implicit sub-task.
    pub fn subtasks(&self) -> Vec<&str> {
        match self.kind {
            StepKind::Action => split_subtasks(&self.content),
            _ => vec![self.content.trim()],
        }
    }

    /// Number of sub-tasks that must be done before the step completes
    pub fn subtask_count(&self) -> usize {
        self.subtasks().len()
    }
}

/// Split comma-delimited Action content into its sub-tasks
///
/// Blank entries are dropped; content with no usable entries counts as a
/// single sub-task.
pub fn split_subtasks(content: &str) -> Vec<&str> {
    let parts: Vec<&str> = content
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();

    if parts.is_empty() {
        vec![content.trim()]
    } else {
        parts
    }
}
