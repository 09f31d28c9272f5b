//! Error types for the CAT engine
//!
//! Two failure domains are kept apart:
//!
//! - [`StructuralError`]: the step batch or the stored graph breaks a graph
//!   invariant. Never retryable without a corrected batch.
//! - [`ExecutionError`]: a transition request was rejected. Recoverable
//!   unless [`ExecutionError::is_fatal`] says otherwise.

use thiserror::Error;

use crate::types::{ChildIndex, LocalId, StepId, StepKind};

/// Result type alias using ExecutionError
pub type Result<T> = std::result::Result<T, ExecutionError>;

/// Structural problems found while building or validating a protocol graph
///
/// Step references use the collaborator's local ids where the problem is
/// about the batch, and global step ids where it is about stored data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    /// The batch contained no step descriptors
    #[error("Protocol contains no steps")]
    EmptyProtocol,

    /// The batch exceeds the configured step limit
    #[error("Protocol has {count} steps, limit is {max}")]
    ProtocolTooLarge { count: usize, max: usize },

    /// Two descriptors share the same local id
    #[error("Local id {0} is used by more than one step")]
    DuplicateLocalId(LocalId),

    /// A descriptor lists a child local id that is not in the batch
    #[error("Step references unknown local id {0}")]
    DanglingReference(LocalId),

    /// A step lists the same child more than once
    #[error("Step {parent} lists child {child} more than once")]
    DuplicateChild { parent: LocalId, child: LocalId },

    /// Some steps cannot be reached from the root
    #[error("Steps unreachable from the root: {0:?}")]
    UnreachableSteps(Vec<LocalId>),

    /// More than one step has no parent
    #[error("Protocol has multiple root steps: {0:?}")]
    MultipleRoots(Vec<LocalId>),

    /// No step is free of parents
    #[error("Protocol has no root step")]
    NoRoot,

    /// The child relation loops back on itself
    #[error("Cycle detected through steps {0:?}")]
    CycleDetected(Vec<LocalId>),

    /// A Condition or Wait step has a child count its kind does not allow
    #[error("{kind} step {local_id} has {count} children, expected {}", .kind.arity_description())]
    InvalidChildCount {
        local_id: LocalId,
        kind: StepKind,
        count: usize,
    },

    /// Two steps share the same global id
    #[error("Step id '{0}' appears more than once")]
    DuplicateStepId(StepId),

    /// A parent or child link points at a step that does not exist
    #[error("Step '{step}' links to missing step '{missing}'")]
    MissingStep { step: StepId, missing: StepId },

    /// A parent/child link is not mirrored on the other side
    #[error("Edge '{parent}' -> '{child}' is not mirrored in both directions")]
    AsymmetricEdge { parent: StepId, child: StepId },

    /// A stored depth disagrees with the distance from the root
    #[error("Step '{step}' has depth {actual}, expected {expected}")]
    DepthMismatch {
        step: StepId,
        expected: u32,
        actual: u32,
    },
}

/// Rejections and faults raised by execution transitions
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// The step id does not belong to the graph
    #[error("Unknown step '{0}'")]
    UnknownStep(StepId),

    /// The step is not part of the current frontier
    #[error("Step '{0}' is not currently active")]
    StepNotEligible(StepId),

    /// The Condition has already been resolved
    #[error("Condition '{0}' has already been resolved")]
    AlreadyResolved(StepId),

    /// The transition does not apply to this kind of step
    #[error("Step '{step_id}' is a {actual} step, expected {expected}")]
    WrongStepKind {
        step_id: StepId,
        expected: StepKind,
        actual: StepKind,
    },

    /// Sub-task index out of range
    #[error("Step '{step_id}' has {count} sub-tasks, index {index} is out of range")]
    InvalidSubtask {
        step_id: StepId,
        index: usize,
        count: usize,
    },

    /// Branch choice out of range
    #[error("Condition '{step_id}' has {branches} branches, choice {choice} is out of range")]
    InvalidChoice {
        step_id: StepId,
        choice: ChildIndex,
        branches: usize,
    },

    /// A Condition without branches was reached
    #[error("Condition '{0}' has no branches to choose from")]
    LeafCondition(StepId),

    /// The graph failed its invariant check outside construction
    #[error("Protocol graph is corrupted: {0}")]
    CorruptedGraph(#[from] StructuralError),

    /// The execution state does not fit its graph
    #[error("Execution state is corrupted: {0}")]
    CorruptedState(String),
}

impl ExecutionError {
    /// Whether the instance must stop accepting transitions
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CorruptedGraph(_) | Self::CorruptedState(_))
    }

    /// Whether the caller can surface this as an ordinary validation failure
    pub fn is_recoverable(&self) -> bool {
        !self.is_fatal()
    }

    /// Create a corrupted state error with a message
    pub fn corrupted_state(msg: impl Into<String>) -> Self {
        Self::CorruptedState(msg.into())
    }
}
