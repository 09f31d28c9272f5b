//! Execution state for one protocol instance.
//!
//! The state is the only mutable half of an instance. It is linked to its
//! graph by `graph_id` alone and is stored, versioned and restored apart
//! from the graph.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ExecutionError, Result, StructuralError};
use crate::graph::ProtocolGraph;
use crate::types::{ChildIndex, GraphId, Step, StepId, StepKind};

/// Progress of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Done,
    Skipped,
}

impl StepStatus {
    /// Done or Skipped; no further transition applies
    pub fn is_settled(&self) -> bool {
        matches!(self, StepStatus::Done | StepStatus::Skipped)
    }

    /// Pending or InProgress; the step belongs on the frontier
    pub fn is_active(&self) -> bool {
        matches!(self, StepStatus::Pending | StepStatus::InProgress)
    }
}

/// How a Wait was released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitSignal {
    /// The external timer fired
    Elapsed,
    /// Staff released the wait by hand
    Acknowledged,
}

/// What a history entry records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TransitionKind {
    Started,
    SubtaskDone { index: usize },
    ConditionResolved { choice: ChildIndex },
    WaitExpired { signal: WaitSignal },
    Skipped,
}

/// One entry of the audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub step_id: StepId,
    pub at: DateTime<Utc>,
    pub actor_id: String,
    pub kind: TransitionKind,
}

/// The frontier plus per-step status, as returned by every transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrontierSnapshot {
    pub current_step_ids: BTreeSet<StepId>,
    pub step_status: BTreeMap<StepId, StepStatus>,
    pub version: u64,
}

/// Mutable execution position over one protocol graph
///
/// A step with no entry in `step_status` has not been reached yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    graph_id: GraphId,
    current_step_ids: BTreeSet<StepId>,
    step_status: BTreeMap<StepId, StepStatus>,
    #[serde(default)]
    subtask_status: BTreeMap<StepId, BTreeMap<usize, bool>>,
    #[serde(default)]
    condition_choice: BTreeMap<StepId, ChildIndex>,
    #[serde(default)]
    history: Vec<HistoryEntry>,
    #[serde(default)]
    version: u64,
}

impl ExecutionState {
    /// Fresh state with the root as the only Pending frontier member
    pub fn new(graph: &ProtocolGraph) -> std::result::Result<Self, StructuralError> {
        let root = graph.root_of()?;
        let mut state = Self {
            graph_id: graph.id().to_string(),
            current_step_ids: BTreeSet::new(),
            step_status: BTreeMap::new(),
            subtask_status: BTreeMap::new(),
            condition_choice: BTreeMap::new(),
            history: Vec::new(),
            version: 0,
        };
        state.current_step_ids.insert(root.id.clone());
        state.step_status.insert(root.id.clone(), StepStatus::Pending);
        Ok(state)
    }

    /// Replace the version counter
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }

    /// Steps currently eligible for staff action
    pub fn current_step_ids(&self) -> &BTreeSet<StepId> {
        &self.current_step_ids
    }

    pub fn step_status(&self) -> &BTreeMap<StepId, StepStatus> {
        &self.step_status
    }

    /// Status of one step, `None` if not yet reached
    pub fn status_of(&self, step_id: &str) -> Option<StepStatus> {
        self.step_status.get(step_id).copied()
    }

    /// Sub-task completion flags of an Action, by index
    pub fn subtasks_of(&self, step_id: &str) -> Option<&BTreeMap<usize, bool>> {
        self.subtask_status.get(step_id)
    }

    /// Recorded branch of a resolved Condition
    pub fn choice_of(&self, step_id: &str) -> Option<ChildIndex> {
        self.condition_choice.get(step_id).copied()
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Number of committed transitions applied to this state
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Copy of the frontier and status map
    pub fn frontier_snapshot(&self) -> FrontierSnapshot {
        FrontierSnapshot {
            current_step_ids: self.current_step_ids.clone(),
            step_status: self.step_status.clone(),
            version: self.version,
        }
    }

    /// Frontier steps resolved against their graph, in graph order
    pub fn eligible_steps<'g>(&self, graph: &'g ProtocolGraph) -> Vec<&'g Step> {
        graph
            .steps()
            .iter()
            .filter(|s| self.current_step_ids.contains(&s.id))
            .collect()
    }

    /// Whether the protocol has run to completion
    ///
    /// The frontier must be empty and every leaf Done or Skipped.
    pub fn is_complete(&self, graph: &ProtocolGraph) -> bool {
        self.current_step_ids.is_empty()
            && graph
                .leaves()
                .all(|leaf| self.status_of(&leaf.id).is_some_and(|s| s.is_settled()))
    }

    /// Verify that this state can be applied to `graph`
    ///
    /// Checks the graph link, that every referenced step exists, that the
    /// frontier holds exactly the active steps, and that recorded sub-task
    /// indices and branch choices are in range.
    pub fn check_consistency(&self, graph: &ProtocolGraph) -> Result<()> {
        if self.graph_id != graph.id() {
            return Err(ExecutionError::corrupted_state(format!(
                "state belongs to graph '{}', not '{}'",
                self.graph_id,
                graph.id()
            )));
        }

        let index = graph.index();
        let lookup = |step_id: &str| {
            index.get(step_id).copied().ok_or_else(|| {
                ExecutionError::corrupted_state(format!("unknown step '{}' in state", step_id))
            })
        };

        for step_id in &self.current_step_ids {
            lookup(step_id.as_str())?;
            if !self.status_of(step_id).is_some_and(|s| s.is_active()) {
                return Err(ExecutionError::corrupted_state(format!(
                    "frontier step '{}' is not pending or in progress",
                    step_id
                )));
            }
        }

        for (step_id, status) in &self.step_status {
            lookup(step_id.as_str())?;
            if status.is_active() && !self.current_step_ids.contains(step_id) {
                return Err(ExecutionError::corrupted_state(format!(
                    "active step '{}' is missing from the frontier",
                    step_id
                )));
            }
        }

        for (step_id, flags) in &self.subtask_status {
            let step = lookup(step_id.as_str())?;
            let count = step.subtask_count();
            if step.kind != StepKind::Action || flags.keys().any(|&i| i >= count) {
                return Err(ExecutionError::corrupted_state(format!(
                    "sub-task record for '{}' does not match the step",
                    step_id
                )));
            }
        }

        for (step_id, &choice) in &self.condition_choice {
            let step = lookup(step_id.as_str())?;
            if step.kind != StepKind::Condition || choice >= step.child_ids.len() {
                return Err(ExecutionError::corrupted_state(format!(
                    "branch choice {} recorded for '{}' is out of range",
                    choice, step_id
                )));
            }
        }

        Ok(())
    }

    // Mutators used by the engine while working on a cloned state.

    pub(crate) fn set_status(&mut self, step_id: &str, status: StepStatus) {
        self.step_status.insert(step_id.to_string(), status);
        if status.is_active() {
            self.current_step_ids.insert(step_id.to_string());
        } else {
            self.current_step_ids.remove(step_id);
        }
    }

    pub(crate) fn subtasks_mut(&mut self, step_id: &str) -> &mut BTreeMap<usize, bool> {
        self.subtask_status.entry(step_id.to_string()).or_default()
    }

    pub(crate) fn set_choice(&mut self, step_id: &str, choice: ChildIndex) {
        self.condition_choice.insert(step_id.to_string(), choice);
    }

    pub(crate) fn push_history(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
    }

    pub(crate) fn bump_version(&mut self, previous: u64) {
        self.version = previous + 1;
    }
}
