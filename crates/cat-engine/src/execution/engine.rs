//! Execution engine
//!
//! Drives the frontier of one protocol instance through its graph. The
//! engine never mutates the graph. Every transition:
//!
//! 1. re-validates the graph and checks the state against it,
//! 2. applies the change to a clone of the state,
//! 3. commits the clone (bumping `version`) only if nothing failed.
//!
//! Branch advancement is an AND-join: a step joins the frontier only when
//! all its parents are Done or Skipped and at least one incoming edge is
//! live. An edge `P -> C` is dead when `P` is Skipped, or when `P` is a
//! resolved Condition that chose a different child.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::error::{ExecutionError, Result, StructuralError};
use crate::events::ProtocolEvent;
use crate::graph::ProtocolGraph;
use crate::types::{ChildIndex, Step, StepId, StepKind};

use super::state::{
    ExecutionState, FrontierSnapshot, HistoryEntry, StepStatus, TransitionKind, WaitSignal,
};

/// Result of a committed (or idempotent) transition
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionOutcome {
    /// Frontier and status after the transition
    pub snapshot: FrontierSnapshot,
    /// Events produced, in the order they happened
    pub events: Vec<ProtocolEvent>,
    /// False when the request was a no-op (e.g. starting an InProgress step)
    pub changed: bool,
}

/// State machine over one immutable protocol graph
pub struct ExecutionEngine<'g> {
    graph: &'g ProtocolGraph,
    execution_id: String,
}

impl<'g> ExecutionEngine<'g> {
    /// Create an engine whose events are tagged with the graph id
    pub fn new(graph: &'g ProtocolGraph) -> Self {
        Self {
            graph,
            execution_id: graph.id().to_string(),
        }
    }

    /// Tag emitted events with an instance id instead of the graph id
    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = execution_id.into();
        self
    }

    pub fn graph(&self) -> &'g ProtocolGraph {
        self.graph
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Validate the graph and create its initial state
    pub fn initial_state(&self) -> Result<ExecutionState> {
        self.graph.validate()?;
        Ok(ExecutionState::new(self.graph)?)
    }

    /// Whether the protocol has run to completion
    pub fn is_complete(&self, state: &ExecutionState) -> bool {
        state.is_complete(self.graph)
    }

    /// Move a frontier step from Pending to InProgress
    ///
    /// Starting a step that is already InProgress is a no-op.
    pub fn start_step(
        &self,
        state: &mut ExecutionState,
        step_id: &str,
        actor_id: &str,
    ) -> Result<TransitionOutcome> {
        self.apply(state, "start_step", step_id, actor_id, |tx| {
            let step = tx.step(step_id)?;
            tx.require_frontier(step)?;
            tx.start(step);
            Ok(())
        })
    }

    /// Mark one sub-task of an Action as done
    ///
    /// A Pending step is started implicitly. Once every sub-task is done the
    /// step completes and its children are considered for the frontier.
    pub fn complete_subtask(
        &self,
        state: &mut ExecutionState,
        step_id: &str,
        index: usize,
        actor_id: &str,
    ) -> Result<TransitionOutcome> {
        self.apply(state, "complete_subtask", step_id, actor_id, |tx| {
            let step = tx.step(step_id)?;
            tx.require_kind(step, StepKind::Action)?;
            tx.require_frontier(step)?;

            let count = step.subtask_count();
            if index >= count {
                return Err(ExecutionError::InvalidSubtask {
                    step_id: step.id.clone(),
                    index,
                    count,
                });
            }
            let already_done = tx
                .state
                .subtasks_of(&step.id)
                .and_then(|flags| flags.get(&index))
                .copied()
                .unwrap_or(false);
            if already_done {
                return Ok(());
            }

            tx.start(step);
            let flags = tx.state.subtasks_mut(&step.id);
            flags.insert(index, true);
            let remaining = (0..count)
                .filter(|i| !flags.get(i).copied().unwrap_or(false))
                .count();
            tx.record(step, TransitionKind::SubtaskDone { index });
            tx.events.push(ProtocolEvent::SubtaskCompleted {
                execution_id: tx.execution_id.clone(),
                step_id: step.id.clone(),
                index,
                remaining,
            });

            if remaining == 0 {
                tx.complete(step);
                tx.promote(step.child_ids.iter());
            }
            Ok(())
        })
    }

    /// Pick a branch of a Condition
    ///
    /// The chosen child advances, along with any unchosen child still fed by
    /// another settled parent. Steps that can no longer be reached through a
    /// live edge are skipped.
    pub fn resolve_condition(
        &self,
        state: &mut ExecutionState,
        step_id: &str,
        choice: ChildIndex,
        actor_id: &str,
    ) -> Result<TransitionOutcome> {
        self.apply(state, "resolve_condition", step_id, actor_id, |tx| {
            let step = tx.step(step_id)?;
            tx.require_kind(step, StepKind::Condition)?;
            if tx.state.choice_of(&step.id).is_some() {
                return Err(ExecutionError::AlreadyResolved(step.id.clone()));
            }
            tx.require_frontier(step)?;
            if step.child_ids.is_empty() {
                return Err(ExecutionError::LeafCondition(step.id.clone()));
            }
            let chosen = step
                .child_ids
                .get(choice)
                .ok_or_else(|| ExecutionError::InvalidChoice {
                    step_id: step.id.clone(),
                    choice,
                    branches: step.child_ids.len(),
                })?;

            tx.state.set_choice(&step.id, choice);
            tx.record(step, TransitionKind::ConditionResolved { choice });
            tx.events.push(ProtocolEvent::ConditionResolved {
                execution_id: tx.execution_id.clone(),
                step_id: step.id.clone(),
                choice,
                chosen_step_id: chosen.clone(),
            });
            tx.complete(step);

            // Unchosen children that survived the skip may still be reachable
            // through another parent, so every child is a candidate.
            let skipped = tx.propagate_skip(step, chosen)?;
            let candidates = step
                .child_ids
                .iter()
                .chain(skipped.iter().flat_map(|s| s.child_ids.iter()));
            tx.promote(candidates);
            Ok(())
        })
    }

    /// Release a Wait, either because time elapsed or staff acknowledged it
    pub fn expire_wait(
        &self,
        state: &mut ExecutionState,
        step_id: &str,
        signal: WaitSignal,
        actor_id: &str,
    ) -> Result<TransitionOutcome> {
        self.apply(state, "expire_wait", step_id, actor_id, |tx| {
            let step = tx.step(step_id)?;
            tx.require_kind(step, StepKind::Wait)?;
            tx.require_frontier(step)?;

            tx.record(step, TransitionKind::WaitExpired { signal });
            tx.events.push(ProtocolEvent::WaitExpired {
                execution_id: tx.execution_id.clone(),
                step_id: step.id.clone(),
                signal,
            });
            tx.complete(step);
            tx.promote(step.child_ids.iter());
            Ok(())
        })
    }

    /// Run `op` on a clone of `state` and commit it on success
    fn apply<F>(
        &self,
        state: &mut ExecutionState,
        action: &str,
        step_id: &str,
        actor_id: &str,
        op: F,
    ) -> Result<TransitionOutcome>
    where
        F: FnOnce(&mut Transition<'g>) -> Result<()>,
    {
        self.graph.validate()?;
        state.check_consistency(self.graph)?;

        let mut tx = Transition::new(self, state.clone(), actor_id);
        if let Err(e) = op(&mut tx) {
            log::debug!(
                "[{}] {} rejected for step '{}': {}",
                self.execution_id,
                action,
                step_id,
                e
            );
            return Err(e);
        }

        let Transition {
            state: mut next,
            mut events,
            ..
        } = tx;

        let changed = next != *state;
        if changed {
            next.bump_version(state.version());
            if next.is_complete(self.graph) {
                events.push(ProtocolEvent::ProtocolCompleted {
                    execution_id: self.execution_id.clone(),
                });
            }
            *state = next;
            log::debug!(
                "[{}] {} on step '{}' by '{}' committed at version {} ({} active)",
                self.execution_id,
                action,
                step_id,
                actor_id,
                state.version(),
                state.current_step_ids().len()
            );
        }

        Ok(TransitionOutcome {
            snapshot: state.frontier_snapshot(),
            events,
            changed,
        })
    }
}

/// Working copy of the state for one in-flight transition
struct Transition<'g> {
    graph: &'g ProtocolGraph,
    index: HashMap<&'g str, &'g Step>,
    execution_id: String,
    actor_id: String,
    at: DateTime<Utc>,
    state: ExecutionState,
    events: Vec<ProtocolEvent>,
}

impl<'g> Transition<'g> {
    fn new(engine: &ExecutionEngine<'g>, state: ExecutionState, actor_id: &str) -> Self {
        Self {
            graph: engine.graph,
            index: engine.graph.index(),
            execution_id: engine.execution_id.clone(),
            actor_id: actor_id.to_string(),
            at: Utc::now(),
            state,
            events: Vec::new(),
        }
    }

    fn step(&self, step_id: &str) -> Result<&'g Step> {
        self.index
            .get(step_id)
            .copied()
            .ok_or_else(|| ExecutionError::UnknownStep(step_id.to_string()))
    }

    fn require_frontier(&self, step: &Step) -> Result<()> {
        if self.state.current_step_ids().contains(&step.id) {
            Ok(())
        } else {
            Err(ExecutionError::StepNotEligible(step.id.clone()))
        }
    }

    fn require_kind(&self, step: &Step, expected: StepKind) -> Result<()> {
        if step.kind == expected {
            Ok(())
        } else {
            Err(ExecutionError::WrongStepKind {
                step_id: step.id.clone(),
                expected,
                actual: step.kind,
            })
        }
    }

    fn record(&mut self, step: &Step, kind: TransitionKind) {
        self.state.push_history(HistoryEntry {
            step_id: step.id.clone(),
            at: self.at,
            actor_id: self.actor_id.clone(),
            kind,
        });
    }

    /// Pending -> InProgress; anything else is left alone
    fn start(&mut self, step: &Step) {
        if self.state.status_of(&step.id) != Some(StepStatus::Pending) {
            return;
        }
        self.state.set_status(&step.id, StepStatus::InProgress);
        if step.kind == StepKind::Action {
            let flags = self.state.subtasks_mut(&step.id);
            for i in 0..step.subtask_count() {
                flags.entry(i).or_insert(false);
            }
        }
        self.record(step, TransitionKind::Started);
        self.events.push(ProtocolEvent::StepStarted {
            execution_id: self.execution_id.clone(),
            step_id: step.id.clone(),
        });
    }

    fn complete(&mut self, step: &Step) {
        self.state.set_status(&step.id, StepStatus::Done);
        self.events.push(ProtocolEvent::StepCompleted {
            execution_id: self.execution_id.clone(),
            step_id: step.id.clone(),
        });
    }

    fn edge_is_dead(&self, parent: &Step, child_id: &str) -> bool {
        if self.state.status_of(&parent.id) == Some(StepStatus::Skipped) {
            return true;
        }
        match self.state.choice_of(&parent.id) {
            Some(choice) if parent.kind == StepKind::Condition => {
                parent.child_ids.get(choice).map(String::as_str) != Some(child_id)
            }
            _ => false,
        }
    }

    fn all_edges_dead(&self, step: &Step) -> bool {
        step.parent_ids.iter().all(|parent_id| {
            self.index
                .get(parent_id.as_str())
                .is_some_and(|&parent| self.edge_is_dead(parent, &step.id))
        })
    }

    /// Skip every step cut off by the unchosen branches of `condition`
    ///
    /// Candidates are walked parents-first so a skip can cascade down in a
    /// single pass. Done and InProgress steps are never overwritten.
    fn propagate_skip(&mut self, condition: &Step, chosen: &StepId) -> Result<Vec<&'g Step>> {
        let mut candidates: BTreeSet<StepId> = BTreeSet::new();
        for child_id in condition.child_ids.iter().filter(|c| *c != chosen) {
            candidates.insert(child_id.clone());
            candidates.extend(self.graph.descendants_of(child_id));
        }
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let order = self.graph.topological_order().ok_or_else(|| {
            ExecutionError::CorruptedGraph(StructuralError::CycleDetected(Vec::new()))
        })?;

        let mut skipped = Vec::new();
        for step in order.into_iter().filter(|s| candidates.contains(&s.id)) {
            if matches!(
                self.state.status_of(&step.id),
                Some(StepStatus::Done | StepStatus::InProgress | StepStatus::Skipped)
            ) {
                continue;
            }
            if self.all_edges_dead(step) {
                self.state.set_status(&step.id, StepStatus::Skipped);
                self.record(step, TransitionKind::Skipped);
                skipped.push(step);
            }
        }

        if !skipped.is_empty() {
            self.events.push(ProtocolEvent::StepsSkipped {
                execution_id: self.execution_id.clone(),
                step_ids: skipped.iter().map(|s| s.id.clone()).collect(),
            });
        }
        Ok(skipped)
    }

    /// Add every ready candidate to the frontier as Pending
    ///
    /// Ready means: not yet reached, every parent Done or Skipped, and at
    /// least one incoming edge still live.
    fn promote<'a>(&mut self, candidates: impl IntoIterator<Item = &'a StepId>) {
        let mut eligible: Vec<StepId> = Vec::new();
        for child_id in candidates {
            let Some(&child) = self.index.get(child_id.as_str()) else {
                continue;
            };
            if self.state.status_of(&child.id).is_some() {
                continue;
            }
            let parents_settled = child.parent_ids.iter().all(|p| {
                self.state
                    .status_of(p)
                    .is_some_and(|status| status.is_settled())
            });
            if parents_settled && !self.all_edges_dead(child) {
                self.state.set_status(&child.id, StepStatus::Pending);
                eligible.push(child.id.clone());
            }
        }

        if !eligible.is_empty() {
            self.events.push(ProtocolEvent::StepsEligible {
                execution_id: self.execution_id.clone(),
                step_ids: eligible,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{build_protocol, DescriptorBatch};
    use crate::types::StepDescriptor;
    use proptest::prelude::*;
    use proptest::sample::Index;

    const NURSE: &str = "nurse-1";

    fn id_of(graph: &ProtocolGraph, local_id: i64) -> StepId {
        graph
            .steps()
            .iter()
            .find(|s| s.local_id == local_id)
            .map(|s| s.id.clone())
            .unwrap()
    }

    fn frontier(graph: &ProtocolGraph, state: &ExecutionState) -> Vec<i64> {
        state
            .eligible_steps(graph)
            .iter()
            .map(|s| s.local_id)
            .collect()
    }

    fn status(graph: &ProtocolGraph, state: &ExecutionState, local_id: i64) -> Option<StepStatus> {
        state.status_of(&id_of(graph, local_id))
    }

    #[test]
    fn test_linear_scenario() {
        let _ = env_logger::builder().is_test(true).try_init();
        let descriptors = vec![
            StepDescriptor::new(0, StepKind::Action, "faire pansement")
                .with_children([1])
                .with_depth(0),
            StepDescriptor::new(1, StepKind::Wait, "attendre 2h").with_depth(1),
        ];
        let graph = build_protocol(&descriptors).unwrap();
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.root_of().unwrap().local_id, 0);

        let engine = ExecutionEngine::new(&graph);
        let mut state = engine.initial_state().unwrap();
        assert_eq!(frontier(&graph, &state), vec![0]);

        let outcome = engine
            .complete_subtask(&mut state, &id_of(&graph, 0), 0, NURSE)
            .unwrap();
        assert!(outcome.changed);
        assert_eq!(frontier(&graph, &state), vec![1]);
        assert_eq!(status(&graph, &state, 0), Some(StepStatus::Done));
        assert_eq!(outcome.snapshot, state.frontier_snapshot());
        assert!(!engine.is_complete(&state));

        let outcome = engine
            .expire_wait(&mut state, &id_of(&graph, 1), WaitSignal::Elapsed, NURSE)
            .unwrap();
        assert!(state.current_step_ids().is_empty());
        assert!(engine.is_complete(&state));
        assert!(matches!(
            outcome.events.last(),
            Some(ProtocolEvent::ProtocolCompleted { .. })
        ));
    }

    #[test]
    fn test_branching_scenario() {
        // root ? -> A | B, B -> B1 -> B2
        let graph = DescriptorBatch::new()
            .condition(0, "allergie ?", [1, 2])
            .action(1, "antibiotique A", [])
            .action(2, "antibiotique B", [3])
            .action(3, "surveiller", [4])
            .wait(4, "attendre 4h", [])
            .build()
            .unwrap();
        let engine = ExecutionEngine::new(&graph);
        let mut state = engine.initial_state().unwrap();

        let outcome = engine
            .resolve_condition(&mut state, &id_of(&graph, 0), 0, NURSE)
            .unwrap();

        assert_eq!(frontier(&graph, &state), vec![1]);
        assert_eq!(state.choice_of(&id_of(&graph, 0)), Some(0));
        for local in [2, 3, 4] {
            assert_eq!(status(&graph, &state, local), Some(StepStatus::Skipped));
        }
        let skipped = outcome.events.iter().find_map(|e| match e {
            ProtocolEvent::StepsSkipped { step_ids, .. } => Some(step_ids.len()),
            _ => None,
        });
        assert_eq!(skipped, Some(3));
    }

    #[test]
    fn test_join_waits_for_all_parents() {
        // root -> A, B -> M
        let graph = DescriptorBatch::new()
            .action(0, "accueil", [1, 2])
            .action(1, "bilan sanguin", [3])
            .action(2, "radio", [3])
            .action(3, "synthèse", [])
            .build()
            .unwrap();
        let engine = ExecutionEngine::new(&graph);
        let mut state = engine.initial_state().unwrap();

        engine.complete_subtask(&mut state, &id_of(&graph, 0), 0, NURSE).unwrap();
        assert_eq!(frontier(&graph, &state), vec![1, 2]);

        engine.complete_subtask(&mut state, &id_of(&graph, 1), 0, NURSE).unwrap();
        assert_eq!(frontier(&graph, &state), vec![2]);
        assert_eq!(status(&graph, &state, 3), None);

        engine.complete_subtask(&mut state, &id_of(&graph, 2), 0, NURSE).unwrap();
        assert_eq!(frontier(&graph, &state), vec![3]);
        assert_eq!(status(&graph, &state, 3), Some(StepStatus::Pending));
    }

    #[test]
    fn test_join_after_condition() {
        // root ? -> A | B, A -> M, B -> M
        let graph = DescriptorBatch::new()
            .condition(0, "douleur > 5 ?", [1, 2])
            .action(1, "morphine", [3])
            .action(2, "paracétamol", [3])
            .action(3, "réévaluer douleur", [])
            .build()
            .unwrap();
        let engine = ExecutionEngine::new(&graph);
        let mut state = engine.initial_state().unwrap();

        engine.resolve_condition(&mut state, &id_of(&graph, 0), 0, NURSE).unwrap();
        assert_eq!(status(&graph, &state, 2), Some(StepStatus::Skipped));
        // The join still has a live parent and is neither skipped nor eligible
        assert_eq!(status(&graph, &state, 3), None);
        assert_eq!(frontier(&graph, &state), vec![1]);

        engine.complete_subtask(&mut state, &id_of(&graph, 1), 0, NURSE).unwrap();
        assert_eq!(frontier(&graph, &state), vec![3]);
    }

    #[test]
    fn test_skip_spares_steps_reachable_from_chosen_branch() {
        // root ? -> A | B, B -> X -> M, A -> M
        let graph = DescriptorBatch::new()
            .condition(0, "diabétique ?", [1, 2])
            .action(1, "glycémie", [4])
            .action(2, "bilan standard", [3])
            .action(3, "ECG", [4])
            .action(4, "transmission", [])
            .build()
            .unwrap();
        let engine = ExecutionEngine::new(&graph);
        let mut state = engine.initial_state().unwrap();

        engine.resolve_condition(&mut state, &id_of(&graph, 0), 0, NURSE).unwrap();
        assert_eq!(status(&graph, &state, 2), Some(StepStatus::Skipped));
        assert_eq!(status(&graph, &state, 3), Some(StepStatus::Skipped));
        assert_eq!(status(&graph, &state, 4), None);

        engine.complete_subtask(&mut state, &id_of(&graph, 1), 0, NURSE).unwrap();
        assert_eq!(frontier(&graph, &state), vec![4]);
        engine.complete_subtask(&mut state, &id_of(&graph, 4), 0, NURSE).unwrap();
        assert!(engine.is_complete(&state));
    }

    #[test]
    fn test_nested_conditions_cascade_skips() {
        // R ? -> A | C, C ? -> X | Y, A -> M, Y -> M
        let graph = DescriptorBatch::new()
            .condition(0, "conscient ?", [1, 2])
            .action(1, "position latérale", [5])
            .condition(2, "respire ?", [3, 4])
            .action(3, "appeler réanimation", [])
            .action(4, "oxygène", [5])
            .action(5, "surveillance continue", [])
            .build()
            .unwrap();
        let engine = ExecutionEngine::new(&graph);
        let mut state = engine.initial_state().unwrap();

        engine.resolve_condition(&mut state, &id_of(&graph, 0), 1, NURSE).unwrap();
        assert_eq!(status(&graph, &state, 1), Some(StepStatus::Skipped));
        // M still has a possibly-live parent through Y
        assert_eq!(status(&graph, &state, 5), None);
        assert_eq!(frontier(&graph, &state), vec![2]);

        engine.resolve_condition(&mut state, &id_of(&graph, 2), 0, NURSE).unwrap();
        assert_eq!(status(&graph, &state, 4), Some(StepStatus::Skipped));
        assert_eq!(status(&graph, &state, 5), Some(StepStatus::Skipped));
        assert_eq!(frontier(&graph, &state), vec![3]);

        engine.complete_subtask(&mut state, &id_of(&graph, 3), 0, NURSE).unwrap();
        assert!(engine.is_complete(&state));
    }

    #[test]
    fn test_unchosen_child_with_done_parent_advances() {
        // root -> C, X; C ? -> X | Y
        let graph = DescriptorBatch::new()
            .action(0, "prise des constantes", [1, 2])
            .condition(1, "saturation < 92 ?", [2, 3])
            .action(2, "noter au dossier", [])
            .action(3, "oxygène", [])
            .build()
            .unwrap();
        let engine = ExecutionEngine::new(&graph);
        let mut state = engine.initial_state().unwrap();

        engine.complete_subtask(&mut state, &id_of(&graph, 0), 0, NURSE).unwrap();
        // X also waits on the Condition
        assert_eq!(frontier(&graph, &state), vec![1]);

        let outcome = engine
            .resolve_condition(&mut state, &id_of(&graph, 1), 1, NURSE)
            .unwrap();
        // The edge from the root keeps X alive
        assert_eq!(status(&graph, &state, 2), Some(StepStatus::Pending));
        assert_eq!(frontier(&graph, &state), vec![2, 3]);
        assert!(!outcome
            .events
            .iter()
            .any(|e| matches!(e, ProtocolEvent::StepsSkipped { .. })));

        engine.complete_subtask(&mut state, &id_of(&graph, 3), 0, NURSE).unwrap();
        assert!(!engine.is_complete(&state));
        engine.complete_subtask(&mut state, &id_of(&graph, 2), 0, NURSE).unwrap();
        assert!(engine.is_complete(&state));
    }

    #[test]
    fn test_start_step_is_idempotent() {
        let graph = DescriptorBatch::new()
            .action(0, "faire pansement", [])
            .build()
            .unwrap();
        let engine = ExecutionEngine::new(&graph);
        let mut state = engine.initial_state().unwrap();
        let root = id_of(&graph, 0);

        let outcome = engine.start_step(&mut state, &root, NURSE).unwrap();
        assert!(outcome.changed);
        assert_eq!(state.status_of(&root), Some(StepStatus::InProgress));
        assert_eq!(state.version(), 1);

        let outcome = engine.start_step(&mut state, &root, NURSE).unwrap();
        assert!(!outcome.changed);
        assert!(outcome.events.is_empty());
        assert_eq!(state.version(), 1);
        assert_eq!(state.history().len(), 1);
    }

    #[test]
    fn test_partial_subtasks_keep_step_in_progress() {
        let graph = DescriptorBatch::new()
            .action(0, "prendre tension, mesurer température, noter", [1])
            .wait(1, "attendre 1h", [])
            .build()
            .unwrap();
        let engine = ExecutionEngine::new(&graph);
        let mut state = engine.initial_state().unwrap();
        let root = id_of(&graph, 0);

        let outcome = engine.complete_subtask(&mut state, &root, 1, NURSE).unwrap();
        assert_eq!(state.status_of(&root), Some(StepStatus::InProgress));
        assert!(outcome.events.iter().any(|e| matches!(
            e,
            ProtocolEvent::SubtaskCompleted { index: 1, remaining: 2, .. }
        )));

        // Re-marking is a no-op
        let outcome = engine.complete_subtask(&mut state, &root, 1, NURSE).unwrap();
        assert!(!outcome.changed);

        engine.complete_subtask(&mut state, &root, 0, NURSE).unwrap();
        assert_eq!(frontier(&graph, &state), vec![0]);
        engine.complete_subtask(&mut state, &root, 2, NURSE).unwrap();
        assert_eq!(state.status_of(&root), Some(StepStatus::Done));
        assert_eq!(frontier(&graph, &state), vec![1]);
        assert_eq!(state.version(), 3);
    }

    #[test]
    fn test_rejections_leave_state_untouched() {
        let graph = DescriptorBatch::new()
            .action(0, "prendre tension, noter", [1])
            .condition(1, "tension > 14 ?", [2, 3])
            .action(2, "appeler médecin", [])
            .wait(3, "recontrôler dans 1h", [])
            .build()
            .unwrap();
        let engine = ExecutionEngine::new(&graph);
        let mut state = engine.initial_state().unwrap();
        let root = id_of(&graph, 0);
        let condition = id_of(&graph, 1);
        let before = state.clone();

        assert_eq!(
            engine.start_step(&mut state, "ghost", NURSE),
            Err(ExecutionError::UnknownStep("ghost".to_string()))
        );
        assert_eq!(
            engine.resolve_condition(&mut state, &condition, 0, NURSE),
            Err(ExecutionError::StepNotEligible(condition.clone()))
        );
        assert!(matches!(
            engine.resolve_condition(&mut state, &root, 0, NURSE),
            Err(ExecutionError::WrongStepKind { expected: StepKind::Condition, .. })
        ));
        assert!(matches!(
            engine.expire_wait(&mut state, &root, WaitSignal::Elapsed, NURSE),
            Err(ExecutionError::WrongStepKind { expected: StepKind::Wait, .. })
        ));
        assert_eq!(
            engine.complete_subtask(&mut state, &root, 2, NURSE),
            Err(ExecutionError::InvalidSubtask {
                step_id: root.clone(),
                index: 2,
                count: 2,
            })
        );
        assert_eq!(state, before);

        engine.complete_subtask(&mut state, &root, 0, NURSE).unwrap();
        engine.complete_subtask(&mut state, &root, 1, NURSE).unwrap();
        let before = state.clone();
        assert_eq!(
            engine.resolve_condition(&mut state, &condition, 2, NURSE),
            Err(ExecutionError::InvalidChoice {
                step_id: condition.clone(),
                choice: 2,
                branches: 2,
            })
        );
        assert_eq!(
            engine.complete_subtask(&mut state, &root, 0, NURSE),
            Err(ExecutionError::StepNotEligible(root.clone()))
        );
        assert_eq!(state, before);
    }

    #[test]
    fn test_already_resolved_takes_precedence() {
        let graph = DescriptorBatch::new()
            .condition(0, "fièvre ?", [1, 2])
            .action(1, "paracétamol", [])
            .action(2, "surveillance", [])
            .build()
            .unwrap();
        let engine = ExecutionEngine::new(&graph);
        let mut state = engine.initial_state().unwrap();
        let root = id_of(&graph, 0);

        engine.resolve_condition(&mut state, &root, 1, NURSE).unwrap();
        assert_eq!(
            engine.resolve_condition(&mut state, &root, 0, NURSE),
            Err(ExecutionError::AlreadyResolved(root.clone()))
        );
        assert_eq!(frontier(&graph, &state), vec![2]);
    }

    #[test]
    fn test_leaf_condition_is_rejected_when_reached() {
        let graph = DescriptorBatch::new()
            .action(0, "examen clinique", [1])
            .condition(1, "hospitaliser ?", [])
            .build()
            .unwrap();
        let engine = ExecutionEngine::new(&graph);
        let mut state = engine.initial_state().unwrap();
        let condition = id_of(&graph, 1);

        engine.complete_subtask(&mut state, &id_of(&graph, 0), 0, NURSE).unwrap();
        let err = engine
            .resolve_condition(&mut state, &condition, 0, NURSE)
            .unwrap_err();
        assert_eq!(err, ExecutionError::LeafCondition(condition));
        assert!(err.is_recoverable());
        assert!(!engine.is_complete(&state));
    }

    #[test]
    fn test_wait_signal_and_actor_are_recorded() {
        let graph = DescriptorBatch::new()
            .wait(0, "attendre avis chirurgien", [1])
            .action(1, "préparer bloc", [])
            .build()
            .unwrap();
        let engine = ExecutionEngine::new(&graph);
        let mut state = engine.initial_state().unwrap();
        let wait = id_of(&graph, 0);

        engine
            .expire_wait(&mut state, &wait, WaitSignal::Acknowledged, "dr-martin")
            .unwrap();

        let entry = state.history().last().unwrap();
        assert_eq!(entry.step_id, wait);
        assert_eq!(entry.actor_id, "dr-martin");
        assert_eq!(
            entry.kind,
            TransitionKind::WaitExpired {
                signal: WaitSignal::Acknowledged
            }
        );
        assert_eq!(frontier(&graph, &state), vec![1]);
    }

    #[test]
    fn test_events_carry_execution_id() {
        let graph = DescriptorBatch::new()
            .action(0, "faire pansement", [1])
            .wait(1, "attendre 2h", [])
            .build()
            .unwrap();
        let engine = ExecutionEngine::new(&graph).with_execution_id("instance-7");
        let mut state = engine.initial_state().unwrap();

        let outcome = engine
            .complete_subtask(&mut state, &id_of(&graph, 0), 0, NURSE)
            .unwrap();
        assert!(!outcome.events.is_empty());
        assert!(outcome.events.iter().all(|e| e.execution_id() == "instance-7"));
        assert!(outcome.events.iter().any(|e| matches!(
            e,
            ProtocolEvent::StepsEligible { step_ids, .. } if step_ids == &vec![id_of(&graph, 1)]
        )));
    }

    #[test]
    fn test_corrupted_graph_is_fatal() {
        let graph = DescriptorBatch::new()
            .action(0, "faire pansement", [1])
            .wait(1, "attendre 2h", [])
            .build()
            .unwrap();
        let mut state = ExecutionEngine::new(&graph).initial_state().unwrap();

        let mut value = serde_json::to_value(&graph).unwrap();
        value["steps"][1]["depth"] = serde_json::json!(9);
        let tampered: ProtocolGraph = serde_json::from_value(value).unwrap();

        let engine = ExecutionEngine::new(&tampered);
        let before = state.clone();
        let err = engine
            .start_step(&mut state, &id_of(&graph, 0), NURSE)
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::CorruptedGraph(StructuralError::DepthMismatch { .. })
        ));
        assert!(err.is_fatal());
        assert_eq!(state, before);
    }

    #[test]
    fn test_foreign_state_is_fatal() {
        let batch = DescriptorBatch::new().action(0, "faire pansement", []);
        let graph = build_protocol(batch.descriptors()).unwrap();
        let other = build_protocol(batch.descriptors()).unwrap();

        let mut state = ExecutionEngine::new(&other).initial_state().unwrap();
        let engine = ExecutionEngine::new(&graph);
        let err = engine
            .start_step(&mut state, &id_of(&graph, 0), NURSE)
            .unwrap_err();
        assert!(matches!(err, ExecutionError::CorruptedState(_)));
    }

    /// Random valid batch: every step hangs off a lower-numbered step, extra
    /// edges only point forward, and kinds respect the arity rules
    fn arb_batch() -> impl Strategy<Value = Vec<StepDescriptor>> {
        (2usize..10)
            .prop_flat_map(|n| {
                (
                    Just(n),
                    prop::collection::vec(any::<Index>(), n - 1),
                    prop::collection::vec(prop::bool::weighted(0.25), n * n),
                    prop::collection::vec(any::<bool>(), n),
                )
            })
            .prop_map(|(n, tree_parents, extra_edges, kind_bits)| {
                let mut children: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
                for (i, parent) in tree_parents.iter().enumerate() {
                    let child = i + 1;
                    children[parent.index(child)].insert(child);
                }
                for from in 0..n {
                    for to in from + 1..n {
                        if extra_edges[from * n + to] {
                            children[from].insert(to);
                        }
                    }
                }

                children
                    .iter()
                    .enumerate()
                    .map(|(local, kids)| {
                        let (kind, content) = match (kids.len(), kind_bits[local]) {
                            (2, true) => (StepKind::Condition, "fièvre ?"),
                            (0 | 1, true) => (StepKind::Wait, "attendre 1h"),
                            _ => (StepKind::Action, "préparer, administrer"),
                        };
                        StepDescriptor::new(local as i64, kind, content)
                            .with_children(kids.iter().map(|&c| c as i64))
                    })
                    .collect()
            })
    }

    /// Act on some frontier step until the protocol completes or gets stuck
    fn run_protocol(graph: &ProtocolGraph, picks: &[Index]) -> ExecutionState {
        let engine = ExecutionEngine::new(graph);
        let mut state = engine.initial_state().unwrap();

        for turn in 0..graph.len() * 4 {
            if engine.is_complete(&state) {
                break;
            }
            let eligible = state.eligible_steps(graph);
            assert!(!eligible.is_empty(), "empty frontier before completion");

            let pick = &picks[turn % picks.len()];
            let step = eligible[pick.index(eligible.len())];
            match step.kind {
                StepKind::Action => {
                    let next = (0..step.subtask_count())
                        .find(|i| {
                            !state
                                .subtasks_of(&step.id)
                                .and_then(|flags| flags.get(i))
                                .copied()
                                .unwrap_or(false)
                        })
                        .unwrap();
                    engine.complete_subtask(&mut state, &step.id, next, NURSE).unwrap();
                }
                StepKind::Condition => {
                    engine
                        .resolve_condition(&mut state, &step.id, pick.index(2), NURSE)
                        .unwrap();
                }
                StepKind::Wait => {
                    engine
                        .expire_wait(&mut state, &step.id, WaitSignal::Acknowledged, NURSE)
                        .unwrap();
                }
            }
        }
        state
    }

    proptest! {
        #[test]
        fn test_random_protocols_build_and_run_to_completion(
            descriptors in arb_batch(),
            picks in prop::collection::vec(any::<Index>(), 1..32),
        ) {
            let graph = build_protocol(&descriptors).unwrap();
            prop_assert!(graph.validate().is_ok());
            prop_assert!(graph.validate().is_ok());
            prop_assert!(crate::validation::collect_violations(&graph).is_empty());

            let index = graph.index();
            for step in graph.steps() {
                for child_id in &step.child_ids {
                    prop_assert!(index[child_id.as_str()].parent_ids.contains(&step.id));
                }
                for parent_id in &step.parent_ids {
                    prop_assert!(index[parent_id.as_str()].child_ids.contains(&step.id));
                }
            }

            let state = run_protocol(&graph, &picks);
            prop_assert!(ExecutionEngine::new(&graph).is_complete(&state));
            prop_assert!(state.current_step_ids().is_empty());
            for step in graph.steps() {
                prop_assert!(
                    state.status_of(&step.id).is_some_and(|s| s.is_settled()),
                    "step {} left unsettled",
                    step.local_id
                );
            }
        }
    }
}
