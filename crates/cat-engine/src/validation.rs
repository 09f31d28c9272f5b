//! Graph validation for protocol graphs
//!
//! Re-verifies the structural invariants of a [`ProtocolGraph`]: reference
//! integrity, parent/child symmetry, a single root, reachability, depth,
//! acyclicity and per-kind arity. Runs after construction and again before
//! every execution transition.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::StructuralError;
use crate::graph::ProtocolGraph;
use crate::types::{LocalId, Step};

/// Validate a protocol graph, stopping at the first violation
pub fn validate(graph: &ProtocolGraph) -> Result<(), StructuralError> {
    match collect_violations(graph).into_iter().next() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Validate a protocol graph
///
/// Returns all violations found (not just the first). Traversal checks are
/// skipped when references are already broken, since their results would
/// be meaningless.
pub fn collect_violations(graph: &ProtocolGraph) -> Vec<StructuralError> {
    if graph.is_empty() {
        return vec![StructuralError::EmptyProtocol];
    }

    let mut errors = Vec::new();

    validate_identifiers(graph, &mut errors);
    validate_references(graph, &mut errors);
    if !errors.is_empty() {
        return errors;
    }

    validate_root_and_depth(graph, &mut errors);
    if let Some(path) = find_cycle(graph) {
        errors.push(StructuralError::CycleDetected(path));
    }
    validate_arity(graph, &mut errors);

    errors
}

/// Check that step ids and local ids are unique
fn validate_identifiers(graph: &ProtocolGraph, errors: &mut Vec<StructuralError>) {
    let mut ids = HashSet::new();
    let mut local_ids = HashSet::new();

    for step in graph.steps() {
        if !ids.insert(step.id.as_str()) {
            errors.push(StructuralError::DuplicateStepId(step.id.clone()));
        }
        if !local_ids.insert(step.local_id) {
            errors.push(StructuralError::DuplicateLocalId(step.local_id));
        }
    }
}

/// Check that every link resolves and is mirrored on the other side
fn validate_references(graph: &ProtocolGraph, errors: &mut Vec<StructuralError>) {
    let index = graph.index();

    for step in graph.steps() {
        let mut seen_children = HashSet::new();
        for child_id in &step.child_ids {
            let Some(child) = index.get(child_id.as_str()) else {
                errors.push(StructuralError::MissingStep {
                    step: step.id.clone(),
                    missing: child_id.clone(),
                });
                continue;
            };
            if !seen_children.insert(child_id.as_str()) {
                errors.push(StructuralError::DuplicateChild {
                    parent: step.local_id,
                    child: child.local_id,
                });
            }
            if !child.parent_ids.contains(&step.id) {
                errors.push(StructuralError::AsymmetricEdge {
                    parent: step.id.clone(),
                    child: child_id.clone(),
                });
            }
        }

        for parent_id in &step.parent_ids {
            match index.get(parent_id.as_str()) {
                None => errors.push(StructuralError::MissingStep {
                    step: step.id.clone(),
                    missing: parent_id.clone(),
                }),
                Some(parent) if !parent.child_ids.contains(&step.id) => {
                    errors.push(StructuralError::AsymmetricEdge {
                        parent: parent_id.clone(),
                        child: step.id.clone(),
                    });
                }
                Some(_) => {}
            }
        }
    }
}

/// Check the single root, reachability from it, and stored depths
fn validate_root_and_depth(graph: &ProtocolGraph, errors: &mut Vec<StructuralError>) {
    let root = match graph.root_of() {
        Ok(root) => root,
        Err(err) => {
            errors.push(err);
            return;
        }
    };

    let depths = compute_depths(graph, root);
    let unreachable = unreachable_steps(graph, &depths);
    if !unreachable.is_empty() {
        errors.push(StructuralError::UnreachableSteps(unreachable));
        return;
    }

    for step in graph.steps() {
        if let Some(&expected) = depths.get(step.id.as_str()) {
            if expected != step.depth {
                errors.push(StructuralError::DepthMismatch {
                    step: step.id.clone(),
                    expected,
                    actual: step.depth,
                });
            }
        }
    }
}

/// Check Condition and Wait child counts
fn validate_arity(graph: &ProtocolGraph, errors: &mut Vec<StructuralError>) {
    for step in graph.steps() {
        if let Some(err) = arity_violation(step) {
            errors.push(err);
        }
    }
}

pub(crate) fn arity_violation(step: &Step) -> Option<StructuralError> {
    let count = step.child_ids.len();
    (!step.kind.allows_child_count(count)).then(|| StructuralError::InvalidChildCount {
        local_id: step.local_id,
        kind: step.kind,
        count,
    })
}

/// Breadth-first distance from the root; depth = 1 + min(parent depths)
pub(crate) fn compute_depths<'a>(graph: &'a ProtocolGraph, root: &'a Step) -> HashMap<&'a str, u32> {
    let index = graph.index();
    let mut depths: HashMap<&str, u32> = HashMap::new();
    let mut queue: VecDeque<&Step> = VecDeque::new();

    depths.insert(root.id.as_str(), 0);
    queue.push_back(root);

    while let Some(step) = queue.pop_front() {
        let next_depth = depths[step.id.as_str()] + 1;
        for child_id in &step.child_ids {
            if depths.contains_key(child_id.as_str()) {
                continue;
            }
            if let Some(&child) = index.get(child_id.as_str()) {
                depths.insert(child.id.as_str(), next_depth);
                queue.push_back(child);
            }
        }
    }

    depths
}

/// Local ids of steps missing from a depth map, in batch order
pub(crate) fn unreachable_steps(graph: &ProtocolGraph, depths: &HashMap<&str, u32>) -> Vec<LocalId> {
    graph
        .steps()
        .iter()
        .filter(|s| !depths.contains_key(s.id.as_str()))
        .map(|s| s.local_id)
        .collect()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Grey,
    Black,
}

/// Depth-first cycle search with white/grey/black colouring
///
/// Returns the local ids along the first cycle found, closed on the step
/// where it started (e.g. `[0, 2, 0]`). The walk keeps its own stack of
/// `(step, next child)` frames, so path length is bounded by the heap.
pub(crate) fn find_cycle(graph: &ProtocolGraph) -> Option<Vec<LocalId>> {
    let index = graph.index();
    let mut colors: HashMap<&str, Color> = graph
        .steps()
        .iter()
        .map(|s| (s.id.as_str(), Color::White))
        .collect();

    for start in graph.steps() {
        if colors[start.id.as_str()] != Color::White {
            continue;
        }
        colors.insert(start.id.as_str(), Color::Grey);
        let mut stack: Vec<(&Step, usize)> = vec![(start, 0)];

        while let Some(frame) = stack.last_mut() {
            let (step, next) = *frame;
            let Some(child_id) = step.child_ids.get(next) else {
                colors.insert(step.id.as_str(), Color::Black);
                stack.pop();
                continue;
            };
            frame.1 += 1;

            let Some(&child) = index.get(child_id.as_str()) else {
                continue;
            };
            match colors.get(child.id.as_str()).copied().unwrap_or(Color::White) {
                Color::Grey => {
                    let from = stack.iter().position(|(s, _)| s.id == child.id).unwrap_or(0);
                    let mut cycle: Vec<LocalId> =
                        stack[from..].iter().map(|(s, _)| s.local_id).collect();
                    cycle.push(child.local_id);
                    return Some(cycle);
                }
                Color::White => {
                    colors.insert(child.id.as_str(), Color::Grey);
                    stack.push((child, 0));
                }
                Color::Black => {}
            }
        }
    }
    None
}
