//! CAT Engine - Clinical Adaptive Tree protocols
//!
//! This crate turns a flat, locally-indexed list of protocol steps into a
//! validated directed graph and tracks the execution position of staff
//! through it. It supports:
//!
//! - Action steps split into comma-delimited sub-tasks
//! - Two-way Condition branches with join-aware skip propagation
//! - Wait steps released by an external timer or by acknowledgment
//! - AND-joins where several branches merge back
//!
//! # Architecture
//!
//! - `TreeBuilder`: untrusted `StepDescriptor` batch -> `ProtocolGraph`
//! - `validation`: re-checks graph invariants, at build time and before
//!   every transition
//! - `ExecutionEngine`: pure state machine over an immutable graph and a
//!   separate, versioned `ExecutionState`
//! - `EventSink`: transport-agnostic progress events
//!
//! Everything here is synchronous and free of I/O; persistence and
//! locking live in the store and service crates.
//!
//! # Example
//!
//! ```
//! use cat_engine::{DescriptorBatch, ExecutionEngine};
//!
//! let graph = DescriptorBatch::new()
//!     .action(0, "faire pansement", [1])
//!     .wait(1, "attendre 2h", [])
//!     .build()
//!     .unwrap();
//!
//! let engine = ExecutionEngine::new(&graph);
//! let mut state = engine.initial_state().unwrap();
//! let root = graph.root_of().unwrap().id.clone();
//! engine.complete_subtask(&mut state, &root, 0, "nurse-1").unwrap();
//! assert_eq!(state.current_step_ids().len(), 1);
//! ```

pub mod builder;
pub mod error;
pub mod events;
pub mod execution;
pub mod graph;
pub mod types;
pub mod validation;

// Re-export key types
pub use builder::{build_protocol, DescriptorBatch, TreeBuilder, DEFAULT_MAX_STEPS};
pub use error::{ExecutionError, Result, StructuralError};
pub use events::{EventError, EventSink, NullEventSink, ProtocolEvent, VecEventSink};
pub use execution::{
    ExecutionEngine, ExecutionState, FrontierSnapshot, HistoryEntry, StepStatus, TransitionKind,
    TransitionOutcome, WaitSignal,
};
pub use graph::ProtocolGraph;
pub use types::{ChildIndex, GraphId, LocalId, Step, StepDescriptor, StepId, StepKind};
pub use validation::{collect_violations, validate};
