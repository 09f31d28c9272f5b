//! Protocol execution
//!
//! [`ExecutionState`] holds the mutable position of one instance and
//! [`ExecutionEngine`] applies transitions to it against an immutable graph.

mod engine;
mod state;

pub use engine::{ExecutionEngine, TransitionOutcome};
pub use state::{
    ExecutionState, FrontierSnapshot, HistoryEntry, StepStatus, TransitionKind, WaitSignal,
};
