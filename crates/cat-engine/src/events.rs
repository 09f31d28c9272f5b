//! Event types for protocol execution progress
//!
//! Events are produced by transitions and forwarded by the service to
//! whoever tracks the ward: a UI channel, an audit log, a test.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::execution::WaitSignal;
use crate::types::{ChildIndex, StepId};

/// Trait for sending protocol events
///
/// This abstracts over the transport so the engine and service can be used
/// in different contexts.
pub trait EventSink: Send + Sync {
    /// Send an event
    ///
    /// Returns an error if the event could not be delivered (e.g., channel closed)
    fn send(&self, event: ProtocolEvent) -> Result<(), EventError>;
}

/// Error when sending events fails
#[derive(Debug, Clone)]
pub struct EventError {
    pub message: String,
}

impl std::fmt::Display for EventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event error: {}", self.message)
    }
}

impl std::error::Error for EventError {}

impl EventError {
    pub fn channel_closed() -> Self {
        Self {
            message: "Channel closed".to_string(),
        }
    }
}

/// Events emitted while a protocol instance runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ProtocolEvent {
    /// A protocol graph was built and its execution state initialised
    #[serde(rename_all = "camelCase")]
    InstanceCreated {
        execution_id: String,
        graph_id: String,
        step_count: usize,
    },

    /// A step moved from Pending to InProgress
    #[serde(rename_all = "camelCase")]
    StepStarted {
        execution_id: String,
        step_id: StepId,
    },

    /// One sub-task of an Action was marked done
    #[serde(rename_all = "camelCase")]
    SubtaskCompleted {
        execution_id: String,
        step_id: StepId,
        index: usize,
        remaining: usize,
    },

    /// A step became Done
    #[serde(rename_all = "camelCase")]
    StepCompleted {
        execution_id: String,
        step_id: StepId,
    },

    /// A Condition picked a branch
    #[serde(rename_all = "camelCase")]
    ConditionResolved {
        execution_id: String,
        step_id: StepId,
        choice: ChildIndex,
        chosen_step_id: StepId,
    },

    /// A Wait was released
    #[serde(rename_all = "camelCase")]
    WaitExpired {
        execution_id: String,
        step_id: StepId,
        signal: WaitSignal,
    },

    /// Steps cut off by an unchosen branch
    #[serde(rename_all = "camelCase")]
    StepsSkipped {
        execution_id: String,
        step_ids: Vec<StepId>,
    },

    /// Steps that joined the frontier
    #[serde(rename_all = "camelCase")]
    StepsEligible {
        execution_id: String,
        step_ids: Vec<StepId>,
    },

    /// Frontier is empty and every leaf is settled
    #[serde(rename_all = "camelCase")]
    ProtocolCompleted { execution_id: String },

    /// The instance stopped accepting transitions after a fatal fault
    #[serde(rename_all = "camelCase")]
    InstanceHalted { execution_id: String, error: String },

    /// The last transition was undone
    #[serde(rename_all = "camelCase")]
    TransitionReverted { execution_id: String, version: u64 },
}

impl ProtocolEvent {
    /// The instance this event belongs to
    pub fn execution_id(&self) -> &str {
        match self {
            Self::InstanceCreated { execution_id, .. }
            | Self::StepStarted { execution_id, .. }
            | Self::SubtaskCompleted { execution_id, .. }
            | Self::StepCompleted { execution_id, .. }
            | Self::ConditionResolved { execution_id, .. }
            | Self::WaitExpired { execution_id, .. }
            | Self::StepsSkipped { execution_id, .. }
            | Self::StepsEligible { execution_id, .. }
            | Self::ProtocolCompleted { execution_id }
            | Self::InstanceHalted { execution_id, .. }
            | Self::TransitionReverted { execution_id, .. } => execution_id,
        }
    }

    /// Create an instance halted event
    pub fn instance_halted(execution_id: &str, error: impl ToString) -> Self {
        Self::InstanceHalted {
            execution_id: execution_id.to_string(),
            error: error.to_string(),
        }
    }
}

/// A no-op event sink that discards all events
///
/// Useful for testing or when events aren't needed.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn send(&self, _event: ProtocolEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// A vector-based event sink that collects events
///
/// Useful for testing to verify events were emitted correctly.
pub struct VecEventSink {
    events: Mutex<Vec<ProtocolEvent>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    /// Get all collected events
    pub fn events(&self) -> Vec<ProtocolEvent> {
        self.events.lock().clone()
    }

    /// Clear all collected events
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Default for VecEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for VecEventSink {
    fn send(&self, event: ProtocolEvent) -> Result<(), EventError> {
        self.events.lock().push(event);
        Ok(())
    }
}
