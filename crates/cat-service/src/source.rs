//! Step source collaborator
//!
//! The service never interprets free text. A [`StepSource`] (typically a
//! language-understanding backend) turns a protocol description into an
//! ordered batch of step descriptors, which the tree builder then treats as
//! untrusted input.

use async_trait::async_trait;
use cat_engine::StepDescriptor;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A request to turn free text into a protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolRequest {
    /// Protocol as written by staff
    pub description: String,
    /// Who asked for the protocol
    pub actor_id: String,
}

impl ProtocolRequest {
    pub fn new(description: impl Into<String>, actor_id: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            actor_id: actor_id.into(),
        }
    }
}

/// Produces step descriptor batches from free text
#[async_trait]
pub trait StepSource: Send + Sync {
    /// Generate the step batch for a request
    ///
    /// Failures should be reported as [`ServiceError::StepSource`](crate::ServiceError::StepSource).
    async fn generate_steps(&self, request: &ProtocolRequest) -> Result<Vec<StepDescriptor>>;
}

/// A step source that always returns the same batch
///
/// Useful for tests and for protocols authored directly as descriptors.
#[derive(Debug, Clone, Default)]
pub struct FixedStepSource {
    descriptors: Vec<StepDescriptor>,
}

impl FixedStepSource {
    pub fn new(descriptors: Vec<StepDescriptor>) -> Self {
        Self { descriptors }
    }
}

#[async_trait]
impl StepSource for FixedStepSource {
    async fn generate_steps(&self, request: &ProtocolRequest) -> Result<Vec<StepDescriptor>> {
        log::debug!(
            "Fixed step source answering '{}' with {} steps",
            request.description,
            self.descriptors.len()
        );
        Ok(self.descriptors.clone())
    }
}
