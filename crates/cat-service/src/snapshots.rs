//! Revert history using compressed snapshots
//!
//! Before each committed transition the prior execution state is encoded as
//! zstd-compressed JSON and pushed here. Reverting pops the newest snapshot.
//! The stack is bounded; the oldest snapshots are dropped first.

use std::collections::VecDeque;

use cat_engine::ExecutionState;

use crate::constants::defaults;
use crate::error::{Result, ServiceError};

/// One zstd-compressed execution state
#[derive(Debug, Clone)]
pub struct CompressedState(Vec<u8>);

impl CompressedState {
    /// Compress a state
    pub fn encode(state: &ExecutionState) -> Result<Self> {
        let json = serde_json::to_vec(state)?;
        let compressed = zstd::encode_all(&json[..], defaults::SNAPSHOT_COMPRESSION_LEVEL)
            .map_err(|e| ServiceError::snapshot(e.to_string()))?;
        Ok(Self(compressed))
    }

    /// Decompress back into a state
    pub fn decode(&self) -> Result<ExecutionState> {
        let json = zstd::decode_all(&self.0[..]).map_err(|e| ServiceError::snapshot(e.to_string()))?;
        let state: ExecutionState = serde_json::from_slice(&json)?;
        Ok(state)
    }

    /// Compressed size in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Bounded stack of prior execution states
#[derive(Debug)]
pub struct RevertStack {
    snapshots: VecDeque<CompressedState>,
    max_snapshots: usize,
}

impl RevertStack {
    /// Create a revert stack keeping at most `max_snapshots` states
    pub fn new(max_snapshots: usize) -> Self {
        Self {
            snapshots: VecDeque::new(),
            max_snapshots: max_snapshots.max(1), // At least 1 snapshot
        }
    }

    /// Push a snapshot, dropping the oldest if over the limit
    pub fn push(&mut self, snapshot: CompressedState) {
        self.snapshots.push_back(snapshot);
        while self.snapshots.len() > self.max_snapshots {
            self.snapshots.pop_front();
        }
    }

    /// Take the newest snapshot
    pub fn pop(&mut self) -> Option<CompressedState> {
        self.snapshots.pop_back()
    }

    /// Check if revert is available
    pub fn can_revert(&self) -> bool {
        !self.snapshots.is_empty()
    }

    /// Get the number of snapshots
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Check if the stack is empty
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Get the total compressed size of all snapshots
    pub fn compressed_size(&self) -> usize {
        self.snapshots.iter().map(CompressedState::len).sum()
    }
}
