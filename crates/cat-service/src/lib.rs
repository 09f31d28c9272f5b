//! CAT Service - live protocol instances
//!
//! Wraps the pure `cat-engine` state machine with everything a running
//! deployment needs:
//!
//! - One exclusive lock per instance, so transitions never interleave
//! - Durable state in SQLite through `cat-store`, written before a
//!   transition becomes visible
//! - Progress events forwarded to an [`EventSink`](cat_engine::EventSink),
//!   or to a tokio channel through [`ChannelEventSink`]
//! - Bounded revert history of compressed snapshots
//! - Halting instances whose graph or state is found corrupted
//!
//! Step batches come from a [`StepSource`], which hides whatever turns
//! free-text protocols into descriptors.

pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod manager;
pub mod snapshots;
pub mod source;

pub use config::{ConfigError, ServiceConfig};
pub use error::{Result, ServiceError};
pub use events::ChannelEventSink;
pub use manager::{ProtocolService, RestoreReport};
pub use snapshots::{CompressedState, RevertStack};
pub use source::{FixedStepSource, ProtocolRequest, StepSource};
