//! CAT Store - durable storage for protocol instances
//!
//! Graphs and execution states are kept in SQLite, in separate tables and
//! versioned independently:
//!
//! - graphs are written once, fingerprinted with BLAKE3, and re-validated
//!   on every load
//! - states are overwritten in place, guarded by an optimistic `version`
//!   check so concurrent writers cannot silently clobber each other
//! - the current position is always persisted as a set of step ids

pub mod error;
pub mod fingerprint;
pub mod store;

pub use error::{Result, StoreError};
pub use fingerprint::fingerprint;
pub use store::{ProtocolStore, StoredInstance};
