//! Service-wide constants
//!
//! Single source of truth for configuration defaults.

/// Default values for service configuration
pub mod defaults {
    /// Largest step batch the builder accepts
    pub const MAX_PROTOCOL_STEPS: usize = cat_engine::DEFAULT_MAX_STEPS;
    /// Number of compressed snapshots kept per instance for revert
    pub const REVERT_DEPTH: usize = 20;
    /// zstd level used for revert snapshots
    pub const SNAPSHOT_COMPRESSION_LEVEL: i32 = 3;
}

/// File names inside the service data directory
pub mod paths {
    /// Configuration file name
    pub const CONFIG_FILE: &str = "config.json";
}
