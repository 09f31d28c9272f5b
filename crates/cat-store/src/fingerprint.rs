//! Content fingerprints for stored graphs

use cat_engine::ProtocolGraph;

use crate::error::Result;

/// BLAKE3 hex digest of the graph's canonical JSON encoding
///
/// Steps keep batch order and parent sets are ordered, so equal graphs
/// always hash the same.
pub fn fingerprint(graph: &ProtocolGraph) -> Result<String> {
    let bytes = serde_json::to_vec(graph)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}
