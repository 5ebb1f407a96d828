//! Resolution oracles: external services that propose replacement text for a
//! conflict block.

pub mod http;

use async_trait::async_trait;

use crate::errors::OracleError;

pub use http::HttpOracle;

/// A single request to an oracle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleRequest {
    /// Full instruction text sent to the oracle.
    pub prompt: String,
    /// The conflict block being resolved, markers included.
    pub conflict_text: String,
    /// Branch checked out locally (the "ours" side).
    pub branch: String,
}

/// Something that can propose resolutions.
///
/// Implementations may be slow or rate limited and may legitimately return
/// no candidates at all.
#[async_trait]
pub trait ResolutionOracle: Send + Sync {
    /// Return candidate replacement texts, best first.
    async fn resolve(&self, request: &OracleRequest) -> Result<Vec<String>, OracleError>;
}
