//! MergeMend core library.
//!
//! This crate provides the pieces of an AI-assisted merge conflict resolver:
//! configuration, conflict marker scanning, oracle clients, patch
//! application, position tracking, version-control drivers, and the
//! orchestrator that runs them end to end.

pub mod config;
pub mod conflict;
pub mod errors;
pub mod oracle;
pub mod orchestrator;
pub mod vcs;

// Re-exports for convenience.
pub use config::AppConfig;
pub use conflict::{ConflictLocator, PositionTracker};
pub use oracle::{HttpOracle, ResolutionOracle};
pub use orchestrator::{CancelToken, Orchestrator, RunReport, RunState};
pub use vcs::{GitDriver, MergeOutcome, VcsDriver};
