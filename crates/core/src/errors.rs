//! Error types for the MergeMend core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.
//!
//! Severity follows scope: [`VcsError`] from merge/fetch/status aborts a run,
//! file read/write failures abort only that file, and [`ResolveError`] /
//! [`PatchError::ConflictNotFound`] skip a single conflict.

use std::path::PathBuf;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error(transparent)]
    Oracle(#[from] OracleError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// VCS errors
// ---------------------------------------------------------------------------

/// Errors from the version-control driver.
#[derive(Debug, Error)]
pub enum VcsError {
    /// The repository path does not exist or is not a git repo.
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// A ref (branch, remote-tracking ref) could not be resolved.
    #[error("git ref not found: {0}")]
    RefNotFound(String),

    /// The repository has no working directory (bare repository).
    #[error("repository at '{0}' has no working tree")]
    BareRepository(String),

    /// A working-tree file could not be read.
    #[error("failed to read '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A working-tree file could not be written.
    #[error("failed to write '{}': {source}", .path.display())]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic I/O wrapper.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl VcsError {
    /// True for errors scoped to a single file rather than the whole run.
    pub fn is_file_scoped(&self) -> bool {
        matches!(self, Self::FileRead { .. } | Self::FileWrite { .. })
    }
}

// ---------------------------------------------------------------------------
// Oracle errors
// ---------------------------------------------------------------------------

/// Errors from a resolution oracle call.
#[derive(Debug, Error)]
pub enum OracleError {
    /// HTTP-level transport error (network, TLS, timeout).
    #[error("oracle HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// The API returned a non-success status code.
    #[error("oracle API error (HTTP {status}): {body}")]
    ApiError { status: u16, body: String },

    /// The oracle refused the request because of quota or rate limits.
    #[error("oracle rate limit exceeded")]
    RateLimited,

    /// No API key was configured or resolved.
    #[error("oracle API key is not set (expected in environment variable '{0}')")]
    MissingApiKey(String),

    /// The response body did not have the expected shape.
    #[error("oracle response parse error: {0}")]
    ParseError(String),
}

// ---------------------------------------------------------------------------
// Resolution errors
// ---------------------------------------------------------------------------

/// Failures producing a [`Resolution`](crate::conflict::Resolution) for one
/// conflict. Each of these skips that conflict only.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The oracle answered but offered no candidate.
    #[error("oracle returned no resolution candidate")]
    ResolutionUnavailable,

    /// The normalized candidate was empty, or the oracle call failed.
    #[error("{}", empty_reason(.cause))]
    EmptyResolution {
        #[source]
        cause: Option<OracleError>,
    },

    /// Strict line-count policy rejected the candidate.
    #[error("resolution has {actual} lines, expected {expected}")]
    LineCountMismatch { expected: String, actual: usize },
}

fn empty_reason(cause: &Option<OracleError>) -> &'static str {
    match cause {
        Some(_) => "oracle call failed; no resolution produced",
        None => "oracle returned an empty resolution",
    }
}

// ---------------------------------------------------------------------------
// Patch errors
// ---------------------------------------------------------------------------

/// Errors from splicing a resolution back into a file.
#[derive(Debug, Error)]
pub enum PatchError {
    /// The conflict text is no longer present where it was expected.
    #[error("conflict text starting at line {start_line} not found in '{}'", .path.display())]
    ConflictNotFound { path: PathBuf, start_line: usize },

    /// The patched content could not be persisted.
    #[error(transparent)]
    Write(#[from] VcsError),
}

// ---------------------------------------------------------------------------
// Position tracker errors
// ---------------------------------------------------------------------------

/// Errors from recording highlight positions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
    /// Start lines and resolution line counts must pair up one to one.
    #[error("position sequences for '{}' differ in length ({starts} starts, {counts} line counts)", .path.display())]
    LengthMismatch {
        path: PathBuf,
        starts: usize,
        counts: usize,
    },
}

// ---------------------------------------------------------------------------
// Run errors
// ---------------------------------------------------------------------------

/// Run-scoped failures. Any of these ends the run in the `failed` state.
#[derive(Debug, Error)]
pub enum RunError {
    /// Another resolution run is already in progress.
    #[error("a resolution run is already in progress (started at {started_at})")]
    AlreadyRunning { started_at: String },

    /// The VCS driver failed while merging, listing conflicted files or
    /// reading the current branch.
    #[error("version control failed: {0}")]
    Vcs(#[from] VcsError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
