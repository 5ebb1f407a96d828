//! Turning conflict blocks into oracle requests, and oracle answers into
//! clean replacement text.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::locator::ConflictBlock;
use crate::config::LineCountPolicy;
use crate::errors::ResolveError;
use crate::oracle::{OracleRequest, ResolutionOracle};

const FENCE: &str = "```";

/// Replacement text for exactly one conflict block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// File the conflict belongs to.
    pub file_path: PathBuf,
    /// The conflict's `raw_text`, used as the literal substitution key.
    pub source_conflict: String,
    /// Normalized oracle output. Never empty.
    pub resolved_text: String,
    /// Lines `resolved_text` occupies once spliced into a file.
    pub line_count: usize,
}

impl Resolution {
    /// Build a resolution for `block`, or `None` when `text` is blank.
    ///
    /// One trailing line terminator is dropped: the block's `raw_text` ends
    /// before its closing line's terminator, so the replacement must too.
    pub fn for_block(block: &ConflictBlock, text: &str) -> Option<Self> {
        let text = text.strip_suffix('\n').unwrap_or(text);
        let text = text.strip_suffix('\r').unwrap_or(text);
        if text.trim().is_empty() {
            return None;
        }
        Some(Self {
            file_path: block.file_path.clone(),
            source_conflict: block.raw_text.clone(),
            resolved_text: text.to_string(),
            line_count: text.split('\n').count(),
        })
    }
}

/// Sends conflict blocks to an oracle, one request per block.
#[derive(Clone)]
pub struct ResolutionRequester {
    oracle: Arc<dyn ResolutionOracle>,
    policy: LineCountPolicy,
}

impl ResolutionRequester {
    pub fn new(oracle: Arc<dyn ResolutionOracle>, policy: LineCountPolicy) -> Self {
        Self { oracle, policy }
    }

    /// Build the oracle request for `block` with `branch` checked out locally.
    pub fn build_request(block: &ConflictBlock, branch: &str) -> OracleRequest {
        OracleRequest {
            prompt: build_prompt(block, branch),
            conflict_text: block.raw_text.clone(),
            branch: branch.to_string(),
        }
    }

    /// Ask the oracle for a resolution of `block`.
    #[instrument(skip(self, block), fields(path = %block.file_path.display(), start_line = block.start_line))]
    pub async fn request(
        &self,
        block: &ConflictBlock,
        branch: &str,
    ) -> Result<Resolution, ResolveError> {
        let request = Self::build_request(block, branch);

        let candidates = match self.oracle.resolve(&request).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "oracle call failed");
                return Err(ResolveError::EmptyResolution { cause: Some(e) });
            }
        };

        let first = candidates
            .into_iter()
            .next()
            .ok_or(ResolveError::ResolutionUnavailable)?;

        let resolution = Resolution::for_block(block, strip_code_fences(&first))
            .ok_or(ResolveError::EmptyResolution { cause: None })?;

        if self.policy == LineCountPolicy::Strict {
            check_line_count(block, &resolution)?;
        }

        debug!(lines = resolution.line_count, "resolution accepted");
        Ok(resolution)
    }
}

/// Strict policy: the resolution must be as long as one of the two sides.
fn check_line_count(block: &ConflictBlock, resolution: &Resolution) -> Result<(), ResolveError> {
    let ours = block.ours.lines().count();
    let theirs = block.theirs.lines().count();
    if resolution.line_count == ours || resolution.line_count == theirs {
        return Ok(());
    }
    let expected = if ours == theirs {
        ours.to_string()
    } else {
        format!("{ours} or {theirs}")
    };
    Err(ResolveError::LineCountMismatch {
        expected,
        actual: resolution.line_count,
    })
}

/// Instruction text for one conflict block.
pub fn build_prompt(block: &ConflictBlock, branch: &str) -> String {
    format!(
        "You are resolving a git merge conflict in `{path}`.\n\
         The local side, between `<<<<<<< HEAD` and `=======`, is the head of the \
         current branch `{branch}`. The incoming side runs from `=======` to \
         `>>>>>>> {their_ref}`.\n\
         \n\
         Reply with only the code that replaces the whole conflict block, markers removed.\n\
         - Return code only: no explanations, no commentary, no code fences, no language annotations.\n\
         - Preserve the original indentation exactly.\n\
         - Keep the line count of the conflicted region.\n\
         \n\
         {conflict}\n",
        path = block.file_path.display(),
        branch = branch,
        their_ref = block.their_ref,
        conflict = block.raw_text,
    )
}

/// Strip one leading fence line (optionally tagged, e.g. ```` ```rust ````) and
/// one trailing bare fence line. Every other line is left untouched.
pub fn strip_code_fences(text: &str) -> &str {
    let mut body = text;

    let (first, rest) = match body.find('\n') {
        Some(idx) => (&body[..idx], &body[idx + 1..]),
        None => (body, ""),
    };
    if is_opening_fence(first) {
        body = rest;
    }

    let trimmed = body.trim_end_matches(['\n', '\r']);
    let (head, last) = match trimmed.rfind('\n') {
        Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
        None => ("", trimmed),
    };
    if last.trim() == FENCE {
        body = head.strip_suffix('\r').unwrap_or(head);
    }

    body
}

fn is_opening_fence(line: &str) -> bool {
    let line = line.trim();
    match line.strip_prefix(FENCE) {
        Some(tag) => !tag.contains('`') && !tag.contains(char::is_whitespace),
        None => false,
    }
}
