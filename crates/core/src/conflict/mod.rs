//! Conflict handling: locating marker regions, requesting resolutions,
//! splicing them back in, and tracking where they landed.

pub mod applier;
pub mod locator;
pub mod requester;
pub mod tracker;

pub use applier::{substitute_first, AppliedConflict, FilePatch, PatchApplier};
pub use locator::{conflict_start_lines, ConflictBlock, ConflictIter, ConflictLocator};
pub use requester::{build_prompt, strip_code_fences, Resolution, ResolutionRequester};
pub use tracker::{FilePositions, HighlightSink, HighlightSpan, PositionTracker};
