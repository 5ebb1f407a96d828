//! Conflict marker scanning.
//!
//! A conflict region is the text from a `<<<<<<< HEAD` line, through a
//! `=======` line, to the nearest following `>>>>>>> <ref>` line where `<ref>`
//! is a run of lowercase ASCII letters and digits. Anything else (uppercase
//! refs, custom labels, a missing separator) is not a conflict.

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Opening marker line, compared exactly.
pub const OPEN_MARKER: &str = "<<<<<<< HEAD";
/// Separator line between the two sides.
pub const SEPARATOR: &str = "=======";
/// Prefix shared by every closing marker line.
pub const CLOSE_PREFIX: &str = ">>>>>>> ";

static CLOSE_MARKER: OnceLock<Regex> = OnceLock::new();

fn close_marker() -> &'static Regex {
    CLOSE_MARKER.get_or_init(|| {
        Regex::new(r"^>>>>>>> [a-z0-9]+$").expect("closing marker pattern is valid")
    })
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One conflict region found in a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictBlock {
    /// File the block was scanned from.
    pub file_path: PathBuf,
    /// Opening marker line through closing marker line, without the closing
    /// line's terminator.
    pub raw_text: String,
    /// Zero-based line index of the opening marker.
    pub start_line: usize,
    /// Byte range of `raw_text` in the scanned content.
    pub span: Range<usize>,
    /// Local ("ours") side, without its final line terminator.
    pub ours: String,
    /// Incoming ("theirs") side, without its final line terminator.
    pub theirs: String,
    /// Ref named on the closing marker.
    pub their_ref: String,
}

impl ConflictBlock {
    /// Number of lines the block occupies, markers included.
    pub fn line_count(&self) -> usize {
        self.raw_text.split('\n').count()
    }
}

// ---------------------------------------------------------------------------
// Locator
// ---------------------------------------------------------------------------

/// Stateless scanner for conflict regions.
pub struct ConflictLocator;

impl ConflictLocator {
    /// Lazily scan `content` for conflict blocks, top to bottom.
    ///
    /// The iterator borrows the content and holds no state beyond its cursor;
    /// scanning the same text again yields the same blocks.
    pub fn scan<'a>(file_path: &'a Path, content: &'a str) -> ConflictIter<'a> {
        ConflictIter {
            file_path,
            content,
            offset: 0,
            line: 0,
        }
    }

    /// Collect every conflict block in `content`.
    pub fn locate(file_path: &Path, content: &str) -> Vec<ConflictBlock> {
        let blocks: Vec<ConflictBlock> = Self::scan(file_path, content).collect();
        debug!(path = %file_path.display(), count = blocks.len(), "located conflict blocks");
        blocks
    }
}

/// Zero-based indices of every line equal to the opening marker.
///
/// This is independent of region pairing: an opening marker that never closes
/// still appears here.
pub fn conflict_start_lines(content: &str) -> Vec<usize> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| strip_cr(line) == OPEN_MARKER)
        .map(|(idx, _)| idx)
        .collect()
}

fn strip_cr(line: &str) -> &str {
    line.strip_suffix('\r').unwrap_or(line)
}

/// Remove one trailing line terminator.
fn trim_terminator(text: &str) -> &str {
    let text = text.strip_suffix('\n').unwrap_or(text);
    text.strip_suffix('\r').unwrap_or(text)
}

/// Iterator returned by [`ConflictLocator::scan`].
pub struct ConflictIter<'a> {
    file_path: &'a Path,
    content: &'a str,
    offset: usize,
    line: usize,
}

/// Region under construction while scanning.
struct OpenRegion {
    start: usize,
    start_line: usize,
    ours_start: usize,
    /// `(ours_end, theirs_start)` once the separator has been seen.
    separator: Option<(usize, usize)>,
}

impl Iterator for ConflictIter<'_> {
    type Item = ConflictBlock;

    fn next(&mut self) -> Option<ConflictBlock> {
        let mut open: Option<OpenRegion> = None;

        while self.offset < self.content.len() {
            let rest = &self.content[self.offset..];
            let raw_line = match rest.find('\n') {
                Some(nl) => &rest[..=nl],
                None => rest,
            };
            let body = strip_cr(raw_line.strip_suffix('\n').unwrap_or(raw_line));
            let line_start = self.offset;
            let line_idx = self.line;
            self.offset += raw_line.len();
            self.line += 1;

            if body == OPEN_MARKER {
                // A later opening marker wins: pairing is with the nearest close.
                open = Some(OpenRegion {
                    start: line_start,
                    start_line: line_idx,
                    ours_start: self.offset,
                    separator: None,
                });
                continue;
            }

            let Some(region) = open.as_mut() else {
                continue;
            };

            let separator = region.separator;
            match separator {
                None if body == SEPARATOR => {
                    region.separator = Some((line_start, self.offset));
                }
                None if body.starts_with(CLOSE_PREFIX) => {
                    debug!(line = line_idx, "closing marker before separator; region dropped");
                    open = None;
                }
                Some((ours_end, theirs_start)) if body.starts_with(CLOSE_PREFIX) => {
                    if !close_marker().is_match(body) {
                        debug!(line = line_idx, marker = body, "closing marker out of grammar; region dropped");
                        open = None;
                        continue;
                    }
                    let end = line_start + body.len();
                    let block = ConflictBlock {
                        file_path: self.file_path.to_path_buf(),
                        raw_text: self.content[region.start..end].to_string(),
                        start_line: region.start_line,
                        span: region.start..end,
                        ours: trim_terminator(&self.content[region.ours_start..ours_end])
                            .to_string(),
                        theirs: trim_terminator(&self.content[theirs_start..line_start])
                            .to_string(),
                        their_ref: body[CLOSE_PREFIX.len()..].to_string(),
                    };
                    return Some(block);
                }
                _ => {}
            }
        }

        None
    }
}
