//! Splicing resolutions back into file content and persisting the result.
//!
//! Two strategies are supported (see [`PatchStrategy`]):
//!
//! - **Anchored** rewrites the byte span each block occupied when it was
//!   scanned, highest offset first, after checking that the span still holds
//!   the block's text. The file is written once.
//! - **Literal** replaces the first occurrence of each block's text in the
//!   current content, in discovery order, writing after every replacement.
//!   When two blocks in a file have identical text, a later resolution can
//!   land on the wrong occurrence; this is a known limitation of the strategy.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::locator::ConflictBlock;
use super::requester::Resolution;
use crate::config::PatchStrategy;
use crate::errors::PatchError;
use crate::vcs::VcsDriver;

/// Where an applied resolution now lives in the patched file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedConflict {
    /// Zero-based line of the resolution's first line in the patched file.
    pub start_line: usize,
    /// Lines occupied by the resolution.
    pub line_count: usize,
}

/// Result of applying every resolution for one file.
#[derive(Debug)]
pub struct FilePatch {
    /// File content as last persisted (the original if nothing was written).
    pub content: String,
    /// Persisted resolutions, in discovery order.
    pub applied: Vec<AppliedConflict>,
    /// Conflicts whose text could not be found; each one was skipped.
    pub not_found: Vec<PatchError>,
    /// Set when a write failed. Remaining resolutions for the file were dropped.
    pub write_error: Option<PatchError>,
    /// Indices into the input pairs whose resolutions were dropped by
    /// `write_error`, ascending.
    pub unwritten: Vec<usize>,
}

/// Replace the first literal occurrence of `raw` in `content` with `resolved`.
///
/// Returns the new content and the byte offset of the replaced occurrence, or
/// `None` when `raw` does not occur.
pub fn substitute_first(content: &str, raw: &str, resolved: &str) -> Option<(String, usize)> {
    let idx = content.find(raw)?;
    let mut out = String::with_capacity(content.len() - raw.len() + resolved.len());
    out.push_str(&content[..idx]);
    out.push_str(resolved);
    out.push_str(&content[idx + raw.len()..]);
    Some((out, idx))
}

fn line_of_offset(content: &str, offset: usize) -> usize {
    content.as_bytes()[..offset]
        .iter()
        .filter(|&&b| b == b'\n')
        .count()
}

/// Applies resolutions to files through a [`VcsDriver`].
#[derive(Debug, Clone, Copy)]
pub struct PatchApplier {
    strategy: PatchStrategy,
}

impl PatchApplier {
    pub fn new(strategy: PatchStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> PatchStrategy {
        self.strategy
    }

    /// Apply a single resolution with first-match substitution and persist it.
    ///
    /// Returns the updated content.
    pub fn apply(
        &self,
        vcs: &dyn VcsDriver,
        path: &Path,
        content: &str,
        block: &ConflictBlock,
        resolution: &Resolution,
    ) -> Result<String, PatchError> {
        let (updated, _) =
            substitute_first(content, &resolution.source_conflict, &resolution.resolved_text)
                .ok_or_else(|| PatchError::ConflictNotFound {
                    path: path.to_path_buf(),
                    start_line: block.start_line,
                })?;
        vcs.write_file(path, updated.as_bytes())?;
        debug!(path = %path.display(), start_line = block.start_line, "resolution written");
        Ok(updated)
    }

    /// Apply every `(block, resolution)` pair for one file, in discovery order.
    ///
    /// `content` must be the text the blocks were scanned from.
    pub fn apply_all(
        &self,
        vcs: &dyn VcsDriver,
        path: &Path,
        content: &str,
        pairs: &[(ConflictBlock, Resolution)],
    ) -> FilePatch {
        let patch = match self.strategy {
            PatchStrategy::Anchored => self.apply_anchored(vcs, path, content, pairs),
            PatchStrategy::Literal => self.apply_literal(vcs, path, content, pairs),
        };
        info!(
            path = %path.display(),
            strategy = ?self.strategy,
            applied = patch.applied.len(),
            not_found = patch.not_found.len(),
            write_failed = patch.write_error.is_some(),
            "patch applied"
        );
        patch
    }

    fn apply_anchored(
        &self,
        vcs: &dyn VcsDriver,
        path: &Path,
        content: &str,
        pairs: &[(ConflictBlock, Resolution)],
    ) -> FilePatch {
        let mut not_found = Vec::new();
        let mut planned: Vec<usize> = Vec::with_capacity(pairs.len());
        for (idx, (block, _)) in pairs.iter().enumerate() {
            if content.get(block.span.clone()) == Some(block.raw_text.as_str()) {
                planned.push(idx);
            } else {
                warn!(path = %path.display(), start_line = block.start_line, "conflict span no longer matches");
                not_found.push(PatchError::ConflictNotFound {
                    path: path.to_path_buf(),
                    start_line: block.start_line,
                });
            }
        }

        // Post-edit positions, front to back.
        let mut applied = Vec::with_capacity(planned.len());
        let mut delta: isize = 0;
        for &idx in &planned {
            let (block, resolution) = &pairs[idx];
            let start = block.start_line as isize + delta;
            applied.push(AppliedConflict {
                start_line: start as usize,
                line_count: resolution.line_count,
            });
            delta += resolution.line_count as isize - block.line_count() as isize;
        }

        // Rewrite back to front so earlier spans keep their offsets.
        let mut updated = content.to_string();
        for &idx in planned.iter().rev() {
            let (block, resolution) = &pairs[idx];
            updated.replace_range(block.span.clone(), &resolution.resolved_text);
        }

        if applied.is_empty() {
            return FilePatch {
                content: content.to_string(),
                applied,
                not_found,
                write_error: None,
                unwritten: Vec::new(),
            };
        }

        match vcs.write_file(path, updated.as_bytes()) {
            Ok(()) => FilePatch {
                content: updated,
                applied,
                not_found,
                write_error: None,
                unwritten: Vec::new(),
            },
            Err(e) => FilePatch {
                content: content.to_string(),
                applied: Vec::new(),
                not_found,
                write_error: Some(e.into()),
                unwritten: planned,
            },
        }
    }

    fn apply_literal(
        &self,
        vcs: &dyn VcsDriver,
        path: &Path,
        content: &str,
        pairs: &[(ConflictBlock, Resolution)],
    ) -> FilePatch {
        let mut current = content.to_string();
        let mut applied = Vec::new();
        let mut not_found = Vec::new();

        for (idx, (block, resolution)) in pairs.iter().enumerate() {
            let Some((updated, offset)) =
                substitute_first(&current, &resolution.source_conflict, &resolution.resolved_text)
            else {
                warn!(path = %path.display(), start_line = block.start_line, "conflict text not found");
                not_found.push(PatchError::ConflictNotFound {
                    path: path.to_path_buf(),
                    start_line: block.start_line,
                });
                continue;
            };

            if let Err(e) = vcs.write_file(path, updated.as_bytes()) {
                return FilePatch {
                    content: current,
                    applied,
                    not_found,
                    write_error: Some(e.into()),
                    unwritten: (idx..pairs.len()).collect(),
                };
            }

            applied.push(AppliedConflict {
                start_line: line_of_offset(&current, offset),
                line_count: resolution.line_count,
            });
            current = updated;
        }

        FilePatch {
            content: current,
            applied,
            not_found,
            write_error: None,
            unwritten: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::locator::ConflictLocator;
    use crate::vcs::MemoryVcs;

    const PATH: &str = "/work/a.txt";

    fn pairs_for(content: &str, answers: &[&str]) -> Vec<(ConflictBlock, Resolution)> {
        ConflictLocator::locate(Path::new(PATH), content)
            .into_iter()
            .zip(answers)
            .map(|(block, answer)| {
                let resolution = Resolution::for_block(&block, answer).unwrap();
                (block, resolution)
            })
            .collect()
    }

    #[test]
    fn test_substitute_first_only() {
        let (out, idx) = substitute_first("a X b X c", "X", "Y").unwrap();
        assert_eq!(out, "a Y b X c");
        assert_eq!(idx, 2);
        assert!(substitute_first("abc", "zzz", "Y").is_none());
    }

    #[test]
    fn test_apply_single_scenario() {
        let content = "x\n<<<<<<< HEAD\nA\n=======\nB\n>>>>>>> abc123\ny\n";
        let vcs = MemoryVcs::new("main").with_file(PATH, content);
        let pairs = pairs_for(content, &["C"]);
        let applier = PatchApplier::new(PatchStrategy::Literal);
        let out = applier
            .apply(&vcs, Path::new(PATH), content, &pairs[0].0, &pairs[0].1)
            .unwrap();
        assert_eq!(out, "x\nC\ny\n");
        assert_eq!(vcs.file(PATH).as_deref(), Some("x\nC\ny\n"));
    }

    #[test]
    fn test_apply_missing_conflict_reports_not_found() {
        let content = "x\n<<<<<<< HEAD\nA\n=======\nB\n>>>>>>> abc123\ny\n";
        let vcs = MemoryVcs::new("main").with_file(PATH, "already clean\n");
        let pairs = pairs_for(content, &["C"]);
        let err = PatchApplier::new(PatchStrategy::Literal)
            .apply(&vcs, Path::new(PATH), "already clean\n", &pairs[0].0, &pairs[0].1)
            .unwrap_err();
        assert!(matches!(err, PatchError::ConflictNotFound { start_line: 1, .. }));
        assert_eq!(vcs.file(PATH).as_deref(), Some("already clean\n"));
    }

    #[test]
    fn test_round_trip_with_ours_side() {
        let content = "head\n<<<<<<< HEAD\n    keep(1)\n    keep(2)\n=======\n    drop()\n>>>>>>> 9f8e7d6\ntail\n";
        let vcs = MemoryVcs::new("main").with_file(PATH, content);
        let block = ConflictLocator::locate(Path::new(PATH), content).remove(0);
        let resolution = Resolution::for_block(&block, &block.ours).unwrap();
        let patch = PatchApplier::new(PatchStrategy::Anchored).apply_all(
            &vcs,
            Path::new(PATH),
            content,
            &[(block, resolution)],
        );
        assert_eq!(patch.content, "head\n    keep(1)\n    keep(2)\ntail\n");
        assert_eq!(
            patch.applied,
            vec![AppliedConflict {
                start_line: 1,
                line_count: 2
            }]
        );
    }

    #[test]
    fn test_anchored_tracks_line_shift() {
        let content = "\
a
<<<<<<< HEAD
1
=======
2
>>>>>>> abc
b
<<<<<<< HEAD
3
=======
4
>>>>>>> abc
c
";
        let vcs = MemoryVcs::new("main").with_file(PATH, content);
        let pairs = pairs_for(content, &["one\nuno", "three"]);
        let patch =
            PatchApplier::new(PatchStrategy::Anchored).apply_all(&vcs, Path::new(PATH), content, &pairs);
        assert_eq!(patch.content, "a\none\nuno\nb\nthree\nc\n");
        assert_eq!(
            patch.applied,
            vec![
                AppliedConflict { start_line: 1, line_count: 2 },
                AppliedConflict { start_line: 4, line_count: 1 },
            ]
        );
        assert_eq!(vcs.write_count(PATH), 1);
    }

    #[test]
    fn test_duplicate_blocks_resolved_independently() {
        let block = "<<<<<<< HEAD\nsame\n=======\nother\n>>>>>>> abc\n";
        let content = format!("{block}mid\n{block}");

        let vcs = MemoryVcs::new("main").with_file(PATH, &content);
        let pairs = pairs_for(&content, &["first", "second"]);
        let anchored = PatchApplier::new(PatchStrategy::Anchored)
            .apply_all(&vcs, Path::new(PATH), &content, &pairs);
        assert_eq!(anchored.content, "first\nmid\nsecond\n");

        // Literal substitution threads content forward, so order still holds
        // here; both strategies agree when every block is resolved.
        let vcs = MemoryVcs::new("main").with_file(PATH, &content);
        let literal = PatchApplier::new(PatchStrategy::Literal)
            .apply_all(&vcs, Path::new(PATH), &content, &pairs);
        assert_eq!(literal.content, "first\nmid\nsecond\n");
        assert_eq!(literal.applied, anchored.applied);
        assert_eq!(vcs.write_count(PATH), 2);
    }

    #[test]
    fn test_literal_duplicate_limitation() {
        // Only the second of two identical blocks was resolved; literal
        // substitution lands on the first occurrence instead.
        let block = "<<<<<<< HEAD\nsame\n=======\nother\n>>>>>>> abc\n";
        let content = format!("{block}mid\n{block}");
        let blocks = ConflictLocator::locate(Path::new(PATH), &content);
        let second = blocks[1].clone();
        let resolution = Resolution::for_block(&second, "second").unwrap();
        let pairs = vec![(second, resolution)];

        let vcs = MemoryVcs::new("main").with_file(PATH, &content);
        let literal = PatchApplier::new(PatchStrategy::Literal)
            .apply_all(&vcs, Path::new(PATH), &content, &pairs);
        assert!(literal.content.starts_with("second\nmid\n"));
        assert_eq!(literal.applied[0].start_line, 0);

        let vcs = MemoryVcs::new("main").with_file(PATH, &content);
        let anchored = PatchApplier::new(PatchStrategy::Anchored)
            .apply_all(&vcs, Path::new(PATH), &content, &pairs);
        assert!(anchored.content.ends_with("mid\nsecond\n"));
        assert_eq!(anchored.applied[0].start_line, 6);
    }

    #[test]
    fn test_anchored_stale_span_not_found() {
        let content = "<<<<<<< HEAD\nA\n=======\nB\n>>>>>>> abc\n";
        let pairs = pairs_for(content, &["C"]);
        let vcs = MemoryVcs::new("main").with_file(PATH, "edited\n");
        let patch = PatchApplier::new(PatchStrategy::Anchored).apply_all(
            &vcs,
            Path::new(PATH),
            "edited\n",
            &pairs,
        );
        assert!(patch.applied.is_empty());
        assert_eq!(patch.not_found.len(), 1);
        assert_eq!(vcs.write_count(PATH), 0);
    }

    #[test]
    fn test_write_failure_keeps_earlier_literal_writes() {
        let content = "<<<<<<< HEAD\nA\n=======\nB\n>>>>>>> abc\n<<<<<<< HEAD\nC\n=======\nD\n>>>>>>> abc\n";
        let pairs = pairs_for(content, &["x", "y"]);
        let vcs = MemoryVcs::new("main")
            .with_file(PATH, content)
            .fail_writes_after(PATH, 1);
        let patch = PatchApplier::new(PatchStrategy::Literal).apply_all(
            &vcs,
            Path::new(PATH),
            content,
            &pairs,
        );
        assert_eq!(patch.applied.len(), 1);
        assert!(patch.write_error.is_some());
        assert_eq!(patch.unwritten, vec![1]);
        let on_disk = vcs.file(PATH).unwrap();
        assert!(on_disk.starts_with("x\n<<<<<<< HEAD\nC"));
    }

    #[test]
    fn test_write_failure_anchored_discards_file() {
        let content = "<<<<<<< HEAD\nA\n=======\nB\n>>>>>>> abc\n";
        let pairs = pairs_for(content, &["x"]);
        let vcs = MemoryVcs::new("main")
            .with_file(PATH, content)
            .fail_writes_after(PATH, 0);
        let patch = PatchApplier::new(PatchStrategy::Anchored).apply_all(
            &vcs,
            Path::new(PATH),
            content,
            &pairs,
        );
        assert!(patch.applied.is_empty());
        assert!(matches!(patch.write_error, Some(PatchError::Write(_))));
        assert_eq!(patch.unwritten, vec![0]);
        assert_eq!(vcs.file(PATH).as_deref(), Some(content));
    }

    #[test]
    fn test_literal_write_failure_after_missing_conflict() {
        let stale = "<<<<<<< HEAD
old
=======
gone
>>>>>>> abc
";
        let current = "<<<<<<< HEAD
A
=======
B
>>>>>>> abc
<<<<<<< HEAD
C
=======
D
>>>>>>> abc
";
        let mut pairs = pairs_for(stale, &["s"]);
        pairs.extend(pairs_for(current, &["x", "y"]));
        let vcs = MemoryVcs::new("main")
            .with_file(PATH, current)
            .fail_writes_after(PATH, 1);
        let patch = PatchApplier::new(PatchStrategy::Literal).apply_all(
            &vcs,
            Path::new(PATH),
            current,
            &pairs,
        );
        assert_eq!(patch.not_found.len(), 1);
        assert_eq!(patch.applied.len(), 1);
        assert!(patch.write_error.is_some());
        assert_eq!(patch.unwritten, vec![2]);
    }

    #[test]
    fn test_anchored_write_failure_skips_stale_blocks() {
        let content = "<<<<<<< HEAD
A
=======
B
>>>>>>> abc
mid
<<<<<<< HEAD
C
=======
D
>>>>>>> abc
";
        let mut pairs = pairs_for(content, &["x", "y"]);
        pairs[0].0.span = 0..3;
        let vcs = MemoryVcs::new("main")
            .with_file(PATH, content)
            .fail_writes_after(PATH, 0);
        let patch = PatchApplier::new(PatchStrategy::Anchored).apply_all(
            &vcs,
            Path::new(PATH),
            content,
            &pairs,
        );
        assert_eq!(patch.not_found.len(), 1);
        assert_eq!(patch.unwritten, vec![1]);
    }
}
