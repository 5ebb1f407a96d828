//! Per-file record of where resolved conflicts ended up, for highlighting.
//!
//! Start lines and line counts are published together. [`PositionTracker::record_starts`]
//! only stages the start lines; they become visible when the matching line
//! counts arrive through [`PositionTracker::record_resolution_lines`], so a
//! reader never sees one sequence updated without the other.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::applier::AppliedConflict;
use crate::errors::TrackerError;

/// One highlighted region: `line_count` lines starting at `start_line`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighlightSpan {
    pub start_line: usize,
    pub line_count: usize,
}

impl HighlightSpan {
    /// Zero-based line after the last highlighted line.
    pub fn end_line(&self) -> usize {
        self.start_line + self.line_count
    }
}

/// Published positions for one file. Both sequences always have equal length.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePositions {
    start_lines: Vec<usize>,
    line_counts: Vec<usize>,
}

impl FilePositions {
    pub fn start_lines(&self) -> &[usize] {
        &self.start_lines
    }

    pub fn line_counts(&self) -> &[usize] {
        &self.line_counts
    }

    pub fn len(&self) -> usize {
        self.start_lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.start_lines.is_empty()
    }

    /// Pairs of start line and line count, in recorded order.
    pub fn spans(&self) -> impl Iterator<Item = HighlightSpan> + '_ {
        self.start_lines
            .iter()
            .zip(&self.line_counts)
            .map(|(&start_line, &line_count)| HighlightSpan {
                start_line,
                line_count,
            })
    }
}

impl From<&[AppliedConflict]> for FilePositions {
    fn from(applied: &[AppliedConflict]) -> Self {
        Self {
            start_lines: applied.iter().map(|a| a.start_line).collect(),
            line_counts: applied.iter().map(|a| a.line_count).collect(),
        }
    }
}

/// Receives highlight spans when the active file changes.
pub trait HighlightSink {
    /// Highlight one span in `path`.
    fn highlight(&mut self, path: &Path, span: HighlightSpan);
}

/// Thread-safe map from file path to its published positions.
#[derive(Debug, Default)]
pub struct PositionTracker {
    published: RwLock<HashMap<PathBuf, FilePositions>>,
    staged: Mutex<HashMap<PathBuf, Vec<usize>>>,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage the start lines for `path`, replacing anything staged before.
    ///
    /// Nothing is visible to [`query`](Self::query) until
    /// [`record_resolution_lines`](Self::record_resolution_lines) is called.
    pub fn record_starts(&self, path: &Path, start_lines: Vec<usize>) {
        self.staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf(), start_lines);
    }

    /// Publish `line_counts` together with the staged start lines for `path`.
    ///
    /// A missing stage counts as an empty sequence. On a length mismatch
    /// nothing is published and the stage is kept.
    pub fn record_resolution_lines(
        &self,
        path: &Path,
        line_counts: Vec<usize>,
    ) -> Result<(), TrackerError> {
        let mut staged = self.staged.lock().unwrap_or_else(PoisonError::into_inner);
        let starts_len = staged.get(path).map_or(0, Vec::len);
        if starts_len != line_counts.len() {
            return Err(TrackerError::LengthMismatch {
                path: path.to_path_buf(),
                starts: starts_len,
                counts: line_counts.len(),
            });
        }
        let start_lines = staged.remove(path).unwrap_or_default();
        self.publish(
            path,
            FilePositions {
                start_lines,
                line_counts,
            },
        );
        Ok(())
    }

    /// Publish positions for `path` in one step, discarding any stage.
    pub fn record(&self, path: &Path, positions: FilePositions) {
        self.staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
        self.publish(path, positions);
    }

    fn publish(&self, path: &Path, positions: FilePositions) {
        debug!(path = %path.display(), count = positions.len(), "positions published");
        self.published
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf(), positions);
    }

    /// Published positions for `path`; empty when nothing was recorded.
    pub fn query(&self, path: &Path) -> FilePositions {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    /// Every path with published positions, sorted.
    pub fn files(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        paths.sort();
        paths
    }

    /// Send every published span for `path` to `sink`. Returns the number of
    /// spans rendered; a file with nothing recorded renders nothing.
    pub fn on_active_file_changed(&self, path: &Path, sink: &mut dyn HighlightSink) -> usize {
        let positions = self.query(path);
        for span in positions.spans() {
            sink.highlight(path, span);
        }
        positions.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[derive(Default)]
    struct RecordingSink(Vec<(PathBuf, HighlightSpan)>);

    impl HighlightSink for RecordingSink {
        fn highlight(&mut self, path: &Path, span: HighlightSpan) {
            self.0.push((path.to_path_buf(), span));
        }
    }

    #[test]
    fn test_record_and_query() {
        let tracker = PositionTracker::new();
        let path = Path::new("/w/a.rs");
        tracker.record_starts(path, vec![3, 10]);
        assert!(tracker.query(path).is_empty());
        tracker.record_resolution_lines(path, vec![2, 1]).unwrap();

        let positions = tracker.query(path);
        assert_eq!(positions.start_lines(), &[3, 10]);
        assert_eq!(positions.line_counts(), &[2, 1]);
    }

    #[test]
    fn test_query_unknown_is_empty() {
        let tracker = PositionTracker::new();
        assert_eq!(tracker.query(Path::new("nowhere")), FilePositions::default());
    }

    #[test]
    fn test_length_mismatch_publishes_nothing() {
        let tracker = PositionTracker::new();
        let path = Path::new("a");
        tracker.record(
            path,
            FilePositions::from(&[AppliedConflict { start_line: 1, line_count: 1 }][..]),
        );
        tracker.record_starts(path, vec![4, 9]);
        let err = tracker.record_resolution_lines(path, vec![1]).unwrap_err();
        assert_eq!(
            err,
            TrackerError::LengthMismatch {
                path: path.to_path_buf(),
                starts: 2,
                counts: 1
            }
        );
        // Previous publication untouched; the stage survives for a retry.
        assert_eq!(tracker.query(path).start_lines(), &[1]);
        tracker.record_resolution_lines(path, vec![1, 1]).unwrap();
        assert_eq!(tracker.query(path).start_lines(), &[4, 9]);
    }

    #[test]
    fn test_replacement_not_merge() {
        let tracker = PositionTracker::new();
        let path = Path::new("a");
        tracker.record_starts(path, vec![1, 2, 3]);
        tracker.record_resolution_lines(path, vec![1, 1, 1]).unwrap();
        tracker.record_starts(path, vec![7]);
        tracker.record_resolution_lines(path, vec![4]).unwrap();
        assert_eq!(tracker.query(path).start_lines(), &[7]);
        assert_eq!(tracker.files(), vec![PathBuf::from("a")]);
    }

    #[test]
    fn test_empty_publication() {
        let tracker = PositionTracker::new();
        let path = Path::new("clean.rs");
        tracker.record_resolution_lines(path, Vec::new()).unwrap();
        assert!(tracker.query(path).is_empty());
        assert_eq!(tracker.files().len(), 1);
    }

    #[test]
    fn test_active_file_renders_each_span() {
        let tracker = PositionTracker::new();
        let path = Path::new("/w/a.rs");
        tracker.record_starts(path, vec![0, 6]);
        tracker.record_resolution_lines(path, vec![3, 1]).unwrap();

        let mut sink = RecordingSink::default();
        assert_eq!(tracker.on_active_file_changed(path, &mut sink), 2);
        assert_eq!(sink.0[0].1, HighlightSpan { start_line: 0, line_count: 3 });
        assert_eq!(sink.0[1].1.end_line(), 7);

        let mut sink = RecordingSink::default();
        assert_eq!(tracker.on_active_file_changed(Path::new("other"), &mut sink), 0);
        assert!(sink.0.is_empty());
    }

    #[test]
    fn test_concurrent_readers_see_consistent_pairs() {
        let tracker = Arc::new(PositionTracker::new());
        let path = PathBuf::from("shared");
        let writer = {
            let tracker = tracker.clone();
            let path = path.clone();
            std::thread::spawn(move || {
                for n in 0..200 {
                    tracker.record_starts(&path, vec![0; n % 5]);
                    tracker.record_resolution_lines(&path, vec![1; n % 5]).unwrap();
                }
            })
        };
        for _ in 0..200 {
            let positions = tracker.query(&path);
            assert_eq!(positions.start_lines().len(), positions.line_counts().len());
        }
        writer.join().unwrap();
    }
}
