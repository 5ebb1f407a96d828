//! Terminal rendering of resolved regions and the saved position store.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use mergemend_core::conflict::{FilePositions, HighlightSink, HighlightSpan, PositionTracker};

use crate::style;

/// Prints a file with every highlighted span shaded.
///
/// Spans are collected by [`HighlightSink::highlight`] and written out by
/// [`TerminalSink::render`], so overlapping or out-of-order spans are fine.
pub struct TerminalSink<W: Write> {
    out: W,
    spans: Vec<HighlightSpan>,
}

impl<W: Write> TerminalSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            spans: Vec::new(),
        }
    }

    fn is_highlighted(&self, line: usize) -> bool {
        self.spans
            .iter()
            .any(|s| line >= s.start_line && line < s.end_line())
    }

    /// Write `content` with line numbers, shading highlighted lines.
    pub fn render(&mut self, content: &str) -> std::io::Result<()> {
        for (idx, line) in content.lines().enumerate() {
            let number = style::dim(&format!("{:>5}", idx + 1));
            if self.is_highlighted(idx) {
                writeln!(self.out, "{number} {}", style::resolved_line(line))?;
            } else {
                writeln!(self.out, "{number} {line}")?;
            }
        }
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> HighlightSink for TerminalSink<W> {
    fn highlight(&mut self, _path: &Path, span: HighlightSpan) {
        self.spans.push(span);
    }
}

// ---------------------------------------------------------------------------
// Position store
// ---------------------------------------------------------------------------

/// Default location of the saved positions of the last run.
pub fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("mergemend")
        .join("positions.json")
}

/// Save every published position in `tracker` to `path`, merged over what is
/// already stored.
pub fn save_positions(tracker: &PositionTracker, path: &Path) -> Result<()> {
    let mut stored = read_store(path)?;
    for file in tracker.files() {
        let positions = tracker.query(&file);
        stored.insert(file, positions);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(&stored).context("failed to serialize positions")?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Load saved positions into a fresh tracker. A missing store is empty.
pub fn load_positions(path: &Path) -> Result<PositionTracker> {
    let tracker = PositionTracker::new();
    for (file, positions) in read_store(path)? {
        tracker.record_starts(&file, positions.start_lines().to_vec());
        tracker
            .record_resolution_lines(&file, positions.line_counts().to_vec())
            .context("corrupt position store")?;
    }
    Ok(tracker)
}

fn read_store(path: &Path) -> Result<BTreeMap<PathBuf, FilePositions>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let raw =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}
