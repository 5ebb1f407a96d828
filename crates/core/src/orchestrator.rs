//! Merge-and-resolve runs.
//!
//! The [`Orchestrator`] drives one run at a time through a small state machine:
//!
//! 1. Merge the requested branch (optional).
//! 2. Scan every conflicted file for conflict blocks.
//! 3. Ask the oracle for a resolution of each block.
//! 4. Splice resolutions into the files and persist them.
//! 5. Publish the resulting positions to the [`PositionTracker`].
//!
//! Files are read and resolved concurrently, bounded by
//! `max_concurrent_files`; within a file every step is sequential. A VCS
//! failure while merging or listing files fails the whole run. Read and write
//! failures only affect their file, and oracle failures only skip their
//! conflict.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::ResolverConfig;
use crate::conflict::{
    AppliedConflict, ConflictBlock, ConflictLocator, PatchApplier, PositionTracker, Resolution,
    ResolutionRequester,
};
use crate::errors::{PatchError, RunError, VcsError};
use crate::oracle::ResolutionOracle;
use crate::vcs::{MergeOutcome, VcsDriver};

// ---------------------------------------------------------------------------
// Run state machine
// ---------------------------------------------------------------------------

/// States of a resolution run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Merging,
    Scanning,
    Resolving,
    Applying,
    Done,
    Failed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Merging => write!(f, "merging"),
            Self::Scanning => write!(f, "scanning"),
            Self::Resolving => write!(f, "resolving"),
            Self::Applying => write!(f, "applying"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Cooperative cancellation flag for a run. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// A conflict that was found but not applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkippedConflict {
    /// Zero-based line of the opening marker as scanned.
    pub start_line: usize,
    pub reason: String,
}

/// Outcome for one conflicted file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileReport {
    pub path: PathBuf,
    pub conflicts_found: usize,
    /// Applied resolutions at their post-edit positions.
    pub applied: Vec<AppliedConflict>,
    pub skipped: Vec<SkippedConflict>,
    /// File-scoped failure (read or write), if any.
    pub error: Option<String>,
}

/// Statistics and per-file outcomes of a single run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub id: String,
    pub state: RunState,
    pub merge: Option<MergeOutcome>,
    pub branch: String,
    pub files: Vec<FileReport>,
    pub cancelled: bool,
    pub started_at: String,
    pub completed_at: Option<String>,
}

impl RunReport {
    fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state: RunState::Idle,
            merge: None,
            branch: String::new(),
            files: Vec::new(),
            cancelled: false,
            started_at: Utc::now().to_rfc3339(),
            completed_at: None,
        }
    }

    pub fn conflicts_found(&self) -> usize {
        self.files.iter().map(|f| f.conflicts_found).sum()
    }

    pub fn conflicts_applied(&self) -> usize {
        self.files.iter().map(|f| f.applied.len()).sum()
    }

    pub fn conflicts_skipped(&self) -> usize {
        self.files.iter().map(|f| f.skipped.len()).sum()
    }

    pub fn file_errors(&self) -> usize {
        self.files.iter().filter(|f| f.error.is_some()).count()
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{} file(s), {} conflict(s): {} resolved, {} skipped",
            self.files.len(),
            self.conflicts_found(),
            self.conflicts_applied(),
            self.conflicts_skipped(),
        );
        if self.file_errors() > 0 {
            line.push_str(&format!(", {} file error(s)", self.file_errors()));
        }
        if self.cancelled {
            line.push_str(" (cancelled)");
        }
        line
    }
}

/// A file read and scanned, waiting for resolutions.
struct ScannedFile {
    path: PathBuf,
    content: String,
    blocks: Vec<ConflictBlock>,
}

/// A scanned file with the resolutions the oracle produced.
struct ResolvedFile {
    scanned: ScannedFile,
    pairs: Vec<(ConflictBlock, Resolution)>,
    skipped: Vec<SkippedConflict>,
}

/// How the resolve step ended for one file.
enum FileResolution {
    Resolved(ResolvedFile),
    /// Not started because the run was cancelled.
    Cancelled,
    /// The resolve task died; the file is left untouched.
    Failed { path: PathBuf, reason: String },
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Coordinates merge, scan, resolve, apply and publish for one repository.
pub struct Orchestrator {
    vcs: Arc<dyn VcsDriver>,
    requester: ResolutionRequester,
    applier: PatchApplier,
    tracker: Arc<PositionTracker>,
    max_concurrent_files: usize,
    /// Atomic flag preventing concurrent runs.
    running: Arc<AtomicBool>,
    state: Mutex<RunState>,
    run_started_at: Mutex<Option<DateTime<Utc>>>,
}

impl Orchestrator {
    pub fn new(
        vcs: Arc<dyn VcsDriver>,
        oracle: Arc<dyn ResolutionOracle>,
        config: &ResolverConfig,
    ) -> Self {
        info!(
            strategy = ?config.strategy,
            policy = ?config.line_count_policy,
            max_concurrent_files = config.max_concurrent_files,
            "initializing orchestrator"
        );
        Self {
            vcs,
            requester: ResolutionRequester::new(oracle, config.line_count_policy),
            applier: PatchApplier::new(config.strategy),
            tracker: Arc::new(PositionTracker::new()),
            max_concurrent_files: config.max_concurrent_files.max(1),
            running: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(RunState::Idle),
            run_started_at: Mutex::new(None),
        }
    }

    /// Shared handle to the positions published by runs.
    pub fn tracker(&self) -> Arc<PositionTracker> {
        self.tracker.clone()
    }

    /// State of the current or most recent run.
    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check if a run is currently in progress.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: RunState) {
        debug!(%state, "run state");
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Merge `branch` from `remote`, then resolve every conflict it leaves.
    pub async fn merge_and_resolve(
        &self,
        remote: &str,
        branch: &str,
        cancel: &CancelToken,
    ) -> Result<RunReport, RunError> {
        self.run(Some((remote, branch)), None, cancel).await
    }

    /// Resolve conflicts in files that are already conflicted, without
    /// merging. With `paths` empty, every file the VCS reports as conflicted
    /// is used.
    pub async fn resolve_paths(
        &self,
        paths: Vec<PathBuf>,
        cancel: &CancelToken,
    ) -> Result<RunReport, RunError> {
        let paths = if paths.is_empty() { None } else { Some(paths) };
        self.run(None, paths, cancel).await
    }

    async fn run(
        &self,
        merge: Option<(&str, &str)>,
        paths: Option<Vec<PathBuf>>,
        cancel: &CancelToken,
    ) -> Result<RunReport, RunError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let started_at = self
                .run_started_at
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .map(|t| t.to_rfc3339())
                .unwrap_or_default();
            return Err(RunError::AlreadyRunning { started_at });
        }

        // Clears the running flag on drop, even on panic.
        let _guard = RunLockGuard(self.running.clone());
        *self
            .run_started_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());

        let mut report = RunReport::new();
        info!(run_id = %report.id, "run started");

        let result = self.do_run(merge, paths, cancel, &mut report).await;
        report.completed_at = Some(Utc::now().to_rfc3339());

        match result {
            Ok(()) => {
                self.set_state(RunState::Done);
                report.state = RunState::Done;
                info!(run_id = %report.id, summary = %report.summary(), "run finished");
                Ok(report)
            }
            Err(e) => {
                self.set_state(RunState::Failed);
                // Callers own the user-facing report of a failed run.
                info!(run_id = %report.id, error = %e, "run failed");
                Err(e)
            }
        }
    }

    async fn do_run(
        &self,
        merge: Option<(&str, &str)>,
        paths: Option<Vec<PathBuf>>,
        cancel: &CancelToken,
        report: &mut RunReport,
    ) -> Result<(), RunError> {
        // 1. Merge.
        if let Some((remote, branch)) = merge {
            self.set_state(RunState::Merging);
            let vcs = self.vcs.clone();
            let (remote, branch) = (remote.to_string(), branch.to_string());
            let outcome = tokio::task::spawn_blocking(move || vcs.fetch_and_merge(&remote, &branch))
                .await
                .map_err(|e| VcsError::IoError(std::io::Error::other(e)))??;
            info!(%outcome, "merge finished");
            report.merge = Some(outcome);
        }

        // 2. Scan.
        self.set_state(RunState::Scanning);
        let paths = match paths {
            Some(paths) => paths,
            None => self.vcs.list_conflicted_files()?,
        };
        report.branch = self.vcs.current_branch()?;
        if paths.is_empty() {
            info!("no conflicted files");
            return Ok(());
        }

        let scanned = self.scan_files(paths, report).await;
        if cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(());
        }

        // 3. Resolve.
        self.set_state(RunState::Resolving);
        let resolved = self.resolve_files(scanned, &report.branch, cancel).await;

        // 4. Apply, in discovery order. Files whose resolve step started are
        // finished even if the run was cancelled meanwhile.
        self.set_state(RunState::Applying);
        let mut published = Vec::new();
        for outcome in resolved {
            let ResolvedFile {
                scanned,
                pairs,
                mut skipped,
            } = match outcome {
                FileResolution::Resolved(resolved) => resolved,
                FileResolution::Cancelled => {
                    report.cancelled = true;
                    continue;
                }
                FileResolution::Failed { path, reason } => {
                    if let Some(file) = report.files.iter_mut().find(|f| f.path == path) {
                        file.error = Some(reason);
                    }
                    continue;
                }
            };

            let file = match report.files.iter_mut().find(|f| f.path == scanned.path) {
                Some(file) => file,
                None => continue,
            };

            let patch = self
                .applier
                .apply_all(self.vcs.as_ref(), &scanned.path, &scanned.content, &pairs);
            for err in &patch.not_found {
                if let PatchError::ConflictNotFound { start_line, .. } = err {
                    skipped.push(SkippedConflict {
                        start_line: *start_line,
                        reason: err.to_string(),
                    });
                }
            }
            if let Some(err) = &patch.write_error {
                warn!(path = %scanned.path.display(), error = %err, "file write failed");
                file.error = Some(err.to_string());
                // Resolutions not persisted are skipped too.
                skipped.extend(patch.unwritten.iter().map(|&idx| SkippedConflict {
                    start_line: pairs[idx].0.start_line,
                    reason: err.to_string(),
                }));
            }
            skipped.sort_by_key(|s| s.start_line);
            file.applied = patch.applied;
            file.skipped = skipped;
            published.push((scanned.path, file.applied.clone()));
        }

        // 5. Publish.
        for (path, applied) in published {
            self.tracker
                .record_starts(&path, applied.iter().map(|a| a.start_line).collect());
            if let Err(e) = self
                .tracker
                .record_resolution_lines(&path, applied.iter().map(|a| a.line_count).collect())
            {
                warn!(error = %e, "positions not published");
            }
        }

        Ok(())
    }

    /// Read and scan every file concurrently. Files that cannot be read are
    /// reported with an error and left out. Results keep the input order.
    async fn scan_files(&self, paths: Vec<PathBuf>, report: &mut RunReport) -> Vec<ScannedFile> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_files));
        let mut tasks = JoinSet::new();

        for (idx, path) in paths.iter().cloned().enumerate() {
            let vcs = self.vcs.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = tokio::task::spawn_blocking({
                    let path = path.clone();
                    move || vcs.read_file(&path)
                })
                .await
                .map_err(|e| VcsError::IoError(std::io::Error::other(e)))
                .and_then(|r| r)
                .and_then(|bytes| {
                    String::from_utf8(bytes).map_err(|e| VcsError::FileRead {
                        path: path.clone(),
                        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
                    })
                });
                (idx, path, result)
            });
        }

        let mut results: Vec<Option<(PathBuf, Result<String, VcsError>)>> =
            (0..paths.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, path, result)) => results[idx] = Some((path, result)),
                Err(e) => warn!(error = %e, "scan task failed"),
            }
        }

        let mut scanned = Vec::new();
        for (path, result) in paths.into_iter().zip(results) {
            let (path, result) = result.unwrap_or_else(|| {
                let reason = "read task did not complete";
                (path, Err(VcsError::IoError(std::io::Error::other(reason))))
            });
            match result {
                Ok(content) => {
                    let blocks = ConflictLocator::locate(&path, &content);
                    report.files.push(FileReport {
                        path: path.clone(),
                        conflicts_found: blocks.len(),
                        ..Default::default()
                    });
                    scanned.push(ScannedFile {
                        path,
                        content,
                        blocks,
                    });
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "file read failed");
                    report.files.push(FileReport {
                        path,
                        error: Some(e.to_string()),
                        ..Default::default()
                    });
                }
            }
        }
        scanned
    }

    /// Request resolutions file by file, concurrently across files and in
    /// order within each file. Cancellation is checked as each file starts.
    async fn resolve_files(
        &self,
        scanned: Vec<ScannedFile>,
        branch: &str,
        cancel: &CancelToken,
    ) -> Vec<FileResolution> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_files));
        let mut tasks = JoinSet::new();
        let paths: Vec<PathBuf> = scanned.iter().map(|f| f.path.clone()).collect();

        for (idx, file) in scanned.into_iter().enumerate() {
            let requester = self.requester.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let branch = branch.to_string();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                if cancel.is_cancelled() {
                    debug!(path = %file.path.display(), "skipped by cancellation");
                    return (idx, FileResolution::Cancelled);
                }
                let mut pairs = Vec::new();
                let mut skipped = Vec::new();
                for block in &file.blocks {
                    match requester.request(block, &branch).await {
                        Ok(resolution) => pairs.push((block.clone(), resolution)),
                        Err(e) => {
                            warn!(
                                path = %file.path.display(),
                                start_line = block.start_line,
                                error = %e,
                                "conflict skipped"
                            );
                            skipped.push(SkippedConflict {
                                start_line: block.start_line,
                                reason: e.to_string(),
                            });
                        }
                    }
                }
                (
                    idx,
                    FileResolution::Resolved(ResolvedFile {
                        scanned: file,
                        pairs,
                        skipped,
                    }),
                )
            });
        }

        let mut results: Vec<Option<FileResolution>> = paths.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, resolution)) => results[idx] = Some(resolution),
                Err(e) => warn!(error = %e, "resolve task failed"),
            }
        }
        paths
            .into_iter()
            .zip(results)
            .map(|(path, resolution)| {
                resolution.unwrap_or(FileResolution::Failed {
                    path,
                    reason: "resolve task did not complete".into(),
                })
            })
            .collect()
    }
}

/// Drop guard that resets the `running` flag to `false`.
struct RunLockGuard(Arc<AtomicBool>);

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    use super::*;
    use crate::config::PatchStrategy;
    use crate::errors::OracleError;
    use crate::oracle::OracleRequest;
    use crate::vcs::MemoryVcs;

    /// Answers by looking up a substring of the conflict text.
    struct TableOracle {
        answers: HashMap<&'static str, Result<&'static str, ()>>,
        delay: Duration,
    }

    impl TableOracle {
        fn new(answers: &[(&'static str, Result<&'static str, ()>)]) -> Arc<Self> {
            Arc::new(Self {
                answers: answers.iter().cloned().collect(),
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl ResolutionOracle for TableOracle {
        async fn resolve(&self, request: &OracleRequest) -> Result<Vec<String>, OracleError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            for (key, answer) in &self.answers {
                if request.conflict_text.contains(key) {
                    return match answer {
                        Ok(text) => Ok(vec![text.to_string()]),
                        Err(()) => Err(OracleError::RateLimited),
                    };
                }
            }
            Ok(Vec::new())
        }
    }

    /// Crashes on conflicts mentioning "boom".
    struct CrashingOracle;

    #[async_trait]
    impl ResolutionOracle for CrashingOracle {
        async fn resolve(&self, request: &OracleRequest) -> Result<Vec<String>, OracleError> {
            if request.conflict_text.contains("boom") {
                panic!("oracle crashed");
            }
            Ok(vec!["ok".into()])
        }
    }

    /// Counts ERROR-level events.
    struct ErrorEvents(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> Layer<S> for ErrorEvents {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() == tracing::Level::ERROR {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    const A: &str = "/w/a.txt";
    const B: &str = "/w/b.txt";

    fn conflict(ours: &str, theirs: &str) -> String {
        format!("<<<<<<< HEAD\n{ours}\n=======\n{theirs}\n>>>>>>> abc123\n")
    }

    fn orchestrator(vcs: Arc<MemoryVcs>, oracle: Arc<dyn ResolutionOracle>) -> Orchestrator {
        Orchestrator::new(vcs, oracle, &ResolverConfig::default())
    }

    #[test]
    fn test_run_state_display() {
        assert_eq!(RunState::Idle.to_string(), "idle");
        assert_eq!(RunState::Merging.to_string(), "merging");
        assert_eq!(RunState::Scanning.to_string(), "scanning");
        assert_eq!(RunState::Resolving.to_string(), "resolving");
        assert_eq!(RunState::Applying.to_string(), "applying");
        assert_eq!(RunState::Done.to_string(), "done");
        assert_eq!(RunState::Failed.to_string(), "failed");
    }

    #[tokio::test]
    async fn test_oracle_failure_in_one_file() {
        let vcs = Arc::new(
            MemoryVcs::new("main")
                .with_merge_outcome(MergeOutcome::Conflicted)
                .with_conflicted_file(A, format!("top\n{}", conflict("a1", "a2")))
                .with_conflicted_file(B, format!("{}end\n", conflict("b1", "b2"))),
        );
        let oracle = TableOracle::new(&[("a1", Err(())), ("b1", Ok("b"))]);
        let orch = orchestrator(vcs.clone(), oracle);

        let report = orch
            .merge_and_resolve("origin", "feature", &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(report.state, RunState::Done);
        assert_eq!(report.merge, Some(MergeOutcome::Conflicted));
        assert_eq!(report.branch, "main");

        // A untouched, nothing recorded.
        assert_eq!(vcs.file(A).unwrap(), format!("top\n{}", conflict("a1", "a2")));
        assert_eq!(vcs.write_count(A), 0);
        assert!(orch.tracker().query(Path::new(A)).is_empty());
        assert_eq!(report.files[0].skipped.len(), 1);

        // B resolved and recorded.
        assert_eq!(vcs.file(B).as_deref(), Some("b\nend\n"));
        let positions = orch.tracker().query(Path::new(B));
        assert_eq!(positions.start_lines(), &[0]);
        assert_eq!(positions.line_counts(), &[1]);
        assert_eq!(report.summary(), "2 file(s), 2 conflict(s): 1 resolved, 1 skipped");
    }

    #[tokio::test]
    async fn test_file_without_markers() {
        let vcs = Arc::new(MemoryVcs::new("main").with_conflicted_file(A, "clean\n"));
        let orch = orchestrator(vcs.clone(), TableOracle::new(&[]));
        let report = orch.resolve_paths(Vec::new(), &CancelToken::new()).await.unwrap();
        assert_eq!(report.conflicts_found(), 0);
        assert_eq!(vcs.write_count(A), 0);
        assert_eq!(orch.tracker().files(), vec![PathBuf::from(A)]);
        assert!(orch.tracker().query(Path::new(A)).is_empty());
    }

    #[tokio::test]
    async fn test_second_run_is_noop() {
        let vcs = Arc::new(
            MemoryVcs::new("main").with_conflicted_file(A, format!("x\n{}y\n", conflict("A", "B"))),
        );
        let orch = orchestrator(vcs.clone(), TableOracle::new(&[("A", Ok("C"))]));
        orch.resolve_paths(Vec::new(), &CancelToken::new()).await.unwrap();
        assert_eq!(vcs.file(A).as_deref(), Some("x\nC\ny\n"));

        let report = orch.resolve_paths(Vec::new(), &CancelToken::new()).await.unwrap();
        assert_eq!(report.conflicts_found(), 0);
        assert_eq!(vcs.write_count(A), 1);
        assert_eq!(vcs.file(A).as_deref(), Some("x\nC\ny\n"));
    }

    #[tokio::test]
    async fn test_merge_failure_fails_run() {
        let vcs = Arc::new(
            MemoryVcs::new("main")
                .fail_merge("network unreachable")
                .with_conflicted_file(A, conflict("A", "B")),
        );
        let orch = orchestrator(vcs.clone(), TableOracle::new(&[("A", Ok("C"))]));
        let err = orch
            .merge_and_resolve("origin", "main", &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Vcs(_)));
        assert_eq!(orch.state(), RunState::Failed);
        assert_eq!(vcs.write_count(A), 0);
        assert!(!orch.is_running());
    }

    #[tokio::test]
    async fn test_failed_run_emits_no_error_events() {
        let errors = Arc::new(AtomicUsize::new(0));
        let _default = tracing::subscriber::set_default(
            tracing_subscriber::registry().with(ErrorEvents(errors.clone())),
        );
        let vcs = Arc::new(MemoryVcs::new("main").fail_merge("network unreachable"));
        let orch = orchestrator(vcs, TableOracle::new(&[]));
        let err = orch
            .merge_and_resolve("origin", "main", &CancelToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("version control failed"));
        assert_eq!(orch.state(), RunState::Failed);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unreadable_file_is_file_scoped() {
        let vcs = Arc::new(
            MemoryVcs::new("main")
                .with_unreadable_file(A)
                .with_conflicted_file(B, conflict("b1", "b2")),
        );
        let orch = orchestrator(vcs.clone(), TableOracle::new(&[("b1", Ok("b"))]));
        let report = orch.resolve_paths(Vec::new(), &CancelToken::new()).await.unwrap();
        assert!(report.files[0].error.is_some());
        assert_eq!(vcs.file(B).as_deref(), Some("b\n"));
        assert_eq!(report.file_errors(), 1);
    }

    #[tokio::test]
    async fn test_write_failure_is_file_scoped() {
        let vcs = Arc::new(
            MemoryVcs::new("main")
                .with_conflicted_file(A, conflict("a1", "a2"))
                .with_conflicted_file(B, conflict("b1", "b2"))
                .fail_writes_after(A, 0),
        );
        let oracle = TableOracle::new(&[("a1", Ok("a")), ("b1", Ok("b"))]);
        let orch = orchestrator(vcs.clone(), oracle);
        let report = orch.resolve_paths(Vec::new(), &CancelToken::new()).await.unwrap();
        assert!(report.files[0].error.is_some());
        assert_eq!(report.files[0].skipped.len(), 1);
        assert!(orch.tracker().query(Path::new(A)).is_empty());
        assert_eq!(orch.tracker().query(Path::new(B)).len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_run_rejected() {
        let vcs = Arc::new(MemoryVcs::new("main").with_conflicted_file(A, conflict("A", "B")));
        let oracle = Arc::new(TableOracle {
            answers: [("A", Ok("C"))].into_iter().collect(),
            delay: Duration::from_millis(200),
        });
        let orch = Arc::new(orchestrator(vcs, oracle));

        let first = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.resolve_paths(Vec::new(), &CancelToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(orch.is_running());
        let err = orch
            .resolve_paths(Vec::new(), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::AlreadyRunning { .. }));

        assert!(first.await.unwrap().is_ok());
        assert!(!orch.is_running());
    }

    #[tokio::test]
    async fn test_cancelled_before_resolving() {
        let vcs = Arc::new(MemoryVcs::new("main").with_conflicted_file(A, conflict("A", "B")));
        let orch = orchestrator(vcs.clone(), TableOracle::new(&[("A", Ok("C"))]));
        let cancel = CancelToken::new();
        cancel.cancel();
        let report = orch.resolve_paths(Vec::new(), &cancel).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.state, RunState::Done);
        assert_eq!(vcs.write_count(A), 0);
        assert!(report.summary().ends_with("(cancelled)"));
    }

    #[tokio::test]
    async fn test_cancel_mid_run_finishes_started_file() {
        let vcs = Arc::new(
            MemoryVcs::new("main")
                .with_conflicted_file(A, conflict("a1", "a2"))
                .with_conflicted_file(B, conflict("b1", "b2")),
        );
        let oracle = Arc::new(TableOracle {
            answers: [("a1", Ok("a")), ("b1", Ok("b"))].into_iter().collect(),
            delay: Duration::from_millis(150),
        });
        let config = ResolverConfig {
            max_concurrent_files: 1,
            ..Default::default()
        };
        let orch = Orchestrator::new(vcs.clone(), oracle, &config);

        let cancel = CancelToken::new();
        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            })
        };
        let report = orch.resolve_paths(Vec::new(), &cancel).await.unwrap();
        canceller.await.unwrap();

        assert!(report.cancelled);
        assert_eq!(report.state, RunState::Done);
        assert_eq!(report.conflicts_found(), 2);
        assert_eq!(report.conflicts_applied(), 1);
        assert_eq!(vcs.write_count(A) + vcs.write_count(B), 1);

        // Whichever file was in flight is finished and published.
        let finished: Vec<&FileReport> =
            report.files.iter().filter(|f| !f.applied.is_empty()).collect();
        assert_eq!(finished.len(), 1);
        assert_eq!(orch.tracker().query(&finished[0].path).len(), 1);
    }

    #[tokio::test]
    async fn test_crashed_resolve_task_is_file_error() {
        let vcs = Arc::new(
            MemoryVcs::new("main")
                .with_conflicted_file(A, conflict("boom", "a2"))
                .with_conflicted_file(B, conflict("b1", "b2")),
        );
        let orch = orchestrator(vcs.clone(), Arc::new(CrashingOracle));
        let report = orch.resolve_paths(Vec::new(), &CancelToken::new()).await.unwrap();

        assert!(!report.cancelled);
        assert_eq!(report.file_errors(), 1);
        let a = &report.files[0];
        assert_eq!(a.path, PathBuf::from(A));
        assert!(a.error.as_deref().unwrap().contains("did not complete"));
        assert_eq!(vcs.write_count(A), 0);
        assert_eq!(vcs.file(B).as_deref(), Some("ok\n"));
    }

    #[tokio::test]
    async fn test_literal_and_anchored_agree() {
        let content = format!(
            "head\n{}mid\n{}tail\n",
            conflict("one", "uno"),
            conflict("two", "dos")
        );
        let oracle = TableOracle::new(&[("one", Ok("1\n1")), ("two", Ok("2"))]);

        let mut results = Vec::new();
        for strategy in [PatchStrategy::Anchored, PatchStrategy::Literal] {
            let vcs = Arc::new(MemoryVcs::new("main").with_conflicted_file(A, content.clone()));
            let config = ResolverConfig {
                strategy,
                ..Default::default()
            };
            let orch = Orchestrator::new(vcs.clone(), oracle.clone(), &config);
            orch.resolve_paths(Vec::new(), &CancelToken::new()).await.unwrap();
            results.push((vcs.file(A), orch.tracker().query(Path::new(A))));
        }
        assert_eq!(results[0], results[1]);
        assert_eq!(results[0].0.as_deref(), Some("head\n1\n1\nmid\n2\ntail\n"));
        assert_eq!(results[0].1.start_lines(), &[1, 4]);
        assert_eq!(results[0].1.line_counts(), &[2, 1]);
    }
}
