//! Local Git repository operations via `git2`.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use git2::build::CheckoutBuilder;
use git2::{Cred, FetchOptions, MergeOptions, Oid, RemoteCallbacks, Repository, StatusOptions};
use tracing::{debug, info, instrument, warn};

use super::{MergeOutcome, VcsDriver};
use crate::errors::VcsError;

/// Length of the commit id used to label the incoming side of a conflict.
const THEIR_LABEL_LEN: usize = 7;

/// [`VcsDriver`] backed by a `git2::Repository` with a working tree.
pub struct GitDriver {
    repo: Mutex<Repository>,
    workdir: PathBuf,
    token: Option<String>,
}

impl GitDriver {
    /// Open an existing Git repository at `repo_path`.
    ///
    /// `token` is offered as an HTTPS password when fetching.
    pub fn open<P: AsRef<Path>>(repo_path: P, token: Option<String>) -> Result<Self, VcsError> {
        let path = repo_path.as_ref();
        info!(path = %path.display(), "opening git repository");
        let repo = Repository::open(path)
            .map_err(|_| VcsError::RepositoryNotFound(path.display().to_string()))?;
        let workdir = repo
            .workdir()
            .ok_or_else(|| VcsError::BareRepository(path.display().to_string()))?
            .to_path_buf();
        Ok(Self {
            repo: Mutex::new(repo),
            workdir,
            token,
        })
    }

    /// Root of the working tree.
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn repo(&self) -> MutexGuard<'_, Repository> {
        self.repo.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_workdir(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workdir.join(path)
        }
    }

    fn callbacks(&self) -> RemoteCallbacks<'static> {
        let mut callbacks = RemoteCallbacks::new();
        if let Some(tok) = &self.token {
            let tok = tok.clone();
            callbacks.credentials(move |_url, _username, _allowed| {
                Cred::userpass_plaintext("x-access-token", &tok)
            });
        }
        callbacks
    }

    /// Fetch `branch` into its remote-tracking ref and return the fetched commit.
    fn fetch(&self, repo: &Repository, remote_name: &str, branch: &str) -> Result<Oid, VcsError> {
        info!(remote = remote_name, branch, "fetching");
        let mut remote = repo.find_remote(remote_name)?;
        let mut fetch_opts = FetchOptions::new();
        fetch_opts.remote_callbacks(self.callbacks());
        let tracking = format!("refs/remotes/{remote_name}/{branch}");
        let refspec = format!("+refs/heads/{branch}:{tracking}");
        remote.fetch(&[refspec.as_str()], Some(&mut fetch_opts), None)?;

        let reference = repo
            .find_reference(&tracking)
            .map_err(|_| VcsError::RefNotFound(tracking.clone()))?;
        let commit = reference.peel_to_commit()?;
        debug!(commit = %commit.id(), "fetch completed");
        Ok(commit.id())
    }
}

fn short_id(oid: Oid) -> String {
    let mut id = oid.to_string();
    id.truncate(THEIR_LABEL_LEN);
    id
}

impl VcsDriver for GitDriver {
    #[instrument(skip(self))]
    fn fetch_and_merge(&self, remote: &str, branch: &str) -> Result<MergeOutcome, VcsError> {
        let repo = self.repo();
        let fetched = self.fetch(&repo, remote, branch)?;
        let annotated = repo.find_annotated_commit(fetched)?;
        let (analysis, _) = repo.merge_analysis(&[&annotated])?;

        if analysis.is_up_to_date() {
            info!("already up to date");
            return Ok(MergeOutcome::UpToDate);
        }

        if analysis.is_fast_forward() {
            let head = repo.head()?;
            let head_name = head
                .name()
                .ok_or_else(|| VcsError::RefNotFound("HEAD".into()))?
                .to_string();
            // Update the working tree before moving the ref. A safe checkout
            // refuses to overwrite local edits, leaving HEAD where it was.
            let target = repo.find_object(fetched, None)?;
            repo.checkout_tree(&target, Some(CheckoutBuilder::new().safe()))?;
            let mut head_ref = repo.find_reference(&head_name)?;
            head_ref.set_target(fetched, "mergemend: fast-forward")?;
            repo.set_head(&head_name)?;
            info!(commit = %fetched, "fast-forwarded");
            return Ok(MergeOutcome::FastForward);
        }

        // The incoming side is labelled with its abbreviated commit id so the
        // closing markers read `>>>>>>> <hex>`.
        let label = short_id(fetched);
        let mut checkout = CheckoutBuilder::new();
        checkout
            .allow_conflicts(true)
            .conflict_style_merge(true)
            .our_label("HEAD")
            .their_label(&label);
        repo.merge(&[&annotated], Some(&mut MergeOptions::new()), Some(&mut checkout))?;

        if repo.index()?.has_conflicts() {
            warn!(their = %label, "merge left conflicts");
            Ok(MergeOutcome::Conflicted)
        } else {
            info!(their = %label, "merged cleanly");
            Ok(MergeOutcome::Clean)
        }
    }

    fn list_conflicted_files(&self) -> Result<Vec<PathBuf>, VcsError> {
        let repo = self.repo();
        let mut opts = StatusOptions::new();
        opts.include_untracked(false).include_ignored(false);
        let statuses = repo.statuses(Some(&mut opts))?;
        let paths: Vec<PathBuf> = statuses
            .iter()
            .filter(|entry| entry.status().is_conflicted())
            .filter_map(|entry| entry.path().map(|p| self.workdir.join(p)))
            .collect();
        debug!(count = paths.len(), "listed conflicted files");
        Ok(paths)
    }

    fn current_branch(&self) -> Result<String, VcsError> {
        let repo = self.repo();
        let head = repo.head()?;
        Ok(head.shorthand().unwrap_or("HEAD").to_string())
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>, VcsError> {
        let full = self.in_workdir(path);
        std::fs::read(&full).map_err(|source| VcsError::FileRead { path: full, source })
    }

    fn write_file(&self, path: &Path, content: &[u8]) -> Result<(), VcsError> {
        let full = self.in_workdir(path);
        std::fs::write(&full, content).map_err(|source| VcsError::FileWrite { path: full, source })
    }
}
