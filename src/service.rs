//! Commands and queries over mirrored repositories.
//!
//! This is the surface an outer layer (the CLI here) calls.  Fetches go
//! through the shared queue or the per-repo fetch lock so they stay
//! serialised across processes; the status projection combines on-disk refs
//! with the shared status record.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::clones::LocalClones;
use crate::coordination::{fetch_lock_key, Coordinator, FetchEvent, FetchJob};
use crate::error::GitError;
use crate::metrics::MetricsRegistry;
use crate::model::{
    Author, BranchName, CommitMessage, File, GitRepoInfo, PushableCommitRef, PushedCommit,
    RefName, RemoteUrl, RepoId,
};
use crate::worker::{acquire_fetch_lock, WorkerSettings};

#[derive(Clone)]
pub struct RepoService {
    clones: LocalClones,
    coordinator: Arc<dyn Coordinator>,
    settings: WorkerSettings,
    metrics: MetricsRegistry,
    default_author: Author,
}

impl RepoService {
    pub fn new(
        clones: LocalClones,
        coordinator: Arc<dyn Coordinator>,
        settings: WorkerSettings,
        metrics: MetricsRegistry,
        default_author: Author,
    ) -> Self {
        Self {
            clones,
            coordinator,
            settings,
            metrics,
            default_author,
        }
    }

    pub fn clones(&self) -> &LocalClones {
        &self.clones
    }

    /// Point the repo at `url`, creating its clone on first use, and queue
    /// the initial fetch.  An unreachable URL fails with
    /// [`GitError::Connection`] and leaves the previous status untouched.
    #[instrument(skip_all, fields(%repo_id, %url))]
    pub async fn connect_to_remote(&self, repo_id: &RepoId, url: RemoteUrl) -> Result<()> {
        self.clones.set_origin_to(repo_id, url.clone()).await?;
        self.coordinator
            .record_remote(repo_id, &url)
            .await
            .context("record remote")?;
        self.enqueue(repo_id).await?;
        info!("connected to remote");
        Ok(())
    }

    /// Queue a fetch.  Returns `false` when one was already waiting.
    pub async fn fetch_from_remote(&self, repo_id: &RepoId) -> Result<bool> {
        self.require_clone(repo_id)?;
        self.enqueue(repo_id).await
    }

    /// Queue a fetch and wait for a worker to report on it.  Returns `None`
    /// when no report arrives within `timeout`.
    pub async fn fetch_and_wait(
        &self,
        repo_id: &RepoId,
        timeout: Duration,
    ) -> Result<Option<FetchEvent>> {
        self.require_clone(repo_id)?;
        // Subscribe before enqueueing so a fast worker cannot be missed.
        let mut events = self.coordinator.subscribe().await?;
        self.enqueue(repo_id).await?;
        let event = events.wait_for(repo_id, timeout).await;
        if event.is_none() {
            warn!(%repo_id, ?timeout, "no fetch report before timeout");
        }
        Ok(event)
    }

    /// Commit `files` on top of the remote branch and push the result.
    ///
    /// The commit is staged on `refs/pending-commits/<branch>`, pushed, and
    /// the pending ref removed while the clone is held, so concurrent
    /// commits to one repo queue behind each other.  After a successful push
    /// the clone is fetched under the repo's fetch lock; if a worker holds
    /// that lock a fetch is queued instead.
    #[instrument(skip_all, fields(%repo_id, %branch, files = files.len()))]
    pub async fn commit(
        &self,
        repo_id: &RepoId,
        branch: BranchName,
        files: Vec<File>,
        author: Option<Author>,
        message: CommitMessage,
    ) -> Result<PushedCommit> {
        self.require_clone(repo_id)?;
        let pending = PushableCommitRef::pending_for_branch(branch);
        let author = author.unwrap_or_else(|| self.default_author.clone());

        let pushed = self
            .clones
            .commit_and_push(repo_id, &pending, files, author, message)
            .await?;
        info!(revision = %pushed.revision, "commit pushed");

        self.refresh(repo_id).await?;
        Ok(pushed)
    }

    /// Fetch under the repo's distributed lock and record the outcome.  A
    /// failed fetch is recorded but not returned.
    async fn refresh(&self, repo_id: &RepoId) -> Result<()> {
        let lock_key = fetch_lock_key(&self.settings.queue_name, repo_id);
        let owner = format!("{}-commit", self.settings.worker_id);
        if !acquire_fetch_lock(
            self.coordinator.as_ref(),
            &self.settings,
            &self.metrics,
            &lock_key,
            &owner,
        )
        .await?
        {
            self.enqueue(repo_id).await?;
            return Ok(());
        }

        let fetched = self.clones.fetch(repo_id).await;
        let error = fetched.as_ref().err().map(ToString::to_string);
        let recorded = self
            .coordinator
            .record_fetch(repo_id, error.as_deref())
            .await
            .context("record fetch");

        if let Err(e) = self.coordinator.unlock(&lock_key, &owner).await {
            warn!(error = %format!("{e:#}"), "failed to release fetch lock; it will expire");
        }
        if let Some(error) = error {
            warn!(%error, "fetch after push failed");
        }
        recorded
    }

    /// Files on the remote-tracking ref for `branch`.
    pub async fn files(&self, repo_id: &RepoId, branch: &BranchName) -> Result<Vec<File>> {
        self.require_clone(repo_id)?;
        Ok(self
            .clones
            .get_files(repo_id, RefName::remote_branch(branch))
            .await?)
    }

    pub async fn get_info(&self, repo_id: &RepoId) -> Result<GitRepoInfo> {
        self.require_clone(repo_id)?;
        let refs = self.clones.get_refs(repo_id).await?;
        let status = self
            .coordinator
            .repo_status(repo_id)
            .await
            .context("read repo status")?;
        Ok(GitRepoInfo {
            repo_id: repo_id.clone(),
            connection_status: status.connection_status(),
            remote_url: status.remote_url,
            branches: refs.branches(),
        })
    }

    async fn enqueue(&self, repo_id: &RepoId) -> Result<bool> {
        let added = self
            .coordinator
            .enqueue_fetch(&FetchJob::new(repo_id.clone()))
            .await
            .context("enqueue fetch")?;
        if added {
            self.metrics.metrics.jobs_enqueued.inc();
        } else {
            self.metrics.metrics.jobs_coalesced.inc();
        }
        info!(%repo_id, added, "fetch requested");
        Ok(added)
    }

    fn require_clone(&self, repo_id: &RepoId) -> Result<(), GitError> {
        if self.clones.exists(repo_id) {
            Ok(())
        } else {
            Err(GitError::NotFound(repo_id.clone()))
        }
    }
}
