//! Per-repository serialisation over the on-disk clones.
//!
//! Clones live at `{root}/{repo_id}`.  Each repo id owns one slot: an async
//! mutex that holds the opened [`Repo`].  Every operation takes the slot for
//! its repo for its whole duration, so operations on one clone run one at a
//! time in the order they were submitted, while different repos never wait
//! on each other.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{GitError, GitResult};
use crate::git::{
    Commit, DeleteRef, Fetch, GetFiles, GetRefs, GetRevision, Operation, Push, Repo, RepoFactory,
    RepoKind, Request, SetOrigin,
};
use crate::metrics::MetricsRegistry;
use crate::model::{
    Author, CommitMessage, CommitRef, FetchedCommitRef, File, PushableCommitRef, PushedCommit,
    RefName, Refs, RemoteUrl, RepoId,
};

type Slot = Arc<tokio::sync::Mutex<Option<Repo>>>;

// ---------------------------------------------------------------------------
// LocalClones
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct LocalClones {
    root: PathBuf,
    factory: RepoFactory,
    slots: Arc<Mutex<HashMap<RepoId, Slot>>>,
    metrics: MetricsRegistry,
}

impl LocalClones {
    pub fn new(root: impl Into<PathBuf>, factory: RepoFactory, metrics: MetricsRegistry) -> Self {
        Self {
            root: root.into(),
            factory,
            slots: Arc::new(Mutex::new(HashMap::new())),
            metrics,
        }
    }

    /// Build the pool described by the `storage` and `git` config sections.
    pub fn from_config(config: &Config, metrics: MetricsRegistry) -> Self {
        let kind = if config.storage.bare {
            RepoKind::Bare
        } else {
            RepoKind::NonBare
        };
        let factory = RepoFactory::new(kind)
            .with_binary(config.git.binary.clone())
            .with_timeout(Duration::from_secs(config.git.command_timeout));
        Self::new(&config.storage.root, factory, metrics)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the clone for `repo_id`.
    pub fn path_for(&self, repo_id: &RepoId) -> PathBuf {
        self.root.join(repo_id.as_str())
    }

    /// Whether a clone has been created for `repo_id`, by this process or an
    /// earlier one.
    pub fn exists(&self, repo_id: &RepoId) -> bool {
        self.factory.exists(&self.path_for(repo_id))
    }

    // -- commands -----------------------------------------------------------

    pub async fn commit(
        &self,
        repo_id: &RepoId,
        commit_ref: impl Into<CommitRef>,
        files: Vec<File>,
        author: Author,
        message: CommitMessage,
    ) -> GitResult<()> {
        let op = Commit::to_commit_ref(commit_ref)
            .with_files(files)
            .by_author(author)
            .with_message(message)
            .build()?;
        self.send(repo_id, op).await
    }

    /// Commit `files` to the pending ref, push it, and remove the pending
    /// ref, all under one hold of the repo's slot.
    ///
    /// A pending ref left behind by an earlier failure is cleared first, so
    /// the commit always builds on the remote-tracking tip, which is
    /// reported as the base.
    pub async fn commit_and_push(
        &self,
        repo_id: &RepoId,
        pending: &PushableCommitRef,
        files: Vec<File>,
        author: Author,
        message: CommitMessage,
    ) -> GitResult<PushedCommit> {
        let op = Commit::to_commit_ref(pending.clone())
            .with_files(files)
            .by_author(author)
            .with_message(message)
            .build()?;

        let slot = self.slot(repo_id);
        let mut guard = slot.lock().await;

        self.run(repo_id, &mut guard, DeleteRef::named(pending.local.clone()))
            .await?;
        let base = self
            .run(repo_id, &mut guard, GetRefs::all())
            .await?
            .fetched(&pending.branch);
        self.run(repo_id, &mut guard, op).await?;

        let pushed = async {
            let revision = self
                .run(repo_id, &mut guard, GetRevision::for_ref(pending.local.clone()))
                .await?;
            self.run(repo_id, &mut guard, Push::pending_commit_from(pending))
                .await?;
            Ok::<_, GitError>(revision)
        }
        .await;

        // A leftover pending ref would become the parent of the next commit.
        if let Err(e) = self
            .run(repo_id, &mut guard, DeleteRef::named(pending.local.clone()))
            .await
        {
            warn!(%repo_id, error = %e, "failed to delete pending ref");
        }

        Ok(PushedCommit {
            branch: pending.branch.clone(),
            revision: pushed?,
            base,
        })
    }

    pub async fn push(&self, repo_id: &RepoId, commit_ref: &PushableCommitRef) -> GitResult<()> {
        self.send(repo_id, Push::pending_commit_from(commit_ref)).await
    }

    pub async fn set_origin_to(&self, repo_id: &RepoId, remote_url: RemoteUrl) -> GitResult<()> {
        self.send(repo_id, SetOrigin::to_url(remote_url)).await
    }

    pub async fn fetch(&self, repo_id: &RepoId) -> GitResult<()> {
        self.send(repo_id, Fetch::from_origin()).await
    }

    pub async fn delete_ref(&self, repo_id: &RepoId, ref_name: RefName) -> GitResult<()> {
        self.send(repo_id, DeleteRef::named(ref_name)).await
    }

    // -- queries ------------------------------------------------------------

    pub async fn get_refs(&self, repo_id: &RepoId) -> GitResult<Refs> {
        self.send(repo_id, GetRefs::all()).await
    }

    pub async fn get_revision(&self, repo_id: &RepoId, ref_name: RefName) -> GitResult<String> {
        self.send(repo_id, GetRevision::for_ref(ref_name)).await
    }

    pub async fn get_files(&self, repo_id: &RepoId, ref_name: RefName) -> GitResult<Vec<File>> {
        self.send(repo_id, GetFiles::for_ref(ref_name)).await
    }

    // -- internals ----------------------------------------------------------

    fn slot(&self, repo_id: &RepoId) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(slots.entry(repo_id.clone()).or_default())
    }

    /// Run `request` against the clone for `repo_id`, creating the clone
    /// first if needed. The slot is released when this returns, whatever
    /// the outcome.
    async fn send<R: Request>(&self, repo_id: &RepoId, request: R) -> GitResult<R::Output> {
        let slot = self.slot(repo_id);
        let mut guard = slot.lock().await;
        self.run(repo_id, &mut guard, request).await
    }

    /// Dispatch one request while the caller holds the slot.
    async fn run<R: Request>(
        &self,
        repo_id: &RepoId,
        opened: &mut Option<Repo>,
        request: R,
    ) -> GitResult<R::Output> {
        let operation: Operation = request.into();
        let name = operation.name();
        let started = Instant::now();

        let result = async {
            let repo = match opened.as_ref() {
                Some(repo) => repo.clone(),
                None => {
                    let repo = self.factory.open(&self.path_for(repo_id)).await?;
                    self.metrics.metrics.open_clones.inc();
                    *opened = Some(repo.clone());
                    repo
                }
            };
            repo.dispatch(operation).await
        }
        .await;

        let elapsed = started.elapsed().as_secs_f64();
        self.metrics
            .metrics
            .record_operation(name, result.is_ok(), elapsed);

        match &result {
            Ok(_) => debug!(%repo_id, operation = name, elapsed, "operation complete"),
            Err(e) => warn!(%repo_id, operation = name, error = %e, "operation failed"),
        }

        R::output(result?)
    }
}

impl std::fmt::Debug for LocalClones {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalClones")
            .field("root", &self.root)
            .field("kind", &self.factory.kind())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BranchName;

    fn clones(root: &Path) -> LocalClones {
        LocalClones::new(root, RepoFactory::bare(), MetricsRegistry::new())
    }

    fn id(s: &str) -> RepoId {
        RepoId::parse(s).unwrap()
    }

    fn main_ref() -> CommitRef {
        CommitRef::for_branch(BranchName::parse("main").unwrap())
    }

    #[tokio::test]
    async fn creates_clone_lazily_under_root() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = clones(tmp.path());
        let repo_id = id("repo-1");
        assert!(!pool.exists(&repo_id));
        assert!(pool.get_refs(&repo_id).await.unwrap().is_empty());
        assert!(pool.exists(&repo_id));
        assert_eq!(pool.path_for(&repo_id), tmp.path().join("repo-1"));
    }

    #[tokio::test]
    async fn concurrent_commits_on_one_branch_stay_linear() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = clones(tmp.path());
        let repo_id = id("busy");

        let mut handles = Vec::new();
        for n in 0..8 {
            let pool = pool.clone();
            let repo_id = repo_id.clone();
            handles.push(tokio::spawn(async move {
                pool.commit(
                    &repo_id,
                    main_ref(),
                    vec![File::new(format!("file-{n}"), "x")],
                    Author::default(),
                    CommitMessage::new(format!("commit {n}")),
                )
                .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let repo = RepoFactory::bare().open(&pool.path_for(&repo_id)).await.unwrap();
        let count = repo
            .directory()
            .read("rev-list", &["--count", "refs/heads/main"])
            .await
            .unwrap();
        assert_eq!(count.trim(), "8");
        let tree = repo
            .directory()
            .read("ls-tree", &["-r", "--name-only", "refs/heads/main"])
            .await
            .unwrap();
        assert_eq!(tree.lines().count(), 8);
    }

    #[tokio::test]
    async fn held_slot_blocks_only_its_own_repo() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = clones(tmp.path());
        let a = id("a");
        let b = id("b");

        let slot = pool.slot(&a);
        let guard = slot.lock().await;

        let other = tokio::time::timeout(Duration::from_secs(10), pool.get_refs(&b)).await;
        assert!(other.is_ok(), "repo b should not wait on repo a");

        let same = tokio::time::timeout(Duration::from_millis(200), pool.get_refs(&a)).await;
        assert!(same.is_err(), "repo a should wait for its slot");

        drop(guard);
        assert!(pool.get_refs(&a).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failure_releases_the_slot() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = clones(tmp.path());
        let repo_id = id("no-origin");

        let err = pool.fetch(&repo_id).await.unwrap_err();
        assert!(err.is_connection());

        let refs = tokio::time::timeout(Duration::from_secs(10), pool.get_refs(&repo_id))
            .await
            .expect("slot was not released");
        assert!(refs.unwrap().is_empty());
    }

    #[tokio::test]
    async fn connect_to_unreachable_url_leaves_refs() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = clones(tmp.path());
        let repo_id = id("r");
        pool.commit(
            &repo_id,
            main_ref(),
            vec![],
            Author::default(),
            CommitMessage::default(),
        )
        .await
        .unwrap();
        let before = pool.get_refs(&repo_id).await.unwrap();

        let err = pool
            .set_origin_to(&repo_id, RemoteUrl::new(tmp.path().join("missing").display().to_string()))
            .await
            .unwrap_err();
        assert!(err.is_connection(), "unexpected error: {err}");
        assert_eq!(pool.get_refs(&repo_id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn ref_listings_never_see_half_a_fetch() {
        let tmp = tempfile::tempdir().unwrap();
        let origin_path = tmp.path().join("origin.git");
        let origin = RepoFactory::bare().open(&origin_path).await.unwrap();
        let branches = [BranchName::parse("a").unwrap(), BranchName::parse("b").unwrap()];

        // Every round moves both branches; a listing must show one round.
        let advance = |round: usize| {
            let origin = origin.clone();
            let branches = branches.clone();
            async move {
                let mut tips = Vec::new();
                for branch in &branches {
                    let op = Commit::to_commit_ref(CommitRef::for_branch(branch.clone()))
                        .with_file(File::new("round", round.to_string()))
                        .build()
                        .unwrap();
                    origin.send(op).await.unwrap();
                    tips.push(
                        origin
                            .send(GetRevision::for_branch_named(branch))
                            .await
                            .unwrap(),
                    );
                }
                tips
            }
        };

        let pool = clones(&tmp.path().join("clones"));
        let repo_id = id("mirror");
        let mut rounds = vec![advance(0).await];
        pool.set_origin_to(&repo_id, RemoteUrl::new(origin_path.display().to_string()))
            .await
            .unwrap();
        pool.fetch(&repo_id).await.unwrap();

        for round in 1..6 {
            rounds.push(advance(round).await);
            let mut tasks = Vec::new();
            {
                let pool = pool.clone();
                let repo_id = repo_id.clone();
                tasks.push(tokio::spawn(async move {
                    pool.fetch(&repo_id).await.unwrap();
                    None
                }));
            }
            for _ in 0..4 {
                let pool = pool.clone();
                let repo_id = repo_id.clone();
                tasks.push(tokio::spawn(async move {
                    Some(pool.get_refs(&repo_id).await.unwrap())
                }));
            }

            for task in tasks {
                let Some(refs) = task.await.unwrap() else {
                    continue;
                };
                let seen: Vec<String> = branches
                    .iter()
                    .map(|b| refs.fetched(b).unwrap().revision)
                    .collect();
                assert!(
                    rounds[round - 1..=round].contains(&seen),
                    "round {round}: listing mixes rounds: {seen:?}"
                );
            }
        }
    }

    #[tokio::test]
    async fn records_operation_metrics() {
        let tmp = tempfile::tempdir().unwrap();
        let metrics = MetricsRegistry::new();
        let pool = LocalClones::new(tmp.path(), RepoFactory::bare(), metrics.clone());
        pool.get_refs(&id("m")).await.unwrap();
        let _ = pool.fetch(&id("m")).await;
        let text = metrics.render();
        assert!(text.contains("operation=\"get_refs\""));
        assert!(text.contains("operation=\"fetch\""));
    }
}
