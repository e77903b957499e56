//! Opens repositories on disk and wires them to the operation handlers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, instrument};

use super::directory::GitDirectory;
use super::handlers;
use super::operations::{Init, Operation, Reply, Request};
use crate::error::{GitError, GitResult};

/// Whether clones are created with a working tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoKind {
    Bare,
    NonBare,
}

/// Creates [`Repo`] endpoints for paths, initialising the repository first
/// when needed.
#[derive(Debug, Clone)]
pub struct RepoFactory {
    kind: RepoKind,
    binary: String,
    timeout: Option<Duration>,
}

impl RepoFactory {
    pub fn new(kind: RepoKind) -> Self {
        Self {
            kind,
            binary: "git".to_string(),
            timeout: None,
        }
    }

    pub fn bare() -> Self {
        Self::new(RepoKind::Bare)
    }

    pub fn non_bare() -> Self {
        Self::new(RepoKind::NonBare)
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn kind(&self) -> RepoKind {
        self.kind
    }

    /// Whether `path` already holds a repository of this factory's kind.
    pub fn exists(&self, path: &Path) -> bool {
        let head = match self.kind {
            RepoKind::Bare => path.join("HEAD"),
            RepoKind::NonBare => path.join(".git").join("HEAD"),
        };
        path.is_dir() && head.is_file()
    }

    /// Make sure `path` exists and holds a repository, then return an
    /// endpoint for it.
    #[instrument(skip(self), fields(path = %path.display(), kind = ?self.kind))]
    pub async fn open(&self, path: &Path) -> GitResult<Repo> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| GitError::io(path.display().to_string(), e))?;

        let mut dir = GitDirectory::new(path).with_binary(self.binary.clone());
        if let Some(timeout) = self.timeout {
            dir = dir.with_timeout(timeout);
        }

        let repo = Repo { dir };
        let init = match self.kind {
            RepoKind::Bare => Init::bare_repo(),
            RepoKind::NonBare => Init::non_bare_repo(),
        };
        repo.send(init).await?;

        debug!("repo opened");
        Ok(repo)
    }
}

/// A repository that accepts operations.
#[derive(Debug, Clone)]
pub struct Repo {
    dir: GitDirectory,
}

impl Repo {
    pub async fn send<R: Request>(&self, request: R) -> GitResult<R::Output> {
        let reply = self.dispatch(request.into()).await?;
        R::output(reply)
    }

    /// Run an untyped operation.
    pub async fn dispatch(&self, operation: Operation) -> GitResult<Reply> {
        handlers::dispatch(&self.dir, operation).await
    }

    pub fn directory(&self) -> &GitDirectory {
        &self.dir
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }
}
