//! Value types shared by the git layer, the clone registry and the worker.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{GitError, GitResult};

pub const LOCAL_BRANCH_PREFIX: &str = "refs/heads/";
pub const REMOTE_BRANCH_PREFIX: &str = "refs/remotes/origin/";
pub const PENDING_COMMIT_PREFIX: &str = "refs/pending-commits/";

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Stable identifier of a mirrored repository.
///
/// Also used verbatim as the name of the clone's directory under the storage
/// root, so it is restricted to characters that are safe in a single path
/// component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepoId(String);

impl RepoId {
    pub fn parse(value: impl Into<String>) -> GitResult<Self> {
        let value = value.into();
        let valid_chars = value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if value.is_empty() || value == "." || value == ".." || !valid_chars {
            return Err(GitError::InvalidOperation(format!(
                "invalid repo id {value:?}: use letters, digits, '-', '_' or '.'"
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RepoId {
    type Error = GitError;

    fn try_from(value: String) -> GitResult<Self> {
        Self::parse(value)
    }
}

impl From<RepoId> for String {
    fn from(id: RepoId) -> Self {
        id.0
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Location of the origin remote. Only validated by trying to use it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteUrl(String);

impl RemoteUrl {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A branch name as the user sees it (`main`, `feature/x`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BranchName(String);

impl BranchName {
    pub fn parse(value: impl Into<String>) -> GitResult<Self> {
        let value = value.into();
        let bad = value.is_empty()
            || value.starts_with('-')
            || value.starts_with('/')
            || value.ends_with('/')
            || value.ends_with(".lock")
            || value.contains("..")
            || value.contains("@{")
            || value
                .chars()
                .any(|c| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(c));
        if bad {
            return Err(GitError::InvalidOperation(format!(
                "invalid branch name {value:?}"
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for BranchName {
    type Error = GitError;

    fn try_from(value: String) -> GitResult<Self> {
        Self::parse(value)
    }
}

impl From<BranchName> for String {
    fn from(name: BranchName) -> Self {
        name.0
    }
}

impl fmt::Display for BranchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Refs
// ---------------------------------------------------------------------------

/// A fully qualified ref name (`refs/...`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefName(String);

impl RefName {
    pub fn parse(value: impl Into<String>) -> GitResult<Self> {
        let value = value.into();
        if !value.starts_with("refs/") || value.len() <= "refs/".len() {
            return Err(GitError::InvalidOperation(format!(
                "ref name {value:?} must start with refs/"
            )));
        }
        Ok(Self(value))
    }

    pub fn local_branch(branch: &BranchName) -> Self {
        Self(format!("{LOCAL_BRANCH_PREFIX}{branch}"))
    }

    pub fn remote_branch(branch: &BranchName) -> Self {
        Self(format!("{REMOTE_BRANCH_PREFIX}{branch}"))
    }

    pub fn pending_commit(branch: &BranchName) -> Self {
        Self(format!("{PENDING_COMMIT_PREFIX}{branch}"))
    }

    /// The branch this ref stands for, if it lives under one of the known
    /// branch namespaces.
    pub fn branch_name(&self) -> Option<&str> {
        [LOCAL_BRANCH_PREFIX, REMOTE_BRANCH_PREFIX, PENDING_COMMIT_PREFIX]
            .iter()
            .find_map(|prefix| self.0.strip_prefix(prefix))
    }

    pub fn is_remote(&self) -> bool {
        self.0.starts_with(REMOTE_BRANCH_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RefName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A ref and the revision it points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ref {
    pub name: RefName,
    pub revision: String,
}

impl Ref {
    pub fn new(name: RefName, revision: impl Into<String>) -> Self {
        Self {
            name,
            revision: revision.into(),
        }
    }

    pub fn branch_name(&self) -> Option<&str> {
        self.name.branch_name()
    }

    pub fn is_remote(&self) -> bool {
        self.name.is_remote()
    }
}

/// Snapshot of the branch refs in a clone, ordered by ref name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Refs(Vec<Ref>);

impl Refs {
    pub fn new(mut refs: Vec<Ref>) -> Self {
        refs.sort_by(|a, b| a.name.cmp(&b.name));
        Self(refs)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Ref> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn find(&self, name: &RefName) -> Option<&Ref> {
        self.0.iter().find(|r| &r.name == name)
    }

    /// The remote-tracking state of `branch`, if it has been fetched.
    pub fn fetched(&self, branch: &BranchName) -> Option<FetchedCommitRef> {
        self.find(&RefName::remote_branch(branch))
            .map(|r| FetchedCommitRef::new(branch.clone(), r.revision.clone()))
    }

    /// Collapse the refs into one entry per branch. The remote-tracking ref
    /// wins over a local branch of the same name since it reflects origin.
    pub fn branches(&self) -> Vec<Branch> {
        let mut by_name: BTreeMap<&str, &Ref> = BTreeMap::new();
        for r in &self.0 {
            let Some(name) = r.branch_name() else {
                continue;
            };
            match by_name.get(name) {
                Some(existing) if existing.is_remote() => {}
                _ => {
                    by_name.insert(name, r);
                }
            }
        }
        by_name
            .into_iter()
            .map(|(name, r)| Branch {
                name: name.to_string(),
                revision: r.revision.clone(),
            })
            .collect()
    }
}

impl IntoIterator for Refs {
    type Item = Ref;
    type IntoIter = std::vec::IntoIter<Ref>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

// ---------------------------------------------------------------------------
// Commit refs
// ---------------------------------------------------------------------------

/// The ref a commit is written to, and the branch it represents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRef {
    pub branch: BranchName,
    pub local: RefName,
}

impl CommitRef {
    pub fn for_branch(branch: BranchName) -> Self {
        let local = RefName::local_branch(&branch);
        Self { branch, local }
    }
}

/// A branch as last fetched from origin: its remote-tracking ref and the
/// revision that ref pointed at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchedCommitRef {
    pub branch: BranchName,
    pub revision: String,
}

impl FetchedCommitRef {
    pub fn new(branch: BranchName, revision: impl Into<String>) -> Self {
        Self {
            branch,
            revision: revision.into(),
        }
    }

    pub fn remote_ref(&self) -> RefName {
        RefName::remote_branch(&self.branch)
    }
}

/// A local ref holding a commit that is about to be pushed to `remote`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushableCommitRef {
    pub branch: BranchName,
    pub local: RefName,
    pub remote: RefName,
}

impl PushableCommitRef {
    /// Stage under `refs/pending-commits/<branch>`, push to
    /// `refs/heads/<branch>` on origin.
    pub fn pending_for_branch(branch: BranchName) -> Self {
        Self {
            local: RefName::pending_commit(&branch),
            remote: RefName::local_branch(&branch),
            branch,
        }
    }
}

impl From<PushableCommitRef> for CommitRef {
    fn from(r: PushableCommitRef) -> Self {
        Self {
            branch: r.branch,
            local: r.local,
        }
    }
}

/// A commit that reached origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushedCommit {
    pub branch: BranchName,
    pub revision: String,
    /// The fetched tip the commit was built on; `None` for a branch that
    /// did not exist on origin yet.
    pub base: Option<FetchedCommitRef>,
}

// ---------------------------------------------------------------------------
// Commit payload
// ---------------------------------------------------------------------------

/// A file to add or replace in a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub path: String,
    pub content: String,
}

impl File {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    pub email: String,
}

impl Author {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

impl Default for Author {
    fn default() -> Self {
        Self::new("Clonekeeper", "clonekeeper@localhost")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitMessage(String);

impl CommitMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CommitMessage {
    fn default() -> Self {
        Self::new("Commit")
    }
}

// ---------------------------------------------------------------------------
// Query projection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionStatus {
    /// No origin has been set.
    NotConnected,
    /// An origin is set but no fetch has completed yet.
    Connecting,
    /// The last fetch succeeded.
    Connected,
    /// The last fetch failed.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    pub revision: String,
}

/// What consumers see of a mirrored repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitRepoInfo {
    pub repo_id: RepoId,
    pub remote_url: Option<String>,
    pub connection_status: ConnectionStatus,
    pub branches: Vec<Branch>,
}
