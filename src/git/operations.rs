//! The closed set of operations that can be sent to a [`Repo`](super::Repo).
//!
//! Each operation is plain data: building one never touches the disk.  The
//! [`Request`] trait ties every operation type to the shape of its reply so
//! `Repo::send` hands back a typed result.

use crate::error::{GitError, GitResult};
use crate::model::{
    Author, BranchName, CommitMessage, CommitRef, File, PushableCommitRef, RefName, Refs,
    RemoteUrl,
};

/// Every operation the handlers know how to execute.
#[derive(Debug, Clone)]
pub enum Operation {
    Init(Init),
    Commit(Commit),
    SetOrigin(SetOrigin),
    Fetch(Fetch),
    Push(Push),
    GetRefs(GetRefs),
    GetRevision(GetRevision),
    GetFiles(GetFiles),
    DeleteRef(DeleteRef),
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init(_) => "init",
            Self::Commit(_) => "commit",
            Self::SetOrigin(_) => "set_origin",
            Self::Fetch(_) => "fetch",
            Self::Push(_) => "push",
            Self::GetRefs(_) => "get_refs",
            Self::GetRevision(_) => "get_revision",
            Self::GetFiles(_) => "get_files",
            Self::DeleteRef(_) => "delete_ref",
        }
    }
}

/// Untyped handler result.
#[derive(Debug, Clone)]
pub enum Reply {
    Done,
    Refs(Refs),
    Revision(String),
    Files(Vec<File>),
}

/// An operation with a known reply type.
pub trait Request: Into<Operation> {
    type Output;

    fn output(reply: Reply) -> GitResult<Self::Output>;
}

fn unexpected(expected: &str, reply: Reply) -> GitError {
    GitError::InvalidOperation(format!("expected {expected} reply, got {reply:?}"))
}

macro_rules! request {
    ($op:ident, (), Done) => {
        impl From<$op> for Operation {
            fn from(op: $op) -> Self {
                Operation::$op(op)
            }
        }

        impl Request for $op {
            type Output = ();

            fn output(reply: Reply) -> GitResult<()> {
                match reply {
                    Reply::Done => Ok(()),
                    other => Err(unexpected("empty", other)),
                }
            }
        }
    };
    ($op:ident, $out:ty, $variant:ident) => {
        impl From<$op> for Operation {
            fn from(op: $op) -> Self {
                Operation::$op(op)
            }
        }

        impl Request for $op {
            type Output = $out;

            fn output(reply: Reply) -> GitResult<$out> {
                match reply {
                    Reply::$variant(value) => Ok(value),
                    other => Err(unexpected(stringify!($variant), other)),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Init
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Init {
    pub bare: bool,
}

impl Init {
    pub fn bare_repo() -> Self {
        Self { bare: true }
    }

    pub fn non_bare_repo() -> Self {
        Self { bare: false }
    }
}

request!(Init, (), Done);

// ---------------------------------------------------------------------------
// Commit
// ---------------------------------------------------------------------------

/// Write `files` on top of the tree at `ref_name` (or at the remote-tracking
/// ref for `branch` when `ref_name` does not exist yet) and move `ref_name`
/// to the new commit.
#[derive(Debug, Clone)]
pub struct Commit {
    ref_name: RefName,
    branch: BranchName,
    files: Vec<File>,
    author: Author,
    message: CommitMessage,
}

impl Commit {
    pub fn builder() -> CommitBuilder {
        CommitBuilder::default()
    }

    pub fn to_ref_name(ref_name: RefName) -> CommitBuilder {
        Self::builder().to_ref_name(ref_name)
    }

    pub fn to_commit_ref(commit_ref: impl Into<CommitRef>) -> CommitBuilder {
        let commit_ref = commit_ref.into();
        Self::builder()
            .to_ref_name(commit_ref.local)
            .on_branch(commit_ref.branch)
    }

    pub fn ref_name(&self) -> &RefName {
        &self.ref_name
    }

    pub fn branch(&self) -> &BranchName {
        &self.branch
    }

    pub fn files(&self) -> &[File] {
        &self.files
    }

    pub fn author(&self) -> &Author {
        &self.author
    }

    pub fn message(&self) -> &CommitMessage {
        &self.message
    }
}

/// Collects the parameters of a [`Commit`].
///
/// Without a ref the commit goes to `refs/heads/main`.  The branch is
/// derived from the ref when the ref lives under a branch namespace.
#[derive(Debug, Clone, Default)]
pub struct CommitBuilder {
    ref_name: Option<RefName>,
    branch: Option<BranchName>,
    files: Vec<File>,
    author: Option<Author>,
    message: Option<CommitMessage>,
}

impl CommitBuilder {
    pub fn to_ref_name(mut self, ref_name: RefName) -> Self {
        self.ref_name = Some(ref_name);
        self
    }

    pub fn on_branch(mut self, branch: BranchName) -> Self {
        self.branch = Some(branch);
        self
    }

    pub fn with_files(mut self, files: impl IntoIterator<Item = File>) -> Self {
        self.files.extend(files);
        self
    }

    pub fn with_file(mut self, file: File) -> Self {
        self.files.push(file);
        self
    }

    pub fn by_author(mut self, author: Author) -> Self {
        self.author = Some(author);
        self
    }

    pub fn with_message(mut self, message: CommitMessage) -> Self {
        self.message = Some(message);
        self
    }

    pub fn build(self) -> GitResult<Commit> {
        let (ref_name, branch) = match (self.ref_name, self.branch) {
            (Some(r), Some(b)) => (r, b),
            (Some(r), None) => {
                let derived = r.branch_name().ok_or_else(|| {
                    GitError::InvalidOperation(format!(
                        "commit to {r} needs an explicit branch"
                    ))
                })?;
                let b = BranchName::parse(derived)?;
                (r, b)
            }
            (None, Some(b)) => (RefName::local_branch(&b), b),
            (None, None) => {
                let b = BranchName::parse("main")?;
                (RefName::local_branch(&b), b)
            }
        };

        for file in &self.files {
            validate_file_path(&file.path)?;
        }

        Ok(Commit {
            ref_name,
            branch,
            files: self.files,
            author: self.author.unwrap_or_default(),
            message: self.message.unwrap_or_default(),
        })
    }
}

fn validate_file_path(path: &str) -> GitResult<()> {
    let bad = path.is_empty()
        || path.starts_with('/')
        || path.ends_with('/')
        || path.contains(['\0', '\n'])
        || path
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == ".." || part == ".git");
    if bad {
        return Err(GitError::InvalidOperation(format!(
            "invalid file path {path:?}"
        )));
    }
    Ok(())
}

request!(Commit, (), Done);

// ---------------------------------------------------------------------------
// SetOrigin (connect)
// ---------------------------------------------------------------------------

/// Point `origin` at `url` after checking the remote answers.
#[derive(Debug, Clone)]
pub struct SetOrigin {
    pub url: RemoteUrl,
}

impl SetOrigin {
    pub fn to_url(url: RemoteUrl) -> Self {
        Self { url }
    }
}

request!(SetOrigin, (), Done);

// ---------------------------------------------------------------------------
// Fetch / Push
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct Fetch;

impl Fetch {
    pub fn from_origin() -> Self {
        Self
    }
}

request!(Fetch, (), Done);

#[derive(Debug, Clone)]
pub struct Push {
    pub local: RefName,
    pub remote: RefName,
}

impl Push {
    pub fn pending_commit_from(commit_ref: &PushableCommitRef) -> Self {
        Self {
            local: commit_ref.local.clone(),
            remote: commit_ref.remote.clone(),
        }
    }
}

request!(Push, (), Done);

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Every local and remote-tracking branch ref in the clone.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetRefs;

impl GetRefs {
    pub fn all() -> Self {
        Self
    }
}

request!(GetRefs, Refs, Refs);

#[derive(Debug, Clone)]
pub struct GetRevision {
    pub ref_name: RefName,
}

impl GetRevision {
    pub fn for_branch_named(branch: &BranchName) -> Self {
        Self {
            ref_name: RefName::local_branch(branch),
        }
    }

    pub fn for_ref(ref_name: RefName) -> Self {
        Self { ref_name }
    }
}

request!(GetRevision, String, Revision);

#[derive(Debug, Clone)]
pub struct GetFiles {
    pub ref_name: RefName,
}

impl GetFiles {
    pub fn for_branch_named(branch: &BranchName) -> Self {
        Self {
            ref_name: RefName::local_branch(branch),
        }
    }

    pub fn for_ref(ref_name: RefName) -> Self {
        Self { ref_name }
    }
}

request!(GetFiles, Vec<File>, Files);

/// Remove a ref. Deleting a ref that does not exist is a no-op.
#[derive(Debug, Clone)]
pub struct DeleteRef {
    pub ref_name: RefName,
}

impl DeleteRef {
    pub fn named(ref_name: RefName) -> Self {
        Self { ref_name }
    }
}

request!(DeleteRef, (), Done);

#[cfg(test)]
mod tests {
    use super::*;

    fn branch(name: &str) -> BranchName {
        BranchName::parse(name).unwrap()
    }

    #[test]
    fn commit_defaults_to_main() {
        let commit = Commit::builder().build().unwrap();
        assert_eq!(commit.ref_name().as_str(), "refs/heads/main");
        assert_eq!(commit.branch().as_str(), "main");
        assert_eq!(commit.author(), &Author::default());
    }

    #[test]
    fn commit_derives_branch_from_ref() {
        let commit = Commit::to_ref_name(RefName::parse("refs/remotes/origin/topic").unwrap())
            .build()
            .unwrap();
        assert_eq!(commit.branch().as_str(), "topic");
    }

    #[test]
    fn commit_to_unknown_namespace_needs_a_branch() {
        let target = RefName::parse("refs/scratch/x").unwrap();
        assert!(Commit::to_ref_name(target.clone()).build().is_err());
        let commit = Commit::to_ref_name(target)
            .on_branch(branch("x"))
            .build()
            .unwrap();
        assert_eq!(commit.branch().as_str(), "x");
    }

    #[test]
    fn commit_to_pending_ref() {
        let pending = PushableCommitRef::pending_for_branch(branch("feature"));
        let commit = Commit::to_commit_ref(pending)
            .with_file(File::new("a.txt", "x"))
            .with_message(CommitMessage::new("msg"))
            .build()
            .unwrap();
        assert_eq!(commit.ref_name().as_str(), "refs/pending-commits/feature");
        assert_eq!(commit.files().len(), 1);
        assert_eq!(commit.message().as_str(), "msg");
    }

    #[test]
    fn commit_rejects_escaping_paths() {
        for bad in ["", "/abs", "../up", "a//b", "dir/", ".git/config"] {
            let result = Commit::builder().with_file(File::new(bad, "x")).build();
            assert!(result.is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn typed_replies() {
        assert!(<GetRefs as Request>::output(Reply::Refs(Refs::default())).is_ok());
        assert_eq!(
            <GetRevision as Request>::output(Reply::Revision("abc".into())).unwrap(),
            "abc"
        );
        assert!(<Fetch as Request>::output(Reply::Revision("abc".into())).is_err());
    }

    #[test]
    fn operation_names() {
        let op: Operation = Fetch::from_origin().into();
        assert_eq!(op.name(), "fetch");
        let op: Operation = GetRefs::all().into();
        assert_eq!(op.name(), "get_refs");
    }
}
