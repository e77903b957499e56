//! Local git repositories: the directory handle that shells out to `git`,
//! the operation set, the handlers that execute it, and the factory that
//! opens repositories on disk.
//!
//! All operations run the `git` binary through `tokio::process::Command`,
//! never an in-process object model.

pub mod directory;
pub mod factory;
pub mod handlers;
pub mod operations;

pub use directory::{ExecOptions, ExecOutput, GitDirectory};
pub use factory::{Repo, RepoFactory, RepoKind};
pub use operations::{
    Commit, CommitBuilder, DeleteRef, Fetch, GetFiles, GetRefs, GetRevision, Init, Operation,
    Push, Reply, Request, SetOrigin,
};
