//! Keeps local clones of remote git repositories in sync.
//!
//! Every clone lives under one storage root, keyed by [`model::RepoId`].
//! [`clones::LocalClones`] runs one operation at a time per clone, the
//! [`worker::Worker`] performs queued fetches under a lock shared by all
//! workers, and [`service::RepoService`] ties both to the shared status
//! record.

pub mod clones;
pub mod config;
pub mod coordination;
pub mod error;
pub mod git;
pub mod metrics;
pub mod model;
pub mod service;
pub mod worker;

pub use error::{GitError, GitResult};
