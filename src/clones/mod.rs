//! The pool of local clones, one per [`RepoId`](crate::model::RepoId).
//!
//! [`LocalClones`] owns the mapping from repository id to on-disk clone and
//! the per-repository slot that serialises operations against it.

pub mod registry;

pub use registry::LocalClones;
