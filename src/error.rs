//! Error taxonomy for operations against local clones.
//!
//! Handlers classify raw `git` failures into one of these variants before
//! handing them back to the registry, so callers can tell a rejected push
//! from an unreachable remote without parsing stderr themselves.

use std::time::Duration;

use crate::model::RepoId;

/// Failure of an operation against a local clone.
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    /// `git` exited non-zero or produced output we could not interpret.
    #[error("git {command} failed ({status}): {stderr}")]
    ExternalTool {
        command: String,
        status: String,
        stderr: String,
    },

    /// The remote could not be reached, refused our credentials, or the URL
    /// is malformed.
    #[error("cannot connect to remote {url}: {detail}")]
    Connection { url: String, detail: String },

    /// The remote refused the pushed ref (non-fast-forward or policy).
    #[error("push of {local} to {remote} was rejected: {detail}")]
    PushRejected {
        local: String,
        remote: String,
        detail: String,
    },

    /// No clone exists for this repository and creation was not requested.
    #[error("no local clone for repository {0}")]
    NotFound(RepoId),

    /// `git` did not finish within the configured command timeout.
    #[error("git {command} timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    /// An operation was built with missing or invalid parameters.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl GitError {
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    pub fn is_push_rejected(&self) -> bool {
        matches!(self, Self::PushRejected { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// The stderr captured from `git`, if this error came from the tool.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::ExternalTool { stderr, .. } => Some(stderr),
            _ => None,
        }
    }

    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type GitResult<T> = std::result::Result<T, GitError>;
