//! Cross-process coordination for the fetch worker.
//!
//! Provides the durable fetch queue, the per-repo distributed fetch lock,
//! repo-fetched notifications, and the shared per-repo status record.  The
//! KeyDB (Redis-compatible) backend lets several worker processes cooperate;
//! the in-process backend serves single-node deployments and tests.

pub mod locks;
pub mod memory;
pub mod node;
pub mod pubsub;
pub mod queue;
pub mod redis;
pub mod registry;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::model::{RemoteUrl, RepoId};

pub use memory::MemoryCoordinator;
pub use redis::KeyDbCoordinator;
pub use registry::RepoStatus;

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Queue job payload.  Everything else the worker needs is derived from the
/// repo id plus process configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchJob {
    pub repo_id: RepoId,
}

impl FetchJob {
    pub fn new(repo_id: RepoId) -> Self {
        Self { repo_id }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchOutcome {
    Fetched,
    Failed,
}

/// Published after every fetch attempt the worker completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchEvent {
    pub repo_id: RepoId,
    pub outcome: FetchOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FetchEvent {
    pub fn fetched(repo_id: RepoId) -> Self {
        Self {
            repo_id,
            outcome: FetchOutcome::Fetched,
            error: None,
        }
    }

    pub fn failed(repo_id: RepoId, error: impl Into<String>) -> Self {
        Self {
            repo_id,
            outcome: FetchOutcome::Failed,
            error: Some(error.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Event subscription
// ---------------------------------------------------------------------------

/// A live subscription to fetch events.  Dropping it closes the channel,
/// which ends the backend's forwarding task and releases its subscription.
pub struct FetchEvents {
    rx: mpsc::Receiver<FetchEvent>,
}

impl FetchEvents {
    pub(crate) fn new(rx: mpsc::Receiver<FetchEvent>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<FetchEvent> {
        self.rx.recv().await
    }

    /// Wait for the next event about `repo_id`.  Returns `None` on timeout
    /// or when the subscription closes.
    pub async fn wait_for(&mut self, repo_id: &RepoId, timeout: Duration) -> Option<FetchEvent> {
        let wait = async {
            while let Some(event) = self.rx.recv().await {
                if &event.repo_id == repo_id {
                    return Some(event);
                }
            }
            None
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Everything the worker and the service need from the shared backend.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Add a fetch job.  Returns `false` when a job for the same repo is
    /// already waiting, in which case the request is folded into it.
    async fn enqueue_fetch(&self, job: &FetchJob) -> Result<bool>;

    /// Claim the oldest waiting job for `worker_id`, moving it onto that
    /// worker's in-flight list.
    async fn next_job(&self, worker_id: &str) -> Result<Option<FetchJob>>;

    /// Drop a finished job from the worker's in-flight list.
    async fn ack_job(&self, worker_id: &str, job: &FetchJob) -> Result<()>;

    /// Move an in-flight job back to the tail of the queue.
    async fn requeue_job(&self, worker_id: &str, job: &FetchJob) -> Result<()>;

    /// Return jobs left in-flight by an earlier run of `worker_id` to the
    /// head of the queue.
    async fn recover_jobs(&self, worker_id: &str) -> Result<usize>;

    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    async fn unlock(&self, key: &str, owner: &str) -> Result<()>;

    async fn publish(&self, event: &FetchEvent) -> Result<()>;

    async fn subscribe(&self) -> Result<FetchEvents>;

    /// Remember the origin of a repo.  Resets the fetch history, so the repo
    /// reads as connecting until the next fetch completes.
    async fn record_remote(&self, repo_id: &RepoId, url: &RemoteUrl) -> Result<()>;

    /// Record the outcome of a fetch attempt.
    async fn record_fetch(&self, repo_id: &RepoId, error: Option<&str>) -> Result<()>;

    async fn repo_status(&self, repo_id: &RepoId) -> Result<RepoStatus>;
}

/// Lock key guarding fetches of `repo_id` under queue `prefix`.
pub fn fetch_lock_key(prefix: &str, repo_id: &RepoId) -> String {
    format!("{prefix}:lock:fetch:{repo_id}")
}
