//! In-process [`Coordinator`] for single-node deployments and tests.
//!
//! Mirrors the KeyDB layout: a job list, a pending set for coalescing, one
//! in-flight list per worker, expiring owner-tagged locks, and a broadcast
//! channel standing in for pub/sub.  Nothing survives the process.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::{Coordinator, FetchEvent, FetchEvents, FetchJob, RepoStatus};
use crate::model::{RemoteUrl, RepoId};

#[derive(Default)]
struct State {
    jobs: VecDeque<FetchJob>,
    pending: HashSet<RepoId>,
    processing: HashMap<String, Vec<FetchJob>>,
    locks: HashMap<String, (String, Instant)>,
    statuses: HashMap<RepoId, RepoStatus>,
}

#[derive(Clone)]
pub struct MemoryCoordinator {
    state: Arc<Mutex<State>>,
    events: broadcast::Sender<FetchEvent>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of jobs waiting to be claimed.
    pub fn queued(&self) -> usize {
        self.state().jobs.len()
    }

    /// Number of jobs claimed by `worker_id` and not yet acknowledged.
    pub fn in_flight(&self, worker_id: &str) -> usize {
        self.state()
            .processing
            .get(worker_id)
            .map_or(0, Vec::len)
    }
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn enqueue_fetch(&self, job: &FetchJob) -> Result<bool> {
        let mut state = self.state();
        if !state.pending.insert(job.repo_id.clone()) {
            debug!(repo_id = %job.repo_id, "fetch already pending");
            return Ok(false);
        }
        state.jobs.push_back(job.clone());
        Ok(true)
    }

    async fn next_job(&self, worker_id: &str) -> Result<Option<FetchJob>> {
        let mut state = self.state();
        let Some(job) = state.jobs.pop_front() else {
            return Ok(None);
        };
        state.pending.remove(&job.repo_id);
        state
            .processing
            .entry(worker_id.to_string())
            .or_default()
            .push(job.clone());
        Ok(Some(job))
    }

    async fn ack_job(&self, worker_id: &str, job: &FetchJob) -> Result<()> {
        let mut state = self.state();
        remove_in_flight(&mut state, worker_id, job);
        Ok(())
    }

    async fn requeue_job(&self, worker_id: &str, job: &FetchJob) -> Result<()> {
        let mut state = self.state();
        remove_in_flight(&mut state, worker_id, job);
        if state.pending.insert(job.repo_id.clone()) {
            state.jobs.push_back(job.clone());
        }
        Ok(())
    }

    async fn recover_jobs(&self, worker_id: &str) -> Result<usize> {
        let mut state = self.state();
        let stranded = state.processing.remove(worker_id).unwrap_or_default();
        let moved = stranded.len();
        for job in stranded.into_iter().rev() {
            state.jobs.push_front(job);
        }
        Ok(moved)
    }

    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state();
        let now = Instant::now();
        if let Some((_, expires)) = state.locks.get(key) {
            if *expires > now {
                return Ok(false);
            }
        }
        state
            .locks
            .insert(key.to_string(), (owner.to_string(), now + ttl));
        Ok(true)
    }

    async fn unlock(&self, key: &str, owner: &str) -> Result<()> {
        let mut state = self.state();
        if state.locks.get(key).is_some_and(|(held_by, _)| held_by == owner) {
            state.locks.remove(key);
        }
        Ok(())
    }

    async fn publish(&self, event: &FetchEvent) -> Result<()> {
        // No subscribers is not an error.
        let _ = self.events.send(event.clone());
        Ok(())
    }

    async fn subscribe(&self) -> Result<FetchEvents> {
        let mut events = self.events.subscribe();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = tx.closed() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(FetchEvents::new(rx))
    }

    async fn record_remote(&self, repo_id: &RepoId, url: &RemoteUrl) -> Result<()> {
        self.state()
            .statuses
            .insert(repo_id.clone(), RepoStatus::connected_to(url));
        Ok(())
    }

    async fn record_fetch(&self, repo_id: &RepoId, error: Option<&str>) -> Result<()> {
        self.state()
            .statuses
            .entry(repo_id.clone())
            .or_default()
            .apply_fetch(error, chrono::Utc::now().timestamp());
        Ok(())
    }

    async fn repo_status(&self, repo_id: &RepoId) -> Result<RepoStatus> {
        Ok(self
            .state()
            .statuses
            .get(repo_id)
            .cloned()
            .unwrap_or_default())
    }
}

fn remove_in_flight(state: &mut State, worker_id: &str, job: &FetchJob) {
    if let Some(list) = state.processing.get_mut(worker_id) {
        if let Some(pos) = list.iter().position(|j| j == job) {
            list.remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConnectionStatus;

    fn job(id: &str) -> FetchJob {
        FetchJob::new(RepoId::parse(id).unwrap())
    }

    #[tokio::test]
    async fn coalesces_waiting_jobs() {
        let c = MemoryCoordinator::new();
        assert!(c.enqueue_fetch(&job("a")).await.unwrap());
        assert!(!c.enqueue_fetch(&job("a")).await.unwrap());
        assert!(c.enqueue_fetch(&job("b")).await.unwrap());
        assert_eq!(c.queued(), 2);

        // Once claimed, a new request for the same repo queues again.
        assert_eq!(c.next_job("w").await.unwrap(), Some(job("a")));
        assert!(c.enqueue_fetch(&job("a")).await.unwrap());
        assert_eq!(c.next_job("w").await.unwrap(), Some(job("b")));
        assert_eq!(c.next_job("w").await.unwrap(), Some(job("a")));
        assert_eq!(c.next_job("w").await.unwrap(), None);
    }

    #[tokio::test]
    async fn recovers_unacknowledged_jobs_first() {
        let c = MemoryCoordinator::new();
        c.enqueue_fetch(&job("a")).await.unwrap();
        c.enqueue_fetch(&job("b")).await.unwrap();
        c.enqueue_fetch(&job("c")).await.unwrap();
        let a = c.next_job("w").await.unwrap().unwrap();
        let b = c.next_job("w").await.unwrap().unwrap();
        c.ack_job("w", &a).await.unwrap();
        assert_eq!(c.in_flight("w"), 1);

        assert_eq!(c.recover_jobs("w").await.unwrap(), 1);
        assert_eq!(c.in_flight("w"), 0);
        assert_eq!(c.next_job("w").await.unwrap(), Some(b));
        assert_eq!(c.next_job("w").await.unwrap(), Some(job("c")));
    }

    #[tokio::test]
    async fn requeue_goes_to_the_back() {
        let c = MemoryCoordinator::new();
        c.enqueue_fetch(&job("a")).await.unwrap();
        c.enqueue_fetch(&job("b")).await.unwrap();
        let a = c.next_job("w").await.unwrap().unwrap();
        c.requeue_job("w", &a).await.unwrap();
        assert_eq!(c.in_flight("w"), 0);
        assert_eq!(c.next_job("w").await.unwrap(), Some(job("b")));
        assert_eq!(c.next_job("w").await.unwrap(), Some(job("a")));
    }

    #[tokio::test]
    async fn locks_are_owned_and_expire() {
        let c = MemoryCoordinator::new();
        assert!(c.try_lock("k", "w1", Duration::from_secs(60)).await.unwrap());
        assert!(!c.try_lock("k", "w2", Duration::from_secs(60)).await.unwrap());

        c.unlock("k", "w2").await.unwrap();
        assert!(!c.try_lock("k", "w2", Duration::from_secs(60)).await.unwrap());

        c.unlock("k", "w1").await.unwrap();
        assert!(c.try_lock("k", "w2", Duration::from_millis(10)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(c.try_lock("k", "w3", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn events_reach_subscribers() {
        let c = MemoryCoordinator::new();
        let mut events = c.subscribe().await.unwrap();
        let id = RepoId::parse("r").unwrap();
        c.publish(&FetchEvent::fetched(RepoId::parse("other").unwrap()))
            .await
            .unwrap();
        c.publish(&FetchEvent::fetched(id.clone())).await.unwrap();
        let event = events.wait_for(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(event, FetchEvent::fetched(id));
    }

    #[tokio::test]
    async fn dropped_subscription_is_released() {
        let c = MemoryCoordinator::new();
        let events = c.subscribe().await.unwrap();
        assert_eq!(c.events.receiver_count(), 1);

        drop(events);
        let released = async {
            while c.events.receiver_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), released)
            .await
            .expect("forwarding task outlived its subscription");
    }

    #[tokio::test]
    async fn status_follows_remote_and_fetches() {
        let c = MemoryCoordinator::new();
        let id = RepoId::parse("r").unwrap();
        let status = c.repo_status(&id).await.unwrap();
        assert_eq!(status.connection_status(), ConnectionStatus::NotConnected);

        c.record_remote(&id, &RemoteUrl::new("file:///x")).await.unwrap();
        c.record_fetch(&id, Some("boom")).await.unwrap();
        assert_eq!(
            c.repo_status(&id).await.unwrap().connection_status(),
            ConnectionStatus::Error
        );

        // A new remote starts over.
        c.record_remote(&id, &RemoteUrl::new("file:///y")).await.unwrap();
        let status = c.repo_status(&id).await.unwrap();
        assert_eq!(status.connection_status(), ConnectionStatus::Connecting);
        assert_eq!(status.last_error, None);
    }
}
