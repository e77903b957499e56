//! Background fetch worker.
//!
//! Claims fetch jobs from the shared queue and runs them against the local
//! clones.  Fetches of one repo are serialised across every worker by a
//! distributed lock; a job whose lock stays busy past the wait timeout goes
//! back to the queue instead of blocking the worker.  A failed fetch marks
//! the repo as errored and the worker carries on with the next job.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::clones::LocalClones;
use crate::config::QueueConfig;
use crate::coordination::{fetch_lock_key, node, Coordinator, FetchEvent, FetchJob};
use crate::metrics::{JobOutcomeLabel, MetricsRegistry};

/// What happened to a claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Fetched,
    Failed,
    /// The repo's fetch lock stayed held; the job is back on the queue.
    Requeued,
}

impl From<JobOutcome> for JobOutcomeLabel {
    fn from(outcome: JobOutcome) -> Self {
        match outcome {
            JobOutcome::Fetched => Self::Fetched,
            JobOutcome::Failed => Self::Failed,
            JobOutcome::Requeued => Self::Requeued,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub worker_id: String,
    pub queue_name: String,
    pub lock_ttl: Duration,
    pub lock_wait_timeout: Duration,
    pub poll_interval: Duration,
}

impl WorkerSettings {
    pub fn from_config(queue: &QueueConfig) -> Self {
        Self {
            worker_id: node::worker_id(queue.worker_id.as_deref()),
            queue_name: queue.name.clone(),
            lock_ttl: queue.lock_ttl(),
            lock_wait_timeout: queue.lock_wait_timeout(),
            poll_interval: queue.poll_interval(),
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct Worker {
    clones: LocalClones,
    coordinator: Arc<dyn Coordinator>,
    settings: WorkerSettings,
    metrics: MetricsRegistry,
}

impl Worker {
    pub fn new(
        clones: LocalClones,
        coordinator: Arc<dyn Coordinator>,
        settings: WorkerSettings,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            clones,
            coordinator,
            settings,
            metrics,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.settings.worker_id
    }

    /// Process jobs until `shutdown` turns `true`.  A job in progress when
    /// the signal arrives is finished first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let worker_id = self.worker_id();
        info!(%worker_id, queue = %self.settings.queue_name, "fetch worker starting");
        self.recover().await?;

        while !*shutdown.borrow() {
            let idle = match self.coordinator.next_job(worker_id).await {
                Ok(Some(job)) => {
                    self.handle(job).await;
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    error!(error = %format!("{e:#}"), "failed to claim fetch job");
                    true
                }
            };
            if idle {
                tokio::select! {
                    () = tokio::time::sleep(self.settings.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        info!(%worker_id, "fetch worker stopped");
        Ok(())
    }

    /// Process every job currently waiting, then return how many were
    /// handled.  Used where no long-running worker exists.
    pub async fn drain(&self) -> Result<usize> {
        self.recover().await?;
        let mut handled = 0;
        while let Some(job) = self.coordinator.next_job(self.worker_id()).await? {
            match self.handle(job).await {
                Some(JobOutcome::Requeued) => {
                    // Another worker holds the repo; leave the job for it.
                    break;
                }
                Some(_) => handled += 1,
                None => {
                    warn!(handled, "stopping drain after a coordination failure");
                    break;
                }
            }
        }
        Ok(handled)
    }

    /// Move jobs this worker had claimed before a restart back to the queue.
    pub async fn recover(&self) -> Result<usize> {
        let recovered = self.coordinator.recover_jobs(self.worker_id()).await?;
        if recovered > 0 {
            self.metrics
                .metrics
                .jobs_recovered
                .inc_by(u64::try_from(recovered).unwrap_or(u64::MAX));
            info!(worker_id = %self.worker_id(), recovered, "re-queued unfinished fetch jobs");
        }
        Ok(recovered)
    }

    /// Run one claimed job.  Coordination failures are logged and the job
    /// is handed back to the queue.
    async fn handle(&self, job: FetchJob) -> Option<JobOutcome> {
        match self.process(&job).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(repo_id = %job.repo_id, error = %format!("{e:#}"), "fetch job aborted");
                if let Err(e) = self.coordinator.requeue_job(self.worker_id(), &job).await {
                    error!(repo_id = %job.repo_id, error = %format!("{e:#}"), "failed to requeue fetch job");
                }
                None
            }
        }
    }

    /// Fetch one repo under its distributed lock, record the outcome,
    /// publish the event, and acknowledge the job.
    #[instrument(skip(self), fields(repo_id = %job.repo_id, worker_id = %self.settings.worker_id))]
    pub async fn process(&self, job: &FetchJob) -> Result<JobOutcome> {
        let worker_id = self.worker_id();
        let lock_key = fetch_lock_key(&self.settings.queue_name, &job.repo_id);

        if !self.acquire(&lock_key).await? {
            self.coordinator.requeue_job(worker_id, job).await?;
            self.metrics.metrics.record_job(JobOutcome::Requeued.into());
            info!("fetch lock busy, job requeued");
            return Ok(JobOutcome::Requeued);
        }

        let outcome = self.fetch_and_report(job).await;

        if let Err(e) = self.coordinator.unlock(&lock_key, worker_id).await {
            warn!(error = %format!("{e:#}"), "failed to release fetch lock; it will expire");
        }

        let outcome = outcome?;
        self.coordinator.ack_job(worker_id, job).await?;
        self.metrics.metrics.record_job(outcome.into());
        Ok(outcome)
    }

    async fn fetch_and_report(&self, job: &FetchJob) -> Result<JobOutcome> {
        let repo_id = &job.repo_id;
        match self.clones.fetch(repo_id).await {
            Ok(()) => {
                self.coordinator.record_fetch(repo_id, None).await?;
                self.coordinator
                    .publish(&FetchEvent::fetched(repo_id.clone()))
                    .await?;
                info!("repo fetched");
                Ok(JobOutcome::Fetched)
            }
            Err(e) => {
                let detail = e.to_string();
                error!(error = %detail, "fetch failed");
                self.coordinator
                    .record_fetch(repo_id, Some(&detail))
                    .await?;
                self.coordinator
                    .publish(&FetchEvent::failed(repo_id.clone(), detail))
                    .await?;
                Ok(JobOutcome::Failed)
            }
        }
    }

    async fn acquire(&self, lock_key: &str) -> Result<bool> {
        acquire_fetch_lock(
            self.coordinator.as_ref(),
            &self.settings,
            &self.metrics,
            lock_key,
            self.worker_id(),
        )
        .await
    }
}

/// Try for `lock_key` as `owner` until `lock_wait_timeout` passes.
pub(crate) async fn acquire_fetch_lock(
    coordinator: &dyn Coordinator,
    settings: &WorkerSettings,
    metrics: &MetricsRegistry,
    lock_key: &str,
    owner: &str,
) -> Result<bool> {
    let deadline = tokio::time::Instant::now() + settings.lock_wait_timeout;
    let mut waited = false;
    loop {
        if coordinator
            .try_lock(lock_key, owner, settings.lock_ttl)
            .await?
        {
            metrics.metrics.lock_acquisitions.inc();
            debug!(%lock_key, %owner, waited, "fetch lock acquired");
            return Ok(true);
        }
        if !waited {
            metrics.metrics.lock_waits.inc();
            waited = true;
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            metrics.metrics.lock_timeouts.inc();
            warn!(%lock_key, timeout = ?settings.lock_wait_timeout, "timed out waiting for fetch lock");
            return Ok(false);
        }
        tokio::time::sleep(settings.poll_interval.min(remaining)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::coordination::{FetchEvents, FetchOutcome, MemoryCoordinator, RepoStatus};
    use crate::git::{Commit, RepoFactory};
    use crate::model::{ConnectionStatus, File, RefName, RemoteUrl, RepoId};

    struct Fixture {
        tmp: tempfile::TempDir,
        origin_url: RemoteUrl,
        origin_path: std::path::PathBuf,
        clones: LocalClones,
        coordinator: MemoryCoordinator,
        metrics: MetricsRegistry,
    }

    async fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let origin_path = tmp.path().join("origin.git");
        let origin = RepoFactory::bare().open(&origin_path).await.unwrap();
        origin
            .send(
                Commit::builder()
                    .with_file(File::new("README", "hello"))
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();

        let metrics = MetricsRegistry::new();
        let clones = LocalClones::new(tmp.path().join("clones"), RepoFactory::bare(), metrics.clone());
        Fixture {
            origin_url: RemoteUrl::new(origin_path.display().to_string()),
            origin_path,
            tmp,
            clones,
            coordinator: MemoryCoordinator::new(),
            metrics,
        }
    }

    fn settings(worker_id: &str) -> WorkerSettings {
        WorkerSettings {
            worker_id: worker_id.to_string(),
            queue_name: "test".to_string(),
            lock_ttl: Duration::from_secs(60),
            lock_wait_timeout: Duration::from_millis(100),
            poll_interval: Duration::from_millis(10),
        }
    }

    fn worker(f: &Fixture, worker_id: &str) -> Worker {
        Worker::new(
            f.clones.clone(),
            Arc::new(f.coordinator.clone()),
            settings(worker_id),
            f.metrics.clone(),
        )
    }

    async fn connected(f: &Fixture, id: &str) -> RepoId {
        let repo_id = RepoId::parse(id).unwrap();
        f.clones
            .set_origin_to(&repo_id, f.origin_url.clone())
            .await
            .unwrap();
        f.coordinator
            .record_remote(&repo_id, &f.origin_url)
            .await
            .unwrap();
        repo_id
    }

    #[tokio::test]
    async fn fetch_job_updates_refs_status_and_events() {
        let f = fixture().await;
        let repo_id = connected(&f, "r1").await;
        let mut events = f.coordinator.subscribe().await.unwrap();

        f.coordinator
            .enqueue_fetch(&FetchJob::new(repo_id.clone()))
            .await
            .unwrap();
        assert_eq!(worker(&f, "w").drain().await.unwrap(), 1);

        let refs = f.clones.get_refs(&repo_id).await.unwrap();
        assert!(refs
            .find(&RefName::parse("refs/remotes/origin/main").unwrap())
            .is_some());
        let status = f.coordinator.repo_status(&repo_id).await.unwrap();
        assert_eq!(status.connection_status(), ConnectionStatus::Connected);

        let event = events.wait_for(&repo_id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(event.outcome, FetchOutcome::Fetched);
        assert_eq!(f.coordinator.in_flight("w"), 0);
    }

    #[tokio::test]
    async fn failed_fetch_marks_error_and_worker_continues() {
        let f = fixture().await;
        let broken = connected(&f, "broken").await;
        let healthy = connected(&f, "healthy").await;
        std::fs::remove_dir_all(&f.origin_path).unwrap();

        // The healthy repo moves to a fresh, empty remote.
        let second = f.tmp.path().join("second.git");
        RepoFactory::bare().open(&second).await.unwrap();
        let second_url = RemoteUrl::new(second.display().to_string());
        f.clones.set_origin_to(&healthy, second_url.clone()).await.unwrap();
        f.coordinator.record_remote(&healthy, &second_url).await.unwrap();

        f.coordinator.enqueue_fetch(&FetchJob::new(broken.clone())).await.unwrap();
        f.coordinator.enqueue_fetch(&FetchJob::new(healthy.clone())).await.unwrap();

        let w = worker(&f, "w");
        assert_eq!(w.drain().await.unwrap(), 2);

        let status = f.coordinator.repo_status(&broken).await.unwrap();
        assert_eq!(status.connection_status(), ConnectionStatus::Error);
        assert!(status.last_error.is_some());
        let status = f.coordinator.repo_status(&healthy).await.unwrap();
        assert_eq!(status.connection_status(), ConnectionStatus::Connected);
        assert!(f.metrics.render().contains("outcome=\"Failed\""));
    }

    #[tokio::test]
    async fn busy_lock_requeues_the_job() {
        let f = fixture().await;
        let repo_id = connected(&f, "r1").await;
        let key = fetch_lock_key("test", &repo_id);
        assert!(f
            .coordinator
            .try_lock(&key, "someone-else", Duration::from_secs(60))
            .await
            .unwrap());

        let job = FetchJob::new(repo_id.clone());
        f.coordinator.enqueue_fetch(&job).await.unwrap();
        let claimed = f.coordinator.next_job("w").await.unwrap().unwrap();

        let outcome = worker(&f, "w").process(&claimed).await.unwrap();
        assert_eq!(outcome, JobOutcome::Requeued);
        assert_eq!(f.coordinator.queued(), 1);
        assert_eq!(f.coordinator.in_flight("w"), 0);
        let status = f.coordinator.repo_status(&repo_id).await.unwrap();
        assert_eq!(status.connection_status(), ConnectionStatus::Connecting);

        // Once released, the job runs.
        f.coordinator.unlock(&key, "someone-else").await.unwrap();
        assert_eq!(worker(&f, "w").drain().await.unwrap(), 1);
        let status = f.coordinator.repo_status(&repo_id).await.unwrap();
        assert_eq!(status.connection_status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn restarted_worker_finishes_stranded_jobs() {
        let f = fixture().await;
        let repo_id = connected(&f, "r1").await;
        f.coordinator
            .enqueue_fetch(&FetchJob::new(repo_id.clone()))
            .await
            .unwrap();
        // Claimed by a worker that then died before acknowledging.
        f.coordinator.next_job("w").await.unwrap().unwrap();
        assert_eq!(f.coordinator.queued(), 0);

        let mut events = f.coordinator.subscribe().await.unwrap();
        let (stop, shutdown) = watch::channel(false);
        let w = worker(&f, "w");
        let run = tokio::spawn(async move { w.run(shutdown).await });

        let event = events.wait_for(&repo_id, Duration::from_secs(10)).await.unwrap();
        assert_eq!(event.outcome, FetchOutcome::Fetched);

        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(f.coordinator.in_flight("w"), 0);
    }

    #[tokio::test]
    async fn concurrent_workers_never_fetch_one_repo_at_once() {
        let f = fixture().await;
        let repo_id = connected(&f, "r1").await;
        let tracking = Arc::new(Tracking::over(&f.coordinator));
        let (stop, shutdown) = watch::channel(false);

        // Separate clone pools, as two processes sharing a storage root have.
        let mut runs = Vec::new();
        for worker_id in ["w1", "w2"] {
            let clones = LocalClones::new(f.clones.root(), RepoFactory::bare(), f.metrics.clone());
            let w = Worker::new(clones, tracking.clone(), settings(worker_id), f.metrics.clone());
            let shutdown = shutdown.clone();
            runs.push(tokio::spawn(async move { w.run(shutdown).await }));
        }

        for _ in 0..20 {
            f.coordinator
                .enqueue_fetch(&FetchJob::new(repo_id.clone()))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let idle = async {
            while f.coordinator.queued() > 0
                || f.coordinator.in_flight("w1") > 0
                || f.coordinator.in_flight("w2") > 0
            {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(30), idle)
            .await
            .expect("queue did not drain");

        stop.send(true).unwrap();
        for run in runs {
            tokio::time::timeout(Duration::from_secs(10), run)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
        }

        assert!(tracking.fetches.load(Ordering::SeqCst) >= 1);
        assert_eq!(tracking.unlocked_fetches.load(Ordering::SeqCst), 0);
        assert_eq!(tracking.max_holders.load(Ordering::SeqCst), 1);
        assert_eq!(tracking.holders.load(Ordering::SeqCst), 0);
        let status = f.coordinator.repo_status(&repo_id).await.unwrap();
        assert_eq!(status.connection_status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn drain_stops_when_coordination_fails() {
        let f = fixture().await;
        let repo_id = connected(&f, "r1").await;
        let tracking = Arc::new(Tracking {
            fail_locks: true,
            ..Tracking::over(&f.coordinator)
        });
        f.coordinator
            .enqueue_fetch(&FetchJob::new(repo_id))
            .await
            .unwrap();

        let w = Worker::new(f.clones.clone(), tracking, settings("w"), f.metrics.clone());
        let drained = tokio::time::timeout(Duration::from_secs(5), w.drain())
            .await
            .expect("drain kept reclaiming the failed job")
            .unwrap();
        assert_eq!(drained, 0);
        assert_eq!(f.coordinator.queued(), 1);
        assert_eq!(f.coordinator.in_flight("w"), 0);
    }

    /// Wraps a [`MemoryCoordinator`], counting fetch lock holders and
    /// fetch outcomes recorded while no lock was held.
    #[derive(Default)]
    struct Tracking {
        inner: MemoryCoordinator,
        fail_locks: bool,
        holders: AtomicUsize,
        max_holders: AtomicUsize,
        fetches: AtomicUsize,
        unlocked_fetches: AtomicUsize,
    }

    impl Tracking {
        fn over(inner: &MemoryCoordinator) -> Self {
            Self {
                inner: inner.clone(),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl Coordinator for Tracking {
        async fn enqueue_fetch(&self, job: &FetchJob) -> Result<bool> {
            self.inner.enqueue_fetch(job).await
        }

        async fn next_job(&self, worker_id: &str) -> Result<Option<FetchJob>> {
            self.inner.next_job(worker_id).await
        }

        async fn ack_job(&self, worker_id: &str, job: &FetchJob) -> Result<()> {
            self.inner.ack_job(worker_id, job).await
        }

        async fn requeue_job(&self, worker_id: &str, job: &FetchJob) -> Result<()> {
            self.inner.requeue_job(worker_id, job).await
        }

        async fn recover_jobs(&self, worker_id: &str) -> Result<usize> {
            self.inner.recover_jobs(worker_id).await
        }

        async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
            anyhow::ensure!(!self.fail_locks, "lock backend unavailable");
            let acquired = self.inner.try_lock(key, owner, ttl).await?;
            if acquired {
                let now = self.holders.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_holders.fetch_max(now, Ordering::SeqCst);
            }
            Ok(acquired)
        }

        async fn unlock(&self, key: &str, owner: &str) -> Result<()> {
            self.holders.fetch_sub(1, Ordering::SeqCst);
            self.inner.unlock(key, owner).await
        }

        async fn publish(&self, event: &FetchEvent) -> Result<()> {
            self.inner.publish(event).await
        }

        async fn subscribe(&self) -> Result<FetchEvents> {
            self.inner.subscribe().await
        }

        async fn record_remote(&self, repo_id: &RepoId, url: &RemoteUrl) -> Result<()> {
            self.inner.record_remote(repo_id, url).await
        }

        async fn record_fetch(&self, repo_id: &RepoId, error: Option<&str>) -> Result<()> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.holders.load(Ordering::SeqCst) == 0 {
                self.unlocked_fetches.fetch_add(1, Ordering::SeqCst);
            }
            self.inner.record_fetch(repo_id, error).await
        }

        async fn repo_status(&self, repo_id: &RepoId) -> Result<RepoStatus> {
            self.inner.repo_status(repo_id).await
        }
    }
}
