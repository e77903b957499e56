//! KeyDB / Redis client pool creation and the KeyDB-backed coordinator.
//!
//! Builds a [`fred::clients::Pool`] for the instance described in
//! [`crate::config::KeyDbConfig`], optionally enabling TLS via `rustls` and
//! reading the auth token from an environment variable.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fred::clients::Pool;
use fred::interfaces::ClientLike;
use fred::types::config::{ReconnectPolicy, ServerConfig, TlsConnector};
use fred::types::Builder;

use super::queue::QueueKeys;
use super::{locks, pubsub, queue, registry};
use super::{Coordinator, FetchEvent, FetchEvents, FetchJob, RepoStatus};
use crate::config::KeyDbConfig;
use crate::model::{RemoteUrl, RepoId};

const POOL_SIZE: usize = 4;

/// Create a connected and PING-verified KeyDB pool.
pub async fn create_keydb_pool(config: &KeyDbConfig) -> Result<Pool> {
    let auth_token = std::env::var(&config.auth_token_env).ok();

    let endpoint = config
        .endpoint
        .trim_start_matches("rediss://")
        .trim_start_matches("redis://");
    let (host, port) = parse_host_port(endpoint)?;

    let mut fred_config = fred::types::config::Config {
        server: ServerConfig::new_centralized(host, port),
        ..fred::types::config::Config::default()
    };
    if config.tls {
        fred_config.tls = Some(TlsConnector::default_rustls()?.into());
    }
    fred_config.password = auth_token;

    let mut builder = Builder::from_config(fred_config);
    builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));

    let pool = builder
        .build_pool(POOL_SIZE)
        .context("failed to build KeyDB connection pool")?;
    pool.init().await.context("failed to connect to KeyDB")?;

    let _: String = pool
        .ping(None)
        .await
        .context("KeyDB PING failed after connect")?;

    tracing::info!(
        host,
        port,
        tls = config.tls,
        pool_size = POOL_SIZE,
        "KeyDB pool created and verified"
    );
    Ok(pool)
}

/// Parse a `host:port` string.  If the port is omitted, defaults to `6379`.
pub fn parse_host_port(endpoint: &str) -> Result<(&str, u16)> {
    let endpoint = endpoint.split('/').next().unwrap_or(endpoint);

    match endpoint.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid port in endpoint: {endpoint}"))?;
            Ok((host, port))
        }
        None => Ok((endpoint, 6379)),
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// [`Coordinator`] shared by every worker pointed at the same KeyDB and
/// queue name.
#[derive(Clone)]
pub struct KeyDbCoordinator {
    pool: Pool,
    prefix: String,
    keys: QueueKeys,
}

impl KeyDbCoordinator {
    pub fn new(pool: Pool, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            keys: QueueKeys::new(&prefix),
            pool,
            prefix,
        }
    }

    pub async fn connect(config: &KeyDbConfig, prefix: impl Into<String>) -> Result<Self> {
        let pool = create_keydb_pool(config).await?;
        Ok(Self::new(pool, prefix))
    }
}

#[async_trait]
impl Coordinator for KeyDbCoordinator {
    async fn enqueue_fetch(&self, job: &FetchJob) -> Result<bool> {
        queue::enqueue(&self.pool, &self.keys, job).await
    }

    async fn next_job(&self, worker_id: &str) -> Result<Option<FetchJob>> {
        queue::claim(&self.pool, &self.keys, worker_id).await
    }

    async fn ack_job(&self, worker_id: &str, job: &FetchJob) -> Result<()> {
        queue::ack(&self.pool, &self.keys, worker_id, job).await
    }

    async fn requeue_job(&self, worker_id: &str, job: &FetchJob) -> Result<()> {
        queue::requeue(&self.pool, &self.keys, worker_id, job).await
    }

    async fn recover_jobs(&self, worker_id: &str) -> Result<usize> {
        queue::recover(&self.pool, &self.keys, worker_id).await
    }

    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        locks::acquire_lock(&self.pool, key, owner, ttl).await
    }

    async fn unlock(&self, key: &str, owner: &str) -> Result<()> {
        locks::release_lock(&self.pool, key, owner).await
    }

    async fn publish(&self, event: &FetchEvent) -> Result<()> {
        pubsub::publish_event(&self.pool, &self.prefix, event).await
    }

    async fn subscribe(&self) -> Result<FetchEvents> {
        pubsub::subscribe_events(&self.pool, &self.prefix).await
    }

    async fn record_remote(&self, repo_id: &RepoId, url: &RemoteUrl) -> Result<()> {
        registry::set_remote(&self.pool, &self.prefix, repo_id, url).await
    }

    async fn record_fetch(&self, repo_id: &RepoId, error: Option<&str>) -> Result<()> {
        registry::set_fetch_outcome(&self.pool, &self.prefix, repo_id, error).await
    }

    async fn repo_status(&self, repo_id: &RepoId) -> Result<RepoStatus> {
        registry::get_status(&self.pool, &self.prefix, repo_id).await
    }
}
