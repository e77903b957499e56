use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::model::Author;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub git: GitConfig,
    /// Shared coordination backend.  When absent the process runs in
    /// single-node mode with in-process queue, locks and events.
    #[serde(default)]
    pub keydb: Option<KeyDbConfig>,
    #[serde(default)]
    pub queue: QueueConfig,
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one clone per repo id.
    pub root: PathBuf,
    /// Create bare clones (server-side mirrors).
    #[serde(default = "bool_true")]
    pub bare: bool,
}

// ---------------------------------------------------------------------------
// Git
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_git_binary")]
    pub binary: String,
    /// Seconds a single `git` invocation may run before it is killed.
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,
    /// Attributed to commits whose caller did not name an author.
    #[serde(default)]
    pub default_author: Author,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            binary: default_git_binary(),
            command_timeout: default_command_timeout(),
            default_author: Author::default(),
        }
    }
}

fn default_git_binary() -> String {
    "git".to_string()
}

fn default_command_timeout() -> u64 {
    300
}

// ---------------------------------------------------------------------------
// KeyDB / Redis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct KeyDbConfig {
    /// Connection string (e.g. `rediss://keydb.local:6380`).
    pub endpoint: String,
    /// Enable TLS for the KeyDB connection.
    #[serde(default = "bool_true")]
    pub tls: bool,
    /// Name of the environment variable that holds the KeyDB auth token.
    #[serde(default = "default_keydb_auth_env")]
    pub auth_token_env: String,
}

fn bool_true() -> bool {
    true
}

fn default_keydb_auth_env() -> String {
    "KEYDB_AUTH_TOKEN".to_string()
}

// ---------------------------------------------------------------------------
// Fetch queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Key prefix for every queue, lock, status and event key.
    #[serde(default = "default_queue_name")]
    pub name: String,
    /// TTL (seconds) of the distributed per-repo fetch lock.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl: u64,
    /// How long (seconds) a worker waits for a held fetch lock before
    /// putting the job back on the queue.
    #[serde(default = "default_lock_wait_timeout")]
    pub lock_wait_timeout: u64,
    /// Idle poll interval for the queue and for lock waits.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Stable identity of this worker.  Must survive restarts so in-flight
    /// jobs can be recovered.
    #[serde(default)]
    pub worker_id: Option<String>,
}

impl QueueConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl)
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_wait_timeout)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            lock_ttl: default_lock_ttl(),
            lock_wait_timeout: default_lock_wait_timeout(),
            poll_interval_ms: default_poll_interval_ms(),
            worker_id: None,
        }
    }
}

fn default_queue_name() -> String {
    "clonekeeper".to_string()
}

fn default_lock_ttl() -> u64 {
    600
}

fn default_lock_wait_timeout() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    1000
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents)
        .with_context(|| format!("invalid config file: {}", path.display()))
}

/// Parse and validate a YAML document.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents).context("failed to parse config")?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.storage.root.as_os_str().is_empty(),
        "storage.root must not be empty"
    );
    anyhow::ensure!(!config.queue.name.is_empty(), "queue.name must not be empty");
    anyhow::ensure!(
        config.queue.lock_ttl > config.git.command_timeout,
        "queue.lock_ttl must be greater than git.command_timeout"
    );
    anyhow::ensure!(
        config.queue.poll_interval_ms > 0,
        "queue.poll_interval_ms must be positive"
    );
    Ok(())
}
