//! Durable fetch queue in KeyDB.
//!
//! Layout under the queue prefix:
//!
//! * `{prefix}:jobs`: waiting jobs, pushed on the left, claimed from the right.
//! * `{prefix}:pending`: set of repo ids with a waiting job, used to fold
//!   duplicate requests into one job.
//! * `{prefix}:processing:{worker_id}`: jobs claimed by one worker and not yet
//!   acknowledged.  A worker that restarts under the same id moves these back
//!   onto `jobs`, so every job is delivered at least once.
//!
//! Each step is a Lua script so the list and set stay consistent.

use anyhow::{Context, Result};
use fred::clients::Pool;
use fred::interfaces::LuaInterface;
use tracing::{debug, info};

use super::FetchJob;

/// KEYS: jobs, pending.  ARGV: repo id, payload.
const ENQUEUE_SCRIPT: &str = r#"
    if redis.call('SADD', KEYS[2], ARGV[1]) == 1 then
        redis.call('LPUSH', KEYS[1], ARGV[2])
        return 1
    end
    return 0
"#;

/// KEYS: jobs, pending, processing.
const CLAIM_SCRIPT: &str = r#"
    local job = redis.call('LMOVE', KEYS[1], KEYS[3], 'RIGHT', 'LEFT')
    if job then
        local ok, decoded = pcall(cjson.decode, job)
        if ok and decoded.repoId then
            redis.call('SREM', KEYS[2], decoded.repoId)
        end
    end
    return job
"#;

/// KEYS: jobs, pending, processing.  ARGV: repo id, payload.
const REQUEUE_SCRIPT: &str = r#"
    redis.call('LREM', KEYS[3], 1, ARGV[2])
    if redis.call('SADD', KEYS[2], ARGV[1]) == 1 then
        redis.call('LPUSH', KEYS[1], ARGV[2])
    end
    return 1
"#;

/// KEYS: processing, jobs.
const RECOVER_SCRIPT: &str = r#"
    local moved = 0
    while true do
        local job = redis.call('LMOVE', KEYS[1], KEYS[2], 'LEFT', 'RIGHT')
        if not job then
            break
        end
        moved = moved + 1
    end
    return moved
"#;

/// KEYS: processing.  ARGV: payload.
const ACK_SCRIPT: &str = r#"
    return redis.call('LREM', KEYS[1], 1, ARGV[1])
"#;

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) struct QueueKeys {
    pub jobs: String,
    pub pending: String,
    prefix: String,
}

impl QueueKeys {
    pub fn new(prefix: &str) -> Self {
        Self {
            jobs: format!("{prefix}:jobs"),
            pending: format!("{prefix}:pending"),
            prefix: prefix.to_string(),
        }
    }

    pub fn processing(&self, worker_id: &str) -> String {
        format!("{}:processing:{worker_id}", self.prefix)
    }
}

pub(crate) fn encode_job(job: &FetchJob) -> Result<String> {
    serde_json::to_string(job).context("encode fetch job")
}

pub(crate) fn decode_job(payload: &str) -> Result<FetchJob> {
    serde_json::from_str(payload).with_context(|| format!("malformed fetch job: {payload}"))
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub async fn enqueue(pool: &Pool, keys: &QueueKeys, job: &FetchJob) -> Result<bool> {
    let payload = encode_job(job)?;
    let added: i64 = pool
        .eval(
            ENQUEUE_SCRIPT,
            vec![keys.jobs.clone(), keys.pending.clone()],
            vec![job.repo_id.to_string(), payload],
        )
        .await
        .context("enqueue script failed")?;
    debug!(repo_id = %job.repo_id, added = added == 1, "enqueue fetch job");
    Ok(added == 1)
}

/// Claim the next job.  A payload that does not parse is acknowledged and
/// reported as an error so it cannot wedge the queue.
pub async fn claim(pool: &Pool, keys: &QueueKeys, worker_id: &str) -> Result<Option<FetchJob>> {
    let processing = keys.processing(worker_id);
    let payload: Option<String> = pool
        .eval(
            CLAIM_SCRIPT,
            vec![keys.jobs.clone(), keys.pending.clone(), processing.clone()],
            Vec::<String>::new(),
        )
        .await
        .context("claim script failed")?;
    let Some(payload) = payload else {
        return Ok(None);
    };
    match decode_job(&payload) {
        Ok(job) => Ok(Some(job)),
        Err(e) => {
            let _: i64 = pool
                .eval(ACK_SCRIPT, vec![processing], vec![payload])
                .await
                .context("discard malformed job")?;
            Err(e)
        }
    }
}

pub async fn ack(pool: &Pool, keys: &QueueKeys, worker_id: &str, job: &FetchJob) -> Result<()> {
    let removed: i64 = pool
        .eval(
            ACK_SCRIPT,
            vec![keys.processing(worker_id)],
            vec![encode_job(job)?],
        )
        .await
        .context("ack script failed")?;
    debug!(repo_id = %job.repo_id, %worker_id, removed, "ack fetch job");
    Ok(())
}

pub async fn requeue(pool: &Pool, keys: &QueueKeys, worker_id: &str, job: &FetchJob) -> Result<()> {
    let _: i64 = pool
        .eval(
            REQUEUE_SCRIPT,
            vec![
                keys.jobs.clone(),
                keys.pending.clone(),
                keys.processing(worker_id),
            ],
            vec![job.repo_id.to_string(), encode_job(job)?],
        )
        .await
        .context("requeue script failed")?;
    debug!(repo_id = %job.repo_id, %worker_id, "requeued fetch job");
    Ok(())
}

pub async fn recover(pool: &Pool, keys: &QueueKeys, worker_id: &str) -> Result<usize> {
    let moved: i64 = pool
        .eval(
            RECOVER_SCRIPT,
            vec![keys.processing(worker_id), keys.jobs.clone()],
            Vec::<String>::new(),
        )
        .await
        .context("recover script failed")?;
    if moved > 0 {
        info!(%worker_id, moved, "recovered in-flight fetch jobs");
    }
    Ok(usize::try_from(moved).unwrap_or(0))
}
