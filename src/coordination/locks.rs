use std::time::Duration;

use anyhow::{Context, Result};
use fred::interfaces::{KeysInterface, LuaInterface};
use tracing::{debug, warn};

/// Attempt to acquire a distributed lock using SET NX EX.
///
/// Returns `true` if the lock was acquired, `false` if another worker holds
/// it.
pub async fn acquire_lock(
    pool: &fred::clients::Pool,
    key: &str,
    owner: &str,
    ttl: Duration,
) -> Result<bool> {
    let value = lock_value(owner, chrono::Utc::now().timestamp());
    let ttl_secs = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);
    let result: Option<String> = pool
        .set(
            key,
            value.as_str(),
            Some(fred::types::Expiration::EX(ttl_secs)),
            Some(fred::types::SetOptions::NX),
            false,
        )
        .await
        .context("SET NX lock")?;
    // SET … NX returns "OK" when the key was set, nil otherwise.
    let acquired = result.is_some();
    debug!(%key, %owner, acquired, "acquire_lock");
    Ok(acquired)
}

/// Release a lock only if it is still owned by `owner`.
///
/// The check-and-delete runs as one Lua script.
pub async fn release_lock(pool: &fred::clients::Pool, key: &str, owner: &str) -> Result<()> {
    let script = r#"
        local val = redis.call('GET', KEYS[1])
        if val and string.find(val, ARGV[1] .. ":", 1, true) == 1 then
            redis.call('DEL', KEYS[1])
            return 1
        end
        return 0
    "#;
    let released: i64 = pool
        .eval(script, vec![key.to_string()], vec![owner.to_string()])
        .await
        .context("lock release script failed")?;
    if released == 1 {
        debug!(%key, %owner, "lock released");
    } else {
        warn!(%key, %owner, "lock release: key missing or owned by another worker");
    }
    Ok(())
}

fn lock_value(owner: &str, timestamp: i64) -> String {
    format!("{owner}:{timestamp}")
}
