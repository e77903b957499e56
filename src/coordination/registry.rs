use std::collections::HashMap;

use anyhow::{Context, Result};
use fred::interfaces::HashesInterface;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::model::{ConnectionStatus, RemoteUrl, RepoId};

/// Shared record of a repo's origin and fetch history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoStatus {
    pub remote_url: Option<String>,
    /// Unix timestamp of the last completed fetch attempt, 0 if none.
    pub last_fetch_ts: i64,
    /// Outcome of the last fetch attempt; `None` until one completes.
    pub last_fetch_ok: Option<bool>,
    pub last_error: Option<String>,
}

impl RepoStatus {
    pub fn connection_status(&self) -> ConnectionStatus {
        match (&self.remote_url, self.last_fetch_ok) {
            (None, _) => ConnectionStatus::NotConnected,
            (Some(_), None) => ConnectionStatus::Connecting,
            (Some(_), Some(true)) => ConnectionStatus::Connected,
            (Some(_), Some(false)) => ConnectionStatus::Error,
        }
    }

    pub(crate) fn connected_to(url: &RemoteUrl) -> Self {
        Self {
            remote_url: Some(url.as_str().to_string()),
            ..Self::default()
        }
    }

    pub(crate) fn apply_fetch(&mut self, error: Option<&str>, timestamp: i64) {
        self.last_fetch_ts = timestamp;
        self.last_fetch_ok = Some(error.is_none());
        self.last_error = error.map(str::to_string);
    }
}

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

pub(crate) fn status_key(prefix: &str, repo_id: &RepoId) -> String {
    format!("{prefix}:repo:{repo_id}")
}

// ---------------------------------------------------------------------------
// RepoStatus helpers: convert to/from a flat HashMap for HSET / HGETALL
// ---------------------------------------------------------------------------

fn status_to_pairs(status: &RepoStatus) -> Vec<(String, String)> {
    let ok = match status.last_fetch_ok {
        Some(true) => "1",
        Some(false) => "0",
        None => "",
    };
    vec![
        (
            "remote_url".into(),
            status.remote_url.clone().unwrap_or_default(),
        ),
        ("last_fetch_ts".into(), status.last_fetch_ts.to_string()),
        ("last_fetch_ok".into(), ok.to_string()),
        (
            "last_error".into(),
            status.last_error.clone().unwrap_or_default(),
        ),
    ]
}

fn status_from_map(map: HashMap<String, String>) -> RepoStatus {
    let non_empty = |field: &str| map.get(field).filter(|v| !v.is_empty()).cloned();
    RepoStatus {
        remote_url: non_empty("remote_url"),
        last_fetch_ts: map
            .get("last_fetch_ts")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        last_fetch_ok: match map.get("last_fetch_ok").map(String::as_str) {
            Some("1") => Some(true),
            Some("0") => Some(false),
            _ => None,
        },
        last_error: non_empty("last_error"),
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Read the status hash.  A missing key reads as the default status.
pub async fn get_status(
    pool: &fred::clients::Pool,
    prefix: &str,
    repo_id: &RepoId,
) -> Result<RepoStatus> {
    let key = status_key(prefix, repo_id);
    let map: HashMap<String, String> = pool.hgetall(&key).await.context("HGETALL repo status")?;
    if map.is_empty() {
        trace!(%repo_id, "repo status not found");
    }
    Ok(status_from_map(map))
}

/// Replace the status hash with a fresh record for `url`.
pub async fn set_remote(
    pool: &fred::clients::Pool,
    prefix: &str,
    repo_id: &RepoId,
    url: &RemoteUrl,
) -> Result<()> {
    let key = status_key(prefix, repo_id);
    let pairs = status_to_pairs(&RepoStatus::connected_to(url));
    let _: () = pool.hset(&key, pairs).await.context("HSET repo status")?;
    debug!(%repo_id, %url, "recorded remote");
    Ok(())
}

/// Record a fetch outcome.  The remote URL field is left untouched.
pub async fn set_fetch_outcome(
    pool: &fred::clients::Pool,
    prefix: &str,
    repo_id: &RepoId,
    error: Option<&str>,
) -> Result<()> {
    let key = status_key(prefix, repo_id);
    let mut status = RepoStatus::default();
    status.apply_fetch(error, chrono::Utc::now().timestamp());
    let pairs: Vec<(String, String)> = status_to_pairs(&status)
        .into_iter()
        .filter(|(field, _)| field != "remote_url")
        .collect();
    let _: () = pool.hset(&key, pairs).await.context("HSET fetch outcome")?;
    debug!(%repo_id, ok = error.is_none(), "recorded fetch outcome");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> RemoteUrl {
        RemoteUrl::new("https://example.com/r.git")
    }

    #[test]
    fn status_transitions() {
        let mut status = RepoStatus::default();
        assert_eq!(status.connection_status(), ConnectionStatus::NotConnected);

        status = RepoStatus::connected_to(&url());
        assert_eq!(status.connection_status(), ConnectionStatus::Connecting);

        status.apply_fetch(Some("unreachable"), 10);
        assert_eq!(status.connection_status(), ConnectionStatus::Error);
        assert_eq!(status.last_error.as_deref(), Some("unreachable"));

        status.apply_fetch(None, 20);
        assert_eq!(status.connection_status(), ConnectionStatus::Connected);
        assert_eq!(status.last_error, None);
        assert_eq!(status.last_fetch_ts, 20);
    }

    #[test]
    fn hash_round_trip_keeps_unknowns_distinct() {
        let mut status = RepoStatus::connected_to(&url());
        let map: HashMap<_, _> = status_to_pairs(&status).into_iter().collect();
        assert_eq!(status_from_map(map), status);

        status.apply_fetch(Some("boom"), 5);
        let map: HashMap<_, _> = status_to_pairs(&status).into_iter().collect();
        assert_eq!(status_from_map(map), status);
    }

    #[test]
    fn missing_hash_reads_as_not_connected() {
        let status = status_from_map(HashMap::new());
        assert_eq!(status, RepoStatus::default());
    }

    #[test]
    fn key_layout() {
        assert_eq!(status_key("ck", &RepoId::parse("r").unwrap()), "ck:repo:r");
    }
}
