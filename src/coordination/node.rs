/// Environment variable that overrides the derived worker id.
pub const WORKER_ID_ENV: &str = "CLONEKEEPER_WORKER_ID";

/// Derive a stable worker identifier.
///
/// Prefers an explicit configured id, then `CLONEKEEPER_WORKER_ID`, then the
/// hostname.  The id names the worker's in-flight list, so it must be the
/// same across restarts for recovery to find that list again.  Run several
/// workers on one host with distinct explicit ids.
pub fn worker_id(configured: Option<&str>) -> String {
    configured
        .map(str::to_string)
        .filter(|id| !id.is_empty())
        .or_else(|| std::env::var(WORKER_ID_ENV).ok().filter(|id| !id.is_empty()))
        .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned())
}
