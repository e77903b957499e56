//! Handler functions, one per [`Operation`] variant.
//!
//! Each handler takes the directory handle and its operation and runs the
//! `git` subcommands that implement it.  [`dispatch`] is the single match
//! over the operation set, so adding a variant without a handler does not
//! compile.

use tracing::{debug, instrument};

use super::directory::{ExecOptions, GitDirectory};
use super::operations::{
    Commit, DeleteRef, Fetch, GetFiles, GetRefs, GetRevision, Init, Operation, Push, Reply,
    SetOrigin,
};
use crate::error::{GitError, GitResult};
use crate::model::{File, Ref, RefName, Refs, LOCAL_BRANCH_PREFIX, REMOTE_BRANCH_PREFIX};

const DEFAULT_BRANCH: &str = "refs/heads/main";

/// Run `operation` against `dir`.
pub async fn dispatch(dir: &GitDirectory, operation: Operation) -> GitResult<Reply> {
    match operation {
        Operation::Init(op) => handle_init(dir, op).await,
        Operation::Commit(op) => handle_commit(dir, op).await,
        Operation::SetOrigin(op) => handle_set_origin(dir, op).await,
        Operation::Fetch(op) => handle_fetch(dir, op).await,
        Operation::Push(op) => handle_push(dir, op).await,
        Operation::GetRefs(op) => handle_get_refs(dir, op).await,
        Operation::GetRevision(op) => handle_get_revision(dir, op).await,
        Operation::GetFiles(op) => handle_get_files(dir, op).await,
        Operation::DeleteRef(op) => handle_delete_ref(dir, op).await,
    }
}

// ---------------------------------------------------------------------------
// Init
// ---------------------------------------------------------------------------

/// Create the repository if there is not one already.
#[instrument(skip(dir), fields(path = %dir.path().display()))]
pub async fn handle_init(dir: &GitDirectory, op: Init) -> GitResult<Reply> {
    let head = if op.bare {
        dir.path().join("HEAD")
    } else {
        dir.path().join(".git").join("HEAD")
    };
    if head.is_file() {
        debug!("repository already initialised; skipping init");
        return Ok(Reply::Done);
    }

    let args: &[&str] = if op.bare { &["--bare"] } else { &[] };
    dir.exec("init", args, ExecOptions::default()).await?;
    dir.exec("symbolic-ref", &["HEAD", DEFAULT_BRANCH], ExecOptions::default())
        .await?;

    debug!("repository initialised");
    Ok(Reply::Done)
}

// ---------------------------------------------------------------------------
// Commit
// ---------------------------------------------------------------------------

#[instrument(skip(dir, op), fields(path = %dir.path().display(), ref_name = %op.ref_name()))]
pub async fn handle_commit(dir: &GitDirectory, op: Commit) -> GitResult<Reply> {
    let target = op.ref_name();
    let remote = RefName::remote_branch(op.branch());

    let current = resolve_commit(dir, target).await?;
    let parent = match &current {
        Some(rev) => Some(rev.clone()),
        None => resolve_commit(dir, &remote).await?,
    };

    // Replace whatever is staged with the base tree, so leftovers in the
    // index never end up in the commit.
    match &parent {
        Some(rev) => dir.exec("read-tree", &[rev.as_str()], ExecOptions::default()).await?,
        None => dir.exec("read-tree", &["--empty"], ExecOptions::default()).await?,
    };

    for file in op.files() {
        let oid = dir
            .read_with(
                "hash-object",
                &["-w", "--stdin"],
                ExecOptions::new().stdin(file.content.as_str()),
            )
            .await?;
        dir.exec(
            "update-index",
            &["--add", "--cacheinfo", "100644", oid.trim(), &file.path],
            ExecOptions::default(),
        )
        .await?;
    }

    let tree = dir.read("write-tree", &[]).await?;

    let mut args = vec![tree.trim(), "-m", op.message().as_str()];
    if let Some(rev) = &parent {
        args.push("-p");
        args.push(rev.as_str());
    }
    let author = op.author();
    let commit = dir
        .read_with(
            "commit-tree",
            &args,
            ExecOptions::new()
                .env("GIT_AUTHOR_NAME", author.name.as_str())
                .env("GIT_AUTHOR_EMAIL", author.email.as_str())
                .env("GIT_COMMITTER_NAME", author.name.as_str())
                .env("GIT_COMMITTER_EMAIL", author.email.as_str()),
        )
        .await?;

    // The old value guards against the ref having moved under us; an empty
    // old value requires the ref not to exist yet.
    let expected_old = current.as_deref().unwrap_or("");
    dir.exec(
        "update-ref",
        &[target.as_str(), commit.trim(), expected_old],
        ExecOptions::default(),
    )
    .await?;

    debug!(commit = %commit.trim(), parent = ?parent, files = op.files().len(), "commit written");
    Ok(Reply::Done)
}

/// Resolve `name` to a commit id, or `None` if it does not exist.
async fn resolve_commit(dir: &GitDirectory, name: &RefName) -> GitResult<Option<String>> {
    let spec = format!("{name}^{{commit}}");
    match dir.read("rev-parse", &["--verify", "--quiet", &spec]).await {
        Ok(rev) if !rev.trim().is_empty() => Ok(Some(rev.trim().to_string())),
        Ok(_) => Ok(None),
        Err(GitError::ExternalTool { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// SetOrigin
// ---------------------------------------------------------------------------

/// Check the remote answers, then add or update `origin`.
///
/// Refs are never touched: the probe is an `ls-remote`.
#[instrument(skip(dir), fields(path = %dir.path().display(), url = %op.url))]
pub async fn handle_set_origin(dir: &GitDirectory, op: SetOrigin) -> GitResult<Reply> {
    let url = op.url.as_str();

    if url.starts_with('-') {
        return Err(GitError::Connection {
            url: url.to_string(),
            detail: "malformed remote url".to_string(),
        });
    }

    dir.exec("ls-remote", &["--heads", url], ExecOptions::default())
        .await
        .map_err(|e| as_connection_error(e, url))?;

    match dir
        .exec("remote", &["add", "origin", url], ExecOptions::default())
        .await
    {
        Ok(_) => {
            debug!("origin added");
        }
        Err(GitError::ExternalTool { stderr, .. }) if stderr.contains("already exists") => {
            dir.exec("remote", &["set-url", "origin", url], ExecOptions::default())
                .await?;
            debug!("origin url updated");
        }
        Err(e) => return Err(e),
    }

    Ok(Reply::Done)
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

/// Fetch every branch of origin into `refs/remotes/origin/*`.
#[instrument(skip(dir, _op), fields(path = %dir.path().display()))]
pub async fn handle_fetch(dir: &GitDirectory, _op: Fetch) -> GitResult<Reply> {
    let url = origin_url(dir).await?;

    let refspec = format!("+{LOCAL_BRANCH_PREFIX}*:{REMOTE_BRANCH_PREFIX}*");
    let output = dir
        .exec(
            "fetch",
            &["--prune", "--no-tags", "origin", &refspec],
            ExecOptions::default(),
        )
        .await
        .map_err(|e| as_connection_error(e, &url))?;

    debug!(
        refs_updated = count_updated_refs(&output.stderr),
        "fetch complete"
    );
    Ok(Reply::Done)
}

async fn origin_url(dir: &GitDirectory) -> GitResult<String> {
    match dir.read("config", &["--get", "remote.origin.url"]).await {
        Ok(url) => Ok(url.trim().to_string()),
        Err(GitError::ExternalTool { .. }) => Err(GitError::Connection {
            url: String::new(),
            detail: "no origin remote is configured".to_string(),
        }),
        Err(e) => Err(e),
    }
}

/// Count the ref-update lines in `git fetch` stderr.
fn count_updated_refs(stderr: &str) -> usize {
    stderr
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            trimmed.contains("->") && !trimmed.starts_with("From")
        })
        .count()
}

// ---------------------------------------------------------------------------
// Push
// ---------------------------------------------------------------------------

#[instrument(skip(dir), fields(path = %dir.path().display(), local = %op.local, remote = %op.remote))]
pub async fn handle_push(dir: &GitDirectory, op: Push) -> GitResult<Reply> {
    let url = origin_url(dir).await?;
    let refspec = format!("{}:{}", op.local, op.remote);

    match dir
        .exec("push", &["origin", &refspec], ExecOptions::default())
        .await
    {
        Ok(_) => {
            debug!("push complete");
            Ok(Reply::Done)
        }
        Err(GitError::ExternalTool { stderr, .. }) if is_push_rejection(&stderr) => {
            Err(GitError::PushRejected {
                local: op.local.to_string(),
                remote: op.remote.to_string(),
                detail: stderr,
            })
        }
        Err(e) => Err(as_connection_error(e, &url)),
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

#[instrument(skip(dir, _op), fields(path = %dir.path().display()))]
pub async fn handle_get_refs(dir: &GitDirectory, _op: GetRefs) -> GitResult<Reply> {
    let remote_ns = REMOTE_BRANCH_PREFIX.trim_end_matches('/');
    let local_ns = LOCAL_BRANCH_PREFIX.trim_end_matches('/');
    let stdout = dir
        .read(
            "for-each-ref",
            &["--format=%(objectname) %(refname)", local_ns, remote_ns],
        )
        .await?;
    let refs = parse_ref_listing(&stdout)?;
    debug!(ref_count = refs.len(), "refs listed");
    Ok(Reply::Refs(refs))
}

/// Parse `<oid> <refname>` lines, skipping symbolic `HEAD` entries.
fn parse_ref_listing(stdout: &str) -> GitResult<Refs> {
    let mut refs = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((oid, name)) = line.split_once(' ') else {
            return Err(GitError::ExternalTool {
                command: "for-each-ref".to_string(),
                status: "unexpected output".to_string(),
                stderr: line.to_string(),
            });
        };
        if name.ends_with("/HEAD") {
            continue;
        }
        refs.push(Ref::new(RefName::parse(name.trim())?, oid.trim()));
    }
    Ok(Refs::new(refs))
}

#[instrument(skip(dir), fields(path = %dir.path().display()))]
pub async fn handle_get_revision(dir: &GitDirectory, op: GetRevision) -> GitResult<Reply> {
    let spec = format!("{}^{{commit}}", op.ref_name);
    let rev = dir.read("rev-parse", &["--verify", &spec]).await?;
    Ok(Reply::Revision(rev.trim().to_string()))
}

#[instrument(skip(dir), fields(path = %dir.path().display()))]
pub async fn handle_get_files(dir: &GitDirectory, op: GetFiles) -> GitResult<Reply> {
    let listing = dir
        .read("ls-tree", &["-r", "-z", op.ref_name.as_str()])
        .await?;

    let mut files = Vec::new();
    for entry in listing.split('\0').filter(|e| !e.is_empty()) {
        // Format: "<mode> <type> <oid>\t<path>"
        let Some((meta, path)) = entry.split_once('\t') else {
            continue;
        };
        let mut fields = meta.split_whitespace();
        let (Some(_mode), Some(kind), Some(oid)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if kind != "blob" {
            continue;
        }
        let output = dir.exec("cat-file", &["blob", oid], ExecOptions::default()).await?;
        files.push(File::new(path, output.stdout));
    }
    Ok(Reply::Files(files))
}

#[instrument(skip(dir), fields(path = %dir.path().display()))]
pub async fn handle_delete_ref(dir: &GitDirectory, op: DeleteRef) -> GitResult<Reply> {
    if resolve_commit(dir, &op.ref_name).await?.is_some() {
        dir.exec("update-ref", &["-d", op.ref_name.as_str()], ExecOptions::default())
            .await?;
        debug!("ref deleted");
    }
    Ok(Reply::Done)
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

const CONNECTION_MARKERS: &[&str] = &[
    "does not appear to be a git repository",
    "Could not read from remote repository",
    "Could not resolve host",
    "unable to access",
    "Authentication failed",
    "terminal prompts disabled",
    "could not read Username",
    "Connection refused",
    "Connection timed out",
    "Permission denied",
    "Repository not found",
    "repository not found",
    "unable to connect",
    "Host key verification failed",
];

const REJECTION_MARKERS: &[&str] = &[
    "[rejected]",
    "[remote rejected]",
    "non-fast-forward",
    "fetch first",
    "pre-receive hook declined",
];

fn is_connection_failure(stderr: &str) -> bool {
    CONNECTION_MARKERS.iter().any(|m| stderr.contains(m))
}

fn is_push_rejection(stderr: &str) -> bool {
    REJECTION_MARKERS.iter().any(|m| stderr.contains(m))
}

/// Reclassify a tool failure that talks about the remote as a connection
/// error. Anything else passes through unchanged.
fn as_connection_error(err: GitError, url: &str) -> GitError {
    match err {
        GitError::ExternalTool { stderr, .. } if is_connection_failure(&stderr) => {
            GitError::Connection {
                url: url.to_string(),
                detail: stderr,
            }
        }
        // ls-remote against a garbage URL sometimes fails with a bare
        // "fatal:" line that matches none of the markers.
        GitError::ExternalTool { command, stderr, .. } if command == "ls-remote" => {
            GitError::Connection {
                url: url.to_string(),
                detail: stderr,
            }
        }
        GitError::Timeout { command, after } => GitError::Connection {
            url: url.to_string(),
            detail: format!("git {command} timed out after {after:?}"),
        },
        other => other,
    }
}
