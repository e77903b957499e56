//! A directory on disk in which `git` subcommands are run.
//!
//! [`GitDirectory`] is the only place that spawns the `git` binary.  Every
//! invocation runs with stdin closed (unless content is supplied) and with
//! terminal prompts disabled, so an operation that needs credentials fails
//! instead of hanging.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::error::{GitError, GitResult};

/// Variables that are always applied last, after constructor defaults and
/// call-site overrides, so nothing can re-enable an interactive prompt.
const FORCED_ENV: &[(&str, &str)] = &[
    ("GIT_TERMINAL_PROMPT", "0"),
    ("GCM_INTERACTIVE", "never"),
    ("GIT_ASKPASS", ""),
    ("SSH_ASKPASS", ""),
];

// ---------------------------------------------------------------------------
// Options / output
// ---------------------------------------------------------------------------

/// Per-invocation options.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    env: BTreeMap<String, String>,
    stdin: Option<String>,
}

impl ExecOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn stdin(mut self, content: impl Into<String>) -> Self {
        self.stdin = Some(content.into());
        self
    }
}

/// Captured output of a successful invocation.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

// ---------------------------------------------------------------------------
// GitDirectory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GitDirectory {
    path: PathBuf,
    binary: String,
    env: BTreeMap<String, String>,
    timeout: Option<Duration>,
}

impl GitDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let mut env = BTreeMap::new();
        // Stable English messages; error classification matches on them.
        env.insert("LC_ALL".to_string(), "C".to_string());
        env.insert(
            "GIT_SSH_COMMAND".to_string(),
            "ssh -o BatchMode=yes".to_string(),
        );
        Self {
            path: path.into(),
            binary: "git".to_string(),
            env,
            timeout: None,
        }
    }

    /// Default environment applied to every invocation. Call-site options
    /// override these.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `git <command> <args...>` in this directory.
    #[instrument(skip(self, options), fields(path = %self.path.display()))]
    pub async fn exec(
        &self,
        command: &str,
        args: &[&str],
        options: ExecOptions,
    ) -> GitResult<ExecOutput> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(command).args(args).current_dir(&self.path);

        for (k, v) in self.env.iter().chain(options.env.iter()) {
            cmd.env(k, v);
        }
        for (k, v) in FORCED_ENV {
            cmd.env(k, v);
        }

        cmd.stdin(if options.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| spawn_error(command, e))?;

        if let Some(input) = options.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(input.as_bytes())
                    .await
                    .map_err(|e| GitError::io(self.path.display().to_string(), e))?;
                drop(stdin);
            }
        }

        let output = match self.timeout {
            Some(after) => tokio::time::timeout(after, child.wait_with_output())
                .await
                .map_err(|_| GitError::Timeout {
                    command: command.to_string(),
                    after,
                })?,
            None => child.wait_with_output().await,
        }
        .map_err(|e| GitError::io(self.path.display().to_string(), e))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            debug!(%command, status = %output.status, stderr = %stderr.trim(), "git exited non-zero");
            return Err(GitError::ExternalTool {
                command: command.to_string(),
                status: output.status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(ExecOutput { stdout, stderr })
    }

    /// Like [`exec`](Self::exec) but returns only stdout, trimmed of the
    /// trailing newline.
    pub async fn read(&self, command: &str, args: &[&str]) -> GitResult<String> {
        self.read_with(command, args, ExecOptions::default()).await
    }

    pub async fn read_with(
        &self,
        command: &str,
        args: &[&str],
        options: ExecOptions,
    ) -> GitResult<String> {
        let output = self.exec(command, args, options).await?;
        Ok(output.stdout.trim_end_matches('\n').to_string())
    }
}

fn spawn_error(command: &str, e: std::io::Error) -> GitError {
    GitError::ExternalTool {
        command: command.to_string(),
        status: "not started".to_string(),
        stderr: format!("failed to spawn git: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fresh_repo() -> (tempfile::TempDir, GitDirectory) {
        let tmp = tempfile::tempdir().unwrap();
        let repo = GitDirectory::new(tmp.path())
            .with_env("GIT_AUTHOR_NAME", "Tester")
            .with_env("GIT_AUTHOR_EMAIL", "tester@example.com")
            .with_env("GIT_COMMITTER_NAME", "Tester")
            .with_env("GIT_COMMITTER_EMAIL", "tester@example.com");
        repo.exec("init", &[], ExecOptions::default()).await.unwrap();
        (tmp, repo)
    }

    #[tokio::test]
    async fn returns_the_result() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = GitDirectory::new(tmp.path());
        let output = repo.exec("init", &[], ExecOptions::default()).await.unwrap();
        assert!(output.stdout.starts_with("Initialized empty Git repository"));
    }

    #[tokio::test]
    async fn raises_the_tool_error() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = GitDirectory::new(tmp.path());
        let err = repo
            .exec("not-a-command", &[], ExecOptions::default())
            .await
            .unwrap_err();
        assert!(err.stderr().unwrap().contains("is not a git command"));
    }

    #[tokio::test]
    async fn call_site_env_overrides_constructor_env() {
        let (_tmp, repo) = fresh_repo().await;
        let repo = repo.with_env("GIT_REFLOG_ACTION", "testing");
        repo.exec("commit", &["--allow-empty", "-m", "first"], ExecOptions::default())
            .await
            .unwrap();
        assert!(repo.read("reflog", &["-1"]).await.unwrap().contains("testing: first"));

        repo.exec(
            "commit",
            &["--allow-empty", "-m", "second"],
            ExecOptions::new().env("GIT_REFLOG_ACTION", "amazing"),
        )
        .await
        .unwrap();
        assert!(repo.read("reflog", &["-1"]).await.unwrap().contains("amazing: second"));
    }

    #[tokio::test]
    async fn feeds_stdin() {
        let (_tmp, repo) = fresh_repo().await;
        let oid = repo
            .read_with("hash-object", &["-w", "--stdin"], ExecOptions::new().stdin("hello\n"))
            .await
            .unwrap();
        assert_eq!(oid, "ce013625030ba8dba906f756967f9e9ca394464a");
        assert_eq!(repo.read("cat-file", &["-p", &oid]).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn never_prompts_for_credentials() {
        let (_tmp, repo) = fresh_repo().await;
        // Even when the caller asks for prompts, the forced env wins and the
        // command fails instead of waiting on a terminal.
        let result = repo
            .with_timeout(Duration::from_secs(20))
            .exec(
                "ls-remote",
                &["http://127.0.0.1:9/private.git"],
                ExecOptions::new().env("GIT_TERMINAL_PROMPT", "1"),
            )
            .await;
        assert!(matches!(result, Err(GitError::ExternalTool { .. })));
    }
}
