//! Thin async wrapper around the `git` binary.
//!
//! Every invocation runs with a deadline; on expiry the child is killed
//! (`kill_on_drop`) and [`EngineError::GitTimeout`] is returned. Failures
//! carry the command, exit code and captured output. Nothing here retries.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{io_err, EngineError};

pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(60);

pub const COMMIT_AUTHOR_NAME: &str = "foxops";
pub const COMMIT_AUTHOR_EMAIL: &str = "noreply@foxops.io";

/// Config applied to every invocation so behaviour does not depend on the
/// user's global git configuration.
const BASE_CONFIG: &[&str] = &[
    "-c",
    "commit.gpgsign=false",
    "-c",
    "core.quotePath=false",
    "-c",
    "core.autocrlf=false",
    "-c",
    "init.defaultBranch=main",
    "-c",
    "advice.detachedHead=false",
];

/// Captured result of one git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn into_result(self, command: String) -> Result<GitOutput, EngineError> {
        if self.success() {
            Ok(self)
        } else {
            Err(EngineError::Git {
                command,
                code: self.code,
                stdout: self.stdout,
                stderr: self.stderr,
            })
        }
    }
}

/// Run `git <args>` in `cwd`, feeding `stdin` if given. Non-zero exit is not an error here.
pub async fn run_git(
    cwd: &Path,
    args: &[&str],
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> Result<GitOutput, EngineError> {
    let command = args.join(" ");
    tracing::debug!(cwd = %cwd.display(), %command, "git");

    let mut cmd = Command::new("git");
    cmd.args(BASE_CONFIG)
        .args(args)
        .current_dir(cwd)
        .env("GIT_TERMINAL_PROMPT", "0")
        .env("LC_ALL", "C")
        .env("GIT_AUTHOR_NAME", COMMIT_AUTHOR_NAME)
        .env("GIT_AUTHOR_EMAIL", COMMIT_AUTHOR_EMAIL)
        .env("GIT_COMMITTER_NAME", COMMIT_AUTHOR_NAME)
        .env("GIT_COMMITTER_EMAIL", COMMIT_AUTHOR_EMAIL)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let run = async {
        let mut child = cmd.spawn()?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await?;
            // Dropping the handle closes the pipe so git sees EOF.
            drop(pipe);
        }
        child.wait_with_output().await
    };

    let output = match tokio::time::timeout(timeout, run).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => return Err(EngineError::GitSpawn { command, source }),
        Err(_) => {
            tracing::warn!(%command, ?timeout, "git timed out, killed");
            return Err(EngineError::GitTimeout { command, timeout });
        }
    };

    Ok(GitOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

// ---------------------------------------------------------------------------
// GitRepository
// ---------------------------------------------------------------------------

/// A local git working tree (or bare repository) plus the timeout to use for it.
#[derive(Debug, Clone)]
pub struct GitRepository {
    dir: PathBuf,
    timeout: Duration,
}

impl GitRepository {
    /// Wrap an existing repository directory. No I/O.
    pub fn open(dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            timeout,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `git init` a fresh repository at `dir`.
    pub async fn init(dir: &Path, bare: bool, timeout: Duration) -> Result<Self, EngineError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| io_err(dir, e))?;
        let repo = Self::open(dir, timeout);
        if bare {
            repo.run(&["init", "--quiet", "--bare"]).await?;
        } else {
            repo.run(&["init", "--quiet"]).await?;
        }
        Ok(repo)
    }

    /// Clone `url` into `dest`, checked out at `refspec` (default branch if `None`).
    ///
    /// `shallow` asks for a depth-1 clone of a branch or tag. A refspec that is
    /// a commit id cannot be cloned directly, so that case falls back to a full
    /// clone followed by a checkout.
    pub async fn clone_from(
        url: &str,
        dest: &Path,
        refspec: Option<&str>,
        shallow: bool,
        timeout: Duration,
    ) -> Result<Self, EngineError> {
        let parent = dest.parent().unwrap_or(Path::new("."));
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_err(parent, e))?;
        let dest_str = dest.to_string_lossy().into_owned();

        if let Some(refspec) = refspec {
            let mut args = vec!["clone", "--quiet", "--branch", refspec];
            if shallow {
                args.extend(["--depth", "1"]);
            }
            args.extend([url, dest_str.as_str()]);
            let attempt = run_git(Path::new("."), &args, None, timeout).await?;
            if attempt.success() {
                return Ok(Self::open(dest, timeout));
            }
            tracing::debug!(%url, %refspec, "ref is not a branch or tag, falling back to full clone");
            if dest.exists() {
                tokio::fs::remove_dir_all(dest)
                    .await
                    .map_err(|e| io_err(dest, e))?;
            }
        }

        let args = ["clone", "--quiet", url, dest_str.as_str()];
        run_git(Path::new("."), &args, None, timeout)
            .await?
            .into_result(args.join(" "))?;
        let repo = Self::open(dest, timeout);
        if let Some(refspec) = refspec {
            repo.checkout(refspec).await?;
        }
        Ok(repo)
    }

    /// Run a git command here; non-zero exit becomes [`EngineError::Git`].
    pub async fn run(&self, args: &[&str]) -> Result<GitOutput, EngineError> {
        self.run_unchecked(args, None)
            .await?
            .into_result(args.join(" "))
    }

    /// Run a git command here and hand back the output whatever the exit code.
    pub async fn run_unchecked(
        &self,
        args: &[&str],
        stdin: Option<&[u8]>,
    ) -> Result<GitOutput, EngineError> {
        run_git(&self.dir, args, stdin, self.timeout).await
    }

    pub async fn rev_parse(&self, rev: &str) -> Result<String, EngineError> {
        let out = self.run(&["rev-parse", "--verify", "--quiet", rev]).await?;
        Ok(out.stdout.trim().to_string())
    }

    pub async fn head_sha(&self) -> Result<String, EngineError> {
        self.rev_parse("HEAD").await
    }

    /// Whether the repository has at least one commit.
    pub async fn has_commits(&self) -> Result<bool, EngineError> {
        let out = self
            .run_unchecked(&["rev-parse", "--verify", "--quiet", "HEAD"], None)
            .await?;
        Ok(out.success())
    }

    /// Whether `sha` names a commit present in this repository.
    pub async fn commit_exists(&self, sha: &str) -> Result<bool, EngineError> {
        let object = format!("{sha}^{{commit}}");
        let out = self
            .run_unchecked(&["cat-file", "-e", object.as_str()], None)
            .await?;
        Ok(out.success())
    }

    pub async fn checkout(&self, rev: &str) -> Result<(), EngineError> {
        self.run(&["checkout", "--quiet", rev]).await.map(|_| ())
    }

    /// Create `name` at the current HEAD and switch to it.
    pub async fn create_branch(&self, name: &str) -> Result<(), EngineError> {
        self.run(&["checkout", "--quiet", "-b", name]).await.map(|_| ())
    }

    pub async fn current_branch(&self) -> Result<String, EngineError> {
        let out = self.run(&["symbolic-ref", "--short", "HEAD"]).await?;
        Ok(out.stdout.trim().to_string())
    }

    /// Stage every change under the working tree, honouring `.gitignore`.
    pub async fn add_all(&self) -> Result<(), EngineError> {
        self.run(&["add", "--all"]).await.map(|_| ())
    }

    /// Whether the index differs from HEAD (or holds anything, before the first commit).
    pub async fn has_staged_changes(&self) -> Result<bool, EngineError> {
        if !self.has_commits().await? {
            let out = self.run(&["ls-files", "--cached"]).await?;
            return Ok(!out.stdout.trim().is_empty());
        }
        let out = self
            .run_unchecked(&["diff", "--cached", "--quiet"], None)
            .await?;
        match out.code {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            code => Err(EngineError::Git {
                command: "diff --cached --quiet".into(),
                code,
                stdout: out.stdout,
                stderr: out.stderr,
            }),
        }
    }

    /// Commit the index and return the new HEAD.
    pub async fn commit(&self, message: &str) -> Result<String, EngineError> {
        self.run(&["commit", "--quiet", "--no-verify", "-m", message])
            .await?;
        self.head_sha().await
    }

    /// Push `branch` to `remote`. A diverged remote is reported as
    /// [`EngineError::PushRejected`] so callers can decide to retry.
    pub async fn push(&self, remote: &str, branch: &str) -> Result<(), EngineError> {
        let refspec = format!("{branch}:{branch}");
        let args = ["push", "--quiet", remote, refspec.as_str()];
        let out = self.run_unchecked(&args, None).await?;
        if out.success() {
            return Ok(());
        }
        if out.stderr.contains("[rejected]")
            || out.stderr.contains("non-fast-forward")
            || out.stderr.contains("fetch first")
        {
            return Err(EngineError::PushRejected {
                branch: branch.to_string(),
                stderr: out.stderr,
            });
        }
        out.into_result(args.join(" ")).map(|_| ())
    }

    /// Replay local commits on top of `remote`'s `branch`. A conflicting rebase
    /// is aborted and reported as a git failure.
    pub async fn pull_rebase(&self, remote: &str, branch: &str) -> Result<(), EngineError> {
        let args = ["pull", "--rebase", "--quiet", remote, branch];
        let out = self.run_unchecked(&args, None).await?;
        if out.success() {
            return Ok(());
        }
        if let Err(e) = self.run_unchecked(&["rebase", "--abort"], None).await {
            tracing::warn!(error = %e, "failed to abort rebase");
        }
        out.into_result(args.join(" ")).map(|_| ())
    }

    /// Remove `branch` from `remote`.
    pub async fn delete_remote_branch(&self, remote: &str, branch: &str) -> Result<(), EngineError> {
        self.run(&["push", "--quiet", remote, "--delete", branch])
            .await
            .map(|_| ())
    }

    /// Top of the working tree containing `dir`, or `None` outside any repository.
    pub async fn toplevel_of(dir: &Path, timeout: Duration) -> Result<Option<PathBuf>, EngineError> {
        let out = run_git(dir, &["rev-parse", "--show-toplevel"], None, timeout).await?;
        if !out.success() {
            return Ok(None);
        }
        Ok(Some(PathBuf::from(out.stdout.trim())))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
