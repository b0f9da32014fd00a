//! Per-worker isolated build sandbox.
//!
//! An [`Environment`] owns one worker's filesystem namespace: a tmpfs
//! scratch root overlaid with read-only binds of curated host directories,
//! the ports tree, the distfiles cache and the packages repository, plus
//! writable scratch space for the build work area, `/tmp` and the install
//! prefix. [`Environment::execute`] runs one phase inside that namespace;
//! [`Environment::cleanup`] reverses every mount it made.
//!
//! Concrete sandbox mechanics are pluggable: production uses the `"bsd"`
//! backend (nullfs/tmpfs/devfs/procfs + chroot), tests use the `"mock"`
//! backend (plain directories, no privileged mounts). Backends register
//! themselves in a process-wide [`registry`] keyed by name; the
//! orchestrator resolves a backend by name at worker-pool creation time.

pub mod bsd;
pub mod mock;
pub mod registry;

use std::{collections::BTreeMap, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use color_eyre::eyre::Context;
use derive_more::Debug;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::{
    config::Config,
    error::{Cancellation, EnvironmentError},
    path::{AbsDirPath, AbsFilePath},
};

pub use registry::{install_default_backends, register, resolve};

/// A leading `$/` in a [`Command::working_dir`] expands to the sandbox root.
pub const SANDBOX_ROOT_PREFIX: &str = "$/";

/// A command to execute inside a sandbox.
#[derive(Debug, Clone)]
pub struct Command {
    pub program: String,
    pub args: Vec<String>,
    /// Directory the command runs in, interpreted inside the sandbox. A
    /// leading `$/` expands to the sandbox root (e.g. `$/construction`).
    pub working_dir: String,
    /// The full environment the command sees. No caller/ambient
    /// environment variables are forwarded; this map is exhaustive.
    pub env: BTreeMap<String, String>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: SANDBOX_ROOT_PREFIX.to_string(),
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Per-call execution context: carries the cancellation source, an
/// optional per-phase timeout, and the log file phase output is streamed
/// into (structured facts go through `tracing`; raw build-tool output is
/// high-volume and belongs in a file, not the log pipeline).
#[derive(Clone)]
pub struct ExecContext {
    pub cancellation: CancellationToken,
    pub timeout: Option<Duration>,
    pub log_file: AbsFilePath,
}

/// What happened to a command that was allowed to run to completion.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionOutcome {
    pub exit_code: i32,
    pub duration: Duration,
}

/// The result of one [`Environment::execute`] call: either the process
/// ran to completion, or it was cancelled/timed out before that. Context
/// state is always consulted before exit-code interpretation, so a
/// process killed by our own signal is reported as [`ExecOutcome::Cancelled`]
/// rather than as a nonzero exit.
#[derive(Debug, Clone)]
pub enum ExecOutcome {
    Completed(ExecutionOutcome),
    Cancelled(Cancellation),
}

/// A worker's isolated build sandbox.
#[async_trait]
pub trait Environment: Send + Sync {
    /// Assemble the sandbox for `worker_id`. Leaves the sandbox fully
    /// constructed, or leaves nothing behind: any partial mounts are
    /// undone before the error is returned.
    async fn setup(&mut self, worker_id: usize, config: &Config) -> Result<(), EnvironmentError>;

    /// Run `command` inside the sandbox and wait for it to finish,
    /// observing `ctx.cancellation` and `ctx.timeout`.
    async fn execute(&self, ctx: &ExecContext, command: &Command) -> Result<ExecOutcome, EnvironmentError>;

    /// Reverse every mount this sandbox made, in reverse order. Retries
    /// busy mounts with bounded backoff, then force-unmounts, then gives
    /// up on that one mount and continues with the rest; returns
    /// [`EnvironmentError::Cleanup`] listing anything still mounted.
    async fn cleanup(&mut self) -> Result<(), EnvironmentError>;

    /// The sandbox root on the host filesystem (`<build_base>/SL<NN>`).
    fn root(&self) -> &AbsDirPath;
}

/// Shared spawn/wait/cancel logic used by every backend: only how the
/// program and its working directory map onto the host process differs
/// between backends.
#[instrument(skip(ctx, cmd), fields(program = %cmd.program))]
pub(crate) async fn run_and_wait(
    mut proc: tokio::process::Command,
    ctx: &ExecContext,
) -> Result<ExecOutcome, EnvironmentError> {
    let log = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(ctx.log_file.as_std_path())
        .await
        .map_err(|e| EnvironmentError::Execution {
            op: "open log file".to_string(),
            cause: e.to_string(),
        })?;
    let log_std = log
        .into_std()
        .await
        .try_clone()
        .map_err(|e| EnvironmentError::Execution {
            op: "clone log file handle".to_string(),
            cause: e.to_string(),
        })?;
    let log_std_err = log_std.try_clone().map_err(|e| EnvironmentError::Execution {
        op: "clone log file handle".to_string(),
        cause: e.to_string(),
    })?;

    proc.stdin(Stdio::null());
    proc.stdout(Stdio::from(log_std));
    proc.stderr(Stdio::from(log_std_err));

    let start = std::time::Instant::now();
    let mut child = proc.spawn().map_err(|e| EnvironmentError::Execution {
        op: "spawn".to_string(),
        cause: e.to_string(),
    })?;
    let pid = child.id();

    let timeout_fut = async {
        match ctx.timeout {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;

        _ = ctx.cancellation.cancelled() => {
            terminate(&mut child, pid).await;
            Ok(ExecOutcome::Cancelled(Cancellation::Cancelled))
        }
        _ = timeout_fut => {
            terminate(&mut child, pid).await;
            Ok(ExecOutcome::Cancelled(Cancellation::TimedOut))
        }
        status = child.wait() => {
            let status = status.map_err(|e| EnvironmentError::Execution {
                op: "wait".to_string(),
                cause: e.to_string(),
            })?;
            // Cancellation/timeout may have raced the exit; re-check before
            // trusting the exit code.
            if ctx.cancellation.is_cancelled() {
                return Ok(ExecOutcome::Cancelled(Cancellation::Cancelled));
            }
            Ok(ExecOutcome::Completed(ExecutionOutcome {
                exit_code: status.code().unwrap_or(-1),
                duration: start.elapsed(),
            }))
        }
    }
}

/// Send SIGTERM, wait a short grace period, then SIGKILL if still alive.
async fn terminate(child: &mut tokio::process::Child, pid: Option<u32>) {
    const GRACE: Duration = Duration::from_secs(5);

    if let Some(pid) = pid {
        // SAFETY: `pid` is a process id we ourselves spawned and still hold
        // a handle to; sending it a signal is safe regardless of whether it
        // has already exited (kill(2) just returns ESRCH in that case).
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }

    if tokio::time::timeout(GRACE, child.wait()).await.is_ok() {
        return;
    }

    warn!(?pid, "child did not exit after SIGTERM, sending SIGKILL");
    if let Err(err) = child.kill().await {
        warn!(?pid, ?err, "failed to SIGKILL child");
    }
    let _ = child.wait().await;
}

/// Recursively create `dir`, succeeding if it already exists.
pub(crate) async fn ensure_dir(dir: &AbsDirPath) -> color_eyre::Result<()> {
    tokio::fs::create_dir_all(dir.as_std_path())
        .await
        .with_context(|| format!("create sandbox directory: {dir:?}"))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn command_builder_sets_fields() {
        let cmd = Command::new("make")
            .arg("-C")
            .arg("/xports/games/foo")
            .arg("build")
            .env("BATCH", "yes")
            .working_dir("$/construction");

        assert_eq!(cmd.program, "make");
        assert_eq!(cmd.args, vec!["-C", "/xports/games/foo", "build"]);
        assert_eq!(cmd.working_dir, "$/construction");
        assert_eq!(cmd.env.get("BATCH"), Some(&"yes".to_string()));
    }
}
