//! In-process, no-op sandbox backend used by tests.
//!
//! `setup` creates plain directories and copies each bind-mounted host
//! directory's content into them instead of mounting anything; `execute`
//! rewrites any sandbox-absolute argument (`/xports/...`, `/packages/...`,
//! and so on) onto the sandbox root and runs the command directly on the
//! host, unprivileged. Exercising the exact orchestrator code path
//! production does — commands still see the same `-C /xports/<origin>`
//! shape a chroot would show them — is the point: this is a first-class
//! registry entry, not test-only scaffolding bolted on afterward.

use async_trait::async_trait;
use tracing::instrument;

use super::{registry::Backend, Command, Environment, ExecContext, ExecOutcome, run_and_wait};
use crate::{
    config::Config,
    error::EnvironmentError,
    fs,
    path::AbsDirPath,
};

pub struct MockBackend;

impl Backend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn create(&self) -> Box<dyn Environment> {
        Box::new(MockEnvironment::default())
    }
}

#[derive(Default)]
pub struct MockEnvironment {
    root: Option<AbsDirPath>,
    /// Directories this sandbox created, recorded so `cleanup` can verify
    /// (and in production-shaped tests, assert) precise teardown.
    created: Vec<AbsDirPath>,
}

#[async_trait]
impl Environment for MockEnvironment {
    #[instrument(skip(self, config))]
    async fn setup(&mut self, worker_id: usize, config: &Config) -> Result<(), EnvironmentError> {
        let root = config
            .build_base
            .try_join_dir(format!("SL{worker_id:02}"))
            .map_err(|e| EnvironmentError::Setup {
                op: "compute sandbox root".to_string(),
                cause: e.to_string(),
            })?;

        let subdirs = [
            "construction",
            "tmp",
            "usr/local",
            "xports",
            "distfiles",
            "packages",
            "etc",
        ];

        for sub in subdirs {
            let dir = root.try_join_dir(sub).map_err(|e| EnvironmentError::Setup {
                op: format!("compute {sub}"),
                cause: e.to_string(),
            })?;
            super::ensure_dir(&dir).await.map_err(|e| EnvironmentError::Setup {
                op: format!("create {sub}"),
                cause: e.to_string(),
            })?;
            self.created.push(dir);
        }

        // The bsd backend bind-mounts these read-only; without privileged
        // mounts available, mirror their content by copying instead so a
        // phase's `-C /xports/<origin>` still finds the port's Makefile.
        for (src, sub) in [
            (&config.ports_tree, "xports"),
            (&config.distfiles_dir, "distfiles"),
            (&config.packages_dir, "packages"),
        ] {
            if !fs::exists(src.as_std_path()).await {
                continue;
            }
            let dst = root.try_join_dir(sub).map_err(|e| EnvironmentError::Setup {
                op: format!("compute {sub}"),
                cause: e.to_string(),
            })?;
            fs::copy_dir(src, &dst).await.map_err(|e| EnvironmentError::Setup {
                op: format!("mirror {sub} content"),
                cause: e.to_string(),
            })?;
        }

        self.root = Some(root);
        Ok(())
    }

    #[instrument(skip(self, ctx, command), fields(program = %command.program))]
    async fn execute(&self, ctx: &ExecContext, command: &Command) -> Result<ExecOutcome, EnvironmentError> {
        let root = self.root.as_ref().ok_or_else(|| EnvironmentError::Execution {
            op: "execute".to_string(),
            cause: "sandbox not set up".to_string(),
        })?;

        let working_dir = resolve_working_dir(root, &command.working_dir);
        let args: Vec<_> = command.args.iter().map(|a| rewrite_sandbox_arg(root, a)).collect();

        let mut proc = tokio::process::Command::new(&command.program);
        proc.args(&args);
        proc.current_dir(working_dir);
        proc.env_clear();
        proc.envs(command.env.iter());

        run_and_wait(proc, ctx).await
    }

    #[instrument(skip(self))]
    async fn cleanup(&mut self) -> Result<(), EnvironmentError> {
        if let Some(root) = self.root.take() {
            if let Err(err) = tokio::fs::remove_dir_all(root.as_std_path()).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    return Err(EnvironmentError::Cleanup {
                        unreleased: 1,
                        mounts: vec![root.as_str_lossy().to_string()],
                    });
                }
            }
        }
        self.created.clear();
        Ok(())
    }

    fn root(&self) -> &AbsDirPath {
        self.root.as_ref().expect("sandbox not set up")
    }
}

fn resolve_working_dir(root: &AbsDirPath, working_dir: &str) -> std::path::PathBuf {
    if let Some(rest) = working_dir.strip_prefix(super::SANDBOX_ROOT_PREFIX) {
        root.as_std_path().join(rest.trim_start_matches('/'))
    } else {
        root.as_std_path().join(working_dir.trim_start_matches('/'))
    }
}

/// Re-root a sandbox-absolute argument (e.g. `/xports/games/foo`) under the
/// sandbox root, the same transformation a chroot gives the `bsd` backend
/// for free. Arguments that aren't absolute paths pass through untouched.
fn rewrite_sandbox_arg(root: &AbsDirPath, arg: &str) -> String {
    if let Some(rest) = arg.strip_prefix('/') {
        root.as_std_path().join(rest).to_string_lossy().into_owned()
    } else {
        arg.to_string()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::path::AbsFilePath;

    async fn test_config() -> (tempfile::TempDir, Config) {
        let dir = tempdir().unwrap();
        let root = AbsDirPath::try_from(dir.path().to_path_buf()).unwrap();
        let config = Config::rooted_at(&root).unwrap();
        (dir, config)
    }

    #[tokio::test]
    async fn setup_creates_sandbox_directories() {
        let (_dir, config) = test_config().await;
        let mut env = MockEnvironment::default();
        env.setup(0, &config).await.unwrap();
        assert!(env.root().as_std_path().join("construction").is_dir());
        assert!(env.root().as_std_path().join("usr/local").is_dir());
    }

    #[tokio::test]
    async fn execute_runs_command_and_reports_exit_code() {
        let (_dir, config) = test_config().await;
        let mut env = MockEnvironment::default();
        env.setup(0, &config).await.unwrap();

        let log = AbsFilePath::try_from(env.root().as_std_path().join("log")).unwrap();
        let ctx = ExecContext {
            cancellation: tokio_util::sync::CancellationToken::new(),
            timeout: None,
            log_file: log,
        };
        let cmd = Command::new("true");
        let outcome = env.execute(&ctx, &cmd).await.unwrap();
        match outcome {
            ExecOutcome::Completed(o) => assert_eq!(o.exit_code, 0),
            ExecOutcome::Cancelled(_) => panic!("should not be cancelled"),
        }
    }

    #[tokio::test]
    async fn execute_observes_cancellation() {
        let (_dir, config) = test_config().await;
        let mut env = MockEnvironment::default();
        env.setup(0, &config).await.unwrap();

        let log = AbsFilePath::try_from(env.root().as_std_path().join("log")).unwrap();
        let cancellation = tokio_util::sync::CancellationToken::new();
        let ctx = ExecContext {
            cancellation: cancellation.clone(),
            timeout: None,
            log_file: log,
        };
        cancellation.cancel();
        let cmd = Command::new("sleep").arg("5");
        let outcome = env.execute(&ctx, &cmd).await.unwrap();
        assert!(matches!(
            outcome,
            ExecOutcome::Cancelled(crate::error::Cancellation::Cancelled)
        ));
    }

    #[tokio::test]
    async fn setup_mirrors_ports_tree_content() {
        let (_dir, config) = test_config().await;
        crate::fs::write(
            &AbsFilePath::try_from(config.ports_tree.as_std_path().join("games/foo/Makefile")).unwrap(),
            b"PORTNAME=\tfoo\n",
        )
        .await
        .unwrap();

        let mut env = MockEnvironment::default();
        env.setup(0, &config).await.unwrap();
        assert!(env.root().as_std_path().join("xports/games/foo/Makefile").is_file());
    }

    #[tokio::test]
    async fn execute_rewrites_sandbox_absolute_args() {
        let (_dir, config) = test_config().await;
        crate::fs::write(
            &AbsFilePath::try_from(config.ports_tree.as_std_path().join("games/foo/marker")).unwrap(),
            b"present",
        )
        .await
        .unwrap();

        let mut env = MockEnvironment::default();
        env.setup(0, &config).await.unwrap();

        let log = AbsFilePath::try_from(env.root().as_std_path().join("log")).unwrap();
        let ctx = ExecContext {
            cancellation: tokio_util::sync::CancellationToken::new(),
            timeout: None,
            log_file: log,
        };
        let cmd = Command::new("test").arg("-f").arg("/xports/games/foo/marker");
        let outcome = env.execute(&ctx, &cmd).await.unwrap();
        match outcome {
            ExecOutcome::Completed(o) => assert_eq!(o.exit_code, 0),
            ExecOutcome::Cancelled(_) => panic!("should not be cancelled"),
        }
    }

    #[tokio::test]
    async fn cleanup_removes_sandbox_root() {
        let (_dir, config) = test_config().await;
        let mut env = MockEnvironment::default();
        env.setup(0, &config).await.unwrap();
        let root = env.root().as_std_path().to_path_buf();
        env.cleanup().await.unwrap();
        assert!(!root.exists());
    }
}
