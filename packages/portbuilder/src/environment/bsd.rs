//! Production sandbox backend: tmpfs + nullfs/devfs/procfs binds under a
//! `chroot`, the same shape poudriere-style ports builders have used for
//! years. Mount/unmount is driven by shelling out to the host `mount(8)`
//! and `umount(8)` tools (via `tokio::process::Command`, the same idiom
//! [`crate::resolver`] uses for `make -V`) rather than raw syscalls, so the
//! same binary works across the BSD variants that differ in their mount
//! syscall ABI but agree on the command-line tool.

use std::time::Duration;

use async_trait::async_trait;
use color_eyre::eyre::Context;
use tracing::{instrument, warn};

use super::{registry::Backend, run_and_wait, Command, Environment, ExecContext, ExecOutcome};
use crate::{
    config::Config,
    error::EnvironmentError,
    fs,
    path::AbsDirPath,
};

/// Host directories bind-mounted read-only into every sandbox, as a
/// sandbox-relative subpath.
const HOST_RO_BINDS: [&str; 10] = [
    "bin",
    "sbin",
    "usr/bin",
    "usr/sbin",
    "usr/lib",
    "usr/libexec",
    "usr/share",
    "usr/include",
    "lib",
    "libexec",
];

/// Subpaths given their own writable tmpfs, distinct from the root tmpfs,
/// so build work area / `/tmp` / the install prefix can be sized or
/// cleared independently in a future revision.
const WRITABLE_SCRATCH: [&str; 3] = ["construction", "tmp", "usr/local"];

pub struct BsdBackend;

impl Backend for BsdBackend {
    fn name(&self) -> &'static str {
        "bsd"
    }

    fn create(&self) -> Box<dyn Environment> {
        Box::new(BsdEnvironment::default())
    }
}

/// One mount this sandbox performed, recorded so `cleanup` can reverse
/// precisely what `setup` did, in reverse order.
#[derive(Debug, Clone)]
struct Mount {
    dst: AbsDirPath,
}

#[derive(Default)]
pub struct BsdEnvironment {
    root: Option<AbsDirPath>,
    mounts: Vec<Mount>,
    mount_bin: String,
    umount_bin: String,
    chroot_bin: String,
}

impl BsdEnvironment {
    async fn mount(&mut self, fstype: &str, src: Option<&AbsDirPath>, dst: &AbsDirPath, ro: bool) -> Result<(), EnvironmentError> {
        fs::create_dir_all(dst)
            .await
            .map_err(|e| EnvironmentError::Setup {
                op: format!("create mount point {dst:?}"),
                cause: e.to_string(),
            })?;

        let mut cmd = tokio::process::Command::new(&self.mount_bin);
        cmd.arg("-t").arg(fstype);
        if ro {
            cmd.arg("-o").arg("ro");
        }
        if let Some(src) = src {
            cmd.arg(src.as_std_path());
        } else {
            cmd.arg(fstype);
        }
        cmd.arg(dst.as_std_path());

        let output = cmd.output().await.map_err(|e| EnvironmentError::Setup {
            op: format!("mount {fstype} at {dst:?}"),
            cause: e.to_string(),
        })?;
        if !output.status.success() {
            return Err(EnvironmentError::Setup {
                op: format!("mount {fstype} at {dst:?}"),
                cause: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        self.mounts.push(Mount { dst: dst.clone() });
        Ok(())
    }

    async fn unmount_one(&self, dst: &AbsDirPath) -> Result<(), String> {
        const ATTEMPTS: u32 = 3;

        for attempt in 0..ATTEMPTS {
            let status = tokio::process::Command::new(&self.umount_bin)
                .arg(dst.as_std_path())
                .status()
                .await
                .map_err(|e| e.to_string())?;
            if status.success() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(200 * (attempt as u64 + 1))).await;
        }

        let status = tokio::process::Command::new(&self.umount_bin)
            .arg("-f")
            .arg(dst.as_std_path())
            .status()
            .await
            .map_err(|e| e.to_string())?;
        if status.success() {
            Ok(())
        } else {
            Err(format!("umount -f failed for {dst:?}"))
        }
    }
}

#[async_trait]
impl Environment for BsdEnvironment {
    #[instrument(skip(self, config))]
    async fn setup(&mut self, worker_id: usize, config: &Config) -> Result<(), EnvironmentError> {
        self.mount_bin = config.mount_bin.clone();
        self.umount_bin = config.umount_bin.clone();
        self.chroot_bin = config.chroot_bin.clone();

        let root = config
            .build_base
            .try_join_dir(format!("SL{worker_id:02}"))
            .map_err(|e| EnvironmentError::Setup {
                op: "compute sandbox root".to_string(),
                cause: e.to_string(),
            })?;
        fs::create_dir_all(&root).await.map_err(|e| EnvironmentError::Setup {
            op: "create sandbox root".to_string(),
            cause: e.to_string(),
        })?;

        if let Err(err) = self.setup_inner(&root, config).await {
            // setup() must leave nothing behind on failure.
            let _ = self.cleanup().await;
            return Err(err);
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

        let dir = command
            .working_dir
            .strip_prefix(super::SANDBOX_ROOT_PREFIX)
            .unwrap_or(&command.working_dir);
        let dir = if dir.is_empty() { "/" } else { dir };

        let mut shell_cmd = format!("cd {dir} && exec {}", shell_quote(&command.program));
        for arg in &command.args {
            shell_cmd.push(' ');
            shell_cmd.push_str(&shell_quote(arg));
        }

        let mut proc = tokio::process::Command::new(&self.chroot_bin);
        proc.arg(root.as_std_path());
        proc.arg("/bin/sh").arg("-c").arg(shell_cmd);
        proc.env_clear();
        proc.envs(command.env.iter());

        run_and_wait(proc, ctx).await
    }

    #[instrument(skip(self))]
    async fn cleanup(&mut self) -> Result<(), EnvironmentError> {
        let mut failed = Vec::new();
        for mount in self.mounts.drain(..).rev() {
            if let Err(cause) = self.unmount_one(&mount.dst).await {
                warn!(dst = %mount.dst, %cause, "failed to unmount sandbox path");
                failed.push(mount.dst.as_str_lossy().to_string());
            }
        }

        if let Some(root) = &self.root {
            if failed.is_empty() {
                if let Err(err) = tokio::fs::remove_dir_all(root.as_std_path()).await {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        failed.push(root.as_str_lossy().to_string());
                    }
                }
            }
        }
        self.root = None;

        if failed.is_empty() {
            Ok(())
        } else {
            Err(EnvironmentError::Cleanup {
                unreleased: failed.len(),
                mounts: failed,
            })
        }
    }

    fn root(&self) -> &AbsDirPath {
        self.root.as_ref().expect("sandbox not set up")
    }
}

impl BsdEnvironment {
    async fn setup_inner(&mut self, root: &AbsDirPath, config: &Config) -> Result<(), EnvironmentError> {
        self.mount("tmpfs", None, root, false).await?;

        for rel in HOST_RO_BINDS {
            let host = AbsDirPath::try_from(std::path::Path::new("/").join(rel))
                .map_err(|e| EnvironmentError::Setup {
                    op: format!("resolve host dir /{rel}"),
                    cause: e.to_string(),
                })?;
            let dst = root.try_join_dir(rel).map_err(|e| EnvironmentError::Setup {
                op: format!("compute sandbox path {rel}"),
                cause: e.to_string(),
            })?;
            self.mount("nullfs", Some(&host), &dst, true).await?;
        }

        let xports = root.try_join_dir("xports").map_err(|e| EnvironmentError::Setup {
            op: "compute /xports".to_string(),
            cause: e.to_string(),
        })?;
        self.mount("nullfs", Some(&config.ports_tree), &xports, true).await?;

        let distfiles = root.try_join_dir("distfiles").map_err(|e| EnvironmentError::Setup {
            op: "compute /distfiles".to_string(),
            cause: e.to_string(),
        })?;
        self.mount("nullfs", Some(&config.distfiles_dir), &distfiles, false).await?;

        let packages = root.try_join_dir("packages").map_err(|e| EnvironmentError::Setup {
            op: "compute /packages".to_string(),
            cause: e.to_string(),
        })?;
        self.mount("nullfs", Some(&config.packages_dir), &packages, false).await?;

        for rel in WRITABLE_SCRATCH {
            let dst = root.try_join_dir(rel).map_err(|e| EnvironmentError::Setup {
                op: format!("compute {rel}"),
                cause: e.to_string(),
            })?;
            self.mount("tmpfs", None, &dst, false).await?;
        }

        let dev = root.try_join_dir("dev").map_err(|e| EnvironmentError::Setup {
            op: "compute /dev".to_string(),
            cause: e.to_string(),
        })?;
        self.mount("devfs", None, &dev, false).await?;

        let proc = root.try_join_dir("proc").map_err(|e| EnvironmentError::Setup {
            op: "compute /proc".to_string(),
            cause: e.to_string(),
        })?;
        self.mount("procfs", None, &proc, false).await?;

        let etc = root.try_join_dir("etc").map_err(|e| EnvironmentError::Setup {
            op: "compute /etc".to_string(),
            cause: e.to_string(),
        })?;
        fs::create_dir_all(&etc).await.map_err(|e| EnvironmentError::Setup {
            op: "create /etc".to_string(),
            cause: e.to_string(),
        })?;
        fs::copy_dir(&config.template_dir, &etc)
            .await
            .with_context(|| format!("seed /etc from template {:?}", config.template_dir))
            .map_err(|e| EnvironmentError::Setup {
                op: "seed /etc from template".to_string(),
                cause: e.to_string(),
            })?;

        Ok(())
    }
}

/// Best-effort reversal of leftover mounts under `build_base` from a crashed
/// run, used by the CLI's `cleanup` subcommand. Walks `SL<NN>` directories
/// directly rather than constructing full [`BsdEnvironment`]s, since a
/// crashed run's mount bookkeeping is gone along with the process.
#[instrument(skip(build_base))]
pub async fn cleanup_stale_sandboxes(build_base: &AbsDirPath) -> color_eyre::Result<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(build_base.as_std_path()).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).context(format!("read build base {build_base:?}")),
    };

    let mut failures = Vec::new();
    while let Some(entry) = entries.next_entry().await.context("read build base entry")? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("SL") {
            continue;
        }
        let sandbox = AbsDirPath::try_from(entry.path())?;
        if let Err(err) = force_unmount_tree(&sandbox).await {
            failures.push(format!("{sandbox}: {err}"));
        }
    }
    Ok(failures)
}

async fn force_unmount_tree(sandbox: &AbsDirPath) -> Result<(), String> {
    // Deepest paths first so child mounts release before their parents.
    let mut paths = Vec::new();
    let mut stack = vec![sandbox.as_std_path().to_path_buf()];
    while let Some(dir) = stack.pop() {
        paths.push(dir.clone());
        if let Ok(mut entries) = tokio::fs::read_dir(&dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                    stack.push(entry.path());
                }
            }
        }
    }
    paths.sort_by_key(|p| std::cmp::Reverse(p.components().count()));

    for path in paths {
        let _ = tokio::process::Command::new("umount")
            .arg("-f")
            .arg(&path)
            .status()
            .await;
    }

    tokio::fs::remove_dir_all(sandbox.as_std_path())
        .await
        .or_else(|e| if e.kind() == std::io::ErrorKind::NotFound { Ok(()) } else { Err(e) })
        .map_err(|e| e.to_string())
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("foo"), "'foo'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }
}
