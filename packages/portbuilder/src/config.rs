//! Typed runtime configuration.
//!
//! Full INI-style configuration file parsing is out of scope for this
//! crate; what's here is the typed surface an embedder (or the bundled
//! CLI, which layers an optional TOML file and flag overrides on top)
//! populates before constructing an [`crate::orchestrator::Orchestrator`].

use color_eyre::eyre::Context as _;
use serde::{Deserialize, Serialize};

use crate::path::{AbsDirPath, AbsFilePath};

/// Runtime configuration for a build run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root of the ports tree, mounted read-only at `/xports` in sandboxes.
    pub ports_tree: AbsDirPath,

    /// Distfiles cache, mounted read-write at `/distfiles`.
    pub distfiles_dir: AbsDirPath,

    /// Built-package repository, mounted read-write at `/packages`.
    pub packages_dir: AbsDirPath,

    /// Scratch space for worker sandbox roots (`<build_base>/SL<NN>`).
    pub build_base: AbsDirPath,

    /// Path to the build store file (default `<build_base>/builds.db`).
    pub store_path: AbsFilePath,

    /// Directory seeded with the minimal sandbox `/etc` template.
    pub template_dir: AbsDirPath,

    /// Directory holding per-port phase logs.
    pub log_dir: AbsDirPath,

    /// Configured (maximum) number of concurrent build workers.
    pub max_workers: usize,

    /// Number of concurrent Makefile-metadata queries the resolver runs.
    pub resolver_parallelism: usize,

    /// Per-phase execution timeout in seconds. `0` means unbounded.
    pub phase_timeout_secs: u64,

    /// Name of the port build tool binary (`make` on FreeBSD/DragonFly).
    pub make_bin: String,

    /// Name of the `mount(8)` binary the `"bsd"` backend shells out to.
    pub mount_bin: String,

    /// Name of the `umount(8)` binary the `"bsd"` backend shells out to.
    pub umount_bin: String,

    /// Name of the `chroot(8)` binary the `"bsd"` backend shells out to.
    pub chroot_bin: String,

    /// Name of the registered [`crate::environment::Environment`] backend
    /// to use (`"bsd"` in production, `"mock"` in tests).
    pub backend: String,
}

impl Config {
    /// A configuration rooted under `root`, with every subdirectory as a
    /// child of it. Convenient for tests and for `init`.
    pub fn rooted_at(root: &AbsDirPath) -> color_eyre::Result<Self> {
        Ok(Self {
            ports_tree: root.try_join_dir("xports")?,
            distfiles_dir: root.try_join_dir("distfiles")?,
            packages_dir: root.try_join_dir("packages")?,
            build_base: root.try_join_dir("build")?,
            store_path: root.try_join_file("builds.db")?,
            template_dir: root.try_join_dir("template")?,
            log_dir: root.try_join_dir("logs")?,
            max_workers: num_cpus::get(),
            resolver_parallelism: num_cpus::get(),
            phase_timeout_secs: 0,
            make_bin: "make".to_string(),
            mount_bin: "mount".to_string(),
            umount_bin: "umount".to_string(),
            chroot_bin: "chroot".to_string(),
            backend: "bsd".to_string(),
        })
    }

    fn user_cache_root() -> AbsDirPath {
        let base = directories::ProjectDirs::from("com", "portbuilder", "portbuilder")
            .map(|dirs| dirs.cache_dir().to_path_buf())
            .or_else(|| {
                directories::UserDirs::new()
                    .map(|d| d.home_dir().join(".cache").join("portbuilder"))
            })
            .unwrap_or_else(|| std::path::PathBuf::from("/var/tmp/portbuilder"));
        AbsDirPath::try_from(base).expect("platform cache dir is absolute")
    }
}

impl Default for Config {
    /// Rooted at the platform's standard user cache directory, mirroring
    /// the grounding codebase's `user_global_cache_path`. Never fails: if
    /// the platform directories crate can't locate one, falls back to
    /// `/var/tmp/portbuilder`.
    fn default() -> Self {
        let root = Self::user_cache_root();
        Self::rooted_at(&root).expect("user cache root is always a valid absolute path")
    }
}

/// Sparse overrides read from an optional TOML file and from individual CLI
/// flags. Every field mirrors one on [`Config`]; `None` means "leave
/// whatever `Config` already had". TOML, not INI, is a deliberate deviation
/// from the source tool's configuration format (see `DESIGN.md`): the core
/// never depended on INI parsing, and this crate's stack already pulls in
/// `toml` for nothing else, so introducing a second format parser bought no
/// compatibility a from-scratch reimplementation could actually honor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConfigOverrides {
    pub ports_tree: Option<AbsDirPath>,
    pub distfiles_dir: Option<AbsDirPath>,
    pub packages_dir: Option<AbsDirPath>,
    pub build_base: Option<AbsDirPath>,
    pub store_path: Option<AbsFilePath>,
    pub template_dir: Option<AbsDirPath>,
    pub log_dir: Option<AbsDirPath>,
    pub max_workers: Option<usize>,
    pub resolver_parallelism: Option<usize>,
    pub phase_timeout_secs: Option<u64>,
    pub make_bin: Option<String>,
    pub mount_bin: Option<String>,
    pub umount_bin: Option<String>,
    pub chroot_bin: Option<String>,
    pub backend: Option<String>,
}

impl ConfigOverrides {
    /// Read an optional TOML file into a set of overrides. A missing file
    /// is not an error (the common case: no config file has been written
    /// yet); a present-but-unparseable file is.
    pub async fn from_toml_file(path: &crate::path::AbsFilePath) -> color_eyre::Result<Self> {
        match crate::fs::read_buffered_utf8(path).await? {
            Some(text) => toml::from_str(&text)
                .with_context(|| format!("parse config file: {path:?}")),
            None => Ok(Self::default()),
        }
    }
}

impl Config {
    /// Apply a sparse set of overrides on top of this configuration,
    /// leaving any field the overrides didn't set untouched.
    pub fn merge(mut self, overrides: ConfigOverrides) -> Self {
        macro_rules! take {
            ($field:ident) => {
                if let Some(value) = overrides.$field {
                    self.$field = value;
                }
            };
        }
        take!(ports_tree);
        take!(distfiles_dir);
        take!(packages_dir);
        take!(build_base);
        take!(store_path);
        take!(template_dir);
        take!(log_dir);
        take!(max_workers);
        take!(resolver_parallelism);
        take!(phase_timeout_secs);
        take!(make_bin);
        take!(mount_bin);
        take!(umount_bin);
        take!(chroot_bin);
        take!(backend);
        self
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn rooted_at_nests_every_directory() {
        let dir = tempdir().unwrap();
        let root = AbsDirPath::try_from(dir.path().to_path_buf()).unwrap();
        let config = Config::rooted_at(&root).unwrap();
        assert_eq!(
            config.ports_tree.as_std_path(),
            dir.path().join("xports")
        );
        assert_eq!(config.make_bin, "make");
    }

    #[test]
    fn default_config_is_rooted_under_a_cache_dir() {
        let config = Config::default();
        assert_eq!(config.backend, "bsd");
        assert!(config.ports_tree.as_std_path().is_absolute());
        assert!(
            config
                .ports_tree
                .as_std_path()
                .ends_with("xports")
        );
    }
}
