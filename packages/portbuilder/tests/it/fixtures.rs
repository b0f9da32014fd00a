//! Test-only ports tree and port-build-tool stand-in.
//!
//! The real port build tool shells out to `make`; these tests never touch
//! a live ports tree, so `make_bin` in every fixture config points at a
//! small POSIX shell script that answers `-V` metadata queries by reading
//! plain marker files dropped next to each port's `Makefile`, and answers
//! phase invocations with success unless a `FAIL_PHASE` marker names the
//! current phase.

use std::{fs, os::unix::fs::PermissionsExt, path::Path};

use portbuilder::{config::Config, path::AbsDirPath};
use tempfile::TempDir;

const FAKE_MAKE: &str = r#"#!/bin/sh
dir=""
nvars=0
phase=""

while [ $# -gt 0 ]; do
  case "$1" in
    -C)
      dir="$2"
      shift 2
      ;;
    -V)
      nvars=$((nvars + 1))
      shift 2
      ;;
    FLAVOR=*)
      shift
      ;;
    *)
      phase="$1"
      shift
      ;;
  esac
done

if [ "$nvars" -gt 0 ]; then
  cat "$dir/VERSION" 2>/dev/null || echo "1.0"
  cat "$dir/PKGFILE" 2>/dev/null || echo "pkg-1.0.txz"
  cat "$dir/IGNORE" 2>/dev/null || echo ""
  cat "$dir/FETCH_DEPENDS" 2>/dev/null || echo ""
  cat "$dir/EXTRACT_DEPENDS" 2>/dev/null || echo ""
  cat "$dir/PATCH_DEPENDS" 2>/dev/null || echo ""
  cat "$dir/BUILD_DEPENDS" 2>/dev/null || echo ""
  cat "$dir/LIB_DEPENDS" 2>/dev/null || echo ""
  cat "$dir/RUN_DEPENDS" 2>/dev/null || echo ""
  echo "pkgname"
  exit 0
fi

if [ -n "$phase" ] && [ -f "$dir/FAIL_PHASE" ] && [ "$(cat "$dir/FAIL_PHASE")" = "$phase" ]; then
  exit 1
fi
exit 0
"#;

/// A fresh temporary workspace holding a ports tree, a fake `make`, and a
/// [`Config`] wired to use them (backend `"mock"`, single worker).
pub struct Workspace {
    _root: TempDir,
    pub root: AbsDirPath,
    pub config: Config,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create temporary directory");
        let root = AbsDirPath::try_from(dir.path().to_path_buf()).expect("temp dir is absolute");

        let make_bin = root.as_std_path().join("fake-make.sh");
        fs::write(&make_bin, FAKE_MAKE).expect("write fake make script");
        let mut perms = fs::metadata(&make_bin).expect("stat fake make script").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&make_bin, perms).expect("make fake make script executable");

        let mut config = Config::rooted_at(&root).expect("build config rooted at temp dir");
        config.backend = "mock".to_string();
        config.make_bin = make_bin.to_string_lossy().into_owned();
        config.max_workers = 1;
        config.resolver_parallelism = 1;

        Self { _root: dir, root, config }
    }

    /// Create `<category>/<name>` under the ports tree with the given
    /// `Makefile` body (its content feeds the content fingerprint, so
    /// scenarios that need a "port changed" rebuild just rewrite it).
    pub fn port(&self, category: &str, name: &str, makefile_body: &str) -> AbsDirPath {
        let dir = self
            .config
            .ports_tree
            .as_std_path()
            .join(category)
            .join(name);
        fs::create_dir_all(&dir).expect("create port directory");
        fs::write(dir.join("Makefile"), makefile_body).expect("write Makefile");
        AbsDirPath::try_from(dir).expect("port directory is absolute")
    }
}

/// Metadata the fake `make` reports for a port's `-V` query. Every field
/// defaults to empty, i.e. "no dependencies, not ignored".
#[derive(Default)]
pub struct PortMeta<'a> {
    pub version: &'a str,
    pub build_depends: &'a str,
    pub lib_depends: &'a str,
    pub run_depends: &'a str,
    pub ignore: &'a str,
}

/// Write the marker files the fake `make` reads back for a port's
/// metadata query.
pub fn write_metadata(port_dir: &AbsDirPath, meta: &PortMeta) {
    let dir = port_dir.as_std_path();
    write_marker(dir, "VERSION", meta.version);
    write_marker(dir, "PKGFILE", &format!("{}.txz", dir.file_name().unwrap().to_string_lossy()));
    write_marker(dir, "IGNORE", meta.ignore);
    write_marker(dir, "BUILD_DEPENDS", meta.build_depends);
    write_marker(dir, "LIB_DEPENDS", meta.lib_depends);
    write_marker(dir, "RUN_DEPENDS", meta.run_depends);
}

/// Mark a port's build as failing once it reaches `phase`.
pub fn fail_at_phase(port_dir: &AbsDirPath, phase: &str) {
    write_marker(port_dir.as_std_path(), "FAIL_PHASE", phase);
}

fn write_marker(dir: &Path, name: &str, content: &str) {
    fs::write(dir.join(name), content).unwrap_or_else(|e| panic!("write {name} marker: {e}"));
}
