//! Parses user-supplied port specifications and discovers their
//! transitive dependency graph by querying each port's Makefile in
//! parallel.

use std::{process::Stdio, sync::Arc};

use color_eyre::{Result, eyre::Context};
use tracing::{instrument, trace, warn};

use crate::{
    config::Config,
    error::ResolveError,
    graph::{BuildStateRegistry, DepKind, Flag, PackageRegistry, Port, PortKey},
};

/// The Makefile variables queried for every port, in query order. Queried
/// in one invocation via repeated `-V` flags so parsing is a fixed-offset
/// line read.
const QUERIED_VARS: [&str; 10] = [
    "PKGVERSION",
    "PKGFILE:T",
    "IGNORE",
    "FETCH_DEPENDS",
    "EXTRACT_DEPENDS",
    "PATCH_DEPENDS",
    "BUILD_DEPENDS",
    "LIB_DEPENDS",
    "RUN_DEPENDS",
    "PKGNAME",
];

/// A normalized reference to a port, as extracted from a dependency
/// string or user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRef {
    pub origin: String,
    pub flavor: String,
}

impl PortRef {
    pub fn key(&self) -> PortKey {
        PortKey::new(&self.origin, &self.flavor)
    }

    pub fn category_name(&self) -> Result<(String, String)> {
        let (category, name) = self
            .origin
            .split_once('/')
            .ok_or_else(|| ResolveError::InvalidSpec {
                spec: self.origin.clone(),
            })?;
        Ok((category.to_string(), name.to_string()))
    }
}

/// Parse a user-supplied specification: `category/name`,
/// `category/name@flavor`, or an absolute path under `ports_tree`.
#[instrument]
pub fn parse_spec(spec: &str, ports_tree: &crate::path::AbsDirPath) -> Result<PortRef> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(ResolveError::InvalidSpec {
            spec: spec.to_string(),
        }
        .into());
    }

    if let Some(rest) = std::path::Path::new(spec)
        .strip_prefix(ports_tree.as_std_path())
        .ok()
        .filter(|_| std::path::Path::new(spec).is_absolute())
    {
        let origin = rest.to_string_lossy().trim_end_matches('/').to_string();
        return parse_origin_flavor(&origin);
    }

    parse_origin_flavor(spec)
}

fn parse_origin_flavor(spec: &str) -> Result<PortRef> {
    let (origin, flavor) = match spec.split_once('@') {
        Some((o, f)) => (o, f),
        None => (spec, ""),
    };

    let parts: Vec<&str> = origin.split('/').collect();
    if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
        return Err(ResolveError::InvalidSpec {
            spec: spec.to_string(),
        }
        .into());
    }

    Ok(PortRef {
        origin: origin.to_string(),
        flavor: flavor.to_string(),
    })
}

/// Extract candidate port references from a raw dependency string, e.g.
/// `"gmake>=4.2.1:devel/gmake pkgconf>=1:devel/pkgconf"`.
fn parse_depends(raw: &str) -> Vec<PortRef> {
    raw.split_whitespace()
        .filter_map(|token| {
            let (_, origin_part) = token.rsplit_once(':')?;
            parse_origin_flavor(origin_part).ok()
        })
        .collect()
}

/// Query a port's Makefile for its version, ignore reason, six dependency
/// lists, and package name.
#[instrument(skip(config))]
async fn query_metadata(
    port_ref: &PortRef,
    port_dir: &crate::path::AbsDirPath,
    config: &Config,
) -> Result<QueriedMetadata> {
    if !crate::fs::is_dir(port_dir.as_std_path()).await {
        return Err(ResolveError::PortNotFound {
            spec: port_ref.origin.clone(),
            path: port_dir.as_str_lossy().to_string(),
        }
        .into());
    }

    let mut cmd = tokio::process::Command::new(&config.make_bin);
    cmd.arg("-C").arg(port_dir.as_std_path());
    for var in QUERIED_VARS {
        cmd.arg("-V").arg(var);
    }
    if !port_ref.flavor.is_empty() {
        cmd.arg(format!("FLAVOR={}", port_ref.flavor));
    }
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let output = cmd
        .output()
        .await
        .with_context(|| format!("spawn make for {}", port_ref.origin))?;

    if !output.status.success() {
        return Err(ResolveError::MetadataError {
            origin: port_ref.origin.clone(),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
        .into());
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    if lines.len() < QUERIED_VARS.len() {
        return Err(ResolveError::MetadataError {
            origin: port_ref.origin.clone(),
            detail: format!(
                "expected {} lines of output, got {}",
                QUERIED_VARS.len(),
                lines.len()
            ),
        }
        .into());
    }

    Ok(QueriedMetadata {
        version: lines[0].to_string(),
        pkg_file_name: lines[1].to_string(),
        ignore: lines[2].to_string(),
        fetch_depends: lines[3].to_string(),
        extract_depends: lines[4].to_string(),
        patch_depends: lines[5].to_string(),
        build_depends: lines[6].to_string(),
        lib_depends: lines[7].to_string(),
        run_depends: lines[8].to_string(),
        pkgname: lines[9].to_string(),
    })
}

struct QueriedMetadata {
    version: String,
    pkg_file_name: String,
    ignore: String,
    fetch_depends: String,
    extract_depends: String,
    patch_depends: String,
    build_depends: String,
    lib_depends: String,
    run_depends: String,
    #[allow(dead_code)]
    pkgname: String,
}

impl QueriedMetadata {
    fn raw_for(&self, kind: DepKind) -> &str {
        match kind {
            DepKind::Fetch => &self.fetch_depends,
            DepKind::Extract => &self.extract_depends,
            DepKind::Patch => &self.patch_depends,
            DepKind::Build => &self.build_depends,
            DepKind::Lib => &self.lib_depends,
            DepKind::Run => &self.run_depends,
        }
    }
}

/// Discovers and links the transitive dependency graph for a set of
/// user-supplied port specifications.
pub struct Resolver {
    config: Arc<Config>,
    packages: PackageRegistry,
    states: BuildStateRegistry,
}

impl Resolver {
    pub fn new(config: Arc<Config>, packages: PackageRegistry, states: BuildStateRegistry) -> Self {
        Self {
            config,
            packages,
            states,
        }
    }

    /// Run both resolver passes: discover every transitively-reachable
    /// port (querying Makefiles with bounded parallelism) and then link
    /// bidirectional dependency edges.
    #[instrument(skip(self, specs))]
    pub async fn resolve(&self, specs: &[String]) -> Result<()> {
        let mut seeds = Vec::with_capacity(specs.len());
        for spec in specs {
            seeds.push(parse_spec(spec, &self.config.ports_tree)?);
        }

        self.discover(seeds).await?;
        self.link();
        Ok(())
    }

    /// Pass 1: breadth-first discovery of every reachable port, querying
    /// Makefiles with up to `config.resolver_parallelism` concurrent
    /// `make` invocations per wave.
    async fn discover(&self, seeds: Vec<PortRef>) -> Result<()> {
        let mut frontier = Vec::new();
        for seed in seeds {
            let (category, name) = seed.category_name()?;
            let (port, created) = self.packages.enter(&category, &name, &seed.flavor);
            if created {
                frontier.push((seed, port));
            }
        }

        while !frontier.is_empty() {
            let results = self.query_wave(frontier).await;
            frontier = Vec::new();

            for (port_ref, port, metadata) in results {
                let state = self.states.enter(&port.key);
                match metadata {
                    Ok(meta) => {
                        self.populate(&port, &state, &meta);

                        for kind in DepKind::ALL {
                            for dep_ref in parse_depends(meta.raw_for(kind)) {
                                let (category, name) = match dep_ref.category_name() {
                                    Ok(pair) => pair,
                                    Err(_) => continue,
                                };
                                let (dep_port, created) =
                                    self.packages.enter(&category, &name, &dep_ref.flavor);
                                if created {
                                    frontier.push((dep_ref, dep_port));
                                }
                            }
                        }
                    }
                    Err(err) => {
                        warn!(origin = %port_ref.origin, error = %err, "metadata query failed");
                        if matches!(
                            err.downcast_ref::<ResolveError>(),
                            Some(ResolveError::PortNotFound { .. })
                        ) {
                            state.set(Flag::NOT_FOUND);
                        } else {
                            state.set(Flag::CORRUPT);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn query_wave(
        &self,
        frontier: Vec<(PortRef, Arc<Port>)>,
    ) -> Vec<(PortRef, Arc<Port>, Result<QueriedMetadata>)> {
        let (work_tx, work_rx) = flume::unbounded();
        let (result_tx, result_rx) = flume::unbounded();

        let total = frontier.len();
        for item in frontier {
            work_tx.send(item).expect("receiver alive");
        }
        drop(work_tx);

        let concurrency = self.config.resolver_parallelism.max(1);
        let workers = (0..concurrency).map(|_| {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            let config = Arc::clone(&self.config);
            let ports_tree = self.config.ports_tree.clone();
            tokio::spawn(async move {
                while let Ok((port_ref, port)) = work_rx.recv_async().await {
                    let port_dir = match ports_tree
                        .try_join_dir(format!("{}/{}", port.category, port.name))
                    {
                        Ok(dir) => dir,
                        Err(err) => {
                            let _ = result_tx.send((port_ref, port, Err(err)));
                            continue;
                        }
                    };
                    let metadata = query_metadata(&port_ref, &port_dir, &config).await;
                    trace!(origin = %port_ref.origin, ok = metadata.is_ok(), "queried port metadata");
                    if result_tx.send((port_ref, port, metadata)).is_err() {
                        return;
                    }
                }
            })
        });
        drop(result_tx);

        futures::future::join_all(workers).await;

        let mut results = Vec::with_capacity(total);
        while let Ok(item) = result_rx.try_recv() {
            results.push(item);
        }
        results
    }

    fn populate(&self, port: &Arc<Port>, state: &Arc<crate::graph::BuildState>, meta: &QueriedMetadata) {
        port.set_version(meta.version.clone());
        port.set_pkg_file_name(meta.pkg_file_name.clone());
        for kind in DepKind::ALL {
            port.set_raw_depends(kind, meta.raw_for(kind).to_string());
        }
        if !meta.ignore.is_empty() {
            state.set(Flag::NO_BUILD_IGNORE);
            state.set_ignore_reason(meta.ignore.clone());
        }
    }

    /// Pass 2: wire bidirectional edges for every port's parsed
    /// dependency strings.
    fn link(&self) {
        for port in self.packages.all() {
            for kind in DepKind::ALL {
                let raw = port.raw_depends(kind);
                for dep_ref in parse_depends(&raw) {
                    if let Some(dep_port) = self.packages.find(&dep_ref.key()) {
                        Port::link(&port, &dep_port, kind);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::path::AbsDirPath;

    fn tree() -> AbsDirPath {
        AbsDirPath::try_from(std::path::PathBuf::from("/xports")).unwrap()
    }

    #[test]
    fn parses_bare_origin() {
        let r = parse_spec("games/foo", &tree()).unwrap();
        assert_eq!(r.origin, "games/foo");
        assert_eq!(r.flavor, "");
    }

    #[test]
    fn parses_origin_with_flavor() {
        let r = parse_spec("lang/python@py311", &tree()).unwrap();
        assert_eq!(r.origin, "lang/python");
        assert_eq!(r.flavor, "py311");
    }

    #[test]
    fn parses_absolute_path_under_tree() {
        let r = parse_spec("/xports/games/foo", &tree()).unwrap();
        assert_eq!(r.origin, "games/foo");
    }

    #[test]
    fn rejects_malformed_spec() {
        assert!(parse_spec("not-a-valid-spec", &tree()).is_err());
        assert!(parse_spec("", &tree()).is_err());
    }

    #[test]
    fn extracts_dependency_tokens() {
        let deps = parse_depends("gmake>=4.2.1:devel/gmake pkgconf>=1:devel/pkgconf@flavor1");
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[0].origin, "devel/gmake");
        assert_eq!(deps[1].origin, "devel/pkgconf");
        assert_eq!(deps[1].flavor, "flavor1");
    }

    #[test]
    fn ignores_malformed_dependency_tokens() {
        let deps = parse_depends("no-colon-here");
        assert!(deps.is_empty());
    }
}
