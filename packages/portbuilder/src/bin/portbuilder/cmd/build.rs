use clap::Args;
use color_eyre::{Result, eyre::Context as _};
use portbuilder::{
    config::Config,
    orchestrator::{Orchestrator, StatsSnapshot},
    store::BuildStore,
};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

#[derive(Clone, Debug, Args)]
pub struct Options {
    /// Port specifications, e.g. `devel/cmake` or `ports-mgmt/pkg@default`.
    #[arg(required = true)]
    pub ports: Vec<String>,
}

/// Runs a build to completion (or until `cancellation` fires), always
/// letting the orchestrator's own teardown finish before returning so a
/// SIGINT never leaves a worker sandbox mounted.
#[instrument(skip(config, cancellation))]
pub async fn exec(
    config: &Config,
    options: Options,
    force: bool,
    cancellation: CancellationToken,
) -> Result<StatsSnapshot> {
    let store = BuildStore::open(&config.store_path)
        .await
        .context("open build store")?;
    let orchestrator = Orchestrator::new(config.clone(), store, cancellation);
    let stats = orchestrator
        .run(&options.ports, force)
        .await
        .context("run build")?;

    println!(
        "total {} success {} failed {} skipped {} ignored {} ({:.1}s)",
        stats.total,
        stats.success,
        stats.failed,
        stats.skipped,
        stats.ignored,
        stats.duration.as_secs_f64()
    );
    Ok(stats)
}
