//! The binary entrypoint for `portbuilder`.

use clap::{Parser, Subcommand, crate_version};
use color_eyre::{Result, eyre::Context as _};
use portbuilder::{
    config::{Config, ConfigOverrides},
    path::{AbsDirPath, AbsFilePath},
};
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use tracing_subscriber::util::SubscriberInitExt as _;

// Since this is a binary crate, we need to ensure these modules aren't pub
// so that they can correctly warn about dead code:
// https://github.com/rust-lang/rust/issues/74970
//
// Relatedly, in this file specifically nothing should be `pub`.
mod cmd;
mod log;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Clone, Debug, Parser)]
#[command(
    name = "portbuilder",
    about = "Parallel source-package builder for BSD-family ports trees",
    version = crate_version!(),
)]
struct TopLevelFlags {
    #[command(subcommand)]
    command: Command,

    /// Root directory everything else (ports tree, build base, store) is
    /// nested under, unless overridden individually. Defaults to the
    /// platform's standard user cache directory.
    #[arg(long, global = true)]
    root: Option<std::path::PathBuf>,

    /// Optional TOML file layered onto the defaults before CLI flags.
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Name of the registered sandbox backend to use.
    #[arg(long, global = true)]
    backend: Option<String>,

    /// Maximum number of concurrent build workers.
    #[arg(long, global = true)]
    max_workers: Option<usize>,

    /// When to colorize output.
    #[arg(long, value_enum, default_value_t = log::WhenColor::Auto, global = true)]
    color: log::WhenColor,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// First-run preparation: directories, sandbox template, empty store.
    Init,

    /// Build one or more ports, skipping any whose fingerprint is unchanged.
    Build(cmd::build::Options),

    /// Build one or more ports, ignoring stored fingerprints.
    Force(cmd::build::Options),

    /// Read-only query of recorded build attempts.
    Status(cmd::status::Options),

    /// Destroy and recreate the build store.
    ResetDb,

    /// Best-effort teardown of leftover sandbox mounts from a crashed run.
    Cleanup,
}

#[instrument]
#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let top = TopLevelFlags::parse();
    log::make_logger(top.color).init();

    let config = load_config(&top).await.context("load configuration")?;

    let result = match top.command {
        Command::Init => cmd::init::exec(&config).await,
        Command::Build(options) => {
            run_build(&config, options, false).await.map(|_| ())
        }
        Command::Force(options) => {
            run_build(&config, options, true).await.map(|_| ())
        }
        Command::Status(options) => cmd::status::exec(&config, options).await,
        Command::ResetDb => cmd::reset_db::exec(&config).await,
        Command::Cleanup => cmd::cleanup::exec(&config).await,
    };

    result
}

/// Build a [`Config`], rooted at `--root` (or the platform default cache
/// directory), then layer an optional `--config` TOML file and finally
/// individual CLI flags on top, in that order.
async fn load_config(top: &TopLevelFlags) -> Result<Config> {
    let mut config = match &top.root {
        Some(root) => {
            let root = AbsDirPath::try_from(root.as_path()).context("--root must be absolute")?;
            Config::rooted_at(&root)?
        }
        None => Config::default(),
    };

    if let Some(path) = &top.config {
        let path = AbsFilePath::try_from(path.as_path()).context("--config must be absolute")?;
        let overrides = ConfigOverrides::from_toml_file(&path).await?;
        config = config.merge(overrides);
    }

    let flag_overrides = ConfigOverrides {
        backend: top.backend.clone(),
        max_workers: top.max_workers,
        ..Default::default()
    };
    Ok(config.merge(flag_overrides))
}

/// Runs a build under a SIGINT-aware cancellation token, propagating exit
/// code 130 to the shell the same way a shell-level SIGINT would.
async fn run_build(
    config: &Config,
    options: cmd::build::Options,
    force: bool,
) -> Result<portbuilder::orchestrator::StatsSnapshot> {
    let cancellation = CancellationToken::new();
    let sigint = tokio::spawn({
        let cancellation = cancellation.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            cancellation.cancel();
        }
    });

    let stats = cmd::build::exec(config, options, force, cancellation.clone()).await?;
    sigint.abort();

    if cancellation.is_cancelled() {
        std::process::exit(130);
    }
    if stats.failed > 0 {
        std::process::exit(1);
    }
    Ok(stats)
}
