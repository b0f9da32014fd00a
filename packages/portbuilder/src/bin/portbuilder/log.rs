use clap::ValueEnum;
use tracing_error::ErrorLayer;
use tracing_subscriber::{Layer as _, layer::SubscriberExt as _};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum WhenColor {
    Always,
    Never,
    Auto,
}

/// Builds (but does not install) the process subscriber: a `fmt` layer
/// filtered by `PORTBUILDER_LOG`, composed with `tracing-error` so
/// `color-eyre` reports carry a span trace. The library crate never does
/// this itself; only the binary owns the decision.
pub fn make_logger(color: WhenColor) -> impl tracing::Subscriber {
    tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with({
            let layer = tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(true);
            match color {
                WhenColor::Always => layer.with_ansi(true),
                WhenColor::Never => layer.with_ansi(false),
                WhenColor::Auto => layer,
            }
            .with_filter(
                tracing_subscriber::EnvFilter::builder()
                    .with_env_var("PORTBUILDER_LOG")
                    .from_env_lossy(),
            )
        })
}
