use clap::Args;
use color_eyre::{Result, eyre::Context as _};
use portbuilder::{config::Config, store::BuildStore};
use tracing::instrument;

#[derive(Clone, Debug, Args)]
pub struct Options {
    /// Restrict the query to one port origin. Without this, the most
    /// recent attempts across every origin are shown.
    pub port: Option<String>,

    /// Maximum number of records to show when no port is given.
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[instrument(skip(config))]
pub async fn exec(config: &Config, options: Options) -> Result<()> {
    let mut store = BuildStore::open(&config.store_path)
        .await
        .context("open build store")?;

    let records = match &options.port {
        Some(origin) => store
            .records_for_origin(origin)
            .await
            .context("query records for origin")?,
        None => store
            .recent_records(options.limit)
            .await
            .context("query recent records")?,
    };

    if records.is_empty() {
        println!("No recorded build attempts.");
    }
    for record in &records {
        println!(
            "{} {}@{} {} start={} end={}",
            record.uuid, record.origin, record.version, record.status, record.start_time, record.end_time
        );
    }

    store.close().await.context("close build store")
}
