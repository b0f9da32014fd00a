use color_eyre::Result;
use portbuilder::{config::Config, orchestrator::Orchestrator};
use tracing::instrument;

#[instrument(skip(config))]
pub async fn exec(config: &Config) -> Result<()> {
    let cleaned = Orchestrator::cleanup_stale(config).await?;
    if cleaned.is_empty() {
        println!("No stale sandboxes found.");
    } else {
        for sandbox in &cleaned {
            println!("Unmounted stale sandbox {sandbox}");
        }
    }
    Ok(())
}
