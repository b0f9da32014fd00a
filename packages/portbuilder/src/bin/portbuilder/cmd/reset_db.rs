use color_eyre::{Result, eyre::Context as _};
use portbuilder::{config::Config, fs, path::AbsFilePath, store::BuildStore};
use tracing::{info, instrument};

#[instrument(skip(config))]
pub async fn exec(config: &Config) -> Result<()> {
    let lock_path = {
        let mut p = config.store_path.as_std_path().as_os_str().to_owned();
        p.push(".lock");
        AbsFilePath::try_from(std::path::Path::new(&p)).context("build lock path")?
    };
    fs::remove_file(&config.store_path)
        .await
        .context("remove existing build store")?;
    fs::remove_file(&lock_path)
        .await
        .context("remove stale store lock")?;
    let mut store = BuildStore::open(&config.store_path)
        .await
        .context("recreate build store")?;
    store.close().await.context("close build store")?;
    info!(path = ?config.store_path, "build store reset");
    println!("Build store reset at {:?}", config.store_path);
    Ok(())
}
