use color_eyre::{Result, eyre::Context as _};
use portbuilder::{config::Config, fs, path::AbsFilePath, store::BuildStore};
use tracing::{info, instrument};

/// Host files copied into the fresh sandbox template's `/etc`, mirroring
/// the minimal userland a chrooted build phase needs to resolve users,
/// groups, and the dynamic linker.
const TEMPLATE_FILES: &[&str] = &[
    "etc/resolv.conf",
    "etc/passwd",
    "etc/group",
    "etc/master.passwd",
    "etc/spwd.db",
    "etc/pwd.db",
    "var/run/ld-elf.so.hints",
];

#[instrument(skip(config))]
pub async fn exec(config: &Config) -> Result<()> {
    for dir in [
        &config.ports_tree,
        &config.distfiles_dir,
        &config.packages_dir,
        &config.build_base,
        &config.template_dir,
        &config.log_dir,
    ] {
        fs::create_dir_all(dir).await.context("create directory")?;
    }

    let mut copied = 0;
    for rel in TEMPLATE_FILES {
        let Some((dir, file)) = rel.rsplit_once('/') else {
            continue;
        };
        let src = std::path::Path::new("/").join(dir).join(file);
        if !fs::exists(&src).await {
            continue;
        }
        let src = AbsFilePath::try_from(src.as_path()).context("host template source path")?;
        let dst = config
            .template_dir
            .try_join_file(format!("{dir}/{file}"))
            .context("template destination path")?;
        fs::copy_file(&src, &dst).await.context("copy template file")?;
        copied += 1;
    }
    info!(copied, "seeded sandbox template from host /etc");

    let mut store = BuildStore::open(&config.store_path)
        .await
        .context("create empty build store")?;
    store.close().await.context("close build store")?;

    println!("Initialized portbuilder under {:?}", config.build_base);
    Ok(())
}
