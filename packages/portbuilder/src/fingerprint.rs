//! Content fingerprint for a port directory.
//!
//! Produces a 32-bit CRC (IEEE polynomial, the same variant `zip`/`gzip`
//! use) over a deterministic subset of a port's files, so that two runs
//! over byte-identical sources always agree and any relevant change flips
//! the value.

use std::path::Path;

use color_eyre::{Result, eyre::Context};
use crc32fast::Hasher;
use tracing::{instrument, trace};

use crate::{error::FingerprintError, path::AbsDirPath};

/// File extensions (including the empty extension, which catches
/// `Makefile`) whose content is folded into the fingerprint.
const HASHED_EXTENSIONS: [&str; 3] = ["", "mk", "in"];

/// Basenames that are always hashed regardless of extension.
const HASHED_BASENAMES: [&str; 4] = ["Makefile", "distinfo", "pkg-descr", "pkg-plist"];

/// Compute the fingerprint of a port directory.
///
/// Entries are visited in lexicographic order of basename. Each hashed
/// file contributes its basename followed by a null byte, then its full
/// content (or its symlink target, for symlinks), so renames are
/// detectable even when the content itself is unchanged. The `files/`
/// subdirectory (patches, extra distfiles) is recursed into using the
/// same rule.
#[instrument]
pub async fn compute(port_dir: &AbsDirPath) -> Result<u32> {
    let port_dir = port_dir.clone();
    tokio::task::spawn_blocking(move || compute_sync(port_dir.as_std_path()))
        .await
        .context("join task")?
        .map_err(color_eyre::Report::from)
}

fn compute_sync(port_dir: &Path) -> std::result::Result<u32, FingerprintError> {
    let mut hasher = Hasher::new();
    hash_dir(port_dir, &mut hasher)?;

    let files_dir = port_dir.join("files");
    if files_dir.is_dir() {
        hash_dir(&files_dir, &mut hasher)?;
    }

    let crc = hasher.finalize();
    trace!(?port_dir, crc, "computed fingerprint");
    Ok(crc)
}

fn hash_dir(dir: &Path, hasher: &mut Hasher) -> std::result::Result<(), FingerprintError> {
    let fprint_err = |path: &Path, cause: std::io::Error| FingerprintError {
        path: path.to_string_lossy().to_string(),
        cause: cause.to_string(),
    };

    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| fprint_err(dir, e))?
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| fprint_err(dir, e))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let basename = entry.file_name();
        let basename = basename.to_string_lossy();

        let file_type = entry.file_type().map_err(|e| fprint_err(&path, e))?;

        if file_type.is_symlink() {
            if !should_hash(&basename) {
                continue;
            }
            let target = std::fs::read_link(&path).map_err(|e| fprint_err(&path, e))?;
            hash_entry(hasher, &basename, target.to_string_lossy().as_bytes());
            continue;
        }

        if !file_type.is_file() {
            continue;
        }
        if !should_hash(&basename) {
            continue;
        }

        let content = std::fs::read(&path).map_err(|e| fprint_err(&path, e))?;
        hash_entry(hasher, &basename, &content);
    }

    Ok(())
}

fn should_hash(basename: &str) -> bool {
    if HASHED_BASENAMES.contains(&basename) {
        return true;
    }
    match basename.rsplit_once('.') {
        Some((_, ext)) => HASHED_EXTENSIONS.contains(&ext),
        None => HASHED_EXTENSIONS.contains(&""),
    }
}

fn hash_entry(hasher: &mut Hasher, basename: &str, content: &[u8]) {
    hasher.update(basename.as_bytes());
    hasher.update(&[0u8]);
    hasher.update(content);
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::fs;

    #[tokio::test]
    async fn identical_content_yields_identical_fingerprint() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        for dir in [&dir_a, &dir_b] {
            fs::write(
                &crate::path::AbsFilePath::try_from(dir.path().join("Makefile")).unwrap(),
                b"PORTNAME=\tfoo\n",
            )
            .await
            .unwrap();
        }

        let a = compute(&AbsDirPath::try_from(dir_a.path().to_path_buf()).unwrap())
            .await
            .unwrap();
        let b = compute(&AbsDirPath::try_from(dir_b.path().to_path_buf()).unwrap())
            .await
            .unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn changed_content_yields_different_fingerprint() {
        let dir = tempdir().unwrap();
        let makefile = crate::path::AbsFilePath::try_from(dir.path().join("Makefile")).unwrap();
        fs::write(&makefile, b"PORTNAME=\tfoo\n").await.unwrap();
        let before = compute(&AbsDirPath::try_from(dir.path().to_path_buf()).unwrap())
            .await
            .unwrap();

        fs::write(&makefile, b"PORTNAME=\tbar\n").await.unwrap();
        let after = compute(&AbsDirPath::try_from(dir.path().to_path_buf()).unwrap())
            .await
            .unwrap();

        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn ignores_unrelated_files() {
        let dir = tempdir().unwrap();
        fs::write(
            &crate::path::AbsFilePath::try_from(dir.path().join("Makefile")).unwrap(),
            b"PORTNAME=\tfoo\n",
        )
        .await
        .unwrap();
        let before = compute(&AbsDirPath::try_from(dir.path().to_path_buf()).unwrap())
            .await
            .unwrap();

        fs::write(
            &crate::path::AbsFilePath::try_from(dir.path().join("README.txt")).unwrap(),
            b"unrelated scratch notes",
        )
        .await
        .unwrap();
        let after = compute(&AbsDirPath::try_from(dir.path().to_path_buf()).unwrap())
            .await
            .unwrap();

        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn rename_changes_fingerprint_even_with_same_content() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        fs::write(
            &crate::path::AbsFilePath::try_from(dir_a.path().join("distinfo")).unwrap(),
            b"SIZE (foo.tar.gz) = 1\n",
        )
        .await
        .unwrap();
        fs::write(
            &crate::path::AbsFilePath::try_from(dir_b.path().join("pkg-descr")).unwrap(),
            b"SIZE (foo.tar.gz) = 1\n",
        )
        .await
        .unwrap();

        let a = compute(&AbsDirPath::try_from(dir_a.path().to_path_buf()).unwrap())
            .await
            .unwrap();
        let b = compute(&AbsDirPath::try_from(dir_b.path().to_path_buf()).unwrap())
            .await
            .unwrap();
        assert_ne!(a, b);
    }
}
