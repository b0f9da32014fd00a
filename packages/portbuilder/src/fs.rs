//! Filesystem operations tailored to `portbuilder`.
//!
//! Inside this module, we refer to `std::fs` or `tokio::fs` by its fully
//! qualified path to make it maximally clear what we are using.

use std::{convert::identity, fmt::Debug as StdDebug, marker::PhantomData, sync::Arc};

use color_eyre::{Result, eyre::Context};
use derive_more::{Debug, Display};
use fslock::LockFile as FsLockFile;
use futures::{Stream, TryStreamExt};
use tap::{Pipe, TapFallible};
use tokio::{sync::Mutex, task::spawn_blocking};
use tracing::{error, instrument, trace};

use crate::path::{Abs, AbsDirPath, AbsFilePath, TypedPath};

/// The default level of concurrency used in `fs` operations that fan out
/// across many files (copying a port's `files/` subtree, walking a sandbox).
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Shared lock file on the file system.
///
/// Lock the file with [`LockFile::lock`]. Unlock it with [`LockFile::unlock`],
/// or by dropping the locked instance.
#[derive(Debug, Clone, Display)]
#[display("{path}")]
pub struct LockFile<State> {
    state: PhantomData<State>,
    path: AbsFilePath,
    inner: Arc<Mutex<FsLockFile>>,
}

/// The associated type's state is unlocked. Used for the typestate pattern.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Default)]
pub struct Unlocked;

/// The associated type's state is locked. Used for the typestate pattern.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Default)]
pub struct Locked;

impl LockFile<Unlocked> {
    /// Create a new instance at the provided path.
    pub async fn open(path: impl Into<AbsFilePath> + StdDebug) -> Result<Self> {
        let path = path.into();
        let (file, path) =
            spawn_blocking(move || FsLockFile::open(path.as_std_path()).map(|file| (file, path)))
                .await
                .context("join task")?
                .context("open lock file")?;
        Ok(Self {
            state: PhantomData,
            inner: Arc::new(Mutex::new(file)),
            path,
        })
    }

    /// Lock the lockfile.
    #[instrument(skip_all, fields(%self))]
    pub async fn lock(self) -> Result<LockFile<Locked>> {
        spawn_blocking(move || {
            {
                // fslock::LockFile can panic if the handle is already locked,
                // but typestate means there's no way to call this on an
                // already-locked handle.
                let mut inner = self.inner.blocking_lock();
                inner.lock().context("lock file")?;
            }
            Ok(LockFile {
                state: PhantomData,
                inner: self.inner,
                path: self.path,
            })
        })
        .await
        .context("join task")?
        .tap_ok(|f| trace!(path = ?f.path, "locked file"))
    }
}

impl LockFile<Locked> {
    /// Unlock the lockfile.
    #[instrument(skip_all, fields(%self))]
    pub async fn unlock(self) -> Result<LockFile<Unlocked>> {
        spawn_blocking(move || -> Result<_> {
            {
                let mut inner = self.inner.blocking_lock();
                inner.unlock().context("unlock file")?;
            }
            Ok(LockFile {
                state: PhantomData,
                inner: self.inner,
                path: self.path,
            })
        })
        .await
        .context("join task")?
        .tap_ok(|f| trace!(path = ?f.path, "unlocked file"))
    }
}

/// Determine the canonical data directory for the current user, if possible.
///
/// ## Strategy
///
/// - Linux: `$XDG_DATA_HOME/portbuilder`
/// - macOS: `$HOME/Library/Application Support/com.portbuilder.portbuilder`
/// - Windows: `%LOCALAPPDATA%\portbuilder`
///
/// Falls back to `$HOME/.local/share/portbuilder` if the platform directories
/// crate cannot determine a location.
#[instrument]
pub async fn user_data_dir() -> Result<AbsDirPath> {
    let dirs =
        spawn_blocking(|| directories::ProjectDirs::from("com", "portbuilder", "portbuilder"))
            .await
            .expect("join task");

    let base = if let Some(dirs) = dirs {
        dirs.data_dir().to_path_buf()
    } else {
        directories::UserDirs::new()
            .map(|d| d.home_dir().to_path_buf())
            .context("determine user home directory")?
            .join(".local")
            .join("share")
            .join("portbuilder")
    };

    base.pipe(AbsDirPath::try_from)
        .tap_ok(|dir| trace!(?dir, "user data dir"))
}

/// Create the directory and all its parents, if they don't already exist.
#[instrument]
pub async fn create_dir_all(dir: &AbsDirPath) -> Result<()> {
    tokio::fs::create_dir_all(dir.as_std_path())
        .await
        .with_context(|| format!("create dir: {dir:?}"))
        .tap_ok(|_| trace!(?dir, "create directory"))
}

/// Recursively copy the contents of `src` to `dst`.
///
/// Returns the total number of bytes copied across all files.
/// Equivalent to [`copy_dir_with_concurrency`] with [`DEFAULT_CONCURRENCY`].
#[instrument]
pub async fn copy_dir(src: &AbsDirPath, dst: &AbsDirPath) -> Result<u64> {
    copy_dir_with_concurrency(DEFAULT_CONCURRENCY, src, dst).await
}

/// Walk files in a directory recursively, in lexicographic order by full path.
///
/// Only emits regular files; symbolic links and directories are not emitted.
#[instrument]
pub fn walk_files(root: &AbsDirPath) -> impl Stream<Item = Result<AbsFilePath>> + Unpin {
    let (tx, rx) = flume::bounded::<Result<AbsFilePath>>(0);
    let root = root.clone();

    spawn_blocking(move || {
        let mut entries: Vec<_> = match jwalk::WalkDir::new(root.as_std_path())
            .sort(true)
            .skip_hidden(false)
            .into_iter()
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context(|| format!("walk files in {root:?}"))
        {
            Ok(entries) => entries,
            Err(err) => {
                let _ = tx.send(Err(err));
                return;
            }
        };
        entries.retain(|e| e.file_type().is_file());

        for entry in entries {
            let path = match AbsFilePath::try_from(entry.path().as_path()) {
                Ok(path) => path,
                Err(err) => {
                    if tx.send(Err(err)).is_err() {
                        return;
                    }
                    continue;
                }
            };
            if tx.send(Ok(path)).is_err() {
                return;
            }
        }
    });

    rx.into_stream().pipe(Box::pin)
}

/// Report whether the provided directory is empty.
///
/// For the purpose of this function, the directory is empty if it has no
/// regular files.
#[instrument]
pub async fn is_dir_empty(path: &AbsDirPath) -> Result<bool> {
    walk_files(path)
        .try_any(|_| async { true })
        .await
        .map(|found| !found)
}

/// Recursively copy the contents of `src` to `dst` with specified concurrency.
///
/// Returns the total number of bytes copied across all files.
#[instrument]
pub async fn copy_dir_with_concurrency(
    concurrency: usize,
    src: &AbsDirPath,
    dst: &AbsDirPath,
) -> Result<u64> {
    let src = src.clone();
    let dst = dst.clone();
    walk_files(&src)
        .map_ok(|src_file| {
            let src = src.clone();
            let dst = dst.clone();
            async move {
                let rel = src_file
                    .as_std_path()
                    .strip_prefix(src.as_std_path())
                    .with_context(|| format!("make {src_file:?} relative to {src:?}"))?;
                let dst_file = AbsFilePath::try_from(dst.as_std_path().join(rel))
                    .context("build destination path")?;
                copy_file(&src_file, &dst_file)
                    .await
                    .with_context(|| format!("copy {src_file:?} to {dst_file:?}"))
            }
        })
        .try_buffer_unordered(concurrency)
        .try_fold(0u64, |total, copied| async move { Ok(total + copied) })
        .await
}

/// Copy the file from `src` to `dst`.
///
/// Returns the total number of bytes copied.
#[instrument]
pub async fn copy_file(src: &AbsFilePath, dst: &AbsFilePath) -> Result<u64> {
    if let Some(parent) = dst.as_std_path().parent() {
        create_dir_all(&AbsDirPath::try_from(parent).context("parent as dir")?)
            .await
            .context("create parent directory")?;
    }
    let bytes = tokio::fs::copy(src.as_std_path(), dst.as_std_path())
        .await
        .context("copy file")?;
    trace!(?src, ?dst, ?bytes, "copy file");
    Ok(bytes)
}

/// Buffer the file content from disk.
#[instrument]
pub async fn read_buffered(path: &AbsFilePath) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path.as_std_path()).await {
        Ok(buf) => {
            trace!(?path, bytes = buf.len(), "read file");
            Ok(Some(buf))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("read file: {path:?}")),
    }
}

/// Buffer the file content from disk and parse it as UTF8.
#[instrument]
pub async fn read_buffered_utf8(path: &AbsFilePath) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path.as_std_path()).await {
        Ok(buf) => {
            trace!(?path, bytes = buf.len(), "read file as string");
            Ok(Some(buf))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("read file: {path:?}")),
    }
}

/// Write the provided file content to disk.
#[instrument(skip(content))]
pub async fn write(path: &AbsFilePath, content: impl AsRef<[u8]>) -> Result<()> {
    let content = content.as_ref();
    if let Some(parent) = path.as_std_path().parent() {
        create_dir_all(&AbsDirPath::try_from(parent).context("parent as dir")?)
            .await
            .context("create parent directory")?;
    }
    tokio::fs::write(path.as_std_path(), content)
        .await
        .with_context(|| format!("write file: {path:?}"))
        .tap_ok(|_| trace!(?path, bytes = content.len(), "write file"))
}

/// Remove a file. No-op (success) if the file does not exist.
#[instrument]
pub async fn remove_file(path: &AbsFilePath) -> Result<()> {
    match tokio::fs::remove_file(path.as_std_path()).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).context(format!("remove file: {path:?}")),
    }
    .tap_ok(|_| trace!(?path, "remove file"))
}

/// Rename a file or folder, overwriting the destination if it already exists.
#[instrument]
pub async fn rename<T>(src: &TypedPath<Abs, T>, dst: &TypedPath<Abs, T>) -> Result<()> {
    tokio::fs::rename(src.as_std_path(), dst.as_std_path())
        .await
        .with_context(|| format!("rename file: {src:?} -> {dst:?}"))
        .tap_ok(|_| trace!(?src, ?dst, "rename file"))
}

/// Remove the directory and all its contents. No-op if it does not exist.
#[instrument]
pub async fn remove_dir_all(path: &AbsDirPath) -> Result<()> {
    match tokio::fs::remove_dir_all(path.as_std_path()).await {
        Ok(()) => {
            trace!(?path, "removed directory");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            trace!(?path, "removed directory (already removed)");
            Ok(())
        }
        Err(err) => Err(err).context(format!("remove directory: {path:?}")),
    }
}

/// Get the standard metadata for the file, or `None` if it doesn't exist.
#[instrument]
pub async fn metadata(
    path: impl AsRef<std::path::Path> + StdDebug,
) -> Result<Option<std::fs::Metadata>> {
    let path = path.as_ref();
    match tokio::fs::metadata(path).await {
        Ok(metadata) => Ok(Some(metadata)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("stat metadata: {path:?}")),
    }
}

/// Read the target of a symlink without following it.
#[instrument]
pub async fn read_link(path: impl AsRef<std::path::Path> + StdDebug) -> Result<std::path::PathBuf> {
    tokio::fs::read_link(path.as_ref())
        .await
        .with_context(|| format!("read link: {:?}", path.as_ref()))
}

/// Check whether the path exists.
///
/// Returns `false` if there is an error checking whether the path exists.
/// This check is prone to TOCTOU races; prefer operating on the path
/// directly and handling the not-found error where it matters.
#[instrument]
pub async fn exists(path: impl AsRef<std::path::Path> + StdDebug) -> bool {
    tokio::fs::try_exists(path).await.is_ok_and(identity)
}

/// Check whether the file at `path` is executable.
#[instrument]
pub async fn is_executable(path: impl AsRef<std::path::Path> + StdDebug) -> bool {
    let path = path.as_ref().to_path_buf();
    spawn_blocking(move || is_executable::is_executable(path))
        .await
        .expect("join task")
}

/// Return whether the path represents a directory.
#[instrument]
pub async fn is_dir(path: impl AsRef<std::path::Path> + StdDebug) -> bool {
    metadata(path)
        .await
        .is_ok_and(|m| m.is_some_and(|m| m.is_dir()))
}

/// Return whether the path represents a normal file.
#[instrument]
pub async fn is_file(path: impl AsRef<std::path::Path> + StdDebug) -> bool {
    metadata(path)
        .await
        .is_ok_and(|m| m.is_some_and(|m| m.is_file()))
}

/// Return whether the path represents a symlink (without following it).
#[instrument]
pub async fn is_symlink(path: impl AsRef<std::path::Path> + StdDebug) -> bool {
    let path = path.as_ref().to_path_buf();
    spawn_blocking(move || {
        std::fs::symlink_metadata(&path).is_ok_and(|m| m.file_type().is_symlink())
    })
    .await
    .unwrap_or_else(|err| {
        error!(?err, "join task");
        false
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn writes_and_reads_back() {
        let dir = tempdir().unwrap();
        let path = AbsFilePath::try_from(dir.path().join("a/b/c.txt")).unwrap();
        write(&path, b"hello").await.unwrap();
        let content = read_buffered(&path).await.unwrap().unwrap();
        assert_eq!(content, b"hello");
    }

    #[tokio::test]
    async fn missing_file_reads_as_none() {
        let dir = tempdir().unwrap();
        let path = AbsFilePath::try_from(dir.path().join("missing.txt")).unwrap();
        assert_eq!(read_buffered(&path).await.unwrap(), None);
    }

    #[tokio::test]
    async fn walk_files_finds_nested_entries() {
        let dir = tempdir().unwrap();
        let root = AbsDirPath::try_from(dir.path().to_path_buf()).unwrap();
        write(
            &AbsFilePath::try_from(dir.path().join("a.txt")).unwrap(),
            b"1",
        )
        .await
        .unwrap();
        write(
            &AbsFilePath::try_from(dir.path().join("sub/b.txt")).unwrap(),
            b"2",
        )
        .await
        .unwrap();

        let mut found: Vec<_> = walk_files(&root)
            .try_collect::<Vec<_>>()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.as_std_path().to_path_buf())
            .collect();
        found.sort();
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn copy_dir_copies_nested_contents() {
        let src_dir = tempdir().unwrap();
        let dst_dir = tempdir().unwrap();
        write(
            &AbsFilePath::try_from(src_dir.path().join("sub/file.txt")).unwrap(),
            b"payload",
        )
        .await
        .unwrap();

        let src = AbsDirPath::try_from(src_dir.path().to_path_buf()).unwrap();
        let dst = AbsDirPath::try_from(dst_dir.path().to_path_buf()).unwrap();
        let bytes = copy_dir(&src, &dst).await.unwrap();
        assert_eq!(bytes, 7);

        let copied = read_buffered(&AbsFilePath::try_from(dst_dir.path().join("sub/file.txt")).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(copied, b"payload");
    }
}
