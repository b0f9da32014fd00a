//! Path types tailored to `portbuilder`.
//!
//! ## Rationale
//!
//! Nearly every path in this crate is either "absolute, rooted somewhere
//! under a sandbox or the ports tree" or "relative, to be joined onto one
//! of those roots". Plain `PathBuf` doesn't distinguish the two, so it's
//! easy to accidentally join two absolute paths or pass a relative path to
//! an API that assumes an absolute one. `TypedPath<Base, Type>` encodes
//! that distinction (and file-vs-directory intent) in the type.
//!
//! This is a hand-written, simplified sibling of the macro-generated path
//! module used elsewhere in the corpus: no `duplicate`/`paste` expansion,
//! just the methods this crate actually calls.
//!
//! ## Path Normalization
//!
//! This type does NOT normalize paths. They are stored exactly as provided.

use std::{
    any::type_name,
    borrow::Cow,
    ffi::OsStr,
    marker::PhantomData,
    path::{Path, PathBuf},
};

use color_eyre::{
    Report, Result,
    eyre::{Context, bail},
};
use derive_more::Display;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub type RelFilePath = TypedPath<Rel, File>;
pub type RelDirPath = TypedPath<Rel, Dir>;
pub type AbsFilePath = TypedPath<Abs, File>;
pub type AbsDirPath = TypedPath<Abs, Dir>;

/// An absolute path begins from the root of the filesystem.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Abs;

/// A relative path describes steps from an unspecified starting point.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Rel;

/// A directory contains other filesystem entities.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Dir;

/// A file contains data.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct File;

/// A location on the filesystem according to the type modifiers.
///
/// This type is about _intent_; it does not validate that the path exists
/// or is actually the claimed type (that's inherently racy - see
/// [`TypedPath::exists`] if you want a best-effort check anyway).
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Display)]
#[display("{}", self.inner.display())]
pub struct TypedPath<Base, Type> {
    base: PhantomData<Base>,
    ty: PhantomData<Type>,
    inner: PathBuf,
}

impl<B, T> TypedPath<B, T> {
    /// View the path as a standard path.
    pub fn as_std_path(&self) -> &Path {
        &self.inner
    }

    /// View the path as a lossily-converted string.
    pub fn as_str_lossy(&self) -> Cow<'_, str> {
        self.inner.to_string_lossy()
    }

    /// View the path as an OS string.
    pub fn as_os_str(&self) -> &OsStr {
        self.inner.as_os_str()
    }

    /// Returns the final component of the path, if any.
    pub fn file_name(&self) -> Option<&OsStr> {
        self.inner.file_name()
    }

    fn new_unchecked(inner: impl Into<PathBuf>) -> Self {
        Self {
            base: PhantomData,
            ty: PhantomData,
            inner: inner.into(),
        }
    }
}

impl<B: Validator, T: Validator> TryFrom<PathBuf> for TypedPath<B, T> {
    type Error = Report;

    fn try_from(value: PathBuf) -> Result<Self, Self::Error> {
        B::validate(&value).with_context(|| format!("validate base {:?}", B::type_name()))?;
        T::validate(&value).with_context(|| format!("validate type {:?}", T::type_name()))?;
        Ok(Self::new_unchecked(value))
    }
}

impl<B: Validator, T: Validator> TryFrom<&str> for TypedPath<B, T> {
    type Error = Report;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(PathBuf::from(value))
    }
}

impl<B: Validator, T: Validator> TryFrom<&Path> for TypedPath<B, T> {
    type Error = Report;

    fn try_from(value: &Path) -> Result<Self, Self::Error> {
        Self::try_from(value.to_path_buf())
    }
}

impl<B, T> From<TypedPath<B, T>> for PathBuf {
    fn from(value: TypedPath<B, T>) -> Self {
        value.inner
    }
}

impl<B, T> From<&TypedPath<B, T>> for PathBuf {
    fn from(value: &TypedPath<B, T>) -> Self {
        value.inner.clone()
    }
}

impl TypedPath<Abs, Dir> {
    /// Get the current working directory for the process.
    pub fn current() -> Result<TypedPath<Abs, Dir>> {
        let cwd = std::env::current_dir().context("get current dir")?;
        Self::try_from(cwd)
    }

    /// Join a relative directory onto this one.
    pub fn join_dir(&self, other: &TypedPath<Rel, Dir>) -> TypedPath<Abs, Dir> {
        TypedPath::new_unchecked(self.inner.join(&other.inner))
    }

    /// Join a relative file onto this one.
    pub fn join_file(&self, other: &TypedPath<Rel, File>) -> TypedPath<Abs, File> {
        TypedPath::new_unchecked(self.inner.join(&other.inner))
    }

    /// Join a bare string segment as a subdirectory.
    pub fn try_join_dir(&self, segment: impl AsRef<str>) -> Result<TypedPath<Abs, Dir>> {
        TypedPath::try_from(self.inner.join(segment.as_ref()))
    }

    /// Join a bare string segment as a file.
    pub fn try_join_file(&self, segment: impl AsRef<str>) -> Result<TypedPath<Abs, File>> {
        TypedPath::try_from(self.inner.join(segment.as_ref()))
    }
}

impl<'de, B: Validator, T: Validator> Deserialize<'de> for TypedPath<B, T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let p = PathBuf::deserialize(deserializer)?;
        Self::try_from(p).map_err(serde::de::Error::custom)
    }
}

impl<B, T> Serialize for TypedPath<B, T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.inner.serialize(serializer)
    }
}

impl<B, T> std::fmt::Debug for TypedPath<B, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TypedPath::<{}, {}>({:?})",
            type_name::<B>(),
            type_name::<T>(),
            self.inner
        )
    }
}

/// Validates the `Base`/`Type` constraints for a [`TypedPath`].
pub trait Validator {
    fn validate(path: &Path) -> Result<()>;

    fn type_name() -> &'static str {
        core::any::type_name::<Self>()
    }
}

impl Validator for Rel {
    fn validate(path: &Path) -> Result<()> {
        if !path.is_relative() {
            bail!("path is not relative: {path:?}");
        }
        Ok(())
    }
}

impl Validator for Abs {
    fn validate(path: &Path) -> Result<()> {
        if !path.is_absolute() {
            bail!("path is not absolute: {path:?}");
        }
        Ok(())
    }
}

impl Validator for Dir {
    fn validate(_: &Path) -> Result<()> {
        Ok(())
    }
}

impl Validator for File {
    fn validate(_: &Path) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn rejects_relative_path_as_absolute() {
        let err = AbsDirPath::try_from(PathBuf::from("relative/dir"));
        assert!(err.is_err());
    }

    #[test]
    fn rejects_absolute_path_as_relative() {
        let err = RelDirPath::try_from(PathBuf::from("/absolute/dir"));
        assert!(err.is_err());
    }

    #[test]
    fn joins_relative_onto_absolute() {
        let base = AbsDirPath::try_from(PathBuf::from("/xports")).unwrap();
        let rel = RelDirPath::try_from("games/foo").unwrap();
        let joined = base.join_dir(&rel);
        assert_eq!(joined.as_std_path(), Path::new("/xports/games/foo"));
    }
}
