//! Fixture discovery.
//!
//! Fixtures are opaque payload files found by walking a directory tree.
//! The walk does not follow symlinks and skips symlink entries; entries are
//! visited sorted by file name so the resulting order, and thereby the file
//! numbering on the wire, is stable across platforms.

use std::{
    fs,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use walkdir::WalkDir;

/// A single fixture file location.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FixturePath(PathBuf);

impl FixturePath {
    /// Wrap a path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// The underlying path.
    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl AsRef<Path> for FixturePath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

/// An ordered, immutable set of fixture files.
///
/// Cloning is cheap; the paths are shared.
#[derive(Debug, Clone, Default)]
pub struct FixtureSet {
    paths: Arc<[FixturePath]>,
}

impl FixtureSet {
    /// Number of fixtures.
    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Whether the set has no fixtures.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Fixture at `index`, in enumeration order.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&FixturePath> {
        self.paths.get(index)
    }

    /// Iterate in enumeration order.
    pub fn iter(&self) -> std::slice::Iter<'_, FixturePath> {
        self.paths.iter()
    }
}

impl FromIterator<FixturePath> for FixtureSet {
    fn from_iter<I: IntoIterator<Item = FixturePath>>(iter: I) -> Self {
        Self {
            paths: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a FixtureSet {
    type Item = &'a FixturePath;
    type IntoIter = std::slice::Iter<'a, FixturePath>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Fixture root could not be walked.
#[derive(Debug, thiserror::Error)]
pub enum EnumerationError {
    /// The root could not be inspected.
    #[error("cannot read fixture root {}: {source}", .root.display())]
    Root {
        /// The configured root.
        root: PathBuf,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },

    /// The root exists but is not a directory.
    #[error("fixture root {} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    /// An entry below the root could not be read.
    #[error("failed to walk fixtures: {0}")]
    Walk(#[from] walkdir::Error),
}

/// Recursively list every regular file below `root`.
///
/// # Errors
///
/// Fails if `root` is missing, unreadable or not a directory, or if any
/// entry below it cannot be read. No partial set is returned.
pub fn enumerate(root: impl AsRef<Path>) -> Result<FixtureSet, EnumerationError> {
    let root = root.as_ref();

    let meta = fs::metadata(root).map_err(|source| EnumerationError::Root {
        root: root.to_path_buf(),
        source,
    })?;
    if !meta.is_dir() {
        return Err(EnumerationError::NotADirectory(root.to_path_buf()));
    }

    let mut paths = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file() {
            paths.push(FixturePath::new(entry.into_path()));
        }
    }

    tracing::debug!(root = %root.display(), count = paths.len(), "enumerated fixtures");

    Ok(paths.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{enumerate, EnumerationError};

    #[test]
    fn walks_nested_directories_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("b/inner")).unwrap();
        fs::create_dir_all(dir.path().join("a")).unwrap();
        fs::write(dir.path().join("b/inner/z.txt"), b"z").unwrap();
        fs::write(dir.path().join("b/y.txt"), b"y").unwrap();
        fs::write(dir.path().join("a/x.txt"), b"x").unwrap();
        fs::write(dir.path().join("c.txt"), b"c").unwrap();

        let set = enumerate(dir.path()).unwrap();
        let names: Vec<_> = set
            .iter()
            .map(|p| p.as_path().strip_prefix(dir.path()).unwrap().to_path_buf())
            .collect();

        assert_eq!(
            names,
            ["a/x.txt", "b/inner/z.txt", "b/y.txt", "c.txt"]
                .iter()
                .map(std::path::PathBuf::from)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn empty_directory_yields_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("nothing_here")).unwrap();

        assert!(enumerate(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn missing_root_fails() {
        let dir = tempfile::tempdir().unwrap();

        assert!(matches!(
            enumerate(dir.path().join("missing")),
            Err(EnumerationError::Root { .. })
        ));
    }

    #[test]
    fn file_root_fails() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        fs::write(&file, b"data").unwrap();

        assert!(matches!(
            enumerate(&file),
            Err(EnumerationError::NotADirectory(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("real"), b"data").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("link")).unwrap();

        let set = enumerate(dir.path()).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.get(0).unwrap().as_path().ends_with("real"));
    }
}
