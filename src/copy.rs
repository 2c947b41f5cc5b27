// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! File and directory tree copying.
//!
//! Copies keep the permission bits of their source. Tree copies continue past
//! a failing entry so that one unreadable file does not stop its siblings from
//! being copied, and report every failure at the end.
//!
//! # Ignore Files
//!
//! A directory being copied can hold an [`IGNORE_FILE`] at its top-level. Each
//! line names a child, or a path relative to that directory, to leave out of
//! the copy. Blank lines, and any line containing a `#`, are skipped. Only the
//! top-level ignore file is read, but its entries are honored at every depth
//! of the copy.

use std::{
    collections::HashSet,
    fs::{self, DirBuilder, File, Metadata},
    io,
    path::{Path, PathBuf},
};
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

/// Name of ignore file read at the top-level of a copied directory.
pub const IGNORE_FILE: &str = ".ignore";

/// Mode used for directories whose source mode is unknown.
pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// Listing of absolute paths to leave out of a tree copy.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IgnoreList {
    paths: HashSet<PathBuf>,
}

impl IgnoreList {
    /// Construct empty ignore list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read ignore file at top-level of target directory.
    ///
    /// A missing ignore file yields an empty list.
    ///
    /// # Errors
    ///
    /// - Return [`CopyError::ReadIgnoreFile`] if ignore file exists but
    ///   cannot be read.
    pub fn read(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let path = dir.join(IGNORE_FILE);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Self::parse(dir, &content)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(Self::new()),
            Err(error) => Err(CopyError::ReadIgnoreFile {
                source: error,
                path,
            }),
        }
    }

    /// Parse ignore file content relative to target directory.
    pub fn parse(dir: impl AsRef<Path>, content: &str) -> Self {
        let paths = content
            .lines()
            .filter(|line| !line.is_empty() && !line.contains('#'))
            .map(|line| dir.as_ref().join(line))
            .collect();

        Self { paths }
    }

    /// Check if absolute path is ignored.
    pub fn is_ignored(&self, path: impl AsRef<Path>) -> bool {
        self.paths.contains(path.as_ref())
    }

    /// Amount of ignored paths.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Check if nothing is ignored.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Copy file content and permission bits from `src` to `dst`.
///
/// Destination is created, or truncated if it already exists. Both file
/// handles are closed when this returns, whatever the outcome.
///
/// # Errors
///
/// - Return [`CopyError::ReadSource`] if source cannot be opened or read.
/// - Return [`CopyError::WriteDestination`] if destination cannot be created
///   or written.
/// - Return [`CopyError::SetPermissions`] if permission bits cannot be
///   applied to destination.
pub fn copy_file(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
    let (src, dst) = (src.as_ref(), dst.as_ref());

    let mut input = File::open(src).map_err(|error| CopyError::ReadSource {
        source: error,
        path: src.to_path_buf(),
    })?;
    let permissions = input
        .metadata()
        .map_err(|error| CopyError::ReadSource {
            source: error,
            path: src.to_path_buf(),
        })?
        .permissions();

    let mut output = File::create(dst).map_err(|error| CopyError::WriteDestination {
        source: error,
        path: dst.to_path_buf(),
    })?;
    io::copy(&mut input, &mut output).map_err(|error| CopyError::WriteDestination {
        source: error,
        path: dst.to_path_buf(),
    })?;

    fs::set_permissions(dst, permissions).map_err(|error| CopyError::SetPermissions {
        source: error,
        path: dst.to_path_buf(),
    })?;

    Ok(())
}

/// Copy directory tree from `src` into `dst`.
///
/// Destination directory must already exist. Nested directories are created
/// with the mode of their source. When `apply_ignore` is set, the
/// [`IGNORE_FILE`] of `src` decides which entries are skipped.
///
/// # Errors
///
/// - Return [`CopyError::ReadDir`] if `src` itself cannot be listed.
/// - Return [`CopyError::ReadIgnoreFile`] if ignore file cannot be read.
/// - Return [`CopyError::PartialTreeCopy`] if any entry failed to copy.
///   Every other entry was still attempted.
#[instrument(skip_all, fields(path = %src.as_ref().display()), level = "debug")]
pub fn copy_tree(src: impl AsRef<Path>, dst: impl AsRef<Path>, apply_ignore: bool) -> Result<()> {
    let (src, dst) = (src.as_ref(), dst.as_ref());

    // INVARIANT: Failing to list the top-level directory aborts the whole copy.
    fs::read_dir(src).map_err(|error| CopyError::ReadDir {
        source: error,
        path: src.to_path_buf(),
    })?;

    let ignored = if apply_ignore {
        IgnoreList::read(src)?
    } else {
        IgnoreList::new()
    };
    if !ignored.is_empty() {
        debug!("ignoring {} entries of {:?}", ignored.len(), src.display());
    }

    let mut failures = Vec::new();
    let entries = WalkDir::new(src)
        .min_depth(1)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        // INVARIANT: Ignore list is read once at the top-level but checked at every depth.
        .filter_entry(|entry| !ignored.is_ignored(entry.path()));

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                warn!("failed to walk {:?}: {error}", src.display());
                failures.push(CopyError::Walk(error));
                continue;
            }
        };

        let Ok(relative) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dst.join(relative);

        let result = if entry.file_type().is_dir() {
            entry
                .metadata()
                .map_err(CopyError::Walk)
                .and_then(|metadata| create_dir_with_mode(&target, mode_of(&metadata)))
        } else {
            copy_file(entry.path(), &target)
        };

        if let Err(error) = result {
            warn!("{error}");
            failures.push(error);
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(CopyError::PartialTreeCopy {
            path: src.to_path_buf(),
            failures,
        })
    }
}

/// Create directory and its missing parents with target mode.
///
/// An already existing directory is not an error.
///
/// # Errors
///
/// - Return [`CopyError::CreateDir`] if directory cannot be created.
pub fn create_dir_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<()> {
    let path = path.as_ref();
    let mut builder = DirBuilder::new();
    builder.recursive(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    builder.create(path).map_err(|error| CopyError::CreateDir {
        source: error,
        path: path.to_path_buf(),
    })
}

/// Permission bits of file system entry.
#[cfg(unix)]
pub fn mode_of(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(not(unix))]
pub fn mode_of(_metadata: &Metadata) -> u32 {
    DEFAULT_DIR_MODE
}

/// Copy error types.
#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    /// Source file cannot be opened or read.
    #[error("failed to read source file {:?}", path.display())]
    ReadSource {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// Destination file cannot be created or written.
    #[error("failed to write destination file {:?}", path.display())]
    WriteDestination {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// Permission bits cannot be applied to destination.
    #[error("failed to set permissions of {:?}", path.display())]
    SetPermissions {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// Directory cannot be listed.
    #[error("failed to read directory {:?}", path.display())]
    ReadDir {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// Directory cannot be created.
    #[error("failed to create directory {:?}", path.display())]
    CreateDir {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// Ignore file exists but cannot be read.
    #[error("failed to read ignore file {:?}", path.display())]
    ReadIgnoreFile {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// Entry below the top-level cannot be visited.
    #[error(transparent)]
    Walk(#[from] walkdir::Error),

    /// Some entries of a directory tree failed to copy.
    #[error("failed to copy {} entries of {:?}", failures.len(), path.display())]
    PartialTreeCopy {
        path: PathBuf,
        failures: Vec<CopyError>,
    },
}

/// Friendly result alias :3
pub type Result<T, E = CopyError> = std::result::Result<T, E>;
