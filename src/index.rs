// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Tracking of paths written into storage.
//!
//! Every save records the storage-relative path of each item it wrote. The
//! next save compares its own set of paths against that record to find
//! __orphans__, i.e., storage entries that no item refers to anymore, so they
//! can be removed from storage.
//!
//! # Index File Layout
//!
//! The record lives at `<storage-root>/.index`. It is plain text with one
//! storage-relative path per line, and no newline after the final entry. An
//! existing index keeps its permission bits across rewrites. A new index is
//! created with [`DEFAULT_INDEX_MODE`].

use crate::path::{resolve_absolute, PathError};

use std::{
    collections::HashSet,
    fs, io,
    path::{Path, PathBuf},
};
use tracing::{debug, instrument};

/// Name of the index file at the top-level of the storage root.
pub const INDEX_FILE: &str = ".index";

/// Permission bits of a newly created index file.
pub const DEFAULT_INDEX_MODE: u32 = 0o644;

/// Layer of indirection for index persistence.
pub trait Indexer {
    /// Storage-relative paths recorded by the last save.
    fn current_paths(&self) -> &[String];

    /// Replace recorded paths with a new set, and return removed paths.
    ///
    /// Removed paths are the ones recorded before but missing from
    /// `new_paths`. Must be called at most once per save run, after every item
    /// has been copied.
    fn reconcile(&mut self, new_paths: Vec<String>) -> Result<Vec<String>>;
}

/// Index backed by the `.index` file of a storage root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Index {
    path: PathBuf,
    entries: Vec<String>,
    mode: u32,
}

impl Index {
    /// Load index of target storage root.
    ///
    /// An index file that does not exist yet yields an empty index. Blank
    /// lines are dropped.
    ///
    /// # Errors
    ///
    /// - Return [`IndexError::Path`] if index path cannot be resolved.
    /// - Return [`IndexError::ReadIndex`] if existing index file cannot be
    ///   read.
    #[instrument(skip(storage_root), level = "debug")]
    pub fn load(storage_root: impl AsRef<Path>) -> Result<Self> {
        let path = resolve_absolute(format!(
            "{}/{INDEX_FILE}",
            storage_root.as_ref().to_string_lossy()
        ))?;

        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                debug!("no index at {:?}, start empty", path.display());
                return Ok(Self {
                    path,
                    entries: Vec::new(),
                    mode: DEFAULT_INDEX_MODE,
                });
            }
            Err(error) => return Err(IndexError::ReadIndex { source: error, path }),
        };

        let content = fs::read_to_string(&path).map_err(|error| IndexError::ReadIndex {
            source: error,
            path: path.clone(),
        })?;
        let entries = dedup(content.split('\n').filter(|line| !line.is_empty()));
        debug!("loaded {} index entries from {:?}", entries.len(), path.display());

        Ok(Self {
            path,
            entries,
            mode: file_mode(&metadata),
        })
    }

    /// Absolute path to index file.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Permission bits used when the index is written.
    pub fn mode(&self) -> u32 {
        self.mode
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            mkdirp::mkdirp(parent).map_err(|error| IndexError::WriteIndex {
                source: error,
                path: self.path.clone(),
            })?;
        }

        fs::write(&self.path, self.entries.join("\n")).map_err(|error| {
            IndexError::WriteIndex {
                source: error,
                path: self.path.clone(),
            }
        })?;

        set_file_mode(&self.path, self.mode).map_err(|error| IndexError::WriteIndex {
            source: error,
            path: self.path.clone(),
        })
    }
}

impl Indexer for Index {
    fn current_paths(&self) -> &[String] {
        &self.entries
    }

    #[instrument(skip(self, new_paths), level = "debug")]
    fn reconcile(&mut self, new_paths: Vec<String>) -> Result<Vec<String>> {
        let entries = dedup(new_paths);
        let kept: HashSet<&str> = entries.iter().map(String::as_str).collect();
        let removed = self
            .entries
            .iter()
            .filter(|entry| !kept.contains(entry.as_str()))
            .cloned()
            .collect::<Vec<_>>();

        self.entries = entries;
        self.persist()?;
        debug!(
            "index now tracks {} entries, {} removed",
            self.entries.len(),
            removed.len()
        );

        Ok(removed)
    }
}

fn dedup(paths: impl IntoIterator<Item = impl Into<String>>) -> Vec<String> {
    let mut seen = HashSet::new();
    paths
        .into_iter()
        .map(Into::into)
        .filter(|path| seen.insert(path.clone()))
        .collect()
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(not(unix))]
fn file_mode(_metadata: &fs::Metadata) -> u32 {
    DEFAULT_INDEX_MODE
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Index error types.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// Index path cannot be resolved.
    #[error(transparent)]
    Path(#[from] PathError),

    /// Index file cannot be read from.
    #[error("failed to read index file at {:?}", path.display())]
    ReadIndex {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// Index file cannot be written to.
    #[error("failed to write index file at {:?}", path.display())]
    WriteIndex {
        #[source]
        source: io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = IndexError> = std::result::Result<T, E>;
