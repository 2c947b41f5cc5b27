// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Item synchronization between the system and storage.
//!
//! An __item__ is one configured file or directory, e.g., `~/.gitconfig` or
//! `~/.config/nvim`. The [`Synchronizer`] moves every configured item in one
//! of two directions:
//!
//! - __Save__ copies from the system into storage. Directories in storage are
//!   fully replaced, so storage mirrors the system exactly. Ignore files apply.
//!   Afterwards the [`Indexer`] is reconciled, and orphaned storage entries
//!   are deleted.
//! - __Load__ copies from storage onto the system. Nothing at the destination
//!   is removed first, and ignore files do not apply.
//!
//! # Failure Policy
//!
//! A run never stops on a failing item. Each failure is recorded in the
//! [`SyncReport`], and the remaining items are still processed. Only failures
//! that happen before any item is touched, or a failure to persist the index,
//! abort a run.

use crate::{
    copy::{copy_file, copy_tree, create_dir_with_mode, mode_of, CopyError, DEFAULT_DIR_MODE},
    index::{Index, IndexError, Indexer},
    path::{resolve_absolute, PathError},
    platform::{select_for_platform, ItemLocations, PathPair, Resolution, SelectError},
    repo::{Git2Repository, RepoError, RepositoryActions},
};

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs, io,
    path::{Component, Path, PathBuf},
};
use tracing::{debug, error, info, instrument, warn};

/// One configured file or directory to keep in sync.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Item {
    /// Optional human readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Location records keyed by platform identifier.
    #[serde(flatten)]
    pub locations: ItemLocations,
}

impl Item {
    /// Construct new unnamed item.
    pub fn new(locations: ItemLocations) -> Self {
        Self {
            name: None,
            locations,
        }
    }

    /// Construct new named item.
    pub fn named(name: impl Into<String>, locations: ItemLocations) -> Self {
        Self {
            name: Some(name.into()),
            locations,
        }
    }

    /// Label of item in logs and reports.
    pub fn label(&self, position: usize) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("item #{position}"),
        }
    }
}

/// Direction of a synchronization run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Copy from system into storage.
    Save,

    /// Copy from storage onto system.
    Load,
}

impl Display for Direction {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Save => fmt.write_str("save"),
            Self::Load => fmt.write_str("load"),
        }
    }
}

/// Synchronize configured items between system and storage.
#[derive(Debug)]
pub struct Synchronizer<I = Index, R = Git2Repository>
where
    I: Indexer,
    R: RepositoryActions,
{
    storage_root: PathBuf,
    platform: String,
    items: Vec<Item>,
    indexer: I,
    repository: Option<R>,
    update_index: bool,
}

impl<I> Synchronizer<I, Git2Repository>
where
    I: Indexer,
{
    /// Construct new synchronizer over storage root.
    ///
    /// Targets the platform this binary was compiled for, with index updates
    /// enabled, and no repository.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::StorageRoot`] if storage root cannot be resolved.
    pub fn new(storage_root: impl AsRef<str>, indexer: I) -> Result<Self> {
        let storage_root = resolve_absolute(storage_root).map_err(SyncError::StorageRoot)?;

        Ok(Self {
            storage_root,
            platform: std::env::consts::OS.to_owned(),
            items: Vec::new(),
            indexer,
            repository: None,
            update_index: true,
        })
    }
}

impl<I, R> Synchronizer<I, R>
where
    I: Indexer,
    R: RepositoryActions,
{
    /// Use repository to refresh storage before loading, and publish it after
    /// saving.
    pub fn with_repository<T>(self, repository: T) -> Synchronizer<I, T>
    where
        T: RepositoryActions,
    {
        Synchronizer {
            storage_root: self.storage_root,
            platform: self.platform,
            items: self.items,
            indexer: self.indexer,
            repository: Some(repository),
            update_index: self.update_index,
        }
    }

    /// Select item locations for target platform instead of current one.
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    /// Enable or disable index reconciliation after saving.
    pub fn with_index_updates(mut self, enabled: bool) -> Self {
        self.update_index = enabled;
        self
    }

    /// Append items to process, keeping configured order.
    pub fn add_items(&mut self, items: impl IntoIterator<Item = Item>) {
        self.items.extend(items);
    }

    /// Absolute storage root.
    pub fn storage_root(&self) -> &Path {
        self.storage_root.as_path()
    }

    /// Indexer of synchronizer.
    pub fn indexer(&self) -> &I {
        &self.indexer
    }

    /// Repository of synchronizer, if any.
    pub fn repository(&self) -> Option<&R> {
        self.repository.as_ref()
    }

    /// Process all items in target direction.
    ///
    /// Every item is attempted. Per-item failures end up in the returned
    /// report.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::Index`] if index cannot be persisted after
    ///   saving.
    #[instrument(skip(self), level = "debug")]
    pub fn run(&mut self, direction: Direction) -> Result<SyncReport> {
        info!("perform {direction} on {} items", self.items.len());
        let mut report = SyncReport::new(direction);
        let mut new_paths = Vec::new();

        for (position, item) in self.items.iter().enumerate() {
            let label = item.label(position);
            let pair =
                match select_for_platform(&item.locations, &self.storage_root, &self.platform) {
                    Ok(Resolution::Applicable(pair)) => pair,
                    Ok(Resolution::NotApplicable) => {
                        info!("skip {label:?}, no location for {}", self.platform);
                        report.skipped.push(label);
                        continue;
                    }
                    Err(err) => {
                        error!("failed to resolve paths of {label:?}: {err}");
                        report.failures.push(ItemFailure::new(label, err.into()));
                        continue;
                    }
                };

            let outcome = match direction {
                Direction::Save => self.save_item(&pair).map(|relative| {
                    new_paths.push(relative);
                }),
                Direction::Load => self.load_item(&pair),
            };

            match outcome {
                Ok(()) => {
                    info!("{direction} {label:?}");
                    report.processed.push(label);
                }
                Err(err) => {
                    error!("failed to {direction} {label:?}: {err}");

                    // INVARIANT: Failed items keep their existing index entry.
                    if direction == Direction::Save {
                        if let Some(relative) = self.relative_to_storage(&pair.storage) {
                            if self.indexer.current_paths().contains(&relative) {
                                debug!("keep tracking {relative:?}");
                                new_paths.push(relative);
                            }
                        }
                    }

                    report.failures.push(ItemFailure::new(label, err));
                }
            }
        }

        if direction == Direction::Save && self.update_index {
            let removed = self.indexer.reconcile(new_paths)?;
            let tracked = self.indexer.current_paths();
            for entry in removed {
                // INVARIANT: Never delete storage that overlaps a tracked entry.
                if let Some(kept) = tracked.iter().find(|kept| overlaps(kept, &entry)) {
                    debug!("untrack {entry:?} without removal, overlaps {kept:?}");
                    continue;
                }

                match self.remove_orphan(&entry) {
                    Ok(()) => {
                        info!("removed orphan {entry:?} from storage");
                        report.removed.push(entry);
                    }
                    Err(err) => {
                        warn!("failed to remove orphan {entry:?}: {err}");
                        report.cleanup_failures.push(CleanupFailure { entry, error: err });
                    }
                }
            }
        }

        Ok(report)
    }

    /// Stage, commit, and push storage changes through the repository.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::NoRepository`] if no repository is set.
    /// - Return [`SyncError::Repository`] if repository operations fail.
    #[instrument(skip(self, message), level = "debug")]
    pub fn publish(&self, message: impl AsRef<str>) -> Result<()> {
        let repository = self.repository.as_ref().ok_or(SyncError::NoRepository)?;
        repository.stage_and_commit(message.as_ref())?;
        repository.push()?;
        info!("storage changes published");

        Ok(())
    }

    /// Pull remote changes into storage if the remote moved.
    ///
    /// Returns whether anything was pulled.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::NoRepository`] if no repository is set.
    /// - Return [`SyncError::Repository`] if repository operations fail.
    #[instrument(skip(self), level = "debug")]
    pub fn refresh(&self) -> Result<bool> {
        let repository = self.repository.as_ref().ok_or(SyncError::NoRepository)?;
        if !repository.fetch_has_changes()? {
            debug!("storage already up to date");
            return Ok(false);
        }

        repository.pull()?;
        info!("pulled remote changes into storage");

        Ok(true)
    }

    fn save_item(&self, pair: &PathPair) -> Result<String, ItemError> {
        let (src, dst) = (&pair.system, &pair.storage);
        let relative = self
            .relative_to_storage(dst)
            .ok_or_else(|| ItemError::OutsideStorage {
                path: dst.clone(),
                storage_root: self.storage_root.clone(),
            })?;

        ensure_parent(dst)?;
        let metadata = fs::metadata(src).map_err(|err| ItemError::Stat {
            source: err,
            path: src.clone(),
        })?;

        if metadata.is_dir() {
            // INVARIANT: Storage mirrors the system, so replace directories in full.
            let mode = match fs::symlink_metadata(dst) {
                Ok(existing) => {
                    let mode = if existing.is_dir() {
                        mode_of(&existing)
                    } else {
                        DEFAULT_DIR_MODE
                    };
                    remove_path(dst, &existing).map_err(|err| ItemError::RemoveExisting {
                        source: err,
                        path: dst.clone(),
                    })?;
                    mode
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => DEFAULT_DIR_MODE,
                Err(err) => {
                    return Err(ItemError::Stat {
                        source: err,
                        path: dst.clone(),
                    })
                }
            };

            create_dir_with_mode(dst, mode)?;
            copy_tree(src, dst, true)?;
        } else {
            copy_file(src, dst)?;
        }

        Ok(relative)
    }

    fn load_item(&self, pair: &PathPair) -> Result<(), ItemError> {
        let (src, dst) = (&pair.storage, &pair.system);

        ensure_parent(dst)?;
        let metadata = fs::metadata(src).map_err(|err| ItemError::Stat {
            source: err,
            path: src.clone(),
        })?;

        if metadata.is_dir() {
            create_dir_with_mode(dst, mode_of(&metadata))?;
            copy_tree(src, dst, false)?;
        } else {
            copy_file(src, dst)?;
        }

        Ok(())
    }

    fn relative_to_storage(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.storage_root).ok()?;
        if relative.as_os_str().is_empty() {
            return None;
        }

        Some(
            relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
        )
    }

    fn remove_orphan(&self, entry: &str) -> Result<(), CleanupError> {
        let relative = Path::new(entry);
        let escapes = relative.components().any(|component| {
            !matches!(component, Component::Normal(_) | Component::CurDir)
        });
        if entry.is_empty() || escapes {
            return Err(CleanupError::UnsafeEntry {
                entry: entry.to_owned(),
            });
        }

        let path = self.storage_root.join(relative);
        match fs::symlink_metadata(&path) {
            Ok(metadata) => remove_path(&path, &metadata)
                .map_err(|err| CleanupError::Remove { source: err, path }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("orphan {:?} already gone", path.display());
                Ok(())
            }
            Err(err) => Err(CleanupError::Remove { source: err, path }),
        }
    }
}

fn ensure_parent(path: &Path) -> Result<(), ItemError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };

    mkdirp::mkdirp(parent)
        .map(|_| ())
        .map_err(|err| ItemError::CreateParent {
            source: err,
            path: parent.to_path_buf(),
        })
}

fn overlaps(tracked: &str, entry: &str) -> bool {
    let (tracked, entry) = (Path::new(tracked), Path::new(entry));
    tracked.starts_with(entry) || entry.starts_with(tracked)
}

fn remove_path(path: &Path, metadata: &fs::Metadata) -> io::Result<()> {
    if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Outcome of one synchronization run.
#[derive(Debug)]
pub struct SyncReport {
    /// Direction of the run.
    pub direction: Direction,

    /// Labels of items copied successfully.
    pub processed: Vec<String>,

    /// Labels of items with no location for the platform.
    pub skipped: Vec<String>,

    /// Items that failed.
    pub failures: Vec<ItemFailure>,

    /// Orphaned index entries removed from storage.
    pub removed: Vec<String>,

    /// Orphaned index entries that could not be removed.
    pub cleanup_failures: Vec<CleanupFailure>,
}

impl SyncReport {
    /// Construct empty report for target direction.
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            processed: Vec::new(),
            skipped: Vec::new(),
            failures: Vec::new(),
            removed: Vec::new(),
            cleanup_failures: Vec::new(),
        }
    }

    /// Check if nothing failed.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.cleanup_failures.is_empty()
    }

    /// Amount of item and cleanup failures.
    pub fn failure_count(&self) -> usize {
        self.failures.len() + self.cleanup_failures.len()
    }
}

impl Display for SyncReport {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        writeln!(fmt, "{} summary:", self.direction)?;
        writeln!(fmt, "  processed: {}", self.processed.len())?;
        writeln!(fmt, "  skipped:   {}", self.skipped.len())?;
        writeln!(fmt, "  failed:    {}", self.failures.len())?;
        if self.direction == Direction::Save {
            writeln!(fmt, "  removed:   {}", self.removed.len())?;
        }

        for failure in &self.failures {
            writeln!(fmt, "  - {}: {}", failure.item, failure.error)?;
        }
        for failure in &self.cleanup_failures {
            writeln!(fmt, "  - cleanup {:?}: {}", failure.entry, failure.error)?;
        }

        Ok(())
    }
}

/// Failure of one item.
#[derive(Debug)]
pub struct ItemFailure {
    /// Label of failed item.
    pub item: String,

    /// Reason of failure.
    pub error: ItemError,
}

impl ItemFailure {
    fn new(item: String, error: ItemError) -> Self {
        Self { item, error }
    }
}

/// Failure to remove one orphaned index entry.
#[derive(Debug)]
pub struct CleanupFailure {
    /// Storage-relative entry.
    pub entry: String,

    /// Reason of failure.
    pub error: CleanupError,
}

/// Item level error types.
#[derive(Debug, thiserror::Error)]
pub enum ItemError {
    /// Item location cannot be selected or resolved.
    #[error(transparent)]
    Select(#[from] SelectError),

    /// Parent directories of destination cannot be created.
    #[error("failed to create parent directories {:?}", path.display())]
    CreateParent {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// Path cannot be inspected.
    #[error("failed to stat {:?}", path.display())]
    Stat {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// Existing storage copy cannot be removed before replacing it.
    #[error("failed to remove existing storage copy {:?}", path.display())]
    RemoveExisting {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// Storage path is not inside the storage root.
    #[error("{:?} is not inside storage root {:?}", path.display(), storage_root.display())]
    OutsideStorage { path: PathBuf, storage_root: PathBuf },

    /// Copying item content fails.
    #[error(transparent)]
    Copy(#[from] CopyError),
}

/// Orphan cleanup error types.
#[derive(Debug, thiserror::Error)]
pub enum CleanupError {
    /// Index entry is empty, absolute, or leaves the storage root.
    #[error("refusing to remove unsafe index entry {entry:?}")]
    UnsafeEntry { entry: String },

    /// Orphan cannot be removed.
    #[error("failed to remove {:?}", path.display())]
    Remove {
        #[source]
        source: io::Error,
        path: PathBuf,
    },
}

/// Run level error types.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Storage root cannot be resolved.
    #[error("failed to resolve storage root")]
    StorageRoot(#[source] PathError),

    /// Index cannot be persisted.
    #[error(transparent)]
    Index(#[from] IndexError),

    /// Repository operations fail.
    #[error(transparent)]
    Repository(#[from] RepoError),

    /// Operation needs a repository, but none was set.
    #[error("no repository set for storage")]
    NoRepository,
}

/// Friendly result alias :3
pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::INDEX_FILE;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;
    use tempfile::{tempdir, TempDir};

    #[derive(Debug, Default)]
    struct MemoryIndex {
        entries: Vec<String>,
        reconciled: usize,
    }

    impl Indexer for MemoryIndex {
        fn current_paths(&self) -> &[String] {
            &self.entries
        }

        fn reconcile(&mut self, new_paths: Vec<String>) -> crate::index::Result<Vec<String>> {
            let removed = self
                .entries
                .iter()
                .filter(|entry| !new_paths.contains(entry))
                .cloned()
                .collect();
            self.entries = new_paths;
            self.reconciled += 1;
            Ok(removed)
        }
    }

    #[derive(Debug, Default)]
    struct FakeRepository {
        calls: RefCell<Vec<String>>,
        remote_moved: bool,
    }

    impl RepositoryActions for FakeRepository {
        fn stage_and_commit(&self, message: &str) -> crate::repo::Result<()> {
            self.calls.borrow_mut().push(format!("commit {message}"));
            Ok(())
        }

        fn push(&self) -> crate::repo::Result<()> {
            self.calls.borrow_mut().push("push".into());
            Ok(())
        }

        fn pull(&self) -> crate::repo::Result<()> {
            self.calls.borrow_mut().push("pull".into());
            Ok(())
        }

        fn fetch_has_changes(&self) -> crate::repo::Result<bool> {
            self.calls.borrow_mut().push("fetch".into());
            Ok(self.remote_moved)
        }
    }

    struct Sandbox {
        _dir: TempDir,
        system: PathBuf,
        storage: PathBuf,
    }

    impl Sandbox {
        fn new() -> anyhow::Result<Self> {
            let dir = tempdir()?;
            let system = dir.path().join("system");
            let storage = dir.path().join("storage");
            fs::create_dir_all(&system)?;
            fs::create_dir_all(&storage)?;

            Ok(Self {
                _dir: dir,
                system,
                storage,
            })
        }

        fn item(&self, name: &str, remote: &str, local: &str) -> Item {
            let location = format!("$LOCATION/{remote}:{}/{local}", self.system.display());
            Item::named(name, ItemLocations::new().with("linux", location.as_str()))
        }

        fn synchronizer<I: Indexer>(&self, indexer: I) -> anyhow::Result<Synchronizer<I>> {
            Ok(Synchronizer::new(self.storage.to_string_lossy(), indexer)?.with_platform("linux"))
        }
    }

    #[test]
    fn save_file_and_directory_items() -> anyhow::Result<()> {
        let sandbox = Sandbox::new()?;
        fs::write(sandbox.system.join(".gitconfig"), "[user]")?;
        fs::create_dir_all(sandbox.system.join("nvim/lua"))?;
        fs::write(sandbox.system.join("nvim/init.lua"), "require('x')")?;
        fs::write(sandbox.system.join("nvim/lua/x.lua"), "return {}")?;

        let mut sync = sandbox.synchronizer(MemoryIndex::default())?;
        sync.add_items([
            sandbox.item("git", "git/config", ".gitconfig"),
            sandbox.item("nvim", "nvim", "nvim"),
        ]);
        let report = sync.run(Direction::Save)?;

        assert!(report.is_success());
        assert_eq!(report.processed, vec!["git".to_string(), "nvim".to_string()]);
        assert_eq!(
            fs::read_to_string(sandbox.storage.join("git/config"))?,
            "[user]"
        );
        assert_eq!(
            fs::read_to_string(sandbox.storage.join("nvim/lua/x.lua"))?,
            "return {}"
        );
        assert_eq!(
            sync.indexer().current_paths(),
            vec!["git/config".to_string(), "nvim".to_string()]
        );

        Ok(())
    }

    #[test]
    fn save_replaces_storage_directory() -> anyhow::Result<()> {
        let sandbox = Sandbox::new()?;
        fs::create_dir_all(sandbox.system.join("app"))?;
        fs::write(sandbox.system.join("app/settings"), "v1")?;

        let mut sync = sandbox.synchronizer(MemoryIndex::default())?;
        sync.add_items([sandbox.item("app", "app", "app")]);
        sync.run(Direction::Save)?;

        fs::write(sandbox.storage.join("app/stray"), "not configured")?;
        let report = sync.run(Direction::Save)?;

        assert!(report.is_success());
        assert!(!sandbox.storage.join("app/stray").exists());
        assert!(sandbox.storage.join("app/settings").exists());

        Ok(())
    }

    #[test]
    fn save_applies_ignore_file() -> anyhow::Result<()> {
        let sandbox = Sandbox::new()?;
        fs::create_dir_all(sandbox.system.join("ssh"))?;
        fs::write(sandbox.system.join("ssh/.ignore"), "id_ed25519\n")?;
        fs::write(sandbox.system.join("ssh/id_ed25519"), "private")?;
        fs::write(sandbox.system.join("ssh/config"), "Host *")?;

        let mut sync = sandbox.synchronizer(MemoryIndex::default())?;
        sync.add_items([sandbox.item("ssh", "ssh", "ssh")]);
        sync.run(Direction::Save)?;

        assert!(!sandbox.storage.join("ssh/id_ed25519").exists());
        assert!(sandbox.storage.join("ssh/config").exists());

        Ok(())
    }

    #[test]
    fn save_skips_item_without_platform_location() -> anyhow::Result<()> {
        let sandbox = Sandbox::new()?;
        fs::write(sandbox.system.join("a"), "a")?;

        let mut sync = sandbox.synchronizer(MemoryIndex::default())?;
        sync.add_items([
            Item::named("mac only", ItemLocations::new().with("darwin", "$LOCATION/x:/y")),
            sandbox.item("a", "a", "a"),
        ]);
        let report = sync.run(Direction::Save)?;

        assert!(report.is_success());
        assert_eq!(report.skipped, vec!["mac only".to_string()]);
        assert_eq!(sync.indexer().current_paths(), vec!["a".to_string()]);
        assert!(!sandbox.storage.join("x").exists());

        Ok(())
    }

    #[test]
    fn save_continues_past_failed_item() -> anyhow::Result<()> {
        let sandbox = Sandbox::new()?;
        for name in ["one", "three", "four", "five"] {
            fs::write(sandbox.system.join(name), name)?;
        }

        let mut sync = sandbox.synchronizer(MemoryIndex::default())?;
        sync.add_items([
            sandbox.item("one", "one", "one"),
            sandbox.item("two", "two", "two"),
            sandbox.item("three", "three", "three"),
            sandbox.item("four", "four", "four"),
            sandbox.item("five", "five", "five"),
        ]);
        let report = sync.run(Direction::Save)?;

        assert_eq!(report.failure_count(), 1);
        assert_eq!(report.failures[0].item, "two");
        assert!(matches!(report.failures[0].error, ItemError::Stat { .. }));
        assert_eq!(
            sync.indexer().current_paths(),
            vec![
                "one".to_string(),
                "three".to_string(),
                "four".to_string(),
                "five".to_string()
            ]
        );

        Ok(())
    }

    #[test]
    fn save_keeps_tracking_failed_item() -> anyhow::Result<()> {
        let sandbox = Sandbox::new()?;
        fs::write(sandbox.storage.join("gone"), "saved earlier")?;
        let index = MemoryIndex {
            entries: vec!["gone".into()],
            reconciled: 0,
        };

        let mut sync = sandbox.synchronizer(index)?;
        sync.add_items([sandbox.item("gone", "gone", "gone")]);
        let report = sync.run(Direction::Save)?;

        assert_eq!(report.failure_count(), 1);
        assert!(report.removed.is_empty());
        assert_eq!(sync.indexer().current_paths(), vec!["gone".to_string()]);
        assert!(sandbox.storage.join("gone").exists());

        Ok(())
    }

    #[test]
    fn save_removes_orphans() -> anyhow::Result<()> {
        let sandbox = Sandbox::new()?;
        fs::write(sandbox.system.join("kept"), "kept")?;
        fs::create_dir_all(sandbox.storage.join("old/nested"))?;
        fs::write(sandbox.storage.join("old/nested/file"), "old")?;
        fs::write(sandbox.storage.join(INDEX_FILE), "kept\nold\nmissing")?;

        let mut sync = sandbox.synchronizer(Index::load(&sandbox.storage)?)?;
        sync.add_items([sandbox.item("kept", "kept", "kept")]);
        let report = sync.run(Direction::Save)?;

        assert!(report.is_success());
        assert_eq!(report.removed, vec!["old".to_string(), "missing".to_string()]);
        assert!(!sandbox.storage.join("old").exists());
        assert_eq!(fs::read_to_string(sandbox.storage.join(INDEX_FILE))?, "kept");

        Ok(())
    }

    #[test]
    fn save_keeps_file_inside_newly_tracked_directory() -> anyhow::Result<()> {
        let sandbox = Sandbox::new()?;
        fs::create_dir_all(sandbox.system.join("nvim"))?;
        fs::write(sandbox.system.join("nvim/init.lua"), "vim.opt.number = true")?;
        let index = MemoryIndex {
            entries: vec!["nvim/init.lua".into()],
            reconciled: 0,
        };

        let mut sync = sandbox.synchronizer(index)?;
        sync.add_items([sandbox.item("nvim", "nvim", "nvim")]);
        let report = sync.run(Direction::Save)?;

        assert!(report.is_success());
        assert!(report.removed.is_empty());
        assert_eq!(sync.indexer().current_paths(), vec!["nvim".to_string()]);
        assert_eq!(
            fs::read_to_string(sandbox.storage.join("nvim/init.lua"))?,
            "vim.opt.number = true"
        );

        Ok(())
    }

    #[test]
    fn save_keeps_directory_holding_newly_tracked_file() -> anyhow::Result<()> {
        let sandbox = Sandbox::new()?;
        fs::create_dir_all(sandbox.system.join("nvim"))?;
        fs::write(sandbox.system.join("nvim/init.lua"), "vim.opt.number = true")?;
        fs::create_dir_all(sandbox.storage.join("nvim"))?;
        fs::write(sandbox.storage.join("nvim/init.lua"), "stale")?;
        let index = MemoryIndex {
            entries: vec!["nvim".into()],
            reconciled: 0,
        };

        let mut sync = sandbox.synchronizer(index)?;
        sync.add_items([sandbox.item("nvim", "nvim/init.lua", "nvim/init.lua")]);
        let report = sync.run(Direction::Save)?;

        assert!(report.is_success());
        assert!(report.removed.is_empty());
        assert_eq!(
            sync.indexer().current_paths(),
            vec!["nvim/init.lua".to_string()]
        );
        assert_eq!(
            fs::read_to_string(sandbox.storage.join("nvim/init.lua"))?,
            "vim.opt.number = true"
        );

        Ok(())
    }

    #[test]
    fn overlapping_entries_compare_whole_components() {
        assert!(overlaps("nvim", "nvim/init.lua"));
        assert!(overlaps("nvim/init.lua", "nvim"));
        assert!(overlaps("nvim", "nvim"));
        assert!(!overlaps("nvim", "nvim-old"));
        assert!(!overlaps("a/b", "a/c"));
    }

    #[test]
    fn save_refuses_unsafe_orphans() -> anyhow::Result<()> {
        let sandbox = Sandbox::new()?;
        let outside = sandbox.storage.join("../outside");
        fs::write(&outside, "must survive")?;
        let index = MemoryIndex {
            entries: vec!["../outside".into()],
            reconciled: 0,
        };

        let mut sync = sandbox.synchronizer(index)?;
        let report = sync.run(Direction::Save)?;

        assert_eq!(report.cleanup_failures.len(), 1);
        assert!(matches!(
            report.cleanup_failures[0].error,
            CleanupError::UnsafeEntry { .. }
        ));
        assert!(outside.exists());

        Ok(())
    }

    #[test]
    fn save_without_index_updates() -> anyhow::Result<()> {
        let sandbox = Sandbox::new()?;
        fs::write(sandbox.system.join("a"), "a")?;

        let mut sync = sandbox
            .synchronizer(MemoryIndex::default())?
            .with_index_updates(false);
        sync.add_items([sandbox.item("a", "a", "a")]);
        sync.run(Direction::Save)?;

        assert_eq!(sync.indexer().reconciled, 0);
        assert!(sandbox.storage.join("a").exists());

        Ok(())
    }

    #[test]
    fn save_rejects_storage_root_as_item() -> anyhow::Result<()> {
        let sandbox = Sandbox::new()?;
        fs::create_dir_all(sandbox.system.join("dir"))?;
        fs::write(sandbox.storage.join("precious"), "keep")?;

        let location = format!("$LOCATION:{}/dir", sandbox.system.display());
        let mut sync = sandbox.synchronizer(MemoryIndex::default())?;
        sync.add_items([Item::new(
            ItemLocations::new().with("linux", location.as_str()),
        )]);
        let report = sync.run(Direction::Save)?;

        assert!(matches!(
            report.failures[0].error,
            ItemError::OutsideStorage { .. }
        ));
        assert_eq!(report.failures[0].item, "item #0");
        assert!(sandbox.storage.join("precious").exists());

        Ok(())
    }

    #[test]
    fn load_merges_into_existing_directory() -> anyhow::Result<()> {
        let sandbox = Sandbox::new()?;
        fs::create_dir_all(sandbox.storage.join("app"))?;
        fs::write(sandbox.storage.join("app/.ignore"), "settings")?;
        fs::write(sandbox.storage.join("app/settings"), "from storage")?;
        fs::create_dir_all(sandbox.system.join("app"))?;
        fs::write(sandbox.system.join("app/local-only"), "untouched")?;

        let mut sync = sandbox.synchronizer(MemoryIndex::default())?;
        sync.add_items([sandbox.item("app", "app", "app")]);
        let report = sync.run(Direction::Load)?;

        assert!(report.is_success());
        assert_eq!(
            fs::read_to_string(sandbox.system.join("app/settings"))?,
            "from storage"
        );
        assert_eq!(
            fs::read_to_string(sandbox.system.join("app/local-only"))?,
            "untouched"
        );
        assert_eq!(sync.indexer().reconciled, 0);

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn load_restores_directory_mode() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let sandbox = Sandbox::new()?;
        fs::create_dir_all(sandbox.storage.join("gnupg"))?;
        fs::write(sandbox.storage.join("gnupg/gpg.conf"), "use-agent")?;
        fs::set_permissions(
            sandbox.storage.join("gnupg"),
            fs::Permissions::from_mode(0o700),
        )?;

        let mut sync = sandbox.synchronizer(MemoryIndex::default())?;
        sync.add_items([sandbox.item("gnupg", "gnupg", "gnupg")]);
        let report = sync.run(Direction::Load)?;

        assert!(report.is_success());
        let mode = fs::metadata(sandbox.system.join("gnupg"))?.permissions().mode();
        assert_eq!(mode & 0o777, 0o700);

        Ok(())
    }

    #[test]
    fn load_creates_missing_parents() -> anyhow::Result<()> {
        let sandbox = Sandbox::new()?;
        fs::write(sandbox.storage.join("rc"), "export X=1")?;

        let mut sync = sandbox.synchronizer(MemoryIndex::default())?;
        sync.add_items([sandbox.item("rc", "rc", "deep/er/rc")]);
        sync.run(Direction::Load)?;

        assert_eq!(
            fs::read_to_string(sandbox.system.join("deep/er/rc"))?,
            "export X=1"
        );

        Ok(())
    }

    #[test]
    fn unsupported_platform_fails_every_item() -> anyhow::Result<()> {
        let sandbox = Sandbox::new()?;
        let mut sync = sandbox
            .synchronizer(MemoryIndex::default())?
            .with_platform("plan9");
        sync.add_items([sandbox.item("a", "a", "a"), sandbox.item("b", "b", "b")]);
        let report = sync.run(Direction::Load)?;

        assert_eq!(report.failure_count(), 2);
        assert!(matches!(
            report.failures[0].error,
            ItemError::Select(SelectError::UnsupportedPlatform { .. })
        ));

        Ok(())
    }

    #[test]
    fn publish_commits_then_pushes() -> anyhow::Result<()> {
        let sandbox = Sandbox::new()?;
        let sync = sandbox
            .synchronizer(MemoryIndex::default())?
            .with_repository(FakeRepository::default());

        sync.publish("chore: save")?;
        let calls = sync.repository().map(|repo| repo.calls.borrow().clone());
        assert_eq!(
            calls,
            Some(vec!["commit chore: save".to_string(), "push".to_string()])
        );

        Ok(())
    }

    #[test]
    fn refresh_pulls_only_when_remote_moved() -> anyhow::Result<()> {
        let sandbox = Sandbox::new()?;
        let sync = sandbox
            .synchronizer(MemoryIndex::default())?
            .with_repository(FakeRepository::default());
        assert!(!sync.refresh()?);

        let sync = sync.with_repository(FakeRepository {
            remote_moved: true,
            ..Default::default()
        });
        assert!(sync.refresh()?);
        let calls = sync.repository().map(|repo| repo.calls.borrow().clone());
        assert_eq!(calls, Some(vec!["fetch".to_string(), "pull".to_string()]));

        Ok(())
    }

    #[test]
    fn publish_without_repository() -> anyhow::Result<()> {
        let sandbox = Sandbox::new()?;
        let sync = sandbox.synchronizer(MemoryIndex::default())?;
        assert!(matches!(sync.publish("x"), Err(SyncError::NoRepository)));
        Ok(())
    }
}
