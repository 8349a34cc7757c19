//! Local reconciler: compares the sync directory on disk with the store and
//! queues the work needed to bring the peer up to date.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use thiserror::Error;
use tracing::{debug, warn};
use treesync_core::{ROOT_DIR_ID, SessionError, is_temp_name};

use super::apply::ApplyError;
use super::digest::EMPTY_DIGEST;
use super::index::{
    ActionType, DirectoryEntry, FileEntry, IndexError, InventoryStore, NewQueueItem,
};
use super::paths::LocalStat;
use crate::logging::COMMON;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("store error: {0}")]
    Index(#[from] IndexError),
    #[error("I/O error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error("peer error: {0}")]
    Session(#[from] SessionError),
}

impl ReconcileError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        ReconcileError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Walk every directory.
    Deep,
    /// Re-list only directories whose mtime moved or whose digest is not yet
    /// known. Other directories have their stored entries stat'ed instead, so
    /// in-place edits and nested changes are still found.
    Shallow,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub enqueued: usize,
    pub removed_temp: usize,
}

/// One entry of a live directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveEntry {
    pub name: String,
    pub is_dir: bool,
    pub stat: LocalStat,
}

/// Lists `path`, skipping symlinks and names that are not valid UTF-8.
pub async fn read_listing(path: &Path) -> Result<Vec<LiveEntry>, ReconcileError> {
    let mut entries = Vec::new();
    let mut dir = match tokio::fs::read_dir(path).await {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(entries),
        Err(err) => return Err(ReconcileError::io(path, err)),
    };
    while let Some(entry) = dir
        .next_entry()
        .await
        .map_err(|err| ReconcileError::io(path, err))?
    {
        let Ok(name) = entry.file_name().into_string() else {
            warn!(target: COMMON, dir = %path.display(), "skipping entry with non UTF-8 name");
            continue;
        };
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(ReconcileError::io(&entry.path(), err)),
        };
        if metadata.file_type().is_symlink() {
            continue;
        }
        entries.push(LiveEntry {
            name,
            is_dir: metadata.is_dir(),
            stat: LocalStat::from_metadata(&metadata),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// Stats the stored children of `path` instead of listing it. Entries that
/// are gone are left out, so they surface as missing.
pub async fn stat_known(
    path: &Path,
    stored_dirs: &[DirectoryEntry],
    stored_files: &[FileEntry],
) -> Result<Vec<LiveEntry>, ReconcileError> {
    let names = stored_dirs
        .iter()
        .map(|dir| dir.name.as_str())
        .chain(stored_files.iter().map(|file| file.name.as_str()));
    let mut entries = Vec::new();
    for name in names {
        let child = path.join(name);
        let metadata = match tokio::fs::symlink_metadata(&child).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(ReconcileError::io(&child, err)),
        };
        if metadata.file_type().is_symlink() {
            continue;
        }
        entries.push(LiveEntry {
            name: name.to_string(),
            is_dir: metadata.is_dir(),
            stat: LocalStat::from_metadata(&metadata),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// Differences between one stored directory level and its live listing.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LevelDiff {
    /// Matched directories whose attributes changed.
    pub update_dirs: Vec<DirectoryEntry>,
    /// Every matched directory with its live state, for recursion.
    pub descend: Vec<(DirectoryEntry, LocalStat)>,
    pub new_dirs: Vec<String>,
    pub update_files: Vec<FileEntry>,
    pub new_files: Vec<String>,
    pub temp_files: Vec<String>,
    pub missing_files: Vec<FileEntry>,
    pub missing_dirs: Vec<DirectoryEntry>,
}

pub fn diff_level(
    stored_dirs: Vec<DirectoryEntry>,
    stored_files: Vec<FileEntry>,
    live: Vec<LiveEntry>,
) -> LevelDiff {
    let mut dirs: HashMap<String, DirectoryEntry> = stored_dirs
        .into_iter()
        .map(|dir| (dir.name.clone(), dir))
        .collect();
    let mut files: HashMap<String, FileEntry> = stored_files
        .into_iter()
        .map(|file| (file.name.clone(), file))
        .collect();
    let mut diff = LevelDiff::default();

    for entry in live {
        if entry.is_dir {
            match dirs.remove(&entry.name) {
                Some(stored) => {
                    if stored.attributes != entry.stat.attributes {
                        diff.update_dirs.push(stored.clone());
                    }
                    diff.descend.push((stored, entry.stat));
                }
                None => diff.new_dirs.push(entry.name),
            }
        } else if is_temp_name(&entry.name) {
            diff.temp_files.push(entry.name);
        } else {
            match files.remove(&entry.name) {
                Some(stored) => {
                    let changed = stored.size != entry.stat.size
                        || stored.modified != entry.stat.modified
                        || stored.attributes != entry.stat.attributes;
                    if changed {
                        diff.update_files.push(stored);
                    }
                }
                None => diff.new_files.push(entry.name),
            }
        }
    }

    diff.missing_files = files.into_values().collect();
    diff.missing_files.sort_by_key(|file| file.id);
    diff.missing_dirs = dirs.into_values().collect();
    diff.missing_dirs.sort_by_key(|dir| dir.id);
    diff
}

pub struct LocalReconciler<'a> {
    store: &'a InventoryStore,
    mode: ScanMode,
    remove_temp: bool,
}

impl<'a> LocalReconciler<'a> {
    pub fn new(store: &'a InventoryStore, mode: ScanMode) -> Self {
        Self {
            store,
            mode,
            remove_temp: true,
        }
    }

    /// Skips partial files instead of deleting them.
    pub fn keep_temp_files(mut self) -> Self {
        self.remove_temp = false;
        self
    }

    /// Scans the whole tree rooted at `root`.
    pub async fn scan(&self, root: &Path) -> Result<ScanReport, ReconcileError> {
        let mut report = ScanReport::default();
        self.scan_dir(ROOT_DIR_ID, root.to_path_buf(), false, &mut report)
            .await?;
        debug!(
            target: COMMON,
            directory = self.store.directory_name(),
            enqueued = report.enqueued,
            removed_temp = report.removed_temp,
            "local scan finished"
        );
        Ok(report)
    }

    /// With `known_members` set the listing is skipped and only the stored
    /// children are checked.
    fn scan_dir<'b>(
        &'b self,
        dir_id: i64,
        path: PathBuf,
        known_members: bool,
        report: &'b mut ScanReport,
    ) -> BoxFuture<'b, Result<(), ReconcileError>> {
        Box::pin(async move {
            let stored_dirs = self.store.directory_children(dir_id).await?;
            let stored_files = self.store.file_children(dir_id).await?;
            let live = if known_members {
                stat_known(&path, &stored_dirs, &stored_files).await?
            } else {
                read_listing(&path).await?
            };
            let diff = diff_level(stored_dirs, stored_files, live);
            self.apply_level(dir_id, &path, &diff, report).await?;

            for (stored, stat) in diff.descend {
                let unchanged = self.mode == ScanMode::Shallow
                    && stored.modified == stat.modified
                    && stored.digest != EMPTY_DIGEST;
                let child = path.join(&stored.name);
                self.scan_dir(stored.id, child, unchanged, report).await?;
                if stored.modified != stat.modified {
                    self.store.directory_list_touch(stored.id, stat.modified).await?;
                }
            }
            Ok(())
        })
    }

    async fn apply_level(
        &self,
        dir_id: i64,
        path: &Path,
        diff: &LevelDiff,
        report: &mut ScanReport,
    ) -> Result<(), ReconcileError> {
        let store = self.store;

        for file in &diff.missing_files {
            store
                .enqueue(NewQueueItem::file(
                    ActionType::RemoveFile,
                    file.id,
                    dir_id,
                    &file.name,
                ))
                .await?;
            report.enqueued += 1;
        }
        for dir in &diff.missing_dirs {
            report.enqueued += self.enqueue_removal_chain(dir).await?;
        }
        for name in diff.temp_files.iter().filter(|_| self.remove_temp) {
            let temp = path.join(name);
            match tokio::fs::remove_file(&temp).await {
                Ok(()) => report.removed_temp += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(ReconcileError::io(&temp, err)),
            }
        }
        for dir in &diff.update_dirs {
            store
                .enqueue(NewQueueItem::dir(ActionType::UpdateDir, dir.id, &dir.name))
                .await?;
            report.enqueued += 1;
        }
        for file in &diff.update_files {
            store
                .enqueue(NewQueueItem::file(
                    ActionType::UpdateFile,
                    file.id,
                    dir_id,
                    &file.name,
                ))
                .await?;
            report.enqueued += 1;
        }
        for name in &diff.new_files {
            store
                .enqueue(NewQueueItem::file(ActionType::AddFile, 0, dir_id, name))
                .await?;
            report.enqueued += 1;
        }
        for name in &diff.new_dirs {
            let queued = store
                .enqueue(NewQueueItem::dir(ActionType::AddDir, dir_id, name))
                .await?;
            report.enqueued += 1;
            self.enqueue_new_subtree(path.join(name), queued, report)
                .await?;
        }
        Ok(())
    }

    /// Queues creation of everything below a directory that is itself still
    /// waiting to be created. Items carry directory id 0 until their parent's
    /// `AddDir` is finalized.
    fn enqueue_new_subtree<'b>(
        &'b self,
        path: PathBuf,
        parent_item: i64,
        report: &'b mut ScanReport,
    ) -> BoxFuture<'b, Result<(), ReconcileError>> {
        Box::pin(async move {
            for entry in read_listing(&path).await? {
                if entry.is_dir {
                    let queued = self
                        .store
                        .enqueue(
                            NewQueueItem::dir(ActionType::AddDir, 0, &entry.name)
                                .after(Some(parent_item)),
                        )
                        .await?;
                    report.enqueued += 1;
                    self.enqueue_new_subtree(path.join(&entry.name), queued, report)
                        .await?;
                } else if is_temp_name(&entry.name) {
                    let temp = path.join(&entry.name);
                    if self.remove_temp && tokio::fs::remove_file(&temp).await.is_ok() {
                        report.removed_temp += 1;
                    }
                } else {
                    self.store
                        .enqueue(
                            NewQueueItem::file(ActionType::AddFile, 0, 0, &entry.name)
                                .after(Some(parent_item)),
                        )
                        .await?;
                    report.enqueued += 1;
                }
            }
            Ok(())
        })
    }

    /// Queues removal of a stored subtree as one chain: files and
    /// subdirectories first, `dir` itself last. Returns the number of items.
    async fn enqueue_removal_chain(&self, dir: &DirectoryEntry) -> Result<usize, ReconcileError> {
        let subtree = self.store.directory_subtree(dir.id).await?;
        let mut previous = None;
        let mut count = 0;
        for node in subtree.iter().rev() {
            for file in self.store.file_children(node.id).await? {
                let item = NewQueueItem::file(ActionType::RemoveFile, file.id, node.id, &file.name)
                    .after(previous);
                previous = Some(self.store.enqueue(item).await?);
                count += 1;
            }
            let item = NewQueueItem::dir(ActionType::RemoveDir, node.id, &node.name).after(previous);
            previous = Some(self.store.enqueue(item).await?);
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
#[path = "local_tests.rs"]
mod tests;
