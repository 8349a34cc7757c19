//! Filesystem side effects that must stay in step with the store.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};
use treesync_core::promote;

use super::history::{claim_history_path, move_into_history};
use super::index::{FileEntry, HistoryAction, HistoryRecord, IndexError, InventoryStore};
use super::paths::{PathError, now_ms, resolve_under};
use crate::logging::COMMON;

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("store error: {0}")]
    Index(#[from] IndexError),
    #[error("I/O error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("path error: {0}")]
    Path(#[from] PathError),
}

impl ApplyError {
    fn io(path: &Path, source: io::Error) -> Self {
        ApplyError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Where one sync directory lives on disk, and where superseded files go.
#[derive(Debug, Clone)]
pub struct LocalTree {
    root: PathBuf,
    history_root: PathBuf,
}

impl LocalTree {
    pub fn new(root: impl Into<PathBuf>, history_root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            history_root: history_root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn history_root(&self) -> &Path {
        &self.history_root
    }

    pub async fn dir_path(&self, store: &InventoryStore, dir_id: i64) -> Result<PathBuf, ApplyError> {
        let relative = store.directory_path(dir_id).await?;
        Ok(resolve_under(&self.root, &relative)?)
    }

    pub async fn entry_path(
        &self,
        store: &InventoryStore,
        dir_id: i64,
        name: &str,
    ) -> Result<PathBuf, ApplyError> {
        Ok(self.dir_path(store, dir_id).await?.join(name))
    }
}

/// Saves the current on-disk copy of `entry` into history when the store has
/// history enabled. A file that is already gone is not an error.
async fn preserve(
    store: &InventoryStore,
    tree: &LocalTree,
    entry: &FileEntry,
    path: &Path,
    action: HistoryAction,
) -> Result<(), ApplyError> {
    let recorded = now_ms();
    let relative = claim_history_path(tree.history_root(), recorded, &entry.name)
        .await
        .map_err(|err| ApplyError::io(tree.history_root(), err))?;
    let destination = tree.history_root().join(&relative);
    if let Err(err) = move_into_history(path, &destination).await {
        if let Err(cleanup) = tokio::fs::remove_file(&destination).await {
            debug!(target: COMMON, path = %destination.display(), error = %cleanup, "history slot not released");
        }
        if tokio::fs::try_exists(path).await.unwrap_or(true) {
            return Err(ApplyError::io(path, err));
        }
        warn!(target: COMMON, path = %path.display(), error = %err, "file already absent, nothing to keep");
        return Ok(());
    }
    let record = HistoryRecord {
        id: 0,
        action,
        path: relative.to_string_lossy().into_owned(),
        name: entry.name.clone(),
        size: entry.size,
        modified: entry.modified,
        attributes: entry.attributes.clone(),
        md5: entry.md5,
        crc32: entry.crc32,
        recorded,
    };
    store.history_append(&record).await?;
    debug!(target: COMMON, file = %entry.name, "moved into history");
    Ok(())
}

/// Removes a file from disk and then from the store. With history disabled a
/// failed delete leaves the row in place.
pub async fn remove_file(
    store: &InventoryStore,
    tree: &LocalTree,
    entry: &FileEntry,
) -> Result<(), ApplyError> {
    let path = tree.entry_path(store, entry.dir_id, &entry.name).await?;
    if store.history_enabled() {
        preserve(store, tree, entry, &path, HistoryAction::Removed).await?;
    } else {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(ApplyError::io(&path, err)),
        }
    }
    store.file_list_remove(entry.id).await?;
    Ok(())
}

/// Moves a verified temp file over `target`. The replaced content goes to
/// history first when `previous` is known and history is enabled.
pub async fn replace_file(
    store: &InventoryStore,
    tree: &LocalTree,
    previous: Option<&FileEntry>,
    temp: &Path,
    target: &Path,
) -> Result<(), ApplyError> {
    if store.history_enabled()
        && let Some(previous) = previous
        && tokio::fs::try_exists(target).await.unwrap_or(false)
    {
        preserve(store, tree, previous, target, HistoryAction::Replaced).await?;
    }
    promote(temp, target)
        .await
        .map_err(|err| ApplyError::io(target, err))
}

/// Removes a stored directory subtree: files through [`remove_file`], then
/// directories deepest first. Directories that still hold untracked entries
/// stay on disk; their rows are dropped regardless.
pub async fn remove_directory_tree(
    store: &InventoryStore,
    tree: &LocalTree,
    dir_id: i64,
) -> Result<(), ApplyError> {
    let subtree = store.directory_subtree(dir_id).await?;
    let mut paths = Vec::with_capacity(subtree.len());
    for dir in &subtree {
        paths.push(tree.dir_path(store, dir.id).await?);
    }
    for (dir, path) in subtree.iter().zip(paths.iter()).rev() {
        for file in store.file_children(dir.id).await? {
            remove_file(store, tree, &file).await?;
        }
        match tokio::fs::remove_dir(path).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                debug!(target: COMMON, path = %path.display(), error = %err, "directory left on disk");
            }
        }
    }
    store.directory_list_remove(dir_id).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::index::NewFile;
    use treesync_core::ROOT_DIR_ID;

    fn sample(dir_id: i64, name: &str) -> NewFile {
        NewFile {
            dir_id,
            name: name.into(),
            size: 3,
            modified: 10,
            attributes: "644".into(),
            crc32: 1,
            md5: [1; 16],
            changed: 10,
        }
    }

    #[tokio::test]
    async fn removal_with_history_keeps_a_copy() {
        let dir = tempfile::tempdir().unwrap();
        let tree = LocalTree::new(dir.path().join("docs"), dir.path().join("history"));
        tokio::fs::create_dir_all(tree.root()).await.unwrap();
        tokio::fs::write(tree.root().join("a.txt"), b"old").await.unwrap();
        let store = InventoryStore::open_in_memory("docs", true).await.unwrap();
        let entry = store.file_list_insert(sample(ROOT_DIR_ID, "a.txt")).await.unwrap();

        remove_file(&store, &tree, &entry).await.unwrap();

        assert!(!tree.root().join("a.txt").exists());
        assert!(store.file(entry.id).await.unwrap().is_none());
        let records = store.history_records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, HistoryAction::Removed);
        let kept = tree.history_root().join(&records[0].path);
        assert_eq!(tokio::fs::read(kept).await.unwrap(), b"old");
    }

    #[tokio::test]
    async fn removal_of_absent_file_still_drops_row() {
        let dir = tempfile::tempdir().unwrap();
        let tree = LocalTree::new(dir.path().join("docs"), dir.path().join("history"));
        let store = InventoryStore::open_in_memory("docs", true).await.unwrap();
        let entry = store.file_list_insert(sample(ROOT_DIR_ID, "gone.txt")).await.unwrap();

        remove_file(&store, &tree, &entry).await.unwrap();

        assert!(store.file(entry.id).await.unwrap().is_none());
        assert!(store.history_records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replace_moves_previous_content_to_history() {
        let dir = tempfile::tempdir().unwrap();
        let tree = LocalTree::new(dir.path().join("docs"), dir.path().join("history"));
        tokio::fs::create_dir_all(tree.root()).await.unwrap();
        let target = tree.root().join("a.txt");
        let temp = tree.root().join("a.txt.tsyncpart");
        tokio::fs::write(&target, b"old").await.unwrap();
        tokio::fs::write(&temp, b"new").await.unwrap();
        let store = InventoryStore::open_in_memory("docs", true).await.unwrap();
        let entry = store.file_list_insert(sample(ROOT_DIR_ID, "a.txt")).await.unwrap();

        replace_file(&store, &tree, Some(&entry), &temp, &target)
            .await
            .unwrap();

        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"new");
        assert!(!temp.exists());
        let records = store.history_records().await.unwrap();
        assert_eq!(records[0].action, HistoryAction::Replaced);
    }

    #[tokio::test]
    async fn directory_with_untracked_files_stays_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let tree = LocalTree::new(dir.path().join("docs"), dir.path().join("history"));
        let store = InventoryStore::open_in_memory("docs", false).await.unwrap();
        let a = store
            .directory_list_insert(ROOT_DIR_ID, "a", 0, "755")
            .await
            .unwrap();
        let b = store.directory_list_insert(a.id, "b", 0, "755").await.unwrap();
        store.file_list_insert(sample(b.id, "tracked.txt")).await.unwrap();
        let b_path = tree.root().join("a").join("b");
        tokio::fs::create_dir_all(&b_path).await.unwrap();
        tokio::fs::write(b_path.join("tracked.txt"), b"x").await.unwrap();
        tokio::fs::write(tree.root().join("a").join("untracked.txt"), b"y")
            .await
            .unwrap();

        remove_directory_tree(&store, &tree, a.id).await.unwrap();

        assert!(!b_path.exists());
        assert!(tree.root().join("a").join("untracked.txt").exists());
        assert!(store.directory(a.id).await.unwrap().is_none());
        assert!(store.directory(b.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn same_named_files_removed_together_keep_every_copy() {
        let dir = tempfile::tempdir().unwrap();
        let tree = LocalTree::new(dir.path().join("docs"), dir.path().join("history"));
        let store = InventoryStore::open_in_memory("docs", true).await.unwrap();
        let top = store
            .directory_list_insert(ROOT_DIR_ID, "top", 0, "755")
            .await
            .unwrap();
        for n in 0..20 {
            let name = format!("d{n}");
            let sub = store.directory_list_insert(top.id, &name, 0, "755").await.unwrap();
            store.file_list_insert(sample(sub.id, "README")).await.unwrap();
            let path = tree.root().join("top").join(&name);
            tokio::fs::create_dir_all(&path).await.unwrap();
            tokio::fs::write(path.join("README"), format!("copy {n}"))
                .await
                .unwrap();
        }

        remove_directory_tree(&store, &tree, top.id).await.unwrap();

        let records = store.history_records().await.unwrap();
        assert_eq!(records.len(), 20);
        let mut kept = std::collections::HashSet::new();
        for record in &records {
            let content = tokio::fs::read(tree.history_root().join(&record.path))
                .await
                .unwrap();
            kept.insert(content);
        }
        assert_eq!(kept.len(), 20);
        assert!(!tree.root().join("top").exists());
    }
}
