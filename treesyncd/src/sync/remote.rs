//! Remote reconciler: walks the server's tree level by level and folds its
//! changes into the local store, queueing downloads for content that has to
//! be fetched.

use std::future::Future;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use treesync_core::{ClientSession, FileListResponse, ROOT_DIR_ID, SessionError, WireDir, WireFile};

use super::apply::{LocalTree, remove_directory_tree, remove_file};
use super::digest::{EMPTY_DIGEST, recompute_digest, recompute_level};
use super::index::{ActionType, DirectoryEntry, FileEntry, InventoryStore, NewQueueItem};
use super::local::{BoxFuture, ReconcileError};
use super::paths::{LocalStat, apply_attributes, apply_metadata, stat};
use crate::logging::COMMON;

/// The read side of the server, as seen by the reconciler.
pub trait RemotePeer {
    fn list_directory(
        &mut self,
        dir_id: i64,
    ) -> impl Future<Output = Result<FileListResponse, SessionError>> + Send;

    fn directory_digest(
        &mut self,
        dir_id: i64,
    ) -> impl Future<Output = Result<[u8; 16], SessionError>> + Send;
}

impl RemotePeer for ClientSession {
    async fn list_directory(&mut self, dir_id: i64) -> Result<FileListResponse, SessionError> {
        ClientSession::list_directory(self, dir_id).await
    }

    async fn directory_digest(&mut self, dir_id: i64) -> Result<[u8; 16], SessionError> {
        ClientSession::directory_digest(self, dir_id).await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteReport {
    pub updated: usize,
    pub adopted: usize,
    pub inserted: usize,
    pub removed: usize,
    pub enqueued: usize,
}

pub struct RemoteReconciler<'a> {
    store: &'a InventoryStore,
    tree: &'a LocalTree,
    digest_pruning: bool,
}

impl<'a> RemoteReconciler<'a> {
    pub fn new(store: &'a InventoryStore, tree: &'a LocalTree) -> Self {
        Self {
            store,
            tree,
            digest_pruning: false,
        }
    }

    /// Skip matched subtrees whose stored digest already equals the server's.
    pub fn with_digest_pruning(mut self, enabled: bool) -> Self {
        self.digest_pruning = enabled;
        self
    }

    pub async fn reconcile<P>(&self, peer: &mut P) -> Result<RemoteReport, ReconcileError>
    where
        P: RemotePeer + Send,
    {
        let mut report = RemoteReport::default();
        let root = self.tree.root().to_path_buf();
        self.reconcile_dir(peer, ROOT_DIR_ID, root, &mut report)
            .await?;
        recompute_digest(self.store, ROOT_DIR_ID).await?;
        info!(
            target: COMMON,
            directory = self.store.directory_name(),
            updated = report.updated,
            adopted = report.adopted,
            inserted = report.inserted,
            removed = report.removed,
            enqueued = report.enqueued,
            "remote reconcile finished"
        );
        Ok(report)
    }

    fn reconcile_dir<'b, P>(
        &'b self,
        peer: &'b mut P,
        dir_id: i64,
        path: PathBuf,
        report: &'b mut RemoteReport,
    ) -> BoxFuture<'b, Result<(), ReconcileError>>
    where
        P: RemotePeer + Send,
    {
        Box::pin(async move {
            let listing = peer.list_directory(dir_id).await?;
            let mut stored_dirs = self.store.directory_children(dir_id).await?;
            let mut stored_files = self.store.file_children(dir_id).await?;
            let mut descend = Vec::new();

            let mut server_dirs = listing.directories;
            server_dirs.sort_by_key(|dir| dir.id);
            for server in server_dirs {
                let matched = take_match(&mut stored_dirs, server.id, &server.name, |dir| {
                    (dir.id, dir.name.as_str())
                });
                match matched {
                    Some(stored) => {
                        let prune = self.digest_pruning && stored.digest == server.digest;
                        self.refresh_directory(&path, stored, &server, report)
                            .await?;
                        if !prune {
                            descend.push(server);
                        }
                    }
                    None => {
                        let target = path.join(&server.name);
                        if tokio::fs::metadata(&target)
                            .await
                            .is_ok_and(|meta| meta.is_dir())
                        {
                            let mut entry = DirectoryEntry::from(&server);
                            entry.digest = EMPTY_DIGEST;
                            self.store.directory_list_insert_with_id(&entry).await?;
                            report.inserted += 1;
                            descend.push(server);
                        } else {
                            let queued = self
                                .store
                                .enqueue(NewQueueItem::dir(
                                    ActionType::DownloadDir,
                                    server.id,
                                    &server.name,
                                ))
                                .await?;
                            report.enqueued += 1;
                            self.queue_server_subtree(peer, server.id, queued, report)
                                .await?;
                        }
                    }
                }
            }

            let mut server_files = listing.files;
            server_files.sort_by_key(|file| file.id);
            for server in server_files {
                let matched = take_match(&mut stored_files, server.id, &server.name, |file| {
                    (file.id, file.name.as_str())
                });
                match matched {
                    Some(stored) => {
                        self.refresh_file(&path, dir_id, stored, &server, report)
                            .await?;
                    }
                    None => self.adopt_file(&path, dir_id, &server, report).await?,
                }
            }

            for file in stored_files {
                debug!(target: COMMON, file = %file.name, "removed on server");
                remove_file(self.store, self.tree, &file).await?;
                report.removed += 1;
            }
            for dir in stored_dirs {
                debug!(target: COMMON, dir = %dir.name, "removed on server");
                remove_directory_tree(self.store, self.tree, dir.id).await?;
                report.removed += 1;
            }

            for server in descend {
                let child = path.join(&server.name);
                self.reconcile_dir(&mut *peer, server.id, child, &mut *report)
                    .await?;
            }
            recompute_level(self.store, dir_id).await?;
            Ok(())
        })
    }

    /// Brings a matched directory row in line with the server, adopting the
    /// server's id when the match was by name only.
    async fn refresh_directory(
        &self,
        path: &Path,
        stored: DirectoryEntry,
        server: &WireDir,
        report: &mut RemoteReport,
    ) -> Result<(), ReconcileError> {
        if stored.id != server.id {
            debug!(target: COMMON, dir = %server.name, from = stored.id, to = server.id, "adopting server identity");
            self.store
                .directory_list_update_id(stored.id, server.id)
                .await?;
            report.adopted += 1;
        }
        if stored.attributes != server.attributes || stored.name != server.name {
            let mut entry = DirectoryEntry::from(server);
            entry.digest = stored.digest;
            entry.modified = stored.modified;
            self.store.directory_list_update(&entry).await?;
            let target = path.join(&server.name);
            let previous = path.join(&stored.name);
            if stored.name != server.name && tokio::fs::try_exists(&previous).await.unwrap_or(false) {
                tokio::fs::rename(&previous, &target)
                    .await
                    .map_err(|err| ReconcileError::io(&previous, err))?;
            }
            if let Err(err) = apply_attributes(&target, &server.attributes) {
                debug!(target: COMMON, path = %target.display(), error = %err, "could not apply attributes");
            }
            report.updated += 1;
        }
        Ok(())
    }

    async fn refresh_file(
        &self,
        path: &Path,
        dir_id: i64,
        stored: FileEntry,
        server: &WireFile,
        report: &mut RemoteReport,
    ) -> Result<(), ReconcileError> {
        if stored.id != server.id {
            self.store.file_list_update_id(stored.id, server.id).await?;
            report.adopted += 1;
        }
        let incoming = FileEntry::from(server);
        let mut current = stored;
        current.id = server.id;
        if current == incoming {
            return Ok(());
        }

        let target = path.join(&server.name);
        let same_content = current.size == incoming.size
            && current.crc32 == incoming.crc32
            && current.md5 == incoming.md5;
        let on_disk = stat(&target).await.ok();
        let untouched = on_disk.as_ref().is_some_and(|live| {
            live.size == current.size
                && live.modified == current.modified
                && live.attributes == current.attributes
        });

        self.store.file_list_update(&incoming).await?;
        report.updated += 1;

        if same_content && untouched {
            apply_metadata(&target, incoming.modified, &incoming.attributes)
                .map_err(|err| ReconcileError::io(&target, err))?;
        } else if on_disk.is_some() {
            self.store
                .enqueue(NewQueueItem::file(
                    ActionType::UpdateFile,
                    incoming.id,
                    dir_id,
                    &incoming.name,
                ))
                .await?;
            report.enqueued += 1;
        } else {
            self.store
                .enqueue(NewQueueItem::file(
                    ActionType::DownloadFile,
                    incoming.id,
                    dir_id,
                    &incoming.name,
                ))
                .await?;
            report.enqueued += 1;
        }
        Ok(())
    }

    /// Records a server file the store has never seen. An existing local file
    /// of the same name is kept and reconciled through `UpdateFile`.
    async fn adopt_file(
        &self,
        path: &Path,
        dir_id: i64,
        server: &WireFile,
        report: &mut RemoteReport,
    ) -> Result<(), ReconcileError> {
        let target = path.join(&server.name);
        let live = match tokio::fs::metadata(&target).await {
            Ok(meta) if meta.is_file() => Some(LocalStat::from_metadata(&meta)),
            _ => None,
        };
        let Some(live) = live else {
            self.store
                .enqueue(NewQueueItem::file(
                    ActionType::DownloadFile,
                    server.id,
                    dir_id,
                    &server.name,
                ))
                .await?;
            report.enqueued += 1;
            return Ok(());
        };

        let entry = FileEntry::from(server);
        self.store.file_list_insert_with_id(&entry).await?;
        report.inserted += 1;
        let differs = live.size != entry.size
            || live.modified != entry.modified
            || live.attributes != entry.attributes;
        if differs {
            self.store
                .enqueue(NewQueueItem::file(
                    ActionType::UpdateFile,
                    entry.id,
                    dir_id,
                    &entry.name,
                ))
                .await?;
            report.enqueued += 1;
        }
        Ok(())
    }

    /// Queues downloads for a server subtree whose root is itself still
    /// waiting to be created locally.
    fn queue_server_subtree<'b, P>(
        &'b self,
        peer: &'b mut P,
        dir_id: i64,
        parent_item: i64,
        report: &'b mut RemoteReport,
    ) -> BoxFuture<'b, Result<(), ReconcileError>>
    where
        P: RemotePeer + Send,
    {
        Box::pin(async move {
            let listing = peer.list_directory(dir_id).await?;
            for file in &listing.files {
                self.store
                    .enqueue(
                        NewQueueItem::file(ActionType::DownloadFile, file.id, dir_id, &file.name)
                            .after(Some(parent_item)),
                    )
                    .await?;
                report.enqueued += 1;
            }
            for dir in &listing.directories {
                let queued = self
                    .store
                    .enqueue(
                        NewQueueItem::dir(ActionType::DownloadDir, dir.id, &dir.name)
                            .after(Some(parent_item)),
                    )
                    .await?;
                report.enqueued += 1;
                self.queue_server_subtree(&mut *peer, dir.id, queued, &mut *report)
                    .await?;
            }
            Ok(())
        })
    }
}

/// Removes and returns the stored entry matching `id`, or failing that `name`.
fn take_match<T>(
    stored: &mut Vec<T>,
    id: i64,
    name: &str,
    key: impl Fn(&T) -> (i64, &str),
) -> Option<T> {
    let position = stored
        .iter()
        .position(|entry| key(entry).0 == id)
        .or_else(|| stored.iter().position(|entry| key(entry).1 == name))?;
    Some(stored.swap_remove(position))
}

#[cfg(test)]
#[path = "remote_tests.rs"]
mod tests;
