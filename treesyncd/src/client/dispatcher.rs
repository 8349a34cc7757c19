//! Carries queue items out against the server. Every store change happens
//! only after the server confirmed the matching operation.

use std::io;
use std::path::Path;

use tracing::{debug, warn};
use treesync_core::{ClientSession, ErrorCode, SessionError, WireDir, WireFile, checksum_file};

use crate::logging::CLIENT;
use crate::sync::apply::{ApplyError, LocalTree, replace_file};
use crate::sync::conflict::{LocalFileState, UpdateDecision, decide_update};
use crate::sync::digest::{EMPTY_DIGEST, recompute_digest};
use crate::sync::index::{ActionType, DirectoryEntry, FileEntry, IndexError, InventoryStore, QueueItem};
use crate::sync::paths::{LocalStat, apply_attributes, apply_metadata};
use crate::sync::processor::{Dispatch, DispatchError, Outcome};

impl From<SessionError> for DispatchError {
    fn from(err: SessionError) -> Self {
        if err.is_fatal() {
            DispatchError::Abort(err.to_string())
        } else {
            DispatchError::Retry(err.to_string())
        }
    }
}

impl From<ApplyError> for DispatchError {
    fn from(err: ApplyError) -> Self {
        DispatchError::Retry(err.to_string())
    }
}

fn io_retry(path: &Path, err: io::Error) -> DispatchError {
    DispatchError::Retry(format!("{}: {err}", path.display()))
}

pub struct ClientDispatcher<'a> {
    session: &'a mut ClientSession,
    tree: &'a LocalTree,
}

impl<'a> ClientDispatcher<'a> {
    pub fn new(session: &'a mut ClientSession, tree: &'a LocalTree) -> Self {
        Self { session, tree }
    }

    async fn add_dir(
        &mut self,
        store: &InventoryStore,
        item: &QueueItem,
    ) -> Result<Outcome, DispatchError> {
        let Some(path) = self.resolve(store, item.dir_id, &item.name).await? else {
            return Ok(Outcome::Vanished);
        };
        let Some(live) = local_dir(&path).await else {
            return Ok(Outcome::Vanished);
        };

        let created = match self
            .session
            .create_directory(item.dir_id, &item.name, live.modified, &live.attributes)
            .await
        {
            Ok(dir) => dir,
            Err(err) if err.code() == Some(ErrorCode::AlreadyExists) => {
                let listing = self.session.list_directory(item.dir_id).await?;
                listing
                    .directories
                    .into_iter()
                    .find(|dir| dir.name == item.name)
                    .ok_or_else(|| DispatchError::Retry(err.to_string()))?
            }
            Err(err) => return Err(err.into()),
        };

        store.directory_list_upsert(&fresh_directory(&created)).await?;
        recompute_digest(store, item.dir_id).await?;
        Ok(Outcome::Applied {
            created_id: Some(created.id),
        })
    }

    async fn add_file(
        &mut self,
        store: &InventoryStore,
        item: &QueueItem,
    ) -> Result<Outcome, DispatchError> {
        let Some(path) = self.resolve(store, item.dir_id, &item.name).await? else {
            return Ok(Outcome::Vanished);
        };
        let Some(live) = local_file(&path).await else {
            return Ok(Outcome::Vanished);
        };
        let uploaded = self
            .session
            .upload_file(item.dir_id, &item.name, &path, live.modified, &live.attributes)
            .await?;
        self.record_file(store, &uploaded).await?;
        Ok(Outcome::applied())
    }

    async fn update_file(
        &mut self,
        store: &InventoryStore,
        item: &QueueItem,
    ) -> Result<Outcome, DispatchError> {
        let Some(stored) = store.file(item.file_id).await? else {
            return Ok(Outcome::Vanished);
        };
        let Some(path) = self.resolve(store, stored.dir_id, &stored.name).await? else {
            return Ok(Outcome::Vanished);
        };
        let Some(live) = local_file(&path).await else {
            return Ok(Outcome::Vanished);
        };
        let summary = checksum_file(&path)
            .await
            .map_err(|err| DispatchError::Retry(err.to_string()))?;
        let local = LocalFileState {
            size: summary.bytes,
            modified: live.modified,
            attributes: live.attributes,
            crc32: summary.crc32,
        };
        let server = self.session.file_info(stored.id).await?;

        let decision = decide_update(&local, &stored, server.as_ref());
        debug!(target: CLIENT, file = %stored.name, ?decision, "update decision");
        match (decision, server) {
            (UpdateDecision::Download, Some(server)) => {
                self.download(store, &server, Some(&stored), &path).await?;
            }
            (UpdateDecision::Adopt, Some(server)) => {
                self.record_file(store, &server).await?;
            }
            (UpdateDecision::PushMetadata, Some(server)) => {
                let updated = self
                    .session
                    .set_file_info(server.id, local.modified, &local.attributes)
                    .await?;
                self.record_file(store, &updated).await?;
            }
            _ => {
                let uploaded = self
                    .session
                    .upload_file(
                        stored.dir_id,
                        &stored.name,
                        &path,
                        local.modified,
                        &local.attributes,
                    )
                    .await?;
                self.record_file(store, &uploaded).await?;
            }
        }
        Ok(Outcome::applied())
    }

    async fn remove_file(
        &mut self,
        store: &InventoryStore,
        item: &QueueItem,
    ) -> Result<Outcome, DispatchError> {
        match self.session.remove_file(item.file_id).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
        store.file_list_remove(item.file_id).await?;
        if store.directory(item.dir_id).await?.is_some() {
            recompute_digest(store, item.dir_id).await?;
        }
        Ok(Outcome::applied())
    }

    async fn remove_dir(
        &mut self,
        store: &InventoryStore,
        item: &QueueItem,
    ) -> Result<Outcome, DispatchError> {
        match self.session.remove_directory(item.dir_id).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
        if let Some(dir) = store.directory(item.dir_id).await? {
            store.directory_list_remove(dir.id).await?;
            if let Some(parent) = dir.parent_id {
                recompute_digest(store, parent).await?;
            }
        }
        Ok(Outcome::applied())
    }

    async fn update_dir(
        &mut self,
        store: &InventoryStore,
        item: &QueueItem,
    ) -> Result<Outcome, DispatchError> {
        let Some(stored) = store.directory(item.dir_id).await? else {
            return Ok(Outcome::Vanished);
        };
        let path = self.tree.dir_path(store, stored.id).await?;
        let Some(live) = local_dir(&path).await else {
            return Ok(Outcome::Vanished);
        };
        let updated = match self
            .session
            .set_directory_info(stored.id, live.modified, &live.attributes)
            .await
        {
            Ok(dir) => dir,
            Err(err) if err.is_not_found() => return Ok(Outcome::Vanished),
            Err(err) => return Err(err.into()),
        };
        let entry = DirectoryEntry {
            attributes: updated.attributes,
            modified: live.modified,
            ..stored
        };
        store.directory_list_update(&entry).await?;
        if let Some(parent) = entry.parent_id {
            recompute_digest(store, parent).await?;
        }
        Ok(Outcome::applied())
    }

    async fn download_dir(
        &mut self,
        store: &InventoryStore,
        item: &QueueItem,
    ) -> Result<Outcome, DispatchError> {
        let Some(server) = self.session.directory_info(item.dir_id).await? else {
            return Ok(Outcome::Vanished);
        };
        let Some(parent) = server.parent_id else {
            return Ok(Outcome::Vanished);
        };
        let Some(path) = self.resolve(store, parent, &server.name).await? else {
            return Ok(Outcome::Vanished);
        };
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|err| io_retry(&path, err))?;
        if let Err(err) = apply_attributes(&path, &server.attributes) {
            warn!(target: CLIENT, path = %path.display(), error = %err, "could not apply attributes");
        }
        store.directory_list_upsert(&fresh_directory(&server)).await?;
        recompute_digest(store, parent).await?;
        Ok(Outcome::Applied {
            created_id: Some(server.id),
        })
    }

    async fn download_file(
        &mut self,
        store: &InventoryStore,
        item: &QueueItem,
    ) -> Result<Outcome, DispatchError> {
        let Some(server) = self.session.file_info(item.file_id).await? else {
            return Ok(Outcome::Vanished);
        };
        let Some(path) = self.resolve(store, server.dir_id, &server.name).await? else {
            return Ok(Outcome::Vanished);
        };
        let previous = match store.file(server.id).await? {
            Some(entry) => Some(entry),
            None => store.file_by_name(server.dir_id, &server.name).await?,
        };
        let previous = match previous {
            Some(entry) => Some(entry),
            None => untracked_entry(&path, &server).await,
        };
        self.download(store, &server, previous.as_ref(), &path).await?;
        Ok(Outcome::applied())
    }

    /// Fetches `server` into `path`, preserving the replaced copy in history.
    async fn download(
        &mut self,
        store: &InventoryStore,
        server: &WireFile,
        previous: Option<&FileEntry>,
        path: &Path,
    ) -> Result<(), DispatchError> {
        let pending = self.session.download_file(server.id, path).await?;
        if let Err(err) = replace_file(store, self.tree, previous, &pending.temp, path).await {
            pending.discard().await;
            return Err(err.into());
        }
        apply_metadata(path, pending.file.modified, &pending.file.attributes)
            .map_err(|err| io_retry(path, err))?;
        debug!(target: CLIENT, file = %pending.file.name, bytes = pending.summary.bytes, "downloaded");
        self.record_file(store, &pending.file).await
    }

    async fn record_file(&self, store: &InventoryStore, file: &WireFile) -> Result<(), DispatchError> {
        store.file_list_upsert(&FileEntry::from(file)).await?;
        recompute_digest(store, file.dir_id).await?;
        Ok(())
    }

    /// Local path of `name` inside stored directory `dir_id`, or `None` when
    /// the directory is no longer in the store.
    async fn resolve(
        &self,
        store: &InventoryStore,
        dir_id: i64,
        name: &str,
    ) -> Result<Option<std::path::PathBuf>, DispatchError> {
        match self.tree.entry_path(store, dir_id, name).await {
            Ok(path) => Ok(Some(path)),
            Err(ApplyError::Index(IndexError::MissingDirectory(_))) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

impl Dispatch for ClientDispatcher<'_> {
    async fn dispatch(
        &mut self,
        store: &InventoryStore,
        item: &QueueItem,
    ) -> Result<Outcome, DispatchError> {
        match item.action {
            ActionType::AddDir => self.add_dir(store, item).await,
            ActionType::AddFile => self.add_file(store, item).await,
            ActionType::UpdateFile => self.update_file(store, item).await,
            ActionType::RemoveFile => self.remove_file(store, item).await,
            ActionType::RemoveDir => self.remove_dir(store, item).await,
            ActionType::UpdateDir => self.update_dir(store, item).await,
            ActionType::DownloadDir => self.download_dir(store, item).await,
            ActionType::DownloadFile => self.download_file(store, item).await,
        }
    }
}

/// Store row for a directory whose children are not recorded yet.
fn fresh_directory(server: &WireDir) -> DirectoryEntry {
    DirectoryEntry {
        digest: EMPTY_DIGEST,
        ..DirectoryEntry::from(server)
    }
}

async fn local_dir(path: &Path) -> Option<LocalStat> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => Some(LocalStat::from_metadata(&meta)),
        _ => None,
    }
}

async fn local_file(path: &Path) -> Option<LocalStat> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Some(LocalStat::from_metadata(&meta)),
        _ => None,
    }
}

/// Describes a local file the store never recorded, so a download that
/// overwrites it still leaves a copy in history.
async fn untracked_entry(path: &Path, server: &WireFile) -> Option<FileEntry> {
    let live = local_file(path).await?;
    Some(FileEntry {
        id: 0,
        dir_id: server.dir_id,
        name: server.name.clone(),
        size: live.size,
        modified: live.modified,
        attributes: live.attributes,
        crc32: 0,
        md5: [0; 16],
        changed: 0,
    })
}

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod tests;
