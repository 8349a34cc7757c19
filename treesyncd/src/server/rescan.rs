//! Background rescan of a server-side sync directory. Changes made directly
//! on the server's disk are folded into its store with store-assigned ids.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::{debug, info, warn};
use treesync_core::{ROOT_DIR_ID, checksum_file};

use crate::logging::SERVER;
use crate::sync::apply::{ApplyError, LocalTree};
use crate::sync::digest::recompute_digest_deep;
use crate::sync::index::{
    ActionType, DirectoryEntry, FileEntry, IndexError, InventoryStore, NewFile, QueueItem,
};
use crate::sync::local::{LocalReconciler, ReconcileError, ScanMode, ScanReport};
use crate::sync::paths::{LocalStat, now_ms};
use crate::sync::processor::{
    Dispatch, DispatchError, DrainError, DrainReport, Outcome, QueueProcessor,
};

#[derive(Debug, Error)]
pub enum RescanError {
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    Drain(#[from] DrainError),
    #[error("store error: {0}")]
    Index(#[from] IndexError),
}

/// Set of `(account, directory)` pairs with a rescan in flight.
#[derive(Debug, Clone, Default)]
pub struct RescanGuard {
    running: Arc<Mutex<HashSet<(String, String)>>>,
}

/// Held by a running rescan; dropping it frees the slot.
#[derive(Debug)]
pub struct RescanTicket {
    running: Arc<Mutex<HashSet<(String, String)>>>,
    key: (String, String),
}

impl RescanGuard {
    /// `None` when a rescan of the same directory is already running.
    pub fn try_start(&self, account: &str, directory: &str) -> Option<RescanTicket> {
        let key = (account.to_string(), directory.to_string());
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if !running.insert(key.clone()) {
            return None;
        }
        Some(RescanTicket {
            running: Arc::clone(&self.running),
            key,
        })
    }

    pub fn is_running(&self, account: &str, directory: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(account.to_string(), directory.to_string()))
    }
}

impl Drop for RescanTicket {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Applies queue items straight to the server's store.
pub struct RescanDispatcher<'a> {
    tree: &'a LocalTree,
}

impl<'a> RescanDispatcher<'a> {
    pub fn new(tree: &'a LocalTree) -> Self {
        Self { tree }
    }

    async fn live(
        &self,
        store: &InventoryStore,
        dir_id: i64,
        name: &str,
    ) -> Result<Option<(std::path::PathBuf, std::fs::Metadata)>, DispatchError> {
        let path = match self.tree.entry_path(store, dir_id, name).await {
            Ok(path) => path,
            Err(ApplyError::Index(IndexError::MissingDirectory(_))) => return Ok(None),
            Err(err) => return Err(DispatchError::Retry(err.to_string())),
        };
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(Some((path, meta))),
            Err(_) => Ok(None),
        }
    }

    async fn hashed(
        &self,
        store: &InventoryStore,
        dir_id: i64,
        name: &str,
    ) -> Result<Option<NewFile>, DispatchError> {
        let Some((path, meta)) = self.live(store, dir_id, name).await? else {
            return Ok(None);
        };
        if !meta.is_file() {
            return Ok(None);
        }
        let stat = LocalStat::from_metadata(&meta);
        let summary = checksum_file(&path)
            .await
            .map_err(|err| DispatchError::Retry(err.to_string()))?;
        Ok(Some(NewFile {
            dir_id,
            name: name.to_string(),
            size: summary.bytes,
            modified: stat.modified,
            attributes: stat.attributes,
            crc32: summary.crc32,
            md5: summary.md5,
            changed: now_ms(),
        }))
    }
}

impl Dispatch for RescanDispatcher<'_> {
    async fn dispatch(
        &mut self,
        store: &InventoryStore,
        item: &QueueItem,
    ) -> Result<Outcome, DispatchError> {
        match item.action {
            ActionType::AddDir => {
                let Some((_, meta)) = self.live(store, item.dir_id, &item.name).await? else {
                    return Ok(Outcome::Vanished);
                };
                if !meta.is_dir() {
                    return Ok(Outcome::Vanished);
                }
                let stat = LocalStat::from_metadata(&meta);
                let created = store
                    .directory_list_insert(item.dir_id, &item.name, stat.modified, &stat.attributes)
                    .await?;
                Ok(Outcome::Applied {
                    created_id: Some(created.id),
                })
            }
            ActionType::AddFile => match self.hashed(store, item.dir_id, &item.name).await? {
                Some(file) => {
                    store.file_list_insert(file).await?;
                    Ok(Outcome::applied())
                }
                None => Ok(Outcome::Vanished),
            },
            ActionType::UpdateFile => {
                let Some(stored) = store.file(item.file_id).await? else {
                    return Ok(Outcome::Vanished);
                };
                match self.hashed(store, stored.dir_id, &stored.name).await? {
                    Some(file) => {
                        let entry: FileEntry = file.with_id(stored.id);
                        store.file_list_update(&entry).await?;
                        Ok(Outcome::applied())
                    }
                    None => Ok(Outcome::Vanished),
                }
            }
            ActionType::UpdateDir => {
                let Some(stored) = store.directory(item.dir_id).await? else {
                    return Ok(Outcome::Vanished);
                };
                let Some(parent) = stored.parent_id else {
                    return Ok(Outcome::Vanished);
                };
                let Some((_, meta)) = self.live(store, parent, &stored.name).await? else {
                    return Ok(Outcome::Vanished);
                };
                let stat = LocalStat::from_metadata(&meta);
                store
                    .directory_list_update(&DirectoryEntry {
                        modified: stat.modified,
                        attributes: stat.attributes,
                        ..stored
                    })
                    .await?;
                Ok(Outcome::applied())
            }
            ActionType::RemoveFile => {
                store.file_list_remove(item.file_id).await?;
                Ok(Outcome::applied())
            }
            ActionType::RemoveDir => {
                if store.directory(item.dir_id).await?.is_some() {
                    store.directory_list_remove(item.dir_id).await?;
                }
                Ok(Outcome::applied())
            }
            // Nothing on the server side queues downloads.
            ActionType::DownloadDir | ActionType::DownloadFile => Ok(Outcome::Vanished),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RescanReport {
    pub scan: ScanReport,
    pub drain: DrainReport,
}

/// Scans the directory at `root`, records what changed and refreshes every
/// digest. Temp files of uploads in progress are left alone.
pub async fn rescan_directory(
    store: &InventoryStore,
    tree: &LocalTree,
) -> Result<RescanReport, RescanError> {
    let scan = LocalReconciler::new(store, ScanMode::Deep)
        .keep_temp_files()
        .scan(tree.root())
        .await?;
    debug!(target: SERVER, directory = store.directory_name(), enqueued = scan.enqueued, "rescan found changes");
    let drain = QueueProcessor::drain(store, &mut RescanDispatcher::new(tree)).await?;
    recompute_digest_deep(store, ROOT_DIR_ID).await?;
    info!(
        target: SERVER,
        directory = store.directory_name(),
        applied = drain.applied,
        failed = drain.failed,
        "rescan finished"
    );
    Ok(RescanReport { scan, drain })
}

/// Opens its own store handle and rescans in the background. Returns `false`
/// when a rescan of the same directory is already running.
pub fn spawn_rescan(
    guard: &RescanGuard,
    account: &str,
    directory: &str,
    db_path: &Path,
    tree: LocalTree,
    history: bool,
) -> bool {
    let Some(ticket) = guard.try_start(account, directory) else {
        return false;
    };
    let db_path = db_path.to_path_buf();
    let directory = directory.to_string();
    tokio::spawn(async move {
        let _ticket = ticket;
        let store = match InventoryStore::open(&db_path, &directory, history).await {
            Ok(store) => store,
            Err(err) => {
                warn!(target: SERVER, %directory, error = %err, "rescan could not open store");
                return;
            }
        };
        if let Err(err) = rescan_directory(&store, &tree).await {
            warn!(target: SERVER, %directory, error = %err, "rescan failed");
        }
    });
    true
}
