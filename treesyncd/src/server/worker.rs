//! Serves one client connection: authenticates it, tracks its open sync
//! directory and answers requests until the client leaves.

use std::future::Future;
use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};
use treesync_core::{
    AccountData, Command, CreateDirectoryRequest, DigestResponse, DirIdRequest, DirectoryName,
    DirectoryResponse, Envelope, ErrorCode, FileIdRequest, FileListResponse, FileResponse,
    LoginRequest, LoginResponse, MessageStream, ProtocolError, ROOT_DIR_ID,
    SetDirectoryInfoRequest, SetFileInfoRequest, TransferError, TransferJob, TransferOutcome,
    UploadRequest, WireDir, WireFile,
};

use super::ServerState;
use super::accounts::AccountId;
use super::rescan::spawn_rescan;
use crate::logging::SERVER;
use crate::sync::apply::{ApplyError, LocalTree, remove_directory_tree, remove_file, replace_file};
use crate::sync::digest::recompute_digest;
use crate::sync::index::{FileEntry, IndexError, InventoryStore, NewFile};
use crate::sync::paths::{
    PathError, apply_attributes, apply_metadata, now_ms, set_modified, validate_entry_name,
    validate_sync_dir_name,
};

/// A request that could not be served. Each variant maps to one wire error code.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("{0}")]
    Denied(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("{0}")]
    Busy(String),
    #[error(transparent)]
    Name(#[from] PathError),
    #[error("bad request: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("{0}")]
    Invalid(&'static str),
    #[error("store error: {0}")]
    Index(#[from] IndexError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl WorkerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            WorkerError::Denied(_) => ErrorCode::AccessDenied,
            WorkerError::NotFound(_) => ErrorCode::NotFound,
            WorkerError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            WorkerError::Busy(_) => ErrorCode::Busy,
            WorkerError::Name(_) | WorkerError::Apply(ApplyError::Path(_)) => {
                ErrorCode::InvalidName
            }
            WorkerError::Protocol(_) | WorkerError::Invalid(_) => ErrorCode::InvalidRequest,
            WorkerError::Index(_) | WorkerError::Apply(ApplyError::Index(_)) => ErrorCode::Store,
            WorkerError::Apply(_) | WorkerError::Io(_) => ErrorCode::Io,
        }
    }
}

/// What the loop does after a request was handled.
enum Reply {
    Send(Envelope),
    /// The handler already answered, e.g. at the end of a transfer.
    Done,
    /// Answer, then drop the connection.
    SendAndClose(Envelope),
    Close,
}

struct Login {
    token: String,
    account: AccountId,
}

struct ActiveDirectory {
    name: String,
    store: InventoryStore,
    tree: LocalTree,
}

pub struct Worker<S> {
    state: Arc<ServerState>,
    stream: MessageStream<S>,
    peer: String,
    login: Option<Login>,
    active: Option<ActiveDirectory>,
}

impl<S> Worker<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(state: Arc<ServerState>, stream: S, peer: impl Into<String>) -> Self {
        Self {
            state,
            stream: MessageStream::new(stream),
            peer: peer.into(),
            login: None,
            active: None,
        }
    }

    pub async fn run(mut self) {
        debug!(target: SERVER, peer = %self.peer, "connection opened");
        loop {
            let envelope = match self.stream.recv().await {
                Ok(envelope) => envelope,
                Err(ProtocolError::ConnectionClosed) => break,
                Err(ProtocolError::Json(err)) => {
                    let reply = Envelope::failure(0, ErrorCode::InvalidRequest, err.to_string());
                    if self.stream.send(&reply).await.is_err() {
                        break;
                    }
                    continue;
                }
                Err(err) => {
                    debug!(target: SERVER, peer = %self.peer, error = %err, "dropping connection");
                    break;
                }
            };

            let reply = self.serve(&envelope).await;
            let (reply, close) = match reply {
                Reply::Send(reply) => (Some(reply), false),
                Reply::SendAndClose(reply) => (Some(reply), true),
                Reply::Done => (None, false),
                Reply::Close => (None, true),
            };
            if let Some(reply) = reply
                && let Err(err) = self.stream.send(&reply).await
            {
                debug!(target: SERVER, peer = %self.peer, error = %err, "reply not delivered");
                break;
            }
            if close {
                break;
            }
        }
        if let Some(login) = self.login.take() {
            self.state.registry.close_session(&login.token).await;
        }
        debug!(target: SERVER, peer = %self.peer, "connection closed");
    }

    async fn serve(&mut self, envelope: &Envelope) -> Reply {
        let command = match envelope.command() {
            Ok(command) => command,
            Err(err) => {
                return Reply::Send(Envelope::failure(
                    envelope.command,
                    ErrorCode::UnknownCommand,
                    err.to_string(),
                ));
            }
        };
        if !command.is_public() && !self.authorized(envelope).await {
            return Reply::Send(Envelope::failure(
                command.code(),
                ErrorCode::NotLoggedIn,
                "login required",
            ));
        }
        if command.needs_directory() && self.active.is_none() {
            return Reply::Send(Envelope::failure(
                command.code(),
                ErrorCode::NoActiveDirectory,
                "no sync directory is open",
            ));
        }

        match self.handle(command, envelope).await {
            Ok(reply) => reply,
            Err(err) => {
                debug!(target: SERVER, peer = %self.peer, ?command, error = %err, "request failed");
                Reply::Send(Envelope::failure(command.code(), err.code(), err.to_string()))
            }
        }
    }

    async fn authorized(&self, envelope: &Envelope) -> bool {
        let (Some(login), Some(token)) = (&self.login, envelope.session.as_deref()) else {
            return false;
        };
        login.token == token && self.state.registry.session(token).await == Some(login.account)
    }

    async fn handle(&mut self, command: Command, envelope: &Envelope) -> Result<Reply, WorkerError> {
        let ok = || Envelope::response(command);
        match command {
            Command::Login => self.login(envelope.body()?).await,
            Command::Logout => {
                if let Some(login) = self.login.take() {
                    self.state.registry.close_session(&login.token).await;
                }
                self.active = None;
                Ok(Reply::Send(ok()))
            }
            Command::Close => Ok(Reply::SendAndClose(ok())),
            Command::GetAccountData => {
                let data = self.account_data().await?;
                Ok(Reply::Send(ok().with_body(&data)?))
            }
            Command::CreateSyncDirectory => {
                self.create_sync_directory(envelope.body()?).await?;
                Ok(Reply::Send(ok()))
            }
            Command::OpenDirectory => {
                self.open_directory(envelope.body()?).await?;
                Ok(Reply::Send(ok()))
            }
            Command::GetFileList => {
                let DirIdRequest { dir_id } = envelope.body()?;
                let listing = self.file_list(dir_id).await?;
                Ok(Reply::Send(ok().with_body(&listing)?))
            }
            Command::GetFileInfo => {
                let FileIdRequest { file_id } = envelope.body()?;
                let file = WireFile::from(&self.stored_file(file_id).await?);
                Ok(Reply::Send(ok().with_body(&FileResponse { file })?))
            }
            Command::GetDirectoryInfo => {
                let DirIdRequest { dir_id } = envelope.body()?;
                let directory = self.wire_directory(dir_id).await?;
                Ok(Reply::Send(ok().with_body(&DirectoryResponse { directory })?))
            }
            Command::GetDirectoryDigest => {
                let DirIdRequest { dir_id } = envelope.body()?;
                let directory = self.wire_directory(dir_id).await?;
                let body = DigestResponse {
                    dir_id,
                    digest: directory.digest,
                };
                Ok(Reply::Send(ok().with_body(&body)?))
            }
            Command::CreateDirectory => {
                let directory = self.create_directory(envelope.body()?).await?;
                Ok(Reply::Send(ok().with_body(&DirectoryResponse { directory })?))
            }
            Command::RemoveDirectory => {
                let DirIdRequest { dir_id } = envelope.body()?;
                self.remove_directory(dir_id).await?;
                Ok(Reply::Send(ok()))
            }
            Command::SetDirectoryInfo => {
                let directory = self.set_directory_info(envelope.body()?).await?;
                Ok(Reply::Send(ok().with_body(&DirectoryResponse { directory })?))
            }
            Command::UploadFile => self.receive_upload(envelope.body()?).await,
            Command::DownloadFile => {
                let FileIdRequest { file_id } = envelope.body()?;
                self.send_download(file_id).await
            }
            Command::RemoveFile => {
                let FileIdRequest { file_id } = envelope.body()?;
                self.remove_file(file_id).await?;
                Ok(Reply::Send(ok()))
            }
            Command::SetFileInfo => {
                let file = self.set_file_info(envelope.body()?).await?;
                Ok(Reply::Send(ok().with_body(&FileResponse { file })?))
            }
            Command::Rescan => {
                self.rescan()?;
                Ok(Reply::Send(ok()))
            }
            Command::Stop => {
                let login = self.login_ref()?;
                if !self.state.registry.account(login.account).admin {
                    return Err(WorkerError::Denied("stop requires an admin account".into()));
                }
                info!(target: SERVER, peer = %self.peer, "stop requested");
                self.state.request_shutdown();
                Ok(Reply::SendAndClose(ok()))
            }
            Command::Crc => Err(WorkerError::Invalid("CRC message outside of a transfer")),
        }
    }

    async fn login(&mut self, request: LoginRequest) -> Result<Reply, WorkerError> {
        let Some(account) = self
            .state
            .registry
            .authenticate(&request.account, &request.password)
        else {
            warn!(target: SERVER, peer = %self.peer, account = %request.account, "login rejected");
            return Err(WorkerError::Denied("invalid account or password".into()));
        };
        if let Some(previous) = self.login.take() {
            self.state.registry.close_session(&previous.token).await;
        }
        self.active = None;
        let token = self.state.registry.open_session(account).await;
        info!(target: SERVER, peer = %self.peer, account = %request.account, "logged in");
        self.login = Some(Login {
            token: token.clone(),
            account,
        });
        let reply = Envelope::response(Command::Login).with_body(&LoginResponse { session: token })?;
        Ok(Reply::Send(reply))
    }

    fn login_ref(&self) -> Result<&Login, WorkerError> {
        self.login
            .as_ref()
            .ok_or_else(|| WorkerError::Denied("login required".into()))
    }

    fn account_name(&self) -> Result<String, WorkerError> {
        let login = self.login_ref()?;
        Ok(self.state.registry.account(login.account).name.clone())
    }

    fn active(&self) -> Result<&ActiveDirectory, WorkerError> {
        self.active
            .as_ref()
            .ok_or_else(|| WorkerError::Denied("no sync directory is open".into()))
    }

    async fn account_data(&self) -> Result<AccountData, WorkerError> {
        let login = self.login_ref()?;
        let account = self.state.registry.account(login.account);
        let root = self.state.config.account_dir(&account.name);
        let mut directories = Vec::new();
        match tokio::fs::read_dir(&root).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    let Ok(name) = entry.file_name().into_string() else {
                        continue;
                    };
                    if entry.file_type().await?.is_dir() && validate_sync_dir_name(&name).is_ok() {
                        directories.push(name);
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        directories.sort();
        Ok(AccountData {
            account: account.name.clone(),
            directories,
            admin: account.admin,
        })
    }

    async fn create_sync_directory(&self, request: DirectoryName) -> Result<(), WorkerError> {
        validate_sync_dir_name(&request.name)?;
        let account = self.account_name()?;
        let root = self.state.directory_root(&account, &request.name);
        if tokio::fs::try_exists(&root).await? {
            return Err(WorkerError::AlreadyExists(request.name));
        }
        tokio::fs::create_dir_all(&root).await?;
        InventoryStore::open(
            &self.state.store_path(&account),
            &request.name,
            self.state.config.history,
        )
        .await?;
        info!(target: SERVER, %account, directory = %request.name, "sync directory created");
        Ok(())
    }

    async fn open_directory(&mut self, request: DirectoryName) -> Result<(), WorkerError> {
        validate_sync_dir_name(&request.name)?;
        let account = self.account_name()?;
        let root = self.state.directory_root(&account, &request.name);
        if !tokio::fs::metadata(&root).await.is_ok_and(|meta| meta.is_dir()) {
            return Err(WorkerError::NotFound(request.name));
        }
        if self
            .active
            .as_ref()
            .is_some_and(|active| active.name == request.name)
        {
            return Ok(());
        }
        let store = InventoryStore::open(
            &self.state.store_path(&account),
            &request.name,
            self.state.config.history,
        )
        .await?;
        let tree = LocalTree::new(root, self.state.history_root(&account, &request.name));
        debug!(target: SERVER, %account, directory = %request.name, "directory opened");
        self.active = Some(ActiveDirectory {
            name: request.name,
            store,
            tree,
        });
        Ok(())
    }

    async fn file_list(&self, dir_id: i64) -> Result<FileListResponse, WorkerError> {
        let store = &self.active()?.store;
        if store.directory(dir_id).await?.is_none() {
            return Err(WorkerError::NotFound(format!("directory {dir_id}")));
        }
        let directories = store
            .directory_children(dir_id)
            .await?
            .iter()
            .map(WireDir::from)
            .collect();
        let files = store
            .file_children(dir_id)
            .await?
            .iter()
            .map(WireFile::from)
            .collect();
        Ok(FileListResponse { directories, files })
    }

    async fn stored_file(&self, file_id: i64) -> Result<FileEntry, WorkerError> {
        self.active()?
            .store
            .file(file_id)
            .await?
            .ok_or_else(|| WorkerError::NotFound(format!("file {file_id}")))
    }

    async fn wire_directory(&self, dir_id: i64) -> Result<WireDir, WorkerError> {
        let dir = self
            .active()?
            .store
            .directory(dir_id)
            .await?
            .ok_or_else(|| WorkerError::NotFound(format!("directory {dir_id}")))?;
        Ok(WireDir::from(&dir))
    }

    async fn create_directory(&self, request: CreateDirectoryRequest) -> Result<WireDir, WorkerError> {
        validate_entry_name(&request.name)?;
        let active = self.active()?;
        let store = &active.store;
        if store.directory(request.parent_id).await?.is_none() {
            return Err(WorkerError::NotFound(format!("directory {}", request.parent_id)));
        }
        if store
            .directory_by_name(request.parent_id, &request.name)
            .await?
            .is_some()
            || store
                .file_by_name(request.parent_id, &request.name)
                .await?
                .is_some()
        {
            return Err(WorkerError::AlreadyExists(request.name));
        }
        let path = active
            .tree
            .entry_path(store, request.parent_id, &request.name)
            .await?;
        tokio::fs::create_dir_all(&path).await?;
        if let Err(err) = set_modified(&path, request.modified) {
            debug!(target: SERVER, path = %path.display(), error = %err, "could not set directory time");
        }
        apply_attributes(&path, &request.attributes)?;

        let created = transaction(store, async {
            let created = store
                .directory_list_insert(
                    request.parent_id,
                    &request.name,
                    request.modified,
                    &request.attributes,
                )
                .await?;
            recompute_digest(store, request.parent_id).await?;
            Ok::<_, WorkerError>(created)
        })
        .await?;
        Ok(WireDir::from(&created))
    }

    async fn remove_directory(&self, dir_id: i64) -> Result<(), WorkerError> {
        if dir_id == ROOT_DIR_ID {
            return Err(WorkerError::Denied("the root directory cannot be removed".into()));
        }
        let active = self.active()?;
        let store = &active.store;
        let dir = store
            .directory(dir_id)
            .await?
            .ok_or_else(|| WorkerError::NotFound(format!("directory {dir_id}")))?;
        transaction(store, async {
            remove_directory_tree(store, &active.tree, dir_id).await?;
            if let Some(parent) = dir.parent_id {
                recompute_digest(store, parent).await?;
            }
            Ok::<_, WorkerError>(())
        })
        .await
    }

    async fn set_directory_info(
        &self,
        request: SetDirectoryInfoRequest,
    ) -> Result<WireDir, WorkerError> {
        let active = self.active()?;
        let store = &active.store;
        let mut dir = store
            .directory(request.dir_id)
            .await?
            .ok_or_else(|| WorkerError::NotFound(format!("directory {}", request.dir_id)))?;
        let path = active.tree.dir_path(store, dir.id).await?;
        if let Err(err) = set_modified(&path, request.modified) {
            debug!(target: SERVER, path = %path.display(), error = %err, "could not set directory time");
        }
        apply_attributes(&path, &request.attributes)?;

        dir.modified = request.modified;
        dir.attributes = request.attributes;
        let parent = dir.parent_id.unwrap_or(dir.id);
        transaction(store, async {
            store.directory_list_update(&dir).await?;
            recompute_digest(store, parent).await?;
            Ok::<_, WorkerError>(())
        })
        .await?;
        let refreshed = store.directory(dir.id).await?.unwrap_or(dir);
        Ok(WireDir::from(&refreshed))
    }

    async fn remove_file(&self, file_id: i64) -> Result<(), WorkerError> {
        let active = self.active()?;
        let store = &active.store;
        let file = self.stored_file(file_id).await?;
        transaction(store, async {
            remove_file(store, &active.tree, &file).await?;
            recompute_digest(store, file.dir_id).await?;
            Ok::<_, WorkerError>(())
        })
        .await
    }

    async fn set_file_info(&self, request: SetFileInfoRequest) -> Result<WireFile, WorkerError> {
        let active = self.active()?;
        let store = &active.store;
        let mut file = self.stored_file(request.file_id).await?;
        let path = active.tree.entry_path(store, file.dir_id, &file.name).await?;
        apply_metadata(&path, request.modified, &request.attributes)?;
        file.modified = request.modified;
        file.attributes = request.attributes;
        file.changed = now_ms();
        transaction(store, async {
            store.file_list_update(&file).await?;
            recompute_digest(store, file.dir_id).await?;
            Ok::<_, WorkerError>(())
        })
        .await?;
        Ok(WireFile::from(&file))
    }

    /// Accepts the upload, receives the data and answers the client's CRC
    /// message with the stored entry.
    async fn receive_upload(&mut self, request: UploadRequest) -> Result<Reply, WorkerError> {
        validate_entry_name(&request.name)?;
        let active = self.active()?;
        let store = &active.store;
        if store.directory(request.dir_id).await?.is_none() {
            return Err(WorkerError::NotFound(format!("directory {}", request.dir_id)));
        }
        if store
            .directory_by_name(request.dir_id, &request.name)
            .await?
            .is_some()
        {
            return Err(WorkerError::AlreadyExists(request.name));
        }
        let target = active
            .tree
            .entry_path(store, request.dir_id, &request.name)
            .await?;

        self.stream
            .send(&Envelope::response(Command::UploadFile))
            .await?;
        let job = TransferJob::Download {
            target: target.clone(),
            size: request.size,
        };
        let (summary, temp) = match job.run(&mut self.stream).await {
            Ok(TransferOutcome::Received { summary, temp }) => (summary, temp),
            Ok(TransferOutcome::Sent { .. }) => return Ok(Reply::Close),
            Err(TransferError::CrcMismatch { expected, actual }) => {
                warn!(target: SERVER, peer = %self.peer, file = %request.name, expected, actual, "upload corrupted");
                return Ok(Reply::Done);
            }
            Err(err) => {
                warn!(target: SERVER, peer = %self.peer, file = %request.name, error = %err, "upload aborted");
                return Ok(Reply::Close);
            }
        };

        let Some(active) = self.active.as_ref() else {
            let _ = tokio::fs::remove_file(&temp).await;
            return Ok(Reply::Close);
        };
        let store = &active.store;
        let stored = transaction(store, async {
            let previous = store.file_by_name(request.dir_id, &request.name).await?;
            replace_file(store, &active.tree, previous.as_ref(), &temp, &target).await?;
            apply_metadata(&target, request.modified, &request.attributes)?;
            let file = NewFile {
                dir_id: request.dir_id,
                name: request.name.clone(),
                size: summary.bytes,
                modified: request.modified,
                attributes: request.attributes.clone(),
                crc32: summary.crc32,
                md5: summary.md5,
                changed: now_ms(),
            };
            let entry = match previous {
                Some(previous) => {
                    let entry = file.with_id(previous.id);
                    store.file_list_update(&entry).await?;
                    entry
                }
                None => store.file_list_insert(file).await?,
            };
            recompute_digest(store, request.dir_id).await?;
            Ok::<_, WorkerError>(entry)
        })
        .await;

        let reply = match stored {
            Ok(entry) => {
                debug!(target: SERVER, file = %entry.name, id = entry.id, bytes = summary.bytes, "upload stored");
                Envelope::response(Command::Crc).with_body(&FileResponse {
                    file: WireFile::from(&entry),
                })?
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(&temp).await;
                warn!(target: SERVER, file = %request.name, error = %err, "could not store upload");
                Envelope::failure(Command::Crc.code(), err.code(), err.to_string())
            }
        };
        Ok(Reply::Send(reply))
    }

    /// Sends the stored file followed by its CRC and waits for the client's verdict.
    async fn send_download(&mut self, file_id: i64) -> Result<Reply, WorkerError> {
        let file = self.stored_file(file_id).await?;
        let active = self.active()?;
        let path = active
            .tree
            .entry_path(&active.store, file.dir_id, &file.name)
            .await?;
        let source = tokio::fs::File::open(&path).await?;
        let size = source.metadata().await?.len();
        if size != file.size {
            return Err(WorkerError::Busy(format!(
                "{} changed on disk, rescan pending",
                file.name
            )));
        }

        let reply = Envelope::response(Command::DownloadFile).with_body(&FileResponse {
            file: WireFile::from(&file),
        })?;
        self.stream.send(&reply).await?;
        match (TransferJob::Upload { source, size }).run(&mut self.stream).await {
            Ok(TransferOutcome::Sent { response, .. }) if response.is_ok() => {
                debug!(target: SERVER, file = %file.name, bytes = size, "download delivered");
                Ok(Reply::Done)
            }
            Ok(TransferOutcome::Sent { response, .. }) => {
                warn!(target: SERVER, file = %file.name, error = response.error_message(), "client rejected download");
                Ok(Reply::Done)
            }
            Ok(TransferOutcome::Received { .. }) => Ok(Reply::Close),
            Err(err) => {
                warn!(target: SERVER, peer = %self.peer, file = %file.name, error = %err, "download aborted");
                Ok(Reply::Close)
            }
        }
    }

    fn rescan(&self) -> Result<(), WorkerError> {
        let account = self.account_name()?;
        let active = self.active()?;
        let started = spawn_rescan(
            &self.state.rescans,
            &account,
            &active.name,
            &self.state.store_path(&account),
            active.tree.clone(),
            self.state.config.history,
        );
        if started {
            info!(target: SERVER, %account, directory = %active.name, "rescan started");
            Ok(())
        } else {
            Err(WorkerError::Busy("rescan already running".into()))
        }
    }
}

/// Runs `work` inside a store transaction that is rolled back when it fails.
async fn transaction<T, F>(store: &InventoryStore, work: F) -> Result<T, WorkerError>
where
    F: Future<Output = Result<T, WorkerError>>,
{
    store.begin().await?;
    match work.await {
        Ok(value) => {
            store.commit().await?;
            Ok(value)
        }
        Err(err) => {
            let _ = store.rollback().await;
            Err(err)
        }
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
