use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::codec::{MessageStream, SOCKET_TIMEOUT};
use crate::protocol::{
    AccountData, Command, CreateDirectoryRequest, DigestResponse, DirIdRequest, DirectoryName,
    DirectoryResponse, Envelope, ErrorCode, FileIdRequest, FileListResponse, FileResponse,
    LoginRequest, LoginResponse, ProtocolError, SetDirectoryInfoRequest, SetFileInfoRequest,
    UploadRequest, WireDir, WireFile,
};
use crate::retry::{Backoff, RECONNECT_CAP, RetryMachine, RetryStep};
use crate::transfer::{TransferError, TransferJob, TransferOutcome, TransferSummary};

const LOG_TARGET: &str = "treesync::client";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("{command:?} rejected by server ({code:?}): {message}")]
    Remote {
        command: Command,
        code: ErrorCode,
        message: String,
    },
    #[error("login rejected: {0}")]
    LoginRejected(String),
    #[error("gave up after {0} reconnect attempts")]
    ReconnectExhausted(u32),
    #[error("not connected")]
    NotConnected,
}

impl SessionError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            SessionError::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == Some(ErrorCode::NotFound)
    }

    /// The server refused the credentials; retrying later will not help.
    pub fn is_permanent(&self) -> bool {
        matches!(self, SessionError::LoginRejected(_))
            || self.code() == Some(ErrorCode::AccessDenied)
    }

    /// Errors after which continuing with this session is pointless.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::LoginRejected(_) | SessionError::ReconnectExhausted(_)
        ) || matches!(
            self.code(),
            Some(ErrorCode::NotLoggedIn | ErrorCode::AccessDenied)
        )
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// `host:port` of the server.
    pub server: String,
    pub account: String,
    pub password: String,
    pub reconnect_cap: u32,
    pub backoff: Backoff,
    pub timeout: Duration,
}

impl SessionConfig {
    pub fn new(
        server: impl Into<String>,
        account: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            server: server.into(),
            account: account.into(),
            password: password.into(),
            reconnect_cap: RECONNECT_CAP,
            backoff: Backoff::default(),
            timeout: SOCKET_TIMEOUT,
        }
    }
}

/// A received file whose CRC matched and was acknowledged. The data sits in
/// `temp` until the caller promotes or discards it.
#[derive(Debug)]
pub struct PendingDownload {
    pub file: WireFile,
    pub temp: PathBuf,
    pub summary: TransferSummary,
}

impl PendingDownload {
    pub async fn discard(self) {
        let _ = tokio::fs::remove_file(&self.temp).await;
    }
}

/// Client side of one account connection. Reconnects transparently: a failed
/// exchange drops the socket, and the next attempt logs in again and reopens
/// the directory that was open before.
pub struct ClientSession {
    config: SessionConfig,
    stream: Option<MessageStream<TcpStream>>,
    session: Option<String>,
    directory: Option<String>,
}

impl ClientSession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            stream: None,
            session: None,
            directory: None,
        }
    }

    pub async fn connect(config: SessionConfig) -> Result<Self, SessionError> {
        let mut session = Self::new(config);
        session.establish().await?;
        Ok(session)
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn directory(&self) -> Option<&str> {
        self.directory.as_deref()
    }

    pub fn account(&self) -> &str {
        &self.config.account
    }

    pub async fn account_data(&mut self) -> Result<AccountData, SessionError> {
        let response = self.request(Command::GetAccountData, &()).await?;
        Ok(response.body()?)
    }

    pub async fn create_sync_directory(&mut self, name: &str) -> Result<(), SessionError> {
        let body = DirectoryName {
            name: name.to_string(),
        };
        self.request(Command::CreateSyncDirectory, &body).await?;
        Ok(())
    }

    pub async fn open_directory(&mut self, name: &str) -> Result<(), SessionError> {
        let body = DirectoryName {
            name: name.to_string(),
        };
        self.request(Command::OpenDirectory, &body).await?;
        self.directory = Some(name.to_string());
        Ok(())
    }

    pub async fn list_directory(&mut self, dir_id: i64) -> Result<FileListResponse, SessionError> {
        let response = self
            .request(Command::GetFileList, &DirIdRequest { dir_id })
            .await?;
        Ok(response.body()?)
    }

    pub async fn file_info(&mut self, file_id: i64) -> Result<Option<WireFile>, SessionError> {
        match self
            .request(Command::GetFileInfo, &FileIdRequest { file_id })
            .await
        {
            Ok(response) => Ok(Some(response.body::<FileResponse>()?.file)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn directory_info(&mut self, dir_id: i64) -> Result<Option<WireDir>, SessionError> {
        match self
            .request(Command::GetDirectoryInfo, &DirIdRequest { dir_id })
            .await
        {
            Ok(response) => Ok(Some(response.body::<DirectoryResponse>()?.directory)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn directory_digest(&mut self, dir_id: i64) -> Result<[u8; 16], SessionError> {
        let response = self
            .request(Command::GetDirectoryDigest, &DirIdRequest { dir_id })
            .await?;
        Ok(response.body::<DigestResponse>()?.digest)
    }

    pub async fn create_directory(
        &mut self,
        parent_id: i64,
        name: &str,
        modified: i64,
        attributes: &str,
    ) -> Result<WireDir, SessionError> {
        let body = CreateDirectoryRequest {
            parent_id,
            name: name.to_string(),
            modified,
            attributes: attributes.to_string(),
        };
        let response = self.request(Command::CreateDirectory, &body).await?;
        Ok(response.body::<DirectoryResponse>()?.directory)
    }

    pub async fn remove_directory(&mut self, dir_id: i64) -> Result<(), SessionError> {
        self.request(Command::RemoveDirectory, &DirIdRequest { dir_id })
            .await?;
        Ok(())
    }

    pub async fn set_directory_info(
        &mut self,
        dir_id: i64,
        modified: i64,
        attributes: &str,
    ) -> Result<WireDir, SessionError> {
        let body = SetDirectoryInfoRequest {
            dir_id,
            modified,
            attributes: attributes.to_string(),
        };
        let response = self.request(Command::SetDirectoryInfo, &body).await?;
        Ok(response.body::<DirectoryResponse>()?.directory)
    }

    pub async fn remove_file(&mut self, file_id: i64) -> Result<(), SessionError> {
        self.request(Command::RemoveFile, &FileIdRequest { file_id })
            .await?;
        Ok(())
    }

    pub async fn set_file_info(
        &mut self,
        file_id: i64,
        modified: i64,
        attributes: &str,
    ) -> Result<WireFile, SessionError> {
        let body = SetFileInfoRequest {
            file_id,
            modified,
            attributes: attributes.to_string(),
        };
        let response = self.request(Command::SetFileInfo, &body).await?;
        Ok(response.body::<FileResponse>()?.file)
    }

    /// Asks the server to rescan its copy of the open directory in the background.
    pub async fn rescan(&mut self) -> Result<(), SessionError> {
        self.request(Command::Rescan, &()).await?;
        Ok(())
    }

    /// Asks the server to stop accepting connections. Admin accounts only.
    pub async fn stop(&mut self) -> Result<(), SessionError> {
        self.request(Command::Stop, &()).await?;
        Ok(())
    }

    /// Polite goodbye. Errors are ignored since the socket is dropped anyway.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Ok(envelope) = Envelope::request(Command::Close, &()) {
                let envelope = envelope.with_session(self.session.as_deref());
                let _ = stream.exchange(&envelope).await;
            }
        }
        self.session = None;
    }

    /// Uploads `source` as `name` inside `dir_id`. Returns the server's new entry.
    pub async fn upload_file(
        &mut self,
        dir_id: i64,
        name: &str,
        source: &Path,
        modified: i64,
        attributes: &str,
    ) -> Result<WireFile, SessionError> {
        let file = tokio::fs::File::open(source).await?;
        let size = file.metadata().await?.len();
        let body = UploadRequest {
            dir_id,
            name: name.to_string(),
            size,
            modified,
            attributes: attributes.to_string(),
        };
        self.request(Command::UploadFile, &body).await?;

        let stream = self.stream.as_mut().ok_or(SessionError::NotConnected)?;
        let outcome = TransferJob::Upload { source: file, size }.run(stream).await;
        let response = match outcome {
            Ok(TransferOutcome::Sent { response, .. }) => response,
            Ok(TransferOutcome::Received { .. }) => {
                self.stream = None;
                return Err(SessionError::NotConnected);
            }
            Err(err) => {
                warn!(target: LOG_TARGET, file = name, error = %err, "upload aborted");
                self.stream = None;
                return Err(err.into());
            }
        };
        let response = check_response(Command::UploadFile, response)?;
        let FileResponse { file } = response.body()?;
        debug!(target: LOG_TARGET, file = name, id = file.id, size, "uploaded");
        Ok(file)
    }

    /// Downloads file `file_id` into a temp file next to `target`.
    pub async fn download_file(
        &mut self,
        file_id: i64,
        target: &Path,
    ) -> Result<PendingDownload, SessionError> {
        let response = self
            .request(Command::DownloadFile, &FileIdRequest { file_id })
            .await?;
        let file = match response.body::<FileResponse>() {
            Ok(body) => body.file,
            Err(err) => {
                self.stream = None;
                return Err(err.into());
            }
        };

        let stream = self.stream.as_mut().ok_or(SessionError::NotConnected)?;
        let job = TransferJob::Download {
            target: target.to_path_buf(),
            size: file.size,
        };
        match job.run(stream).await {
            Ok(TransferOutcome::Received { summary, temp }) => {
                if let Err(err) = stream.send(&Envelope::response(Command::Crc)).await {
                    let _ = tokio::fs::remove_file(&temp).await;
                    self.stream = None;
                    return Err(err.into());
                }
                Ok(PendingDownload {
                    file,
                    temp,
                    summary,
                })
            }
            Ok(TransferOutcome::Sent { .. }) => {
                self.stream = None;
                Err(SessionError::NotConnected)
            }
            Err(err @ TransferError::CrcMismatch { .. }) => Err(err.into()),
            Err(err) => {
                warn!(target: LOG_TARGET, file_id, error = %err, "download aborted");
                self.stream = None;
                Err(err.into())
            }
        }
    }

    /// Sends one request with reconnect handling and returns the successful response.
    pub async fn request<T: Serialize>(
        &mut self,
        command: Command,
        body: &T,
    ) -> Result<Envelope, SessionError> {
        let request = Envelope::request(command, body)?;
        let mut machine = RetryMachine::new(self.config.reconnect_cap);
        let mut step = machine.start(self.stream.is_some());
        let mut last_error = None;

        loop {
            match step {
                RetryStep::Attempt => {
                    let envelope = request.clone().with_session(self.session.as_deref());
                    match self.exchange(&envelope).await {
                        Ok(response) if response.error_code() == ErrorCode::NotLoggedIn => {
                            warn!(target: LOG_TARGET, ?command, "session expired");
                            self.stream = None;
                            last_error = Some(remote_error(command, &response));
                            step = machine.call_failed();
                        }
                        Ok(response) => return check_response(command, response),
                        Err(err) => {
                            warn!(target: LOG_TARGET, ?command, error = %err, "request failed");
                            self.stream = None;
                            last_error = Some(err.into());
                            step = machine.call_failed();
                        }
                    }
                }
                RetryStep::Reconnect { attempt } => {
                    if attempt > 1 {
                        tokio::time::sleep(self.config.backoff.delay(attempt - 2)).await;
                    }
                    match self.establish().await {
                        Ok(()) => step = machine.reconnected(),
                        Err(err) if err.is_fatal() => return Err(err),
                        Err(err) => {
                            warn!(target: LOG_TARGET, attempt, error = %err, "reconnect failed");
                            last_error = Some(err);
                            step = machine.reconnect_failed();
                        }
                    }
                }
                RetryStep::GiveUp => {
                    if machine.exhausted() {
                        return Err(SessionError::ReconnectExhausted(machine.cap()));
                    }
                    return Err(last_error.unwrap_or(SessionError::NotConnected));
                }
            }
        }
    }

    async fn exchange(&mut self, envelope: &Envelope) -> Result<Envelope, ProtocolError> {
        let stream = self.stream.as_mut().ok_or(ProtocolError::ConnectionClosed)?;
        stream.exchange(envelope).await
    }

    /// Connects, logs in and reopens the current directory.
    async fn establish(&mut self) -> Result<(), SessionError> {
        self.stream = None;
        self.session = None;
        let tcp = tokio::time::timeout(
            self.config.timeout,
            TcpStream::connect(self.config.server.as_str()),
        )
        .await
        .map_err(|_| ProtocolError::Timeout)??;
        tcp.set_nodelay(true)?;
        let mut stream = MessageStream::new(tcp).with_timeout(self.config.timeout);

        let login = Envelope::request(
            Command::Login,
            &LoginRequest {
                account: self.config.account.clone(),
                password: self.config.password.clone(),
            },
        )?;
        let response = stream.exchange(&login).await?;
        if !response.is_ok() {
            return Err(SessionError::LoginRejected(
                response.error_message().to_string(),
            ));
        }
        let LoginResponse { session } = response.body()?;

        if let Some(directory) = &self.directory {
            let open = Envelope::request(
                Command::OpenDirectory,
                &DirectoryName {
                    name: directory.clone(),
                },
            )?
            .with_session(Some(&session));
            let response = stream.exchange(&open).await?;
            check_response(Command::OpenDirectory, response)?;
        }

        info!(
            target: LOG_TARGET,
            server = %self.config.server,
            account = %self.config.account,
            "logged in"
        );
        self.stream = Some(stream);
        self.session = Some(session);
        Ok(())
    }
}

fn remote_error(command: Command, response: &Envelope) -> SessionError {
    SessionError::Remote {
        command,
        code: response.error_code(),
        message: response.error_message().to_string(),
    }
}

fn check_response(command: Command, response: Envelope) -> Result<Envelope, SessionError> {
    if response.is_ok() {
        Ok(response)
    } else {
        Err(remote_error(command, &response))
    }
}
