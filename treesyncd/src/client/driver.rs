use std::collections::HashMap;
use std::future::Future;

use thiserror::Error;
use tracing::{debug, error, info, warn};
use treesync_core::{ClientSession, ROOT_DIR_ID, SessionConfig, SessionError};

use super::dispatcher::ClientDispatcher;
use crate::config::ClientConfig;
use crate::logging::CLIENT;
use crate::sync::apply::LocalTree;
use crate::sync::index::{IndexError, InventoryStore};
use crate::sync::local::{LocalReconciler, ReconcileError, ScanReport};
use crate::sync::processor::{DrainError, DrainReport, QueueProcessor};
use crate::sync::remote::{RemoteReconciler, RemoteReport};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("store error: {0}")]
    Index(#[from] IndexError),
    #[error("reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    Drain(#[from] DrainError),
    #[error("cannot prepare {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

impl DriverError {
    /// The connection or login is gone; the remaining directories of this
    /// cycle are skipped.
    pub fn ends_cycle(&self) -> bool {
        match self {
            DriverError::Session(err) | DriverError::Reconcile(ReconcileError::Session(err)) => {
                err.is_fatal()
            }
            DriverError::Drain(DrainError::Aborted(_)) => true,
            _ => false,
        }
    }

    /// Errors that will not go away by retrying on the next poll.
    pub fn is_fatal(&self) -> bool {
        match self {
            DriverError::Session(err) | DriverError::Reconcile(ReconcileError::Session(err)) => {
                err.is_permanent()
            }
            _ => false,
        }
    }
}

/// Result of one sync cycle for a single directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub directory: String,
    pub scan: ScanReport,
    pub pushed: DrainReport,
    pub remote: Option<RemoteReport>,
    pub pulled: Option<DrainReport>,
    /// Local and server root digests agree at the end of the cycle.
    pub converged: bool,
}

/// Runs sync cycles for every configured directory over one connection.
pub struct ClientDriver {
    config: ClientConfig,
    session: ClientSession,
    stores: HashMap<String, InventoryStore>,
}

impl ClientDriver {
    pub fn new(config: ClientConfig) -> Self {
        let session = ClientSession::new(SessionConfig::new(
            config.server.clone(),
            config.account.clone(),
            config.password.clone(),
        ));
        Self {
            config,
            session,
            stores: HashMap::new(),
        }
    }

    /// Uses a caller-built session, e.g. one with a shorter backoff.
    pub fn with_session(config: ClientConfig, session: ClientSession) -> Self {
        Self {
            config,
            session,
            stores: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self, directory: &str) -> Option<&InventoryStore> {
        self.stores.get(directory)
    }

    /// One cycle over every configured directory. A failing directory does not
    /// stop the others unless the connection or login is lost.
    pub async fn run_once(&mut self) -> Result<Vec<CycleReport>, DriverError> {
        let mut reports = Vec::with_capacity(self.config.directories.len());
        for directory in self.config.directories.clone() {
            match self.sync_directory(&directory).await {
                Ok(report) => reports.push(report),
                Err(err) if err.ends_cycle() => return Err(err),
                Err(err) => {
                    warn!(target: CLIENT, %directory, error = %err, "sync cycle failed");
                }
            }
        }
        Ok(reports)
    }

    /// Polls until Ctrl-C or a fatal error.
    pub async fn run(self) -> Result<(), DriverError> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(target: CLIENT, error = %err, "ctrl_c listener failed");
            }
        })
        .await
    }

    /// Polls until `shutdown` completes. Lost connections and aborted drains
    /// are retried on the next poll; only a refused login ends the loop.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<(), DriverError>
    where
        F: Future<Output = ()>,
    {
        info!(
            target: CLIENT,
            server = %self.config.server,
            account = %self.config.account,
            directories = ?self.config.directories,
            "client started"
        );
        let interval = self.config.poll_interval;
        tokio::pin!(shutdown);
        loop {
            match self.run_once().await {
                Ok(reports) => {
                    for report in &reports {
                        debug!(target: CLIENT, directory = %report.directory, converged = report.converged, "cycle done");
                    }
                }
                Err(err) if err.is_fatal() => {
                    error!(target: CLIENT, error = %err, "giving up");
                    self.session.close().await;
                    return Err(err);
                }
                Err(err) => {
                    warn!(target: CLIENT, error = %err, retry_in = ?interval, "sync cycle failed");
                }
            }
            tokio::select! {
                _ = &mut shutdown => {
                    info!(target: CLIENT, "shutdown requested");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
        self.session.close().await;
        Ok(())
    }

    /// Local scan, push, then a remote pass when the root digests still differ.
    pub async fn sync_directory(&mut self, directory: &str) -> Result<CycleReport, DriverError> {
        self.ensure_store(directory).await?;
        let tree = self.prepare_directory(directory).await?;
        let Some(store) = self.stores.get(directory) else {
            return Err(DriverError::Index(IndexError::MissingDirectory(ROOT_DIR_ID)));
        };

        let mut report = CycleReport {
            directory: directory.to_string(),
            ..CycleReport::default()
        };
        report.scan = LocalReconciler::new(store, self.config.scan_mode)
            .scan(tree.root())
            .await?;
        report.pushed = {
            let mut dispatcher = ClientDispatcher::new(&mut self.session, &tree);
            QueueProcessor::drain(store, &mut dispatcher).await?
        };

        if digests_match(&mut self.session, store).await? {
            report.converged = true;
            return Ok(report);
        }

        let remote = RemoteReconciler::new(store, &tree)
            .with_digest_pruning(self.config.digest_pruning)
            .reconcile(&mut self.session)
            .await?;
        report.remote = Some(remote);
        report.pulled = Some({
            let mut dispatcher = ClientDispatcher::new(&mut self.session, &tree);
            QueueProcessor::drain(store, &mut dispatcher).await?
        });
        report.converged = digests_match(&mut self.session, store).await?;
        if !report.converged {
            debug!(target: CLIENT, %directory, "digests still differ, next cycle continues");
        }
        Ok(report)
    }

    async fn ensure_store(&mut self, directory: &str) -> Result<(), DriverError> {
        if self.stores.contains_key(directory) {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.config.state_dir)
            .await
            .map_err(|source| DriverError::Io {
                path: self.config.state_dir.clone(),
                source,
            })?;
        let store =
            InventoryStore::open(&self.config.store_path(), directory, self.config.history).await?;
        self.stores.insert(directory.to_string(), store);
        Ok(())
    }

    /// Makes sure the directory exists on both sides and is the open one.
    async fn prepare_directory(&mut self, directory: &str) -> Result<LocalTree, DriverError> {
        if self.session.directory() != Some(directory) {
            let account = self.session.account_data().await?;
            if !account.directories.iter().any(|known| known == directory) {
                info!(target: CLIENT, %directory, "creating sync directory on server");
                self.session.create_sync_directory(directory).await?;
            }
            self.session.open_directory(directory).await?;
        }

        let tree = LocalTree::new(
            self.config.directory_root(directory),
            self.config.history_root(directory),
        );
        tokio::fs::create_dir_all(tree.root())
            .await
            .map_err(|source| DriverError::Io {
                path: tree.root().to_path_buf(),
                source,
            })?;
        Ok(tree)
    }
}

async fn digests_match(
    session: &mut ClientSession,
    store: &InventoryStore,
) -> Result<bool, DriverError> {
    let local = store
        .directory(ROOT_DIR_ID)
        .await?
        .map(|root| root.digest)
        .ok_or(IndexError::MissingDirectory(ROOT_DIR_ID))?;
    let server = session.directory_digest(ROOT_DIR_ID).await?;
    Ok(local == server)
}
