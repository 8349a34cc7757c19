//! Server side: accepts client connections and serves each one from its own
//! worker task.

pub mod accounts;
pub mod listener;
pub mod rescan;
pub mod worker;

use std::path::PathBuf;

use tokio::sync::watch;

use crate::config::ServerConfig;
use accounts::AccountRegistry;
use rescan::RescanGuard;

pub use listener::Server;
pub use worker::{Worker, WorkerError};

const STORE_FILE: &str = "inventory.db";
const HISTORY_DIR: &str = ".history";

/// Shared by every worker of one server.
#[derive(Debug)]
pub struct ServerState {
    pub config: ServerConfig,
    pub registry: AccountRegistry,
    pub rescans: RescanGuard,
    shutdown: watch::Sender<bool>,
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Self {
        let registry = AccountRegistry::new(&config.accounts);
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            registry,
            rescans: RescanGuard::default(),
            shutdown,
        }
    }

    pub fn store_path(&self, account: &str) -> PathBuf {
        self.config.account_dir(account).join(STORE_FILE)
    }

    pub fn directory_root(&self, account: &str, directory: &str) -> PathBuf {
        self.config.account_dir(account).join(directory)
    }

    pub fn history_root(&self, account: &str, directory: &str) -> PathBuf {
        self.config
            .account_dir(account)
            .join(HISTORY_DIR)
            .join(directory)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}
