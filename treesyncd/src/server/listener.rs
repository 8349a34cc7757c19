use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::{ServerState, Worker};
use crate::config::ServerConfig;
use crate::logging::SERVER;

/// Accept loop. Every connection gets its own [`Worker`] task.
pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("failed to create {}", config.data_dir.display()))?;
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to listen on {}", config.listen))?;
        Ok(Self {
            listener,
            state: Arc::new(ServerState::new(config)),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// Serves until an admin sends `Stop` or the process gets Ctrl-C.
    pub async fn run(self) -> anyhow::Result<()> {
        let mut shutdown = self.state.shutdown_signal();
        info!(
            target: SERVER,
            addr = %self.local_addr()?,
            data_dir = %self.state.config.data_dir.display(),
            accounts = self.state.config.accounts.len(),
            "server listening"
        );
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(target: SERVER, error = %err, "accept failed");
                            continue;
                        }
                    };
                    if let Err(err) = socket.set_nodelay(true) {
                        warn!(target: SERVER, %peer, error = %err, "could not disable nagle");
                    }
                    let worker = Worker::new(self.state(), socket, peer.to_string());
                    tokio::spawn(worker.run());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(target: SERVER, "stop requested, no longer accepting");
                        break;
                    }
                }
                res = tokio::signal::ctrl_c() => {
                    if let Err(err) = res {
                        warn!(target: SERVER, error = %err, "ctrl_c listener failed");
                    }
                    info!(target: SERVER, "shutdown requested");
                    break;
                }
            }
        }
        Ok(())
    }
}
