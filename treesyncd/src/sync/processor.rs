//! Drains a directory's work queue through a [`Dispatch`] implementation.

use std::future::Future;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::index::{IndexError, InventoryStore, MAX_ATTEMPTS, QueueItem};
use crate::logging::COMMON;

/// How a dispatched item ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The action took effect. Directory-creating actions report the new id.
    Applied { created_id: Option<i64> },
    /// The item's source or target no longer exists; nothing left to do.
    Vanished,
}

impl Outcome {
    pub fn applied() -> Self {
        Outcome::Applied { created_id: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Worth another attempt later.
    #[error("{0}")]
    Retry(String),
    /// The connection or login is gone for good; stop draining.
    #[error("{0}")]
    Abort(String),
}

impl From<IndexError> for DispatchError {
    fn from(err: IndexError) -> Self {
        DispatchError::Retry(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum DrainError {
    #[error("store error: {0}")]
    Index(#[from] IndexError),
    #[error("drain aborted: {0}")]
    Aborted(String),
}

/// Carries out one queue item. Runs inside the processor's transaction, so
/// store writes made here are undone when the dispatch fails.
pub trait Dispatch {
    fn dispatch(
        &mut self,
        store: &InventoryStore,
        item: &QueueItem,
    ) -> impl Future<Output = Result<Outcome, DispatchError>> + Send;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub applied: usize,
    pub vanished: usize,
    pub failed: usize,
}

pub struct QueueProcessor;

impl QueueProcessor {
    /// Works through every eligible item until none is left. Failed items are
    /// retried until they reach the attempt cap and are parked.
    pub async fn drain<D>(store: &InventoryStore, dispatcher: &mut D) -> Result<DrainReport, DrainError>
    where
        D: Dispatch + Send,
    {
        let mut report = DrainReport::default();
        store.reset_attempts().await?;

        while let Some(item) = store.next_eligible().await? {
            store.begin().await?;
            match dispatcher.dispatch(store, &item).await {
                Ok(Outcome::Applied { created_id }) => {
                    let result = store.finalize(&item, created_id).await;
                    match store.finish(result).await {
                        Ok(()) => {
                            debug!(target: COMMON, id = item.id, action = ?item.action, name = %item.name, "applied");
                            report.applied += 1;
                        }
                        Err(err) => {
                            warn!(target: COMMON, id = item.id, error = %err, "could not record applied item");
                            Self::count_failure(store, &item, &mut report).await?;
                        }
                    }
                }
                Ok(Outcome::Vanished) => {
                    let result = store.abandon(&item).await;
                    match store.finish(result).await {
                        Ok(dropped) => {
                            debug!(target: COMMON, id = item.id, name = %item.name, dropped, "target vanished");
                            report.vanished += 1;
                        }
                        Err(err) => {
                            warn!(target: COMMON, id = item.id, error = %err, "could not drop vanished item");
                            Self::count_failure(store, &item, &mut report).await?;
                        }
                    }
                }
                Err(DispatchError::Retry(reason)) => {
                    Self::roll_back(store, &item).await;
                    warn!(target: COMMON, id = item.id, action = ?item.action, name = %item.name, %reason, "dispatch failed");
                    Self::count_failure(store, &item, &mut report).await?;
                }
                Err(DispatchError::Abort(reason)) => {
                    Self::roll_back(store, &item).await;
                    warn!(target: COMMON, id = item.id, %reason, "drain aborted");
                    return Err(DrainError::Aborted(reason));
                }
            }
        }

        info!(
            target: COMMON,
            directory = store.directory_name(),
            applied = report.applied,
            vanished = report.vanished,
            failed = report.failed,
            "queue drained"
        );
        Ok(report)
    }

    async fn roll_back(store: &InventoryStore, item: &QueueItem) {
        if let Err(err) = store.rollback().await {
            warn!(target: COMMON, id = item.id, action = ?item.action, error = %err, "rollback failed");
        }
    }

    async fn count_failure(
        store: &InventoryStore,
        item: &QueueItem,
        report: &mut DrainReport,
    ) -> Result<(), DrainError> {
        report.failed += 1;
        let attempts = store.increment_attempts(item.id).await?;
        if attempts >= MAX_ATTEMPTS {
            warn!(target: COMMON, id = item.id, name = %item.name, "item parked after {attempts} attempts");
        }
        Ok(())
    }
}
