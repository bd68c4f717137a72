//! Storage backends and transactional write sessions
//!
//! Each backend exposes a [`Storage`] handle. A pipeline run opens one
//! [`Tx`] per backend: a single executor task owns the backend session and
//! drains queued write operations strictly in FIFO order, so producers never
//! contend on the connection. Queued operations all execute even after one
//! fails; the transaction then commits only if every operation succeeded,
//! and the first failure is the one reported.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use freighter_common::Record;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStorage;
pub use postgres::PostgresStorage;

/// Storage backend flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Postgres,
    Memory,
}

/// Errors produced by storage backends
#[derive(Debug, Error)]
pub enum StorageError {
    /// The target table does not exist in the backend schema
    #[error("unknown table {0:?}")]
    UnknownTable(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// The connection string scheme maps to no known backend
    #[error("unsupported storage scheme {0:?}")]
    UnsupportedScheme(String),

    /// The transaction executor is gone; no further writes can be queued
    #[error("transaction closed")]
    TxClosed,

    /// A record cannot be represented in the backend
    #[error("bad record: {0}")]
    Record(String),
}

/// A live write session inside one transaction
#[async_trait]
pub trait StorageSession: Send {
    /// Upsert a batch of records into a table. Records sharing a primary
    /// key collapse to the latest write.
    async fn upsert(&mut self, table: &str, records: &[Record]) -> Result<(), StorageError>;
}

/// Session with transaction finalizers, held only by the executor task
#[async_trait]
pub trait TxSession: StorageSession {
    async fn commit(self: Box<Self>) -> Result<(), StorageError>;
    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

/// One queued write operation, executed by the transaction's executor task
pub type WriteFn = Box<
    dyn for<'a> FnOnce(&'a mut dyn StorageSession) -> BoxFuture<'a, Result<(), StorageError>>
        + Send,
>;

enum TxOutcome {
    Commit,
    Rollback,
}

/// A storage backend that can open transactional write sessions
#[async_trait]
pub trait Storage: Send + Sync {
    fn kind(&self) -> StorageKind;

    /// Remove all rows from the given tables. Runs outside any transaction.
    async fn truncate(&self, tables: &[String]) -> Result<(), StorageError>;

    /// Open a transaction backed by a dedicated executor task.
    async fn start_tx(&self) -> Result<Tx, StorageError>;
}

/// Cloneable producer half of a transaction
///
/// `send` queues a write and returns immediately; the executor applies
/// queued writes one at a time in arrival order.
#[derive(Clone)]
pub struct TxWriter {
    ops: mpsc::UnboundedSender<WriteFn>,
}

impl TxWriter {
    /// Queue one write operation.
    ///
    /// # Errors
    ///
    /// - `TxClosed` - the transaction was already finalized
    pub fn send(&self, op: WriteFn) -> Result<(), StorageError> {
        self.ops.send(op).map_err(|_| StorageError::TxClosed)
    }
}

/// An open transaction on one backend
///
/// Dropping a `Tx` without calling [`Tx::commit`] or [`Tx::rollback`] rolls
/// the transaction back.
pub struct Tx {
    ops: mpsc::UnboundedSender<WriteFn>,
    outcome: oneshot::Sender<TxOutcome>,
    handle: JoinHandle<Result<(), StorageError>>,
}

impl Tx {
    /// A cloneable writer for queuing operations from worker tasks.
    pub fn writer(&self) -> TxWriter {
        TxWriter {
            ops: self.ops.clone(),
        }
    }

    /// Finish queuing, wait for every queued operation, and commit if all
    /// of them succeeded.
    ///
    /// # Errors
    ///
    /// The first error among the queued operations, or the backend's commit
    /// failure.
    pub async fn commit(self) -> Result<(), StorageError> {
        self.finalize(TxOutcome::Commit).await
    }

    /// Finish queuing, wait for every queued operation, and roll back.
    pub async fn rollback(self) -> Result<(), StorageError> {
        self.finalize(TxOutcome::Rollback).await
    }

    async fn finalize(self, outcome: TxOutcome) -> Result<(), StorageError> {
        // The outcome message tells the executor to stop intake; it does not
        // wait for writer clones to drop, so a live writer never blocks
        // finalization.
        let _ = self.outcome.send(outcome);
        drop(self.ops);

        match self.handle.await {
            Ok(result) => result,
            Err(_) => Err(StorageError::TxClosed),
        }
    }
}

async fn apply_op<S: TxSession>(
    session: &mut S,
    op: WriteFn,
    first_error: &mut Option<StorageError>,
) {
    if let Err(err) = op(session).await {
        tracing::warn!(error = %err, "queued write failed");
        if first_error.is_none() {
            *first_error = Some(err);
        }
    }
}

/// Spawn the executor task owning a backend session.
///
/// The executor drains operations strictly in order. A failed operation
/// does not stop the drain; its error is recorded and later operations
/// still run. Finalizing closes intake immediately: operations already
/// queued still execute, sends arriving afterwards fail with `TxClosed`.
/// On `Commit` with a recorded error the transaction rolls back and that
/// first error is returned.
pub(crate) fn spawn_tx<S>(session: S) -> Tx
where
    S: TxSession + 'static,
{
    let (ops_tx, mut ops_rx) = mpsc::unbounded_channel::<WriteFn>();
    let (outcome_tx, mut outcome_rx) = oneshot::channel::<TxOutcome>();

    let handle = tokio::spawn(async move {
        let mut session = session;
        let mut first_error: Option<StorageError> = None;

        let outcome = loop {
            tokio::select! {
                op = ops_rx.recv() => match op {
                    Some(op) => apply_op(&mut session, op, &mut first_error).await,
                    // Every writer is gone; wait for the finalize decision.
                    None => break outcome_rx.await.unwrap_or(TxOutcome::Rollback),
                },
                outcome = &mut outcome_rx => {
                    ops_rx.close();
                    break outcome.unwrap_or(TxOutcome::Rollback);
                },
            }
        };

        // Drain whatever was queued before intake closed.
        while let Some(op) = ops_rx.recv().await {
            apply_op(&mut session, op, &mut first_error).await;
        }

        match (outcome, first_error) {
            (TxOutcome::Commit, None) => Box::new(session).commit().await,
            (TxOutcome::Commit, Some(err)) => {
                Box::new(session).rollback().await?;
                Err(err)
            },
            (TxOutcome::Rollback, first_error) => {
                Box::new(session).rollback().await?;
                match first_error {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            },
        }
    });

    Tx {
        ops: ops_tx,
        outcome: outcome_tx,
        handle,
    }
}

/// Open a storage backend from a connection string.
///
/// `postgres://` and `postgresql://` map to Postgres; `memory://` maps to
/// the in-process backend used in tests and dry runs.
///
/// # Errors
///
/// - `UnsupportedScheme` - no backend matches the connection string
pub async fn connect(conn: &str) -> Result<Arc<dyn Storage>, StorageError> {
    let scheme = conn.split("://").next().unwrap_or_default();

    match scheme {
        "postgres" | "postgresql" => Ok(Arc::new(PostgresStorage::connect(conn).await?)),
        "memory" => Ok(Arc::new(MemoryStorage::new())),
        other => Err(StorageError::UnsupportedScheme(other.to_string())),
    }
}
