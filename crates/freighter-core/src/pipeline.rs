//! Pipeline orchestration
//!
//! A run flattens the configured requests into jobs, opens one transaction
//! per storage backend, streams fetched payloads through decoding into
//! every transaction, and finally commits all transactions together or
//! rolls all of them back. The commit decision is all-or-nothing per run:
//! one failed fetch, decode, or write rolls back every backend, and the
//! first error observed is the one surfaced.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::decode::{self, DecodeError};
use crate::fetch::{self, FetchError, Fetcher, HttpFetcher};
use crate::ratelimit::{RateLimitConfig, RateLimitError, RateLimiterRegistry};
use crate::request::{self, FlattenError, RequestSpec};
use crate::storage::{Storage, StorageError, TxWriter};
use crate::stream::RecordStream;

/// Errors surfaced by a pipeline run
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Flatten(#[from] FlattenError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A configured transport run from one web API into one or more storage
/// backends
pub struct Pipeline {
    base_url: Url,
    requests: Vec<RequestSpec>,
    rate_limit: RateLimitConfig,
    storages: Vec<Arc<dyn Storage>>,
    fetcher: Arc<dyn Fetcher>,
    workers: usize,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(base_url: Url, rate_limit: RateLimitConfig) -> Self {
        Self {
            base_url,
            requests: Vec::new(),
            rate_limit,
            storages: Vec::new(),
            fetcher: Arc::new(HttpFetcher::default()),
            workers: fetch::default_workers(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_request(mut self, request: RequestSpec) -> Self {
        self.requests.push(request);
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storages.push(storage);
        self
    }

    /// Replace the HTTP transport; tests substitute a fake here.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Use an external cancellation token; cancelling it aborts the run
    /// and rolls back every backend.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the fetch side only, yielding decoded records to the caller.
    ///
    /// No storage backend is touched and truncate flags are ignored; see
    /// [`RecordStream`] for the yielded items.
    ///
    /// # Errors
    ///
    /// Configuration errors surfaced while flattening; per-job errors are
    /// yielded through the stream instead.
    pub fn stream(self) -> Result<RecordStream, PipelineError> {
        let registry = RateLimiterRegistry::new(&self.rate_limit)?;
        let jobs = request::flatten_requests(&self.base_url, &self.requests, &registry)?;
        let job_count = jobs.len();
        tracing::info!(jobs = job_count, workers = self.workers, "starting record stream");

        let (fetch_rx, workers) = fetch::spawn_fetch_pool(
            Arc::clone(&self.fetcher),
            jobs,
            self.workers,
            self.cancel.clone(),
        );

        Ok(RecordStream::spawn(fetch_rx, workers, job_count))
    }

    /// Execute the run.
    ///
    /// # Errors
    ///
    /// The first error observed anywhere in the run. Whenever any error
    /// occurs, every backend transaction is rolled back before this
    /// returns.
    #[tracing::instrument(skip(self), fields(requests = self.requests.len(), backends = self.storages.len()))]
    pub async fn run(self) -> Result<(), PipelineError> {
        let truncate_tables: Vec<String> = self
            .requests
            .iter()
            .filter(|r| r.truncate)
            .map(RequestSpec::table_name)
            .collect();

        // Truncation is best-effort and runs outside the transactions, so a
        // backend that cannot truncate still receives the load.
        if !truncate_tables.is_empty() {
            for storage in &self.storages {
                if let Err(err) = storage.truncate(&truncate_tables).await {
                    tracing::warn!(error = %err, "truncate failed; continuing");
                }
            }
        }

        let registry = RateLimiterRegistry::new(&self.rate_limit)?;
        let jobs = request::flatten_requests(&self.base_url, &self.requests, &registry)?;
        let job_count = jobs.len();
        tracing::info!(jobs = job_count, workers = self.workers, "starting transport");

        let mut txs = Vec::with_capacity(self.storages.len());
        for storage in &self.storages {
            txs.push(storage.start_tx().await?);
        }
        let writers: Vec<TxWriter> = txs.iter().map(|tx| tx.writer()).collect();

        let (result_rx, mut fetch_pool) = fetch::spawn_fetch_pool(
            Arc::clone(&self.fetcher),
            jobs,
            self.workers,
            self.cancel.clone(),
        );

        let first_error: Arc<Mutex<Option<PipelineError>>> = Arc::new(Mutex::new(None));
        let result_rx = Arc::new(Mutex::new(result_rx));
        let mut upsert_pool = JoinSet::new();

        for _ in 0..self.workers {
            let result_rx = Arc::clone(&result_rx);
            let writers = writers.clone();
            let first_error = Arc::clone(&first_error);

            upsert_pool.spawn(async move {
                loop {
                    let outcome = {
                        let mut rx = result_rx.lock().await;
                        rx.recv().await
                    };
                    let Some(outcome) = outcome else { break };

                    // A failed job dooms the run to rollback but never stops
                    // the other jobs; every job still completes on its own.
                    if let Err(err) = handle_result(outcome, &writers).await {
                        tracing::warn!(error = %err, "transport job failed");
                        let mut slot = first_error.lock().await;
                        if slot.is_none() {
                            *slot = Some(err);
                        }
                    }
                }
            });
        }

        while fetch_pool.join_next().await.is_some() {}
        while upsert_pool.join_next().await.is_some() {}
        drop(writers);

        let run_error = first_error.lock().await.take();

        if let Some(err) = run_error {
            for tx in txs {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "rollback failed");
                }
            }
            return Err(err);
        }

        let mut commit_error: Option<PipelineError> = None;
        for tx in txs {
            if let Err(err) = tx.commit().await {
                tracing::warn!(error = %err, "commit failed");
                if commit_error.is_none() {
                    commit_error = Some(err.into());
                }
            }
        }

        match commit_error {
            Some(err) => Err(err),
            None => {
                tracing::info!(jobs = job_count, "transport complete");
                Ok(())
            },
        }
    }
}

/// Decode one fetched payload and queue its records into every backend
/// transaction.
async fn handle_result(
    outcome: Result<fetch::FetchResult, FetchError>,
    writers: &[TxWriter],
) -> Result<(), PipelineError> {
    let result = outcome?;
    let records = Arc::new(decode::decode(
        &result.content_type,
        &result.body,
        result.clob_column.as_deref(),
    )?);

    if records.is_empty() {
        return Ok(());
    }

    tracing::debug!(table = %result.table, records = records.len(), "queueing upsert");

    for writer in writers {
        let table = result.table.clone();
        let records = Arc::clone(&records);
        writer.send(Box::new(move |session| {
            Box::pin(async move { session.upsert(&table, &records).await })
        }))?;
    }

    Ok(())
}
