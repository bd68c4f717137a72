//! HTTP fetching and the bounded worker pool
//!
//! Jobs flow through a bounded channel sized to the job count, so enqueuing
//! never blocks and the pool drains at exactly the rate its workers (and
//! their shared limiter) will go. Worker count defaults to the number of
//! logical CPUs.

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::ratelimit::{self, RateLimitError};
use crate::request::FlattenedJob;

/// Raw response payload before decoding
#[derive(Debug)]
pub struct FetchedPayload {
    pub body: Vec<u8>,
    pub content_type: String,
}

/// One completed fetch, tagged with its target table
#[derive(Debug)]
pub struct FetchResult {
    pub table: String,
    pub url: Url,
    pub body: Vec<u8>,
    pub content_type: String,
    pub clob_column: Option<String>,
}

/// Errors produced while fetching
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport failure fetching {url}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("unexpected status {status} fetching {url}")]
    Status {
        status: u16,
        url: String,
    },

    /// The run was cancelled before this job got a rate-limit token
    #[error("deadline exceeded fetching {0}")]
    DeadlineExceeded(String),
}

/// Something that performs one HTTP request and returns the raw body
///
/// The pipeline is generic over this seam so tests can substitute a fake
/// transport.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, method: &str, url: &Url) -> Result<FetchedPayload, FetchError>;
}

/// `reqwest`-backed fetcher used by real pipelines
#[derive(Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, method: &str, url: &Url) -> Result<FetchedPayload, FetchError> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .unwrap_or(reqwest::Method::GET);

        let response = self
            .client
            .request(method, url.clone())
            .send()
            .await
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let body = response
            .bytes()
            .await
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;

        Ok(FetchedPayload {
            body: body.to_vec(),
            content_type,
        })
    }
}

/// Default worker count: one per logical CPU.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(4)
}

/// Run the fetch pool over a set of jobs.
///
/// Spawns `workers` tasks pulling jobs from a shared queue; each job waits
/// on its own rate limiter before the request goes out. Every job produces
/// exactly one message on the returned channel, success or failure, so the
/// consumer can count completions. The channel is bounded to the job count
/// and the pool never blocks producing into it.
pub fn spawn_fetch_pool(
    fetcher: Arc<dyn Fetcher>,
    jobs: Vec<FlattenedJob>,
    workers: usize,
    cancel: CancellationToken,
) -> (
    mpsc::Receiver<Result<FetchResult, FetchError>>,
    JoinSet<()>,
) {
    let job_count = jobs.len().max(1);
    let (job_tx, job_rx) = mpsc::channel::<FlattenedJob>(job_count);
    let (result_tx, result_rx) = mpsc::channel(job_count);

    for job in jobs {
        // Capacity equals the job count, so this cannot fail.
        let _ = job_tx.try_send(job);
    }
    drop(job_tx);

    let job_rx = Arc::new(Mutex::new(job_rx));
    let mut pool = JoinSet::new();

    for worker in 0..workers.max(1) {
        let job_rx = Arc::clone(&job_rx);
        let result_tx = result_tx.clone();
        let fetcher = Arc::clone(&fetcher);
        let cancel = cancel.clone();

        pool.spawn(async move {
            loop {
                let job = {
                    let mut rx = job_rx.lock().await;
                    rx.recv().await
                };
                let Some(job) = job else { break };

                tracing::debug!(worker, url = %job.url, table = %job.table, "fetching");
                let outcome = fetch_job(fetcher.as_ref(), &job, &cancel).await;

                if result_tx.send(outcome).await.is_err() {
                    break;
                }
            }
        });
    }

    (result_rx, pool)
}

async fn fetch_job(
    fetcher: &dyn Fetcher,
    job: &FlattenedJob,
    cancel: &CancellationToken,
) -> Result<FetchResult, FetchError> {
    ratelimit::wait(&job.limiter, cancel)
        .await
        .map_err(|err| match err {
            RateLimitError::DeadlineExceeded => {
                FetchError::DeadlineExceeded(job.url.to_string())
            },
            other => FetchError::DeadlineExceeded(other.to_string()),
        })?;

    let payload = tokio::select! {
        payload = fetcher.fetch(&job.method, &job.url) => payload?,
        () = cancel.cancelled() => {
            return Err(FetchError::DeadlineExceeded(job.url.to_string()));
        },
    };

    Ok(FetchResult {
        table: job.table.clone(),
        url: job.url.clone(),
        body: payload.body,
        content_type: payload.content_type,
        clob_column: job.clob_column.clone(),
    })
}
