//! Streaming record iteration
//!
//! [`Pipeline::stream`] runs the fetch side of a configured pipeline and
//! hands decoded records back to the caller instead of writing them to
//! storage. Every flattened job yields exactly one item, a [`RecordSet`]
//! on success or that job's terminal error, so the caller can count
//! completions the same way the storage-backed run does. No transaction is
//! opened and truncate flags are ignored.
//!
//! [`Pipeline::stream`]: crate::pipeline::Pipeline::stream

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use url::Url;

use freighter_common::Record;

use crate::decode;
use crate::fetch::{FetchError, FetchResult};
use crate::pipeline::PipelineError;

/// Decoded records from one completed fetch job
#[derive(Debug)]
pub struct RecordSet {
    /// Target table the job was configured for
    pub table: String,

    /// The job's fully resolved URL
    pub url: Url,

    /// Decoded records; empty when the response held none
    pub records: Vec<Record>,
}

/// Streaming handle over a pipeline's fetch results
///
/// Dropping the stream cancels the remaining fetch work.
pub struct RecordStream {
    items: mpsc::Receiver<Result<RecordSet, PipelineError>>,
    // Dropping the JoinSet aborts the fetch workers.
    _workers: JoinSet<()>,
    _forwarder: JoinHandle<()>,
}

impl RecordStream {
    pub(crate) fn spawn(
        mut fetch_rx: mpsc::Receiver<Result<FetchResult, FetchError>>,
        workers: JoinSet<()>,
        job_count: usize,
    ) -> Self {
        let (tx, items) = mpsc::channel(job_count.max(1));

        let forwarder = tokio::spawn(async move {
            while let Some(outcome) = fetch_rx.recv().await {
                if tx.send(decode_outcome(outcome)).await.is_err() {
                    break;
                }
            }
        });

        Self {
            items,
            _workers: workers,
            _forwarder: forwarder,
        }
    }

    /// The next completed job, or `None` once every job has been yielded.
    pub async fn next(&mut self) -> Option<Result<RecordSet, PipelineError>> {
        self.items.recv().await
    }
}

impl Stream for RecordStream {
    type Item = Result<RecordSet, PipelineError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().items.poll_recv(cx)
    }
}

fn decode_outcome(
    outcome: Result<FetchResult, FetchError>,
) -> Result<RecordSet, PipelineError> {
    let result = outcome?;
    let records = decode::decode(
        &result.content_type,
        &result.body,
        result.clob_column.as_deref(),
    )?;

    Ok(RecordSet {
        table: result.table,
        url: result.url,
        records,
    })
}
