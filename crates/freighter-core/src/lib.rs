//! Freighter Core
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! The concurrent transport pipeline: rate-limited multi-worker fetching of
//! web-API data, time-range request splitting, a channel-serialized
//! per-backend transaction abstraction, and a metadata-driven batched upsert
//! for the relational backend.
//!
//! # Overview
//!
//! A [`pipeline::Pipeline`] is configured with a base URL, a set of
//! [`request::RequestSpec`]s, a shared rate limit, and one or more storage
//! backends. Running it flattens every request into concrete fetch jobs
//! (one per time chunk for timeseries endpoints), fetches them through a
//! worker pool gated by a token-bucket limiter, decodes each response into
//! records, and upserts those records into every backend inside one
//! transaction per backend. Any failure rolls back every backend for the
//! run.
//!
//! # Example
//!
//! ```no_run
//! use freighter_core::pipeline::Pipeline;
//! use freighter_core::ratelimit::RateLimitConfig;
//! use freighter_core::request::RequestSpec;
//! use freighter_core::storage;
//! use url::Url;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = storage::connect("memory://").await?;
//!
//!     let base = Url::parse("https://api.exchange.coinbase.com")?;
//!     let mut spec = RequestSpec::get("/products/BTC-USD/candles");
//!     spec.table = Some("candle_minutes".to_string());
//!
//!     Pipeline::new(base, RateLimitConfig::new(5, 1))
//!         .with_request(spec)
//!         .with_storage(backend)
//!         .run()
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod chunk;
pub mod decode;
pub mod fetch;
pub mod pipeline;
pub mod ratelimit;
pub mod request;
pub mod storage;
pub mod stream;

pub use pipeline::{Pipeline, PipelineError};
pub use stream::{RecordSet, RecordStream};
