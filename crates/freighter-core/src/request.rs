//! Request specifications and flattening
//!
//! A configured [`RequestSpec`] describes one logical endpoint to pull.
//! Flattening resolves every spec into one or more [`FlattenedJob`]s: a
//! non-timeseries spec becomes exactly one job, a timeseries spec becomes
//! one job per time chunk with the chunk bounds written into the query
//! string. Jobs are immutable once created and consumed exactly once by the
//! fetch pool.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use url::Url;

use crate::chunk::{self, ChunkError};
use crate::ratelimit::{RateLimitError, RateLimiterRegistry, SharedRateLimiter};

/// Timeseries descriptor for a request whose endpoint pages by time range
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeseriesSpec {
    /// Query-parameter name holding the range start
    pub start_name: String,

    /// Query-parameter name holding the range end
    pub end_name: String,

    /// Maximum chunk length in seconds the API will serve per request
    pub period_secs: i64,

    /// `chrono` format string for the start/end values; RFC 3339 when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<String>,
}

/// One logical request configuration
///
/// Immutable once flattened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSpec {
    /// HTTP method; defaults to GET
    #[serde(default = "default_method")]
    pub method: String,

    /// Path joined onto the pipeline's base URL
    pub endpoint: String,

    /// Target table/collection; defaults to the last endpoint path segment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,

    /// Static query parameters merged onto the base URL
    #[serde(default)]
    pub query: BTreeMap<String, String>,

    /// Present when the endpoint pages by time range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeseries: Option<TimeseriesSpec>,

    /// Column receiving the raw body when a response is not valid JSON
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clob_column: Option<String>,

    /// Per-request rate-limit override; the pipeline limiter applies when
    /// unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<crate::ratelimit::RateLimitConfig>,

    /// Truncate the target table before the load
    #[serde(default)]
    pub truncate: bool,
}

fn default_method() -> String {
    "GET".to_string()
}

impl RequestSpec {
    /// A GET spec for the given endpoint with no static parameters.
    pub fn get(endpoint: impl Into<String>) -> Self {
        Self {
            method: default_method(),
            endpoint: endpoint.into(),
            table: None,
            query: BTreeMap::new(),
            timeseries: None,
            clob_column: None,
            rate_limit: None,
            truncate: false,
        }
    }

    /// Target table name: the configured table, or the last path segment of
    /// the endpoint.
    pub fn table_name(&self) -> String {
        match &self.table {
            Some(table) => table.clone(),
            None => self
                .endpoint
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string(),
        }
    }
}

/// One concrete fetch unit, consumed exactly once by the fetch pool
pub struct FlattenedJob {
    /// Fully resolved request URL, chunk bounds included
    pub url: Url,

    /// HTTP method
    pub method: String,

    /// Target table for the decoded records
    pub table: String,

    /// Column receiving the raw body when the response is not valid JSON
    pub clob_column: Option<String>,

    /// Limiter gating this job's fetch; chunks of one request share theirs
    pub limiter: SharedRateLimiter,
}

impl std::fmt::Debug for FlattenedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlattenedJob")
            .field("url", &self.url.as_str())
            .field("method", &self.method)
            .field("table", &self.table)
            .finish()
    }
}

/// Errors produced while flattening request configurations
#[derive(Debug, Error)]
pub enum FlattenError {
    /// Flattening the whole configuration produced zero jobs
    #[error("no requests defined")]
    NoRequests,

    /// A timeseries bound parameter is missing or appears more than once
    #[error("expected exactly one {name:?} query parameter, found {count}")]
    InvalidTimeParameter { name: String, count: usize },

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
}

/// Resolve a spec's endpoint and static query parameters against the base
/// URL.
fn resolve_url(base: &Url, spec: &RequestSpec) -> Url {
    let mut url = base.clone();

    let path = format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        spec.endpoint.trim_start_matches('/')
    );
    url.set_path(&path);

    for (key, value) in &spec.query {
        url.query_pairs_mut().append_pair(key, value);
    }

    url
}

/// Read the single value of a timeseries bound parameter from a resolved
/// URL.
fn bound_parameter(url: &Url, name: &str) -> Result<String, FlattenError> {
    let values: Vec<String> = url
        .query_pairs()
        .filter(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .collect();

    if values.len() != 1 {
        return Err(FlattenError::InvalidTimeParameter {
            name: name.to_string(),
            count: values.len(),
        });
    }

    Ok(values.into_iter().next().unwrap_or_default())
}

/// Rewrite a resolved URL's query string with the chunk bounds overriding
/// the static start/end values.
fn chunked_url(url: &Url, series: &TimeseriesSpec, chunk: &chunk::Chunk) -> Url {
    let layout = series.layout.as_deref();
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| *key != series.start_name && *key != series.end_name)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    let mut out = url.clone();
    {
        let mut pairs = out.query_pairs_mut();
        pairs.clear();
        for (key, value) in &retained {
            pairs.append_pair(key, value);
        }
        pairs.append_pair(&series.start_name, &chunk::format_timestamp(chunk.start, layout));
        pairs.append_pair(&series.end_name, &chunk::format_timestamp(chunk.end, layout));
    }

    out
}

/// Flatten one spec into its concrete jobs.
fn flatten_spec(
    base: &Url,
    spec: &RequestSpec,
    registry: &RateLimiterRegistry,
) -> Result<Vec<FlattenedJob>, FlattenError> {
    let url = resolve_url(base, spec);
    let table = spec.table_name();
    let limiter = registry.limiter_for(spec.rate_limit.as_ref())?;

    let series = match &spec.timeseries {
        None => {
            return Ok(vec![FlattenedJob {
                url,
                method: spec.method.clone(),
                table,
                clob_column: spec.clob_column.clone(),
                limiter,
            }])
        },
        Some(series) => series,
    };

    let layout = series.layout.as_deref();
    let start = chunk::parse_timestamp(&bound_parameter(&url, &series.start_name)?, layout)?;
    let end = chunk::parse_timestamp(&bound_parameter(&url, &series.end_name)?, layout)?;

    let chunks = chunk::chunk_range(start, end, series.period_secs)?;

    Ok(chunks
        .iter()
        .map(|chunk| FlattenedJob {
            url: chunked_url(&url, series, chunk),
            method: spec.method.clone(),
            table: table.clone(),
            clob_column: spec.clob_column.clone(),
            limiter: limiter.clone(),
        })
        .collect())
}

/// Expand every configured request into concrete fetch jobs.
///
/// # Errors
///
/// - `NoRequests` - the whole configuration yields zero jobs; this is a
///   configuration error raised before any network I/O
/// - `InvalidTimeParameter` / `Chunk` - malformed timeseries bounds
pub fn flatten_requests(
    base: &Url,
    specs: &[RequestSpec],
    registry: &RateLimiterRegistry,
) -> Result<Vec<FlattenedJob>, FlattenError> {
    let mut jobs = Vec::new();

    for spec in specs {
        jobs.extend(flatten_spec(base, spec, registry)?);
    }

    if jobs.is_empty() {
        return Err(FlattenError::NoRequests);
    }

    Ok(jobs)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::ratelimit::RateLimitConfig;

    fn registry() -> RateLimiterRegistry {
        RateLimiterRegistry::new(&RateLimitConfig::new(10, 1)).unwrap()
    }

    fn base() -> Url {
        Url::parse("https://api.example.com").unwrap()
    }

    #[test]
    fn test_non_timeseries_yields_single_job() {
        let mut spec = RequestSpec::get("/products/BTC-USD/candles");
        spec.query.insert("granularity".to_string(), "60".to_string());

        let jobs = flatten_requests(&base(), &[spec], &registry()).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].table, "candles");
        assert_eq!(
            jobs[0].url.as_str(),
            "https://api.example.com/products/BTC-USD/candles?granularity=60"
        );
    }

    #[test]
    fn test_timeseries_yields_one_job_per_chunk() {
        let mut spec = RequestSpec::get("/candles");
        spec.table = Some("candle_minutes".to_string());
        spec.query.insert("start".to_string(), "2022-05-10T00:00:00Z".to_string());
        spec.query.insert("end".to_string(), "2022-05-11T00:00:00Z".to_string());
        spec.timeseries = Some(TimeseriesSpec {
            start_name: "start".to_string(),
            end_name: "end".to_string(),
            period_secs: 18_000,
            layout: None,
        });

        let jobs = flatten_requests(&base(), &[spec], &registry()).unwrap();
        assert_eq!(jobs.len(), 5);

        let first = &jobs[0].url;
        assert!(first.as_str().contains("start=2022-05-10T00%3A00%3A00Z"));
        assert!(first.as_str().contains("end=2022-05-10T05%3A00%3A00Z"));

        let last = &jobs[4].url;
        assert!(last.as_str().contains("end=2022-05-11T00%3A00%3A00Z"));

        // Chunks of one request share one limiter.
        assert!(std::sync::Arc::ptr_eq(&jobs[0].limiter, &jobs[4].limiter));
    }

    #[test]
    fn test_missing_bound_parameter_fails() {
        let mut spec = RequestSpec::get("/candles");
        spec.query.insert("start".to_string(), "2022-05-10T00:00:00Z".to_string());
        spec.timeseries = Some(TimeseriesSpec {
            start_name: "start".to_string(),
            end_name: "end".to_string(),
            period_secs: 60,
            layout: None,
        });

        let err = flatten_requests(&base(), &[spec], &registry()).unwrap_err();
        assert!(matches!(
            err,
            FlattenError::InvalidTimeParameter { count: 0, .. }
        ));
    }

    #[test]
    fn test_unparsable_bound_fails() {
        let mut spec = RequestSpec::get("/candles");
        spec.query.insert("start".to_string(), "yesterday".to_string());
        spec.query.insert("end".to_string(), "2022-05-11T00:00:00Z".to_string());
        spec.timeseries = Some(TimeseriesSpec {
            start_name: "start".to_string(),
            end_name: "end".to_string(),
            period_secs: 60,
            layout: None,
        });

        assert!(matches!(
            flatten_requests(&base(), &[spec], &registry()).unwrap_err(),
            FlattenError::Chunk(_)
        ));
    }

    #[test]
    fn test_empty_configuration_is_no_requests() {
        assert!(matches!(
            flatten_requests(&base(), &[], &registry()).unwrap_err(),
            FlattenError::NoRequests
        ));
    }

    #[test]
    fn test_default_table_from_endpoint() {
        let spec = RequestSpec::get("/products/BTC-USD/trades/");
        assert_eq!(spec.table_name(), "trades");
    }
}
