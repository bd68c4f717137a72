//! Time-range chunking for paginated timeseries APIs
//!
//! Many web APIs bound the span of a single timeseries query. The chunker
//! splits one `[start, end]` range into contiguous, non-overlapping
//! sub-ranges no longer than a configured period so that each sub-range can
//! be fetched as its own request.

use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, Utc};
use thiserror::Error;

/// One contiguous sub-range of a larger time interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Errors produced while splitting or parsing a time range
#[derive(Debug, Error)]
pub enum ChunkError {
    /// The range bounds are inverted or equal
    #[error("invalid time range: start {start} is not before end {end}")]
    InvalidRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    /// The chunk period must be a positive number of seconds
    #[error("invalid chunk period: {0} seconds")]
    InvalidPeriod(i64),

    /// A timestamp string could not be parsed under the configured layout
    #[error("unparsable timestamp {value:?}: {reason}")]
    UnparsableTime { value: String, reason: String },
}

/// Split `[start, end]` into ordered chunks of at most `period_secs` seconds.
///
/// The produced sequence is contiguous, non-overlapping, and covers the
/// range exactly; every chunk except possibly the last spans the full
/// period. Pure and deterministic.
///
/// # Errors
///
/// - `InvalidPeriod` - `period_secs` is zero or negative
/// - `InvalidRange` - `start` is not strictly before `end`
pub fn chunk_range(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    period_secs: i64,
) -> Result<Vec<Chunk>, ChunkError> {
    if period_secs <= 0 {
        return Err(ChunkError::InvalidPeriod(period_secs));
    }

    if start >= end {
        return Err(ChunkError::InvalidRange { start, end });
    }

    let period = Duration::seconds(period_secs);
    let mut chunks = Vec::new();
    let mut cursor = start;

    while cursor < end {
        let next = std::cmp::min(cursor + period, end);
        chunks.push(Chunk {
            start: cursor,
            end: next,
        });
        cursor = next;
    }

    Ok(chunks)
}

/// Parse a timestamp under the given layout.
///
/// `layout` is a `chrono` format string; `None` means RFC 3339. A layout
/// without an offset is interpreted as UTC.
pub fn parse_timestamp(value: &str, layout: Option<&str>) -> Result<DateTime<Utc>, ChunkError> {
    match layout {
        None => DateTime::parse_from_rfc3339(value)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| ChunkError::UnparsableTime {
                value: value.to_string(),
                reason: e.to_string(),
            }),
        Some(layout) => match DateTime::parse_from_str(value, layout) {
            Ok(ts) => Ok(ts.with_timezone(&Utc)),
            // Fall back to an offset-free layout interpreted as UTC.
            Err(_) => NaiveDateTime::parse_from_str(value, layout)
                .map(|naive| naive.and_utc())
                .map_err(|e| ChunkError::UnparsableTime {
                    value: value.to_string(),
                    reason: e.to_string(),
                }),
        },
    }
}

/// Format a timestamp under the given layout (RFC 3339 when `None`).
pub fn format_timestamp(ts: DateTime<Utc>, layout: Option<&str>) -> String {
    match layout {
        None => ts.to_rfc3339_opts(SecondsFormat::Secs, true),
        Some(layout) => ts.format(layout).to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn utc(value: &str) -> DateTime<Utc> {
        parse_timestamp(value, None).unwrap()
    }

    #[test]
    fn test_even_split() {
        // 24h range with 5h chunks: four full chunks and one 4h remainder.
        let start = utc("2022-05-10T00:00:00Z");
        let end = utc("2022-05-11T00:00:00Z");

        let chunks = chunk_range(start, end, 18_000).unwrap();
        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks[0].start, start);
        assert_eq!(chunks[4].end, end);

        // Contiguous, non-overlapping, exact cover.
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        for chunk in &chunks {
            assert!(chunk.end - chunk.start <= Duration::seconds(18_000));
        }
    }

    #[test]
    fn test_final_short_chunk_on_aligned_overrun() {
        // End one hour past the last 5h boundary: final chunk is short,
        // never extended past the requested end.
        let start = utc("2022-05-10T00:00:00Z");
        let end = utc("2022-05-11T01:00:00Z");

        let chunks = chunk_range(start, end, 18_000).unwrap();
        assert_eq!(chunks.len(), 6);
        assert_eq!(chunks[5].start, utc("2022-05-11T00:00:00Z"));
        assert_eq!(chunks[5].end, end);
        assert_eq!(chunks[5].end - chunks[5].start, Duration::hours(1));
    }

    #[test]
    fn test_single_chunk_when_period_covers_range() {
        let start = utc("2022-05-10T00:00:00Z");
        let end = utc("2022-05-10T01:00:00Z");

        let chunks = chunk_range(start, end, 86_400).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start, start);
        assert_eq!(chunks[0].end, end);
    }

    #[test]
    fn test_zero_period_fails_fast() {
        let start = utc("2022-05-10T00:00:00Z");
        let end = utc("2022-05-11T00:00:00Z");
        assert!(matches!(
            chunk_range(start, end, 0),
            Err(ChunkError::InvalidPeriod(0))
        ));
    }

    #[test]
    fn test_inverted_range_fails() {
        let start = utc("2022-05-11T00:00:00Z");
        let end = utc("2022-05-10T00:00:00Z");
        assert!(matches!(
            chunk_range(start, end, 60),
            Err(ChunkError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_parse_custom_layout() {
        let ts = parse_timestamp("2022-05-10 12:30:00", Some("%Y-%m-%d %H:%M:%S")).unwrap();
        assert_eq!(ts, utc("2022-05-10T12:30:00Z"));
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert!(matches!(
            parse_timestamp("not-a-time", None),
            Err(ChunkError::UnparsableTime { .. })
        ));
    }

    #[test]
    fn test_format_round_trip() {
        let ts = utc("2022-05-10T00:00:00Z");
        assert_eq!(format_timestamp(ts, None), "2022-05-10T00:00:00Z");
        assert_eq!(
            format_timestamp(ts, Some("%Y-%m-%d %H:%M:%S")),
            "2022-05-10 00:00:00"
        );
    }
}
