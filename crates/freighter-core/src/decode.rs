//! Response decoding and Accept-header negotiation
//!
//! Content negotiation here is deliberately permissive: if any entry in the
//! Accept header matches a supported decoder the response is decoded with
//! it, regardless of the entry's quality weight. A `q` value that fails to
//! parse is treated as `1.0`; a `q` value outside `[0, 1]` drops that entry
//! only. JSON is currently the sole supported decoder and is also the
//! fallback for an empty header.

use mime::Mime;
use serde_json::Value;
use thiserror::Error;

use freighter_common::{FreighterError, Record};

/// Supported response decoders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeType {
    Json,
}

/// Errors produced while negotiating or decoding a response body
#[derive(Debug, Error)]
pub enum DecodeError {
    /// No entry in the Accept header matches a supported decoder
    #[error("unsupported decode type in accept header {0:?}")]
    UnsupportedDecodeType(String),

    /// The body failed to decode as the negotiated type
    #[error(transparent)]
    Body(#[from] FreighterError),
}

/// Whether a media range matches a decoder we support.
fn supported(mime: &Mime) -> Option<DecodeType> {
    match (mime.type_(), mime.subtype()) {
        (mime::STAR, _) => Some(DecodeType::Json),
        (mime::APPLICATION, mime::STAR) => Some(DecodeType::Json),
        (mime::APPLICATION, mime::JSON) => Some(DecodeType::Json),
        _ => None,
    }
}

/// Quality weight of a media range entry.
///
/// A garbled weight counts as `1.0`; `None` means the entry carries an
/// out-of-range weight and must be skipped.
fn quality(mime: &Mime) -> Option<f32> {
    let raw = match mime.get_param("q") {
        Some(value) => value.as_str(),
        None => return Some(1.0),
    };

    let q = raw.parse::<f32>().unwrap_or(1.0);
    if !(0.0..=1.0).contains(&q) {
        return None;
    }

    Some(q)
}

/// Pick the decoder for an Accept header.
///
/// # Errors
///
/// - `UnsupportedDecodeType` - the header names only media types we cannot
///   decode
pub fn negotiate(accept: &str) -> Result<DecodeType, DecodeError> {
    if accept.trim().is_empty() {
        return Ok(DecodeType::Json);
    }

    for entry in accept.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        // Bare "*" is a valid wildcard in the wild even though it is not a
        // well-formed media range.
        if entry == "*" {
            return Ok(DecodeType::Json);
        }

        let mime: Mime = match entry.parse() {
            Ok(mime) => mime,
            Err(_) => continue,
        };

        if quality(&mime).is_none() {
            continue;
        }

        if let Some(decoder) = supported(&mime) {
            return Ok(decoder);
        }
    }

    Err(DecodeError::UnsupportedDecodeType(accept.to_string()))
}

/// Negotiate against the Accept header and decode the body into records.
///
/// An object body decodes to one record, an array body to one record per
/// element. A body that is not valid JSON decodes to a single record
/// holding the raw text under `clob_column` when one is configured for the
/// request; without one it is a decode error.
pub fn decode(
    accept: &str,
    body: &[u8],
    clob_column: Option<&str>,
) -> Result<Vec<Record>, DecodeError> {
    match negotiate(accept)? {
        DecodeType::Json => decode_json_body(body, clob_column),
    }
}

fn decode_json_body(body: &[u8], clob_column: Option<&str>) -> Result<Vec<Record>, DecodeError> {
    match Record::decode_json(body) {
        Ok(records) => Ok(records),
        Err(FreighterError::Serialization(err)) => match clob_column {
            Some(column) => {
                let mut record = Record::new();
                record.insert(
                    column,
                    Value::String(String::from_utf8_lossy(body).into_owned()),
                );
                Ok(vec![record])
            },
            None => Err(DecodeError::Body(FreighterError::Serialization(err))),
        },
        Err(other) => Err(DecodeError::Body(other)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_accept_defaults_to_json() {
        assert_eq!(negotiate("").unwrap(), DecodeType::Json);
        assert_eq!(negotiate("   ").unwrap(), DecodeType::Json);
    }

    #[test]
    fn test_wildcards_match_json() {
        assert_eq!(negotiate("*/*").unwrap(), DecodeType::Json);
        assert_eq!(negotiate("*").unwrap(), DecodeType::Json);
        assert_eq!(negotiate("application/*").unwrap(), DecodeType::Json);
    }

    #[test]
    fn test_any_supported_entry_wins_regardless_of_weight() {
        let accept = "text/html;q=0.9, application/json;q=0.1";
        assert_eq!(negotiate(accept).unwrap(), DecodeType::Json);
    }

    #[test]
    fn test_garbled_weight_keeps_entry() {
        assert_eq!(negotiate("application/json;q=banana").unwrap(), DecodeType::Json);
    }

    #[test]
    fn test_out_of_range_weight_drops_entry() {
        assert!(matches!(
            negotiate("application/json;q=1.5"),
            Err(DecodeError::UnsupportedDecodeType(_))
        ));

        // Another supported entry still wins.
        assert_eq!(
            negotiate("application/json;q=1.5, */*").unwrap(),
            DecodeType::Json
        );
    }

    #[test]
    fn test_unsupported_types_fail() {
        assert!(matches!(
            negotiate("text/html, image/png"),
            Err(DecodeError::UnsupportedDecodeType(_))
        ));
    }

    #[test]
    fn test_decode_object_body() {
        let records = decode("application/json", br#"{"id": 1}"#, None).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_decode_array_body() {
        let records = decode("", br#"[{"id": 1}, {"id": 2}]"#, None).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_decode_bad_body_is_body_error() {
        assert!(matches!(
            decode("application/json", b"not json", None),
            Err(DecodeError::Body(_))
        ));
    }

    #[test]
    fn test_non_json_body_wraps_under_clob_column() {
        let records = decode("application/json", b"a,b\n1,2", Some("payload")).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].get("payload"),
            Some(&Value::String("a,b\n1,2".to_string()))
        );
    }

    #[test]
    fn test_valid_json_ignores_clob_column() {
        let records = decode("", br#"{"id": 1}"#, Some("payload")).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("payload"), None);
    }

    #[test]
    fn test_clob_column_does_not_mask_shape_errors() {
        // A scalar is valid JSON; it fails on shape, not syntax, and the
        // clob column must not swallow that.
        assert!(matches!(
            decode("", b"42", Some("payload")),
            Err(DecodeError::Body(_))
        ));
    }
}
