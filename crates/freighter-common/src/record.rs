//! Generic record model
//!
//! A [`Record`] is one row or document moved between the fetch and storage
//! stages: an ordered, string-keyed collection of JSON values. Decoding is
//! explicit rather than reflection-driven; the only wire format is JSON,
//! where an object becomes a single record and an array becomes one record
//! per element.

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::error::{FreighterError, Result};

/// An ordered, string-keyed collection of values representing one
/// row/document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    /// Create an empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field, replacing any existing value under the same key while
    /// keeping the key's original position.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.fields.push((key, value)),
        }
    }

    /// Look up a field by key
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the record has no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate over `(key, value)` pairs in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Build a record from a decoded JSON object
    pub fn from_object(object: serde_json::Map<String, Value>) -> Self {
        Self {
            fields: object.into_iter().collect(),
        }
    }

    /// Decode raw JSON bytes into records
    ///
    /// An object decodes to a single-element sequence; an array decodes
    /// element-wise. Array elements that are not objects, and top-level
    /// scalars, are rejected.
    ///
    /// # Errors
    ///
    /// - `Serialization` - the bytes are not valid JSON
    /// - `Record` - the JSON shape is not an object or array of objects
    pub fn decode_json(body: &[u8]) -> Result<Vec<Record>> {
        let value: Value = serde_json::from_slice(body)?;

        match value {
            Value::Object(object) => Ok(vec![Record::from_object(object)]),
            Value::Array(elements) => elements
                .into_iter()
                .map(|element| match element {
                    Value::Object(object) => Ok(Record::from_object(object)),
                    other => Err(FreighterError::Record(format!(
                        "expected JSON object element, got {other}"
                    ))),
                })
                .collect(),
            other => Err(FreighterError::Record(format!(
                "expected JSON object or array, got {other}"
            ))),
        }
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (key, value) in &self.fields {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (key, value) in iter {
            record.insert(key, value);
        }
        record
    }
}
