// Copyright 2024-2025, The Weir Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The data model: raw payloads as sources produce them, normalization into
//! structured records, and batches as the unit of one write attempt.

use simd_json::ValueType;
use value_trait::prelude::*;

/// The structured value type records are carried in
pub type Value = simd_json::OwnedValue;

/// What a source actually produced, before any interpretation.
///
/// Sources never guess at nesting or encoding themselves; they hand the raw
/// payload to [`normalize`].
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    /// raw bytes, expected to hold JSON
    Bytes(Vec<u8>),
    /// text, expected to hold JSON
    Text(String),
    /// an already structured payload
    Structured(Value),
}

impl From<Vec<u8>> for RawValue {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

impl From<String> for RawValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Value> for RawValue {
    fn from(v: Value) -> Self {
        Self::Structured(v)
    }
}

/// Failure to turn a [`RawValue`] into a structured record payload
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The payload is not valid JSON
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] simd_json::Error),
    /// The payload decoded to something other than an object
    #[error("payload must be an object, got {0:?}")]
    NotAnObject(ValueType),
    /// The `value` envelope field held a string that is not valid JSON
    #[error("envelope `value` field is a string but not valid JSON: {0}")]
    InvalidEnvelope(simd_json::Error),
}

/// Turn a raw payload into the canonical structured record payload.
///
/// The rules are deliberately strict, there is no guessing:
///
/// * `Bytes` and `Text` must parse as JSON objects,
/// * `Structured` values are unwrapped exactly one level: an object carrying a
///   `value` field that is a JSON-encoded string or an object is replaced by
///   that inner value. A `value` of any other type leaves the envelope alone.
/// * the result must be an object, top-level arrays and scalars are errors.
///
/// # Errors
/// if the payload is not valid JSON or does not decode to an object
pub fn normalize(raw: RawValue) -> Result<Value, DecodeError> {
    let value = match raw {
        RawValue::Bytes(mut b) => simd_json::to_owned_value(&mut b)?,
        RawValue::Text(s) => {
            let mut bytes = s.trim().as_bytes().to_vec();
            simd_json::to_owned_value(&mut bytes)?
        }
        RawValue::Structured(v) => unwrap_envelope(v)?,
    };
    if value.is_object() {
        Ok(value)
    } else {
        Err(DecodeError::NotAnObject(value.value_type()))
    }
}

// One level of envelope unwrapping, never more. The upstream corpus carried
// payloads both bare and wrapped in `{"value": ...}` envelopes, with `value`
// sometimes being a JSON-encoded string.
fn unwrap_envelope(value: Value) -> Result<Value, DecodeError> {
    let is_envelope = matches!(
        value.get("value").map(TypedValue::value_type),
        Some(ValueType::String | ValueType::Object)
    );
    if !is_envelope {
        return Ok(value);
    }
    let mut value = value;
    // checked above
    let Some(inner) = value.as_object_mut().and_then(|o| o.remove("value")) else {
        return Ok(value);
    };
    match inner {
        Value::String(s) => {
            let mut bytes = s.into_bytes();
            simd_json::to_owned_value(&mut bytes).map_err(DecodeError::InvalidEnvelope)
        }
        inner => Ok(inner),
    }
}

/// One normalized payload plus the metadata the pipe layer owns.
///
/// Records exist only in memory between read and write; persistence is the
/// external store's job.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// the normalized business payload
    pub payload: Value,
    /// optional partitioning/grouping key
    pub key: Option<String>,
    /// monotonically increasing offset within the record's pipe
    pub offset: u64,
    /// stream the record belongs to within its source
    pub stream: u64,
    /// nanosecond timestamp assigned at publish
    pub ingest_ns: u64,
}

/// An ordered sequence of records grouped for a single write attempt.
///
/// Owned transiently by the write call: discarded on success, redelivered on
/// backpressure, dropped with a fatal error on permanent failure.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// name of the pipe the batch was consumed from
    pub pipe: String,
    /// the records, in publish order
    pub records: Vec<Record>,
}

impl Batch {
    /// number of records in the batch
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// true if the batch holds no records
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// offset of the first record, if any
    #[must_use]
    pub fn first_offset(&self) -> Option<u64> {
        self.records.first().map(|r| r.offset)
    }

    /// offset of the last record, if any
    #[must_use]
    pub fn last_offset(&self) -> Option<u64> {
        self.records.last().map(|r| r.offset)
    }
}
