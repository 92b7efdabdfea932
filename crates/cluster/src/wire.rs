//! Versioned encoding for everything this crate puts on the wire or in the
//! store: gossiped node records and the cluster database.
//!
//! Payloads are JSON wrapped in `{ "schema": N, "payload": ... }`. A peer
//! running a binary with a different schema gets `UnsupportedSchema` instead
//! of a half-decoded record.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Schema version written by this build.
pub const SCHEMA_VERSION: u16 = 1;

/// Wire encoding errors.
#[derive(Debug, Error)]
pub enum WireError {
    /// Bytes were not valid JSON for the expected type.
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    /// The envelope carries a schema this build does not understand.
    #[error("unsupported schema version {found} (expected {expected})")]
    UnsupportedSchema {
        /// Version found in the envelope.
        found: u16,

        /// Version this build writes.
        expected: u16,
    },
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    schema: u16,
    payload: &'a T,
}

#[derive(Deserialize)]
struct Header {
    schema: u16,
}

#[derive(Deserialize)]
struct Envelope<T> {
    payload: T,
}

/// Encodes `payload` under the current schema.
pub fn encode<T: Serialize>(payload: &T) -> Result<Bytes, WireError> {
    let bytes = serde_json::to_vec(&EnvelopeRef {
        schema: SCHEMA_VERSION,
        payload,
    })?;

    Ok(Bytes::from(bytes))
}

/// Decodes a payload, rejecting other schema versions.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    let Header { schema } = serde_json::from_slice(bytes)?;

    if schema != SCHEMA_VERSION {
        return Err(WireError::UnsupportedSchema {
            found: schema,
            expected: SCHEMA_VERSION,
        });
    }

    let Envelope { payload } = serde_json::from_slice(bytes)?;
    Ok(payload)
}
