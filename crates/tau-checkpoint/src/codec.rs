//! Session state envelope, gzip framing, and content hashing.
use std::io::{Read, Write};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{CheckpointError, SessionState};

pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    schema_version: u32,
    session: &'a SessionState,
}

#[derive(Deserialize)]
struct Envelope {
    schema_version: u32,
    session: Value,
}

/// Bytes ready to persist plus their integrity hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EncodedState {
    pub(crate) bytes: Vec<u8>,
    pub(crate) compressed: bool,
    pub(crate) context_hash: String,
}

pub(crate) fn encode_state(
    session: &SessionState,
    compression_level: i32,
) -> Result<EncodedState, CheckpointError> {
    let envelope = EnvelopeRef {
        schema_version: CHECKPOINT_SCHEMA_VERSION,
        session,
    };
    let raw = serde_json::to_vec(&envelope).map_err(CheckpointError::Encode)?;
    let (bytes, compressed) = match gzip_level(compression_level) {
        Some(level) => (gzip(&raw, level)?, true),
        None => (raw, false),
    };
    let context_hash = sha256_hex(&bytes);
    Ok(EncodedState {
        bytes,
        compressed,
        context_hash,
    })
}

pub(crate) fn decode_state(bytes: &[u8], compressed: bool) -> Result<SessionState, CheckpointError> {
    let raw = if compressed {
        gunzip(bytes)?
    } else {
        bytes.to_vec()
    };
    let envelope: Envelope = serde_json::from_slice(&raw).map_err(CheckpointError::Decode)?;
    if envelope.schema_version == 0 || envelope.schema_version > CHECKPOINT_SCHEMA_VERSION {
        return Err(CheckpointError::UnsupportedSchema {
            found: envelope.schema_version,
            supported: CHECKPOINT_SCHEMA_VERSION,
        });
    }
    serde_json::from_value(envelope.session).map_err(CheckpointError::Decode)
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn gzip_level(compression_level: i32) -> Option<u32> {
    u32::try_from(compression_level)
        .ok()
        .filter(|level| *level > 0)
        .map(|level| level.min(9))
}

fn gzip(bytes: &[u8], level: u32) -> Result<Vec<u8>, CheckpointError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level));
    encoder.write_all(bytes).map_err(CheckpointError::Compress)?;
    encoder.finish().map_err(CheckpointError::Compress)
}

fn gunzip(bytes: &[u8]) -> Result<Vec<u8>, CheckpointError> {
    let mut decoder = GzDecoder::new(bytes);
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .map_err(CheckpointError::Decompress)?;
    Ok(raw)
}

#[cfg(test)]
pub(crate) fn encode_envelope_for_test(schema_version: u32, session: &SessionState) -> Vec<u8> {
    serde_json::to_vec(&EnvelopeRef {
        schema_version,
        session,
    })
    .expect("serialize test envelope")
}
