//! Session export/import
//!
//! A session normally lives only as long as its backend. Exporting it lets an
//! operator keep the captured definitions somewhere safe and load them into
//! another connection. JSON is used for inspection, gzip-compressed bincode for
//! the portable form.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use pgrx::JsonB;
use serde::{Deserialize, Serialize};

use super::MigrationSession;
use crate::error::{DepsError, DepsResult};

/// Current envelope version; bump when `MigrationSession` changes shape
pub const ENVELOPE_VERSION: u32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEnvelope {
    pub version: u32,
    pub exported_at: String,
    pub extension_version: String,
    pub session: MigrationSession,
}

impl SessionEnvelope {
    pub fn new(session: MigrationSession) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            exported_at: chrono::Utc::now().to_rfc3339(),
            extension_version: env!("CARGO_PKG_VERSION").to_string(),
            session,
        }
    }

    /// Serialize to gzip-compressed bincode
    pub fn to_bytes(&self) -> DepsResult<Vec<u8>> {
        let raw = bincode::serialize(self)?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw)?;
        Ok(encoder.finish()?)
    }

    pub fn from_bytes(data: &[u8]) -> DepsResult<Self> {
        let mut decoder = GzDecoder::new(data);
        let mut raw = Vec::new();
        decoder.read_to_end(&mut raw).map_err(|e| DepsError::SerializationError {
            message: format!("Decompression failed: {e}"),
        })?;

        let envelope: Self = bincode::deserialize(&raw)?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(DepsError::SerializationError {
                message: format!(
                    "Unsupported session envelope version {} (expected {})",
                    envelope.version, ENVELOPE_VERSION
                ),
            });
        }
        Ok(envelope)
    }
}

/// Full session as JSONB, for `mvdeps_session()`
pub fn to_jsonb(session: &MigrationSession) -> DepsResult<JsonB> {
    let json = serde_json::to_value(session).map_err(|e| DepsError::SerializationError {
        message: format!("Failed to serialize session to JSON: {e}"),
    })?;
    Ok(JsonB(json))
}
