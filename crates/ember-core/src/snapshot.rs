//! Framing for the engine's opaque state blob.
//!
//! The KV-cache snapshot is engine-defined and passes through this layer
//! untouched; only the magic, version and size prefix are validated here.

use std::fs;
use std::io::Write;
use std::path::Path;

use ember_engine::EngineError;
use tracing::debug;

use crate::error::{Result, SessionError};

const MAGIC: &[u8; 8] = b"EMBRSNAP";
const VERSION: u32 = 1;

fn load_err(path: &Path, reason: impl Into<String>) -> SessionError {
    SessionError::LoadFailed {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

/// Write a framed snapshot: magic, version, payload length, payload.
pub fn write_snapshot(path: &Path, blob: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path)
        .map_err(|e| SessionError::Engine(EngineError::State(e.to_string())))?;
    file.write_all(MAGIC)
        .and_then(|_| file.write_all(&VERSION.to_le_bytes()))
        .and_then(|_| file.write_all(&(blob.len() as u64).to_le_bytes()))
        .and_then(|_| file.write_all(blob))
        .map_err(|e| SessionError::Engine(EngineError::State(e.to_string())))?;
    debug!(path = %path.display(), bytes = blob.len(), "session state saved");
    Ok(())
}

/// Read a framed snapshot back, validating the frame only — the payload
/// stays opaque.
pub fn read_snapshot(path: &Path) -> Result<Vec<u8>> {
    let bytes = fs::read(path).map_err(|e| load_err(path, e.to_string()))?;
    if bytes.len() < MAGIC.len() + 4 + 8 {
        return Err(load_err(path, "snapshot header truncated"));
    }
    if &bytes[0..8] != MAGIC {
        return Err(load_err(path, "not a session snapshot"));
    }
    let version = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    if version != VERSION {
        return Err(load_err(path, format!("unsupported snapshot version {version}")));
    }
    let len = u64::from_le_bytes([
        bytes[12], bytes[13], bytes[14], bytes[15], bytes[16], bytes[17], bytes[18], bytes[19],
    ]) as usize;
    let payload = &bytes[20..];
    if payload.len() != len {
        return Err(load_err(
            path,
            format!("payload is {} bytes, header claims {len}", payload.len()),
        ));
    }
    debug!(path = %path.display(), bytes = len, "session state loaded");
    Ok(payload.to_vec())
}
