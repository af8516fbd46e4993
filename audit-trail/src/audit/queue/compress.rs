//! Payload compression for queued drafts
//!
//! Large `previous_data` / `new_data` snapshots are replaced by a gzip +
//! base64 envelope before persistence:
//!
//! ```json
//! {"encoding": "gzip+base64", "data": "H4sIAAAA..."}
//! ```

use std::io::{Read, Write};

use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde_json::{json, Value};

use crate::audit::record::AuditLogDraft;
use crate::error::{Error, Result};

/// Envelope encoding tag
pub const ENCODING: &str = "gzip+base64";

/// Whether a value is already a compression envelope
pub fn is_compressed(value: &Value) -> bool {
    value.get("encoding").and_then(Value::as_str) == Some(ENCODING)
        && value.get("data").is_some_and(Value::is_string)
}

/// Compress a JSON value into an envelope; envelopes are returned unchanged
pub fn compress_value(value: &Value) -> Result<Value> {
    if is_compressed(value) {
        return Ok(value.clone());
    }

    let raw = serde_json::to_vec(value)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw)?;
    let compressed = encoder.finish()?;

    Ok(json!({
        "encoding": ENCODING,
        "data": STANDARD.encode(compressed),
    }))
}

/// Expand an envelope back to the original value; other values pass through
pub fn decompress_value(value: &Value) -> Result<Value> {
    if !is_compressed(value) {
        return Ok(value.clone());
    }

    let data = value
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::validation("compressed payload has no data"))?;
    let compressed = STANDARD
        .decode(data)
        .map_err(|e| Error::validation(format!("invalid base64 in compressed payload: {}", e)))?;

    let mut raw = Vec::new();
    GzDecoder::new(compressed.as_slice()).read_to_end(&mut raw)?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Compress both data snapshots of a draft in place
pub fn compress_draft(draft: &mut AuditLogDraft) -> Result<()> {
    if let Some(previous) = draft.previous_data.as_mut() {
        *previous = compress_value(previous)?;
    }
    if let Some(new) = draft.new_data.as_mut() {
        *new = compress_value(new)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::record::OperationType;

    #[test]
    fn test_compress_and_restore_snapshot() {
        let snapshot = json!({
            "nome": "Maria",
            "email": "maria@example.gov.br",
            "beneficios": (0..50).collect::<Vec<_>>(),
        });

        let envelope = compress_value(&snapshot).unwrap();
        assert!(is_compressed(&envelope));
        assert_eq!(envelope["encoding"], ENCODING);
        assert_eq!(decompress_value(&envelope).unwrap(), snapshot);

        // Idempotent
        assert_eq!(compress_value(&envelope).unwrap(), envelope);
    }

    #[test]
    fn test_plain_values_pass_through_decompress() {
        let plain = json!({"encoding": "utf-8"});
        assert_eq!(decompress_value(&plain).unwrap(), plain);
    }

    #[test]
    fn test_corrupt_envelope_is_rejected() {
        let corrupt = json!({"encoding": ENCODING, "data": "not base64!"});
        assert!(matches!(
            decompress_value(&corrupt),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_compress_draft_touches_only_snapshots() {
        let mut draft = AuditLogDraft::new(OperationType::Update, "Usuario")
            .with_entity_id("42")
            .with_previous_data(json!({"email": "old@example.gov.br"}))
            .with_new_data(json!({"email": "new@example.gov.br"}));

        compress_draft(&mut draft).unwrap();
        assert!(is_compressed(draft.previous_data.as_ref().unwrap()));
        assert!(is_compressed(draft.new_data.as_ref().unwrap()));
        assert_eq!(draft.affected_entity_id.as_deref(), Some("42"));

        let mut empty = AuditLogDraft::new(OperationType::Read, "Usuario");
        compress_draft(&mut empty).unwrap();
        assert!(empty.previous_data.is_none());
    }
}
