// Codec module - JSON encoding of stored records
use crate::domain::error::TetherResult;
use crate::domain::metadata::SessionMetadata;
use tracing::warn;

pub fn encode(metadata: &SessionMetadata) -> TetherResult<String> {
    Ok(serde_json::to_string(metadata)?)
}

/// Decode a stored record; anything unreadable counts as absent
pub fn decode(key: &str, raw: &str) -> Option<SessionMetadata> {
    match serde_json::from_str(raw) {
        Ok(metadata) => Some(metadata),
        Err(e) => {
            warn!(key = %key, error = %e, "Discarding malformed session record");
            None
        }
    }
}

pub fn encode_index(session_ids: &[String]) -> TetherResult<String> {
    Ok(serde_json::to_string(session_ids)?)
}

/// Decode a serialized user index; an unreadable index counts as empty
pub fn decode_index(key: &str, raw: &str) -> Vec<String> {
    match serde_json::from_str(raw) {
        Ok(ids) => ids,
        Err(e) => {
            warn!(key = %key, error = %e, "Discarding malformed user index");
            Vec::new()
        }
    }
}
