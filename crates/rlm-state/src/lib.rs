// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical state serialization, checksumming, and persistence.
//!
//! The state payload of an execution is either a JSON object, a string, or
//! absent. Canonical bytes are compact UTF-8 JSON with keys sorted at every
//! level (the default `serde_json` map is a `BTreeMap`, so sorting falls out
//! of serialization). The checksum is `sha256:` + the hex digest of the
//! canonical bytes. Small states are stored inline in the execution-state
//! row; large states are gzip-offloaded to the blob store at a deterministic
//! key — exactly one of the two forms is ever populated.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use rlm_store::{BlobStore, join_s3_uri};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Inline-vs-offload threshold in canonical bytes.
pub const DEFAULT_INLINE_MAX_BYTES: usize = 350 * 1024;

/// Default key prefix for offloaded state blobs.
pub const DEFAULT_STATE_PREFIX: &str = "state";

/// Prefix carried by every checksum string.
pub const CHECKSUM_PREFIX: &str = "sha256:";

/// Errors from state validation and persistence.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The payload is not an object, string, or null — or contains a value
    /// outside the JSON tree discipline.
    #[error("invalid state payload: {0}")]
    InvalidType(String),
    /// Offload was required but the blob write failed (or no store/bucket
    /// was configured).
    #[error("state offload failed: {0}")]
    Offload(String),
}

/// Where a persisted payload ended up.
///
/// Exactly one of `state_json` and `state_s3_uri` is `Some`.
#[derive(Debug, Clone, PartialEq)]
pub struct StatePayloadRecord {
    /// Inline payload, when it fit under the threshold.
    pub state_json: Option<Value>,
    /// Offloaded blob URI otherwise.
    pub state_s3_uri: Option<String>,
    /// `sha256:`-prefixed checksum of the canonical bytes.
    pub checksum: String,
    /// `{byte_length, char_length}` of the canonical encoding.
    pub summary: Map<String, Value>,
}

fn validate_json_value(value: &Value, path: &str) -> Result<(), StateError> {
    match value {
        Value::Null | Value::Bool(_) | Value::String(_) => Ok(()),
        Value::Number(number) => {
            // serde_json cannot represent NaN/∞ without the arbitrary-
            // precision feature, but the contract is explicit, so check.
            if number.as_f64().is_some_and(f64::is_finite)
                || number.as_i64().is_some()
                || number.as_u64().is_some()
            {
                Ok(())
            } else {
                Err(StateError::InvalidType(format!(
                    "non-finite number at {path}"
                )))
            }
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                validate_json_value(item, &format!("{path}[{index}]"))?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for (key, item) in map {
                validate_json_value(item, &format!("{path}.{key}"))?;
            }
            Ok(())
        }
    }
}

/// Validate a state payload: the top level must be an object, a string, or
/// absent, and every nested value a finite JSON scalar, list, or
/// string-keyed object.
///
/// # Errors
///
/// Returns [`StateError::InvalidType`] describing the offending path.
pub fn validate_state_payload(state: Option<&Value>) -> Result<(), StateError> {
    match state {
        None | Some(Value::Null) | Some(Value::String(_)) => Ok(()),
        Some(Value::Object(map)) => {
            for (key, item) in map {
                validate_json_value(item, &format!("$.{key}"))?;
            }
            Ok(())
        }
        Some(other) => Err(StateError::InvalidType(format!(
            "state must be a JSON object or string, got {}",
            json_type_name(other)
        ))),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Canonical UTF-8 JSON bytes of a payload: compact separators, keys sorted
/// at every level, `null` for an absent payload.
#[must_use]
pub fn canonical_state_bytes(state: Option<&Value>) -> Vec<u8> {
    let value = state.unwrap_or(&Value::Null);
    serde_json::to_vec(value).expect("JSON value serialization is infallible")
}

/// Canonical bytes of any JSON value (cache keys, trace payloads).
#[must_use]
pub fn canonical_json_bytes(value: &Value) -> Vec<u8> {
    serde_json::to_vec(value).expect("JSON value serialization is infallible")
}

/// Hex SHA-256 of a byte payload.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// `sha256:`-prefixed checksum of canonical bytes.
#[must_use]
pub fn state_checksum(canonical: &[u8]) -> String {
    format!("{CHECKSUM_PREFIX}{}", sha256_hex(canonical))
}

/// `{byte_length, char_length}` summary of the canonical encoding.
#[must_use]
pub fn build_state_summary(canonical: &[u8]) -> Map<String, Value> {
    let char_length = String::from_utf8_lossy(canonical).chars().count();
    let mut summary = Map::new();
    summary.insert("byte_length".into(), Value::from(canonical.len()));
    summary.insert("char_length".into(), Value::from(char_length));
    summary
}

/// Deterministic blob key for an offloaded state payload.
#[must_use]
pub fn build_state_key(tenant_id: &str, execution_id: &str, turn_index: i64, prefix: &str)
-> String {
    format!("{prefix}/{tenant_id}/{execution_id}/state_{turn_index}.json.gz")
}

/// Persist a state payload: inline when the canonical bytes fit under
/// `max_inline_bytes`, gzip-offloaded to the blob store otherwise.
///
/// # Errors
///
/// [`StateError::InvalidType`] on validation failure;
/// [`StateError::Offload`] when offload is required but no store/bucket is
/// available or the write fails.
#[allow(clippy::too_many_arguments)]
pub fn persist_state_payload(
    state: Option<&Value>,
    tenant_id: &str,
    execution_id: &str,
    turn_index: i64,
    max_inline_bytes: usize,
    blob_store: Option<&dyn BlobStore>,
    bucket: Option<&str>,
    prefix: &str,
) -> Result<StatePayloadRecord, StateError> {
    validate_state_payload(state)?;

    let canonical = canonical_state_bytes(state);
    let checksum = state_checksum(&canonical);
    let summary = build_state_summary(&canonical);

    if canonical.len() <= max_inline_bytes {
        return Ok(StatePayloadRecord {
            state_json: Some(state.cloned().unwrap_or(Value::Null)),
            state_s3_uri: None,
            checksum,
            summary,
        });
    }

    let (Some(store), Some(bucket)) = (blob_store, bucket) else {
        return Err(StateError::Offload(
            "blob store and bucket required for offloaded state".into(),
        ));
    };
    let key = build_state_key(tenant_id, execution_id, turn_index, prefix);
    let payload = state.cloned().unwrap_or(Value::Null);
    store
        .put_gzip_json(bucket, &key, &payload)
        .map_err(|err| StateError::Offload(err.to_string()))?;

    Ok(StatePayloadRecord {
        state_json: None,
        state_s3_uri: Some(join_s3_uri(bucket, &key)),
        checksum,
        summary,
    })
}

/// Load a state payload given the row fields: inline takes effect only when
/// no offload URI is recorded.
///
/// # Errors
///
/// [`StateError::Offload`] when the offloaded blob cannot be read;
/// [`StateError::InvalidType`] when the loaded payload fails validation.
pub fn load_state_payload(
    state_json: Option<&Value>,
    state_s3_uri: Option<&str>,
    blob_store: &dyn BlobStore,
) -> Result<Option<Value>, StateError> {
    let payload = if let Some(uri) = state_s3_uri {
        let (bucket, key) =
            rlm_store::split_s3_uri(uri).map_err(|err| StateError::Offload(err.to_string()))?;
        Some(
            blob_store
                .get_gzip_json(&bucket, &key)
                .map_err(|err| StateError::Offload(err.to_string()))?,
        )
    } else {
        state_json.cloned()
    };
    validate_state_payload(payload.as_ref())?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rlm_store::MemoryBlobStore;
    use serde_json::json;

    #[test]
    fn canonical_bytes_sort_keys_at_every_level() {
        let a = json!({"b": {"z": 1, "a": 2}, "a": 1});
        let b = json!({"a": 1, "b": {"a": 2, "z": 1}});
        assert_eq!(canonical_state_bytes(Some(&a)), canonical_state_bytes(Some(&b)));
        assert_eq!(
            String::from_utf8(canonical_state_bytes(Some(&a))).unwrap(),
            r#"{"a":1,"b":{"a":2,"z":1}}"#
        );
    }

    #[test]
    fn absent_state_canonicalizes_to_null() {
        assert_eq!(canonical_state_bytes(None), b"null");
    }

    #[test]
    fn checksum_carries_prefix() {
        let checksum = state_checksum(b"null");
        assert!(checksum.starts_with("sha256:"));
        assert_eq!(checksum.len(), "sha256:".len() + 64);
    }

    #[test]
    fn validation_accepts_object_string_null() {
        validate_state_payload(None).unwrap();
        validate_state_payload(Some(&Value::Null)).unwrap();
        validate_state_payload(Some(&json!("notes"))).unwrap();
        validate_state_payload(Some(&json!({"work": {"hits": [1, 2.5, null, true]}}))).unwrap();
    }

    #[test]
    fn validation_rejects_top_level_array_and_number() {
        assert!(validate_state_payload(Some(&json!([1, 2]))).is_err());
        assert!(validate_state_payload(Some(&json!(42))).is_err());
        assert!(validate_state_payload(Some(&json!(true))).is_err());
    }

    #[test]
    fn inline_when_small() {
        let record = persist_state_payload(
            Some(&json!({"a": 1})),
            "t1",
            "e1",
            0,
            DEFAULT_INLINE_MAX_BYTES,
            None,
            None,
            DEFAULT_STATE_PREFIX,
        )
        .unwrap();
        assert!(record.state_json.is_some());
        assert!(record.state_s3_uri.is_none());
        assert_eq!(record.summary["byte_length"], json!(7));
    }

    #[test]
    fn offload_when_large_and_loads_back() {
        let store = MemoryBlobStore::new();
        let big = json!({"work": "x".repeat(1000)});
        let record = persist_state_payload(
            Some(&big),
            "t1",
            "e1",
            3,
            16,
            Some(&store),
            Some("bucket"),
            DEFAULT_STATE_PREFIX,
        )
        .unwrap();
        assert!(record.state_json.is_none());
        let uri = record.state_s3_uri.as_deref().unwrap();
        assert_eq!(uri, "s3://bucket/state/t1/e1/state_3.json.gz");

        let loaded = load_state_payload(None, Some(uri), &store).unwrap();
        assert_eq!(loaded, Some(big));
    }

    #[test]
    fn offload_without_store_fails() {
        let big = json!({"work": "x".repeat(1000)});
        let err = persist_state_payload(
            Some(&big),
            "t1",
            "e1",
            0,
            16,
            None,
            None,
            DEFAULT_STATE_PREFIX,
        )
        .unwrap_err();
        assert!(matches!(err, StateError::Offload(_)));
    }

    #[test]
    fn summary_counts_chars_not_bytes() {
        let state = json!({"s": "é"});
        let canonical = canonical_state_bytes(Some(&state));
        let summary = build_state_summary(&canonical);
        let bytes = summary["byte_length"].as_u64().unwrap();
        let chars = summary["char_length"].as_u64().unwrap();
        assert!(bytes > chars);
    }

    // -- round-trip laws ------------------------------------------------

    fn arb_json_leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[a-z]{0,12}".prop_map(Value::from),
        ]
    }

    fn arb_state_object() -> impl Strategy<Value = Value> {
        prop::collection::btree_map("[a-z_]{1,8}", arb_json_leaf(), 0..8)
            .prop_map(|map| Value::Object(map.into_iter().collect()))
    }

    proptest! {
        #[test]
        fn encode_decode_is_identity_modulo_canonicalization(state in arb_state_object()) {
            let bytes = canonical_state_bytes(Some(&state));
            let decoded: Value = serde_json::from_slice(&bytes).unwrap();
            prop_assert_eq!(&decoded, &state);
            // Re-encoding the decoded value is byte-stable.
            prop_assert_eq!(canonical_state_bytes(Some(&decoded)), bytes);
        }

        #[test]
        fn checksum_is_stable_across_reserialization(state in arb_state_object()) {
            let first = state_checksum(&canonical_state_bytes(Some(&state)));
            let reparsed: Value =
                serde_json::from_slice(&canonical_state_bytes(Some(&state))).unwrap();
            let second = state_checksum(&canonical_state_bytes(Some(&reparsed)));
            prop_assert_eq!(first, second);
        }
    }
}
