// SPDX-License-Identifier: MIT OR Apache-2.0
//! Storage abstractions for the RLM runtime.
//!
//! Two seams: [`BlobStore`] for byte payloads addressed by `(bucket, key)`
//! (parsed text, offsets, offloaded state, caches, traces) and
//! [`RecordStore`] for the typed rows of the single-table layout (sessions,
//! documents, executions, execution state, code log).
//!
//! Both traits are synchronous: the sandbox interpreter reads documents
//! mid-step and must remain a plain tree walk. Conditional-write failures on
//! the record store are `Ok(false)`, never errors — a lost conditional write
//! means another replica won, and the caller simply moves on.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod blob;
pub mod record;

pub use blob::{BlobError, BlobStore, FsBlobStore, MemoryBlobStore};
pub use record::{ExecutionFinalization, MemoryRecordStore, RecordError, RecordStore};

/// Split an `s3://bucket/key` URI into its bucket and key.
///
/// # Errors
///
/// Returns [`BlobError::InvalidUri`] for any other scheme or an empty bucket.
pub fn split_s3_uri(uri: &str) -> Result<(String, String), BlobError> {
    let rest = uri
        .strip_prefix("s3://")
        .ok_or_else(|| BlobError::InvalidUri(uri.to_string()))?;
    let (bucket, key) = rest
        .split_once('/')
        .ok_or_else(|| BlobError::InvalidUri(uri.to_string()))?;
    if bucket.is_empty() || key.is_empty() {
        return Err(BlobError::InvalidUri(uri.to_string()));
    }
    Ok((bucket.to_string(), key.to_string()))
}

/// Join a bucket and key back into an `s3://` URI.
#[must_use]
pub fn join_s3_uri(bucket: &str, key: &str) -> String {
    format!("s3://{bucket}/{key}")
}
