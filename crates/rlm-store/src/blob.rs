// SPDX-License-Identifier: MIT OR Apache-2.0
//! Blob store: byte payloads addressed by `(bucket, key)`.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Errors from blob operations.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// The requested object does not exist (the "404-shaped" class; cache
    /// layers treat this as a miss rather than a failure).
    #[error("blob not found: {bucket}/{key}")]
    NotFound {
        /// Bucket searched.
        bucket: String,
        /// Key searched.
        key: String,
    },
    /// A URI could not be parsed as `s3://bucket/key`.
    #[error("invalid blob URI: {0}")]
    InvalidUri(String),
    /// Payload bytes could not be decoded (UTF-8, JSON, or gzip).
    #[error("blob decode failed for {key}: {message}")]
    Decode {
        /// Key whose payload failed to decode.
        key: String,
        /// Decode failure description.
        message: String,
    },
    /// Underlying I/O failure.
    #[error("blob I/O error")]
    Io(#[from] std::io::Error),
    /// Backend-specific failure.
    #[error("blob backend error: {0}")]
    Backend(String),
}

impl BlobError {
    /// `true` for the not-found class that caches treat as a miss.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Byte storage addressed by `(bucket, key)`.
///
/// Ranged reads are half-open `[start, end)` byte offsets.
pub trait BlobStore: Send + Sync {
    /// Store a payload, overwriting any existing object.
    fn put_bytes(&self, bucket: &str, key: &str, payload: &[u8]) -> Result<(), BlobError>;

    /// Fetch a whole object.
    fn get_bytes(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BlobError>;

    /// Fetch the byte range `[start, end)` of an object.
    fn get_range(&self, bucket: &str, key: &str, start: u64, end: u64)
    -> Result<Vec<u8>, BlobError>;

    /// Store a JSON value as canonical bytes.
    fn put_json(&self, bucket: &str, key: &str, payload: &Value) -> Result<(), BlobError> {
        let body = serde_json::to_vec(payload)
            .map_err(|err| BlobError::Backend(format!("serialize json: {err}")))?;
        self.put_bytes(bucket, key, &body)
    }

    /// Fetch and parse a JSON object.
    fn get_json(&self, bucket: &str, key: &str) -> Result<Value, BlobError> {
        let body = self.get_bytes(bucket, key)?;
        serde_json::from_slice(&body).map_err(|err| BlobError::Decode {
            key: key.to_string(),
            message: err.to_string(),
        })
    }

    /// Store a JSON value gzip-compressed.
    fn put_gzip_json(&self, bucket: &str, key: &str, payload: &Value) -> Result<(), BlobError> {
        let body = serde_json::to_vec(payload)
            .map_err(|err| BlobError::Backend(format!("serialize json: {err}")))?;
        self.put_bytes(bucket, key, &gzip_bytes(&body)?)
    }

    /// Fetch and decompress a gzip JSON object.
    fn get_gzip_json(&self, bucket: &str, key: &str) -> Result<Value, BlobError> {
        let body = self.get_bytes(bucket, key)?;
        let decompressed = gunzip_bytes(&body).map_err(|err| BlobError::Decode {
            key: key.to_string(),
            message: err.to_string(),
        })?;
        serde_json::from_slice(&decompressed).map_err(|err| BlobError::Decode {
            key: key.to_string(),
            message: err.to_string(),
        })
    }
}

/// Gzip-compress a payload.
///
/// # Errors
///
/// Returns [`BlobError::Io`] if the encoder fails.
pub fn gzip_bytes(payload: &[u8]) -> Result<Vec<u8>, BlobError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload)?;
    Ok(encoder.finish()?)
}

/// Decompress a gzip payload.
///
/// # Errors
///
/// Returns [`BlobError::Io`] if the payload is not valid gzip.
pub fn gunzip_bytes(payload: &[u8]) -> Result<Vec<u8>, BlobError> {
    let mut decoder = GzDecoder::new(payload);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn slice_range(body: &[u8], bucket: &str, key: &str, start: u64, end: u64)
-> Result<Vec<u8>, BlobError> {
    if start > end {
        return Err(BlobError::Backend(format!(
            "invalid byte range {start}..{end} for {bucket}/{key}"
        )));
    }
    let len = body.len() as u64;
    let start = start.min(len) as usize;
    let end = end.min(len) as usize;
    Ok(body[start..end].to_vec())
}

// ---------------------------------------------------------------------------
// MemoryBlobStore
// ---------------------------------------------------------------------------

/// In-memory blob store, used by tests and the demo binary.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn object_key(bucket: &str, key: &str) -> String {
        format!("{bucket}/{key}")
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.lock().expect("blob store poisoned").len()
    }

    /// `true` when no objects are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for MemoryBlobStore {
    fn put_bytes(&self, bucket: &str, key: &str, payload: &[u8]) -> Result<(), BlobError> {
        self.objects
            .lock()
            .expect("blob store poisoned")
            .insert(Self::object_key(bucket, key), payload.to_vec());
        Ok(())
    }

    fn get_bytes(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BlobError> {
        self.objects
            .lock()
            .expect("blob store poisoned")
            .get(&Self::object_key(bucket, key))
            .cloned()
            .ok_or_else(|| BlobError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    fn get_range(
        &self,
        bucket: &str,
        key: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<u8>, BlobError> {
        let body = self.get_bytes(bucket, key)?;
        slice_range(&body, bucket, key, start, end)
    }
}

// ---------------------------------------------------------------------------
// FsBlobStore
// ---------------------------------------------------------------------------

/// Directory-rooted blob store: objects live at `<root>/<bucket>/<key>`.
#[derive(Debug)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Create a store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        let mut path = self.root.join(bucket);
        for part in key.split('/') {
            path.push(part);
        }
        path
    }

    fn map_read_err(err: std::io::Error, bucket: &str, key: &str) -> BlobError {
        if err.kind() == std::io::ErrorKind::NotFound {
            BlobError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }
        } else {
            BlobError::Io(err)
        }
    }

    /// The directory this store is rooted at.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl BlobStore for FsBlobStore {
    fn put_bytes(&self, bucket: &str, key: &str, payload: &[u8]) -> Result<(), BlobError> {
        let path = self.object_path(bucket, key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, payload)?;
        Ok(())
    }

    fn get_bytes(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BlobError> {
        std::fs::read(self.object_path(bucket, key))
            .map_err(|err| Self::map_read_err(err, bucket, key))
    }

    fn get_range(
        &self,
        bucket: &str,
        key: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<u8>, BlobError> {
        let body = self.get_bytes(bucket, key)?;
        slice_range(&body, bucket, key, start, end)
    }
}
