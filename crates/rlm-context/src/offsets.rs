// SPDX-License-Identifier: MIT OR Apache-2.0
//! Character→byte checkpoint index over parsed text.
//!
//! The offsets blob maps character positions to byte positions at a fixed
//! interval so a view can fetch any character window with a single
//! byte-range read. The first checkpoint is always `(0, 0)` and the last is
//! `(char_length, byte_length)`.

use crate::ContextError;
use serde::{Deserialize, Serialize};

/// Schema version written into offsets payloads.
pub const OFFSETS_VERSION: &str = "v1";

/// Default characters-per-checkpoint interval.
pub const DEFAULT_CHECKPOINT_INTERVAL: usize = 1024;

/// One `(char, byte)` checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Character position.
    pub char: u64,
    /// Byte position of that character in the UTF-8 text blob.
    pub byte: u64,
}

/// The persisted offsets blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetsPayload {
    /// Schema version.
    pub version: String,
    /// Document this index belongs to.
    pub doc_id: String,
    /// Total characters.
    pub char_length: u64,
    /// Total bytes.
    pub byte_length: u64,
    /// Text encoding; always `utf-8`.
    pub encoding: String,
    /// Sorted checkpoints, `(0,0)` first, `(char_length, byte_length)` last.
    pub checkpoints: Vec<Checkpoint>,
    /// Interval the checkpoints were built at.
    pub checkpoint_interval: u64,
}

/// Normalize line endings to `\n` (the parsed-text contract).
#[must_use]
pub fn normalize_text(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Build an offsets payload for parsed text at the given interval.
///
/// An interval of zero degenerates to a single window over the whole text.
#[must_use]
pub fn build_offsets(doc_id: &str, text: &str, interval: usize) -> OffsetsPayload {
    let interval = if interval == 0 {
        text.chars().count().max(1)
    } else {
        interval
    };
    let mut checkpoints = vec![Checkpoint { char: 0, byte: 0 }];
    let mut byte_offset = 0u64;
    let mut char_offset = 0u64;
    for ch in text.chars() {
        byte_offset += ch.len_utf8() as u64;
        char_offset += 1;
        if char_offset % interval as u64 == 0 {
            checkpoints.push(Checkpoint {
                char: char_offset,
                byte: byte_offset,
            });
        }
    }
    if checkpoints.last().map(|cp| cp.char) != Some(char_offset) {
        checkpoints.push(Checkpoint {
            char: char_offset,
            byte: byte_offset,
        });
    }
    OffsetsPayload {
        version: OFFSETS_VERSION.into(),
        doc_id: doc_id.into(),
        char_length: char_offset,
        byte_length: byte_offset,
        encoding: "utf-8".into(),
        checkpoints,
        checkpoint_interval: interval as u64,
    }
}

/// Parsed, query-ready form of an offsets payload.
#[derive(Debug, Clone)]
pub struct OffsetsIndex {
    /// Total characters.
    pub char_length: u64,
    /// Total bytes.
    pub byte_length: u64,
    checkpoints: Vec<Checkpoint>,
}

impl OffsetsIndex {
    /// Parse an offsets blob payload.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Offsets`] when checkpoints are missing,
    /// unsorted, or do not start at `(0, 0)`.
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self, ContextError> {
        let parsed: OffsetsPayload = serde_json::from_value(payload.clone())
            .map_err(|err| ContextError::Offsets(err.to_string()))?;
        if parsed.checkpoints.is_empty() {
            return Err(ContextError::Offsets("checkpoints missing".into()));
        }
        if parsed.checkpoints[0] != (Checkpoint { char: 0, byte: 0 }) {
            return Err(ContextError::Offsets(
                "first checkpoint must be (0, 0)".into(),
            ));
        }
        if !parsed
            .checkpoints
            .windows(2)
            .all(|pair| pair[0].char <= pair[1].char && pair[0].byte <= pair[1].byte)
        {
            return Err(ContextError::Offsets("checkpoints not sorted".into()));
        }
        Ok(Self {
            char_length: parsed.char_length,
            byte_length: parsed.byte_length,
            checkpoints: parsed.checkpoints,
        })
    }

    /// Build directly from a payload struct (test and ingestion paths).
    #[must_use]
    pub fn from_parts(payload: &OffsetsPayload) -> Self {
        Self {
            char_length: payload.char_length,
            byte_length: payload.byte_length,
            checkpoints: payload.checkpoints.clone(),
        }
    }

    /// Resolve `[start_char, end_char)` to the surrounding checkpoint pair:
    /// the last checkpoint at or before `start_char` and the first at or
    /// after `end_char`.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::InvalidRange`] for inverted ranges or ranges
    /// past the document length.
    pub fn resolve_window(&self, start_char: u64, end_char: u64)
    -> Result<(Checkpoint, Checkpoint), ContextError> {
        if start_char > end_char || end_char > self.char_length {
            return Err(ContextError::InvalidRange {
                start: start_char,
                end: end_char,
            });
        }
        let lo_index = match self
            .checkpoints
            .partition_point(|cp| cp.char <= start_char)
        {
            0 => 0,
            n => n - 1,
        };
        let hi_index = self
            .checkpoints
            .partition_point(|cp| cp.char < end_char)
            .min(self.checkpoints.len() - 1);
        Ok((self.checkpoints[lo_index], self.checkpoints[hi_index]))
    }

    /// Checkpoint-aligned `(chunk_start, chunk_end)` character windows
    /// covering `[start_char, end_char)`, for streaming scans.
    #[must_use]
    pub fn window_bounds(&self, start_char: u64, end_char: u64) -> Vec<(u64, u64)> {
        if start_char >= end_char {
            return Vec::new();
        }
        let start_index = match self
            .checkpoints
            .partition_point(|cp| cp.char <= start_char)
        {
            0 => 0,
            n => n - 1,
        };
        let end_index = self
            .checkpoints
            .partition_point(|cp| cp.char < end_char)
            .min(self.checkpoints.len() - 1);
        let mut windows = Vec::new();
        for index in start_index..=end_index {
            let chunk_start = start_char.max(self.checkpoints[index].char);
            let chunk_end = if index + 1 < self.checkpoints.len() {
                end_char.min(self.checkpoints[index + 1].char)
            } else {
                end_char
            };
            if chunk_end > chunk_start {
                windows.push((chunk_start, chunk_end));
            }
        }
        windows
    }
}
