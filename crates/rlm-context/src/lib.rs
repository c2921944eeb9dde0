// SPDX-License-Identifier: MIT OR Apache-2.0
//! Read-through document views over the blob store.
//!
//! A [`DocView`] exposes one parsed document as a length-bounded
//! random-access character sequence. Construction is lazy: the offsets index
//! is fetched on first use and text bytes are fetched by byte-range reads
//! keyed on the checkpoints surrounding the requested character window.
//! Every read appends a [`SpanLogEntry`] to the owning [`ContextView`]'s
//! span log; scanning probes are tagged `scan:*` so the citation resolver
//! can exclude them.
//!
//! Character positions are Unicode scalar value counts throughout.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod offsets;

use offsets::OffsetsIndex;
use rlm_core::{ContextDocument, ContextManifest, SpanLogEntry};
use rlm_store::{BlobStore, split_s3_uri};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

/// Errors from document reads.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// Inverted or out-of-bounds character range.
    #[error("invalid character range {start}..{end}")]
    InvalidRange {
        /// Requested start character.
        start: u64,
        /// Requested end character.
        end: u64,
    },
    /// Integer index outside `0..char_length`.
    #[error("document index {index} out of range for length {length}")]
    IndexOutOfRange {
        /// Requested index (after negative-index normalization).
        index: i64,
        /// Document character length.
        length: u64,
    },
    /// The offsets payload is missing or malformed.
    #[error("offsets index invalid: {0}")]
    Offsets(String),
    /// Blob fetch failed (surfaces as `S3_READ_ERROR` at the step surface).
    #[error("document read failed")]
    Read(#[from] rlm_store::BlobError),
    /// Fetched bytes were not valid UTF-8 at the expected boundaries.
    #[error("document bytes are not valid UTF-8: {0}")]
    Decode(String),
}

/// A single character-range hit from a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanHit {
    /// Inclusive start character.
    pub start_char: u64,
    /// Exclusive end character.
    pub end_char: u64,
}

type SpanLog = Rc<RefCell<Vec<SpanLogEntry>>>;

/// Lazy random-access view over one parsed document.
pub struct DocView {
    document: ContextDocument,
    store: Arc<dyn BlobStore>,
    span_log: SpanLog,
    text_bucket: String,
    text_key: String,
    offsets_bucket: String,
    offsets_key: String,
    meta_location: Option<(String, String)>,
    offsets: RefCell<Option<Rc<OffsetsIndex>>>,
    meta: RefCell<Option<Rc<serde_json::Value>>>,
}

impl DocView {
    fn new(
        document: ContextDocument,
        store: Arc<dyn BlobStore>,
        span_log: SpanLog,
    ) -> Result<Self, ContextError> {
        let (text_bucket, text_key) = split_s3_uri(&document.text_s3_uri)?;
        let (offsets_bucket, offsets_key) = split_s3_uri(&document.offsets_s3_uri)?;
        let meta_location = match &document.meta_s3_uri {
            Some(uri) => Some(split_s3_uri(uri)?),
            None => None,
        };
        Ok(Self {
            document,
            store,
            span_log,
            text_bucket,
            text_key,
            offsets_bucket,
            offsets_key,
            meta_location,
            offsets: RefCell::new(None),
            meta: RefCell::new(None),
        })
    }

    /// Document identifier.
    #[must_use]
    pub fn doc_id(&self) -> &str {
        &self.document.doc_id
    }

    /// Document index within the session.
    #[must_use]
    pub fn doc_index(&self) -> u32 {
        self.document.doc_index
    }

    /// Document length in characters (fetches offsets on first use).
    pub fn char_length(&self) -> Result<u64, ContextError> {
        Ok(self.get_offsets()?.char_length)
    }

    /// Read `[start, end)` after Python-style clamping of `None`/negative
    /// bounds, logging a span with the given tag.
    pub fn slice(
        &self,
        start: Option<i64>,
        end: Option<i64>,
        tag: Option<&str>,
    ) -> Result<String, ContextError> {
        let (start_char, end_char) = self.normalize_range(start, end)?;
        self.log_span(start_char, end_char, tag);
        if start_char == end_char {
            return Ok(String::new());
        }
        self.read_range(start_char, end_char)
    }

    /// Read the single character at `index` (negative counts from the end),
    /// logging a one-character span.
    pub fn index(&self, index: i64) -> Result<String, ContextError> {
        let length = self.char_length()?;
        let resolved = if index < 0 {
            index + length as i64
        } else {
            index
        };
        if resolved < 0 || resolved as u64 >= length {
            return Err(ContextError::IndexOutOfRange { index, length });
        }
        let start = resolved as u64;
        self.log_span(start, start + 1, None);
        self.read_range(start, start + 1)
    }

    /// Literal substring scan over `[start, end)`, returning up to
    /// `max_hits` hits. Streams checkpoint-sized windows and carries a
    /// `len(term)-1` tail so matches spanning two windows are found. Emits a
    /// single `scan:find` span covering the scanned range.
    pub fn find(
        &self,
        term: &str,
        start: Option<i64>,
        end: Option<i64>,
        max_hits: usize,
    ) -> Result<Vec<ScanHit>, ContextError> {
        if term.is_empty() || max_hits == 0 {
            return Ok(Vec::new());
        }
        let (start_char, end_char) = self.normalize_range(start, end)?;
        if start_char >= end_char {
            return Ok(Vec::new());
        }
        self.log_span(start_char, end_char, Some("scan:find"));

        let offsets = self.get_offsets()?;
        let needle: Vec<char> = term.chars().collect();
        let overlap = needle.len().saturating_sub(1);

        let windows = offsets.window_bounds(start_char, end_char);
        let mut hits = Vec::new();
        let mut tail: Vec<char> = Vec::new();
        for (chunk_start, chunk_end) in windows {
            if chunk_end <= chunk_start {
                continue;
            }
            let chunk = self.read_range(chunk_start, chunk_end)?;
            let mut text: Vec<char> = tail.clone();
            text.extend(chunk.chars());
            let text_start = chunk_start - tail.len() as u64;

            let mut search_from = 0usize;
            while let Some(pos) = find_chars(&text, &needle, search_from) {
                let match_start = text_start + pos as u64;
                let match_end = match_start + needle.len() as u64;
                if match_start < start_char || match_end > end_char || match_end <= chunk_start {
                    search_from = pos + 1;
                    continue;
                }
                hits.push(ScanHit {
                    start_char: match_start,
                    end_char: match_end,
                });
                if hits.len() >= max_hits {
                    return Ok(hits);
                }
                search_from = pos + 1;
            }
            if overlap > 0 {
                let keep = text.len().saturating_sub(overlap);
                tail = text[keep..].to_vec();
            } else {
                tail.clear();
            }
        }
        Ok(hits)
    }

    /// Regex scan over `[start, end)`, returning up to `max_hits` hits.
    /// Invalid patterns return no hits. Emits a single `scan:regex` span.
    pub fn regex(
        &self,
        pattern: &str,
        start: Option<i64>,
        end: Option<i64>,
        max_hits: usize,
    ) -> Result<Vec<ScanHit>, ContextError> {
        if pattern.is_empty() || max_hits == 0 {
            return Ok(Vec::new());
        }
        let Ok(compiled) = regex::Regex::new(pattern) else {
            return Ok(Vec::new());
        };
        let (start_char, end_char) = self.normalize_range(start, end)?;
        if start_char >= end_char {
            return Ok(Vec::new());
        }
        self.log_span(start_char, end_char, Some("scan:regex"));

        let text = self.read_range(start_char, end_char)?;
        // Map byte offsets reported by the regex engine back to characters.
        let mut byte_to_char = std::collections::BTreeMap::new();
        for (char_offset, (byte_offset, _)) in text.char_indices().enumerate() {
            byte_to_char.insert(byte_offset, char_offset as u64);
        }
        byte_to_char.insert(text.len(), text.chars().count() as u64);

        let mut hits = Vec::new();
        for found in compiled.find_iter(&text) {
            let match_start = start_char + byte_to_char[&found.start()];
            let match_end = start_char + byte_to_char[&found.end()];
            hits.push(ScanHit {
                start_char: match_start,
                end_char: match_end,
            });
            if hits.len() >= max_hits {
                break;
            }
        }
        Ok(hits)
    }

    /// Page spans from the structural metadata blob, empty when absent.
    pub fn page_spans(&self) -> Vec<serde_json::Value> {
        let Some(meta) = self.get_meta() else {
            return Vec::new();
        };
        let Some(pages) = meta.get("pages").and_then(|p| p.as_array()) else {
            return Vec::new();
        };
        pages
            .iter()
            .filter(|page| {
                page.get("page_num").is_some_and(serde_json::Value::is_i64)
                    && page.get("start_char").is_some_and(serde_json::Value::is_i64)
                    && page.get("end_char").is_some_and(serde_json::Value::is_i64)
            })
            .cloned()
            .collect()
    }

    /// Top-level structure children from the metadata blob, empty when absent.
    pub fn sections(&self) -> Vec<serde_json::Value> {
        let Some(meta) = self.get_meta() else {
            return Vec::new();
        };
        let Some(children) = meta
            .get("structure")
            .and_then(|s| s.get("children"))
            .and_then(|c| c.as_array())
        else {
            return Vec::new();
        };
        children.iter().filter(|c| c.is_object()).cloned().collect()
    }

    // --- internals ---

    fn log_span(&self, start_char: u64, end_char: u64, tag: Option<&str>) {
        self.span_log.borrow_mut().push(SpanLogEntry {
            doc_index: self.document.doc_index,
            start_char,
            end_char,
            tag: tag.map(String::from),
        });
    }

    fn get_offsets(&self) -> Result<Rc<OffsetsIndex>, ContextError> {
        if let Some(offsets) = self.offsets.borrow().as_ref() {
            return Ok(Rc::clone(offsets));
        }
        let payload = self
            .store
            .get_json(&self.offsets_bucket, &self.offsets_key)?;
        let index = Rc::new(OffsetsIndex::from_payload(&payload)?);
        *self.offsets.borrow_mut() = Some(Rc::clone(&index));
        Ok(index)
    }

    fn get_meta(&self) -> Option<Rc<serde_json::Value>> {
        if let Some(meta) = self.meta.borrow().as_ref() {
            return Some(Rc::clone(meta));
        }
        let (bucket, key) = self.meta_location.as_ref()?;
        let payload = self.store.get_json(bucket, key).ok()?;
        if !payload.is_object() {
            return None;
        }
        let meta = Rc::new(payload);
        *self.meta.borrow_mut() = Some(Rc::clone(&meta));
        Some(meta)
    }

    /// Python-slice clamping: `None` bounds default to the ends, negative
    /// bounds count from the end, everything clamps into `0..=length`.
    fn normalize_range(&self, start: Option<i64>, end: Option<i64>)
    -> Result<(u64, u64), ContextError> {
        let length = self.char_length()? as i64;
        let clamp = |bound: i64| -> i64 {
            let resolved = if bound < 0 { bound + length } else { bound };
            resolved.clamp(0, length)
        };
        let start_char = clamp(start.unwrap_or(0));
        let mut end_char = clamp(end.unwrap_or(length));
        if end_char < start_char {
            end_char = start_char;
        }
        Ok((start_char as u64, end_char as u64))
    }

    fn read_range(&self, start_char: u64, end_char: u64) -> Result<String, ContextError> {
        let offsets = self.get_offsets()?;
        let (lo, hi) = offsets.resolve_window(start_char, end_char)?;
        if hi.byte <= lo.byte {
            return Ok(String::new());
        }
        let payload = self
            .store
            .get_range(&self.text_bucket, &self.text_key, lo.byte, hi.byte)?;
        let chunk =
            String::from_utf8(payload).map_err(|err| ContextError::Decode(err.to_string()))?;
        let skip = (start_char - lo.char) as usize;
        let take = (end_char - start_char) as usize;
        Ok(chunk.chars().skip(skip).take(take).collect())
    }
}

/// Naive character-wise substring search starting at `from`.
fn find_chars(haystack: &[char], needle: &[char], from: usize) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (from..=haystack.len() - needle.len()).find(|&pos| haystack[pos..pos + needle.len()] == *needle)
}

/// The ordered set of [`DocView`]s a step may read, sharing one span log.
pub struct ContextView {
    docs: Vec<Rc<DocView>>,
    span_log: SpanLog,
}

impl ContextView {
    /// Build views over every manifest document. No I/O happens here.
    pub fn new(manifest: &ContextManifest, store: Arc<dyn BlobStore>)
    -> Result<Self, ContextError> {
        let span_log: SpanLog = Rc::new(RefCell::new(Vec::new()));
        let docs = manifest
            .docs
            .iter()
            .map(|doc| {
                DocView::new(doc.clone(), Arc::clone(&store), Rc::clone(&span_log)).map(Rc::new)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { docs, span_log })
    }

    /// Number of documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// `true` when the manifest was empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Fetch a document view by position (negative counts from the end).
    pub fn get(&self, index: i64) -> Result<Rc<DocView>, ContextError> {
        let length = self.docs.len() as i64;
        let resolved = if index < 0 { index + length } else { index };
        if resolved < 0 || resolved >= length {
            return Err(ContextError::IndexOutOfRange {
                index,
                length: length as u64,
            });
        }
        Ok(Rc::clone(&self.docs[resolved as usize]))
    }

    /// Spans logged so far, in program order.
    #[must_use]
    pub fn span_log(&self) -> Vec<SpanLogEntry> {
        self.span_log.borrow().clone()
    }
}
