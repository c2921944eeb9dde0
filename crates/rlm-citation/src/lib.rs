// SPDX-License-Identifier: MIT OR Apache-2.0
//! Span → citation resolution.
//!
//! Scanning spans are dropped, the remainder merged per document with a
//! configurable gap tolerance, and each merged span projected to a
//! [`SpanRef`] carrying the SHA-256 of its NFC-normalized text. Checksums
//! are therefore stable under any normalization-equivalent byte encoding of
//! the same text, and the verification path re-reads the span through a
//! document view and compares.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use rlm_core::{SpanLogEntry, SpanRef};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use unicode_normalization::UnicodeNormalization;

/// Prefix carried by every citation checksum.
pub const CHECKSUM_PREFIX: &str = "sha256:";

/// Errors from citation resolution.
#[derive(Debug, thiserror::Error)]
pub enum CitationError {
    /// A span's bounds are inverted or exceed the document text.
    #[error("invalid span bounds {start_char}..{end_char} (text length {text_length})")]
    InvalidBounds {
        /// Span start.
        start_char: u64,
        /// Span end.
        end_char: u64,
        /// Length of the document text.
        text_length: u64,
    },
    /// A merged span references a document missing from the input set.
    #[error("missing document for doc_index {0}")]
    MissingDocument(u32),
}

/// A document's full text alongside its identity.
#[derive(Debug, Clone)]
pub struct DocumentText {
    /// Document identifier.
    pub doc_id: String,
    /// Document index within the session.
    pub doc_index: u32,
    /// Full parsed text.
    pub text: String,
}

/// A merged, tag-free span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanRange {
    /// Document index.
    pub doc_index: u32,
    /// Inclusive start character.
    pub start_char: u64,
    /// Exclusive end character.
    pub end_char: u64,
}

/// NFC-normalize text.
#[must_use]
pub fn normalize_text(text: &str) -> String {
    text.nfc().collect()
}

/// `sha256:`-prefixed digest of the NFC-normalized text.
#[must_use]
pub fn checksum_text(text: &str) -> String {
    let normalized = normalize_text(text);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{CHECKSUM_PREFIX}{:x}", hasher.finalize())
}

/// Merge a span log: group by document, sort by `(start, end)`, and coalesce
/// spans whose gap is at most `merge_gap_chars` (default 0, meaning only
/// adjacent or overlapping spans merge).
///
/// Merging is idempotent: merging an already-merged log is a no-op.
#[must_use]
pub fn merge_span_log(span_log: &[SpanLogEntry], merge_gap_chars: u64) -> Vec<SpanRange> {
    let mut by_doc: BTreeMap<u32, Vec<(u64, u64)>> = BTreeMap::new();
    for span in span_log {
        if span.end_char < span.start_char {
            continue;
        }
        by_doc
            .entry(span.doc_index)
            .or_default()
            .push((span.start_char, span.end_char));
    }

    let mut merged = Vec::new();
    for (doc_index, mut spans) in by_doc {
        spans.sort_unstable();
        let mut iter = spans.into_iter();
        let Some((mut current_start, mut current_end)) = iter.next() else {
            continue;
        };
        for (start, end) in iter {
            if start <= current_end.saturating_add(merge_gap_chars) {
                current_end = current_end.max(end);
            } else {
                merged.push(SpanRange {
                    doc_index,
                    start_char: current_start,
                    end_char: current_end,
                });
                current_start = start;
                current_end = end;
            }
        }
        merged.push(SpanRange {
            doc_index,
            start_char: current_start,
            end_char: current_end,
        });
    }
    merged
}

/// Build a [`SpanRef`] for a span of a document's text.
///
/// # Errors
///
/// [`CitationError::InvalidBounds`] when the span does not fit the text.
pub fn build_span_ref(
    tenant_id: &str,
    session_id: &str,
    document: &DocumentText,
    start_char: u64,
    end_char: u64,
) -> Result<SpanRef, CitationError> {
    let text_length = document.text.chars().count() as u64;
    if end_char < start_char || end_char > text_length {
        return Err(CitationError::InvalidBounds {
            start_char,
            end_char,
            text_length,
        });
    }
    let slice: String = document
        .text
        .chars()
        .skip(start_char as usize)
        .take((end_char - start_char) as usize)
        .collect();
    Ok(SpanRef {
        tenant_id: tenant_id.to_string(),
        session_id: session_id.to_string(),
        doc_id: document.doc_id.clone(),
        doc_index: document.doc_index,
        start_char,
        end_char,
        checksum: checksum_text(&slice),
    })
}

/// Project a span log to user-visible citations: drop `scan:*` spans, merge,
/// and checksum each merged span against the document texts.
///
/// # Errors
///
/// [`CitationError::MissingDocument`] when a span references an unknown
/// document; [`CitationError::InvalidBounds`] when a span does not fit.
pub fn make_span_refs(
    span_log: &[SpanLogEntry],
    documents: &[DocumentText],
    tenant_id: &str,
    session_id: &str,
    merge_gap_chars: u64,
) -> Result<Vec<SpanRef>, CitationError> {
    let lookup: BTreeMap<u32, &DocumentText> =
        documents.iter().map(|doc| (doc.doc_index, doc)).collect();
    let filtered: Vec<SpanLogEntry> = span_log
        .iter()
        .filter(|span| !span.is_scan())
        .cloned()
        .collect();
    let merged = merge_span_log(&filtered, merge_gap_chars);

    merged
        .into_iter()
        .map(|span| {
            let document = lookup
                .get(&span.doc_index)
                .ok_or(CitationError::MissingDocument(span.doc_index))?;
            build_span_ref(tenant_id, session_id, document, span.start_char, span.end_char)
        })
        .collect()
}

/// Verify a citation against the document text it claims to cite.
///
/// Returns `false` on any mismatch, including out-of-bounds spans.
#[must_use]
pub fn verify_span_ref(span_ref: &SpanRef, document: &DocumentText) -> bool {
    if span_ref.doc_index != document.doc_index {
        return false;
    }
    match build_span_ref(
        &span_ref.tenant_id,
        &span_ref.session_id,
        document,
        span_ref.start_char,
        span_ref.end_char,
    ) {
        Ok(rebuilt) => rebuilt.checksum == span_ref.checksum,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(doc_index: u32, start: u64, end: u64, tag: Option<&str>) -> SpanLogEntry {
        SpanLogEntry {
            doc_index,
            start_char: start,
            end_char: end,
            tag: tag.map(String::from),
        }
    }

    fn document(doc_index: u32, text: &str) -> DocumentText {
        DocumentText {
            doc_id: format!("d{doc_index}"),
            doc_index,
            text: text.to_string(),
        }
    }

    #[test]
    fn checksum_is_stable_under_normalization() {
        // "é" composed vs decomposed.
        let composed = "caf\u{e9}";
        let decomposed = "cafe\u{301}";
        assert_ne!(composed.as_bytes(), decomposed.as_bytes());
        assert_eq!(checksum_text(composed), checksum_text(decomposed));
        assert!(checksum_text(composed).starts_with("sha256:"));
    }

    #[test]
    fn merge_coalesces_overlapping_and_adjacent() {
        let log = vec![
            span(0, 10, 20, None),
            span(0, 15, 25, None),
            span(0, 25, 30, None),
            span(0, 40, 50, None),
        ];
        let merged = merge_span_log(&log, 0);
        assert_eq!(
            merged,
            vec![
                SpanRange { doc_index: 0, start_char: 10, end_char: 30 },
                SpanRange { doc_index: 0, start_char: 40, end_char: 50 },
            ]
        );
    }

    #[test]
    fn merge_respects_gap_tolerance() {
        let log = vec![span(0, 0, 10, None), span(0, 13, 20, None)];
        assert_eq!(merge_span_log(&log, 0).len(), 2);
        assert_eq!(
            merge_span_log(&log, 3),
            vec![SpanRange { doc_index: 0, start_char: 0, end_char: 20 }]
        );
    }

    #[test]
    fn merge_is_idempotent() {
        let log = vec![
            span(1, 5, 9, None),
            span(0, 0, 4, None),
            span(1, 8, 12, None),
            span(0, 2, 3, None),
        ];
        let once = merge_span_log(&log, 0);
        let twice_input: Vec<SpanLogEntry> = once
            .iter()
            .map(|range| span(range.doc_index, range.start_char, range.end_char, None))
            .collect();
        assert_eq!(merge_span_log(&twice_input, 0), once);
    }

    #[test]
    fn merge_groups_by_document() {
        let log = vec![span(1, 0, 5, None), span(0, 0, 5, None)];
        let merged = merge_span_log(&log, 0);
        assert_eq!(merged[0].doc_index, 0);
        assert_eq!(merged[1].doc_index, 1);
    }

    #[test]
    fn scan_spans_never_become_citations() {
        let log = vec![
            span(0, 0, 16, Some("scan:find")),
            span(0, 0, 16, Some("scan:regex")),
        ];
        let refs =
            make_span_refs(&log, &[document(0, "Alpha beta gamma")], "t", "s", 0).unwrap();
        assert!(refs.is_empty());
    }

    #[test]
    fn tagged_reads_do_become_citations() {
        let log = vec![span(0, 0, 5, Some("clause"))];
        let refs =
            make_span_refs(&log, &[document(0, "Alpha beta gamma")], "t", "s", 0).unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].start_char, 0);
        assert_eq!(refs[0].end_char, 5);
    }

    #[test]
    fn span_ref_checksum_matches_slice() {
        let doc = document(0, "Alpha beta gamma delta");
        let refs = make_span_refs(&[span(0, 0, 5, None)], &[doc], "t1", "s1", 0).unwrap();
        assert_eq!(refs.len(), 1);
        let expected = {
            let mut hasher = Sha256::new();
            hasher.update("Alpha".as_bytes());
            format!("sha256:{:x}", hasher.finalize())
        };
        assert_eq!(refs[0].checksum, expected);
        assert_eq!(refs[0].doc_id, "d0");
        assert_eq!(refs[0].tenant_id, "t1");
    }

    #[test]
    fn missing_document_is_an_error() {
        let err = make_span_refs(&[span(3, 0, 1, None)], &[document(0, "x")], "t", "s", 0)
            .unwrap_err();
        assert!(matches!(err, CitationError::MissingDocument(3)));
    }

    #[test]
    fn out_of_bounds_span_is_an_error() {
        let err =
            build_span_ref("t", "s", &document(0, "short"), 0, 99).unwrap_err();
        assert!(matches!(err, CitationError::InvalidBounds { .. }));
    }

    #[test]
    fn verify_detects_tampering() {
        let doc = document(0, "Alpha beta gamma");
        let span_ref = build_span_ref("t", "s", &doc, 6, 10).unwrap();
        assert!(verify_span_ref(&span_ref, &doc));

        let mut tampered = span_ref.clone();
        tampered.checksum = "sha256:0000".into();
        assert!(!verify_span_ref(&tampered, &doc));

        let mut shifted = span_ref;
        shifted.start_char = 7;
        assert!(!verify_span_ref(&shifted, &doc));
    }

    #[test]
    fn verify_multibyte_spans() {
        let doc = document(0, "héllo wörld");
        let span_ref = build_span_ref("t", "s", &doc, 6, 11).unwrap();
        assert!(verify_span_ref(&span_ref, &doc));
    }
}
