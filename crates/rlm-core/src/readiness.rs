// SPDX-License-Identifier: MIT OR Apache-2.0
//! Session readiness: the precondition executions check before running.

use crate::records::DocumentRecord;
use crate::{IngestStatus, ReadinessMode};
use serde::{Deserialize, Serialize};

/// Readiness verdict for a session's document set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionReadiness {
    /// Every document is parsed (or beyond).
    pub parsed_ready: bool,
    /// Every document is search-indexed.
    pub search_ready: bool,
    /// The session satisfies its readiness mode.
    pub ready: bool,
}

/// Compute readiness over a session's documents.
///
/// Lax requires every document parsed; Strict additionally requires every
/// document indexed, but only when search is enabled for the session — with
/// search off there is no index to wait for.
#[must_use]
pub fn compute_readiness(
    documents: &[DocumentRecord],
    mode: ReadinessMode,
    enable_search: bool,
) -> SessionReadiness {
    let parsed_ready = !documents.is_empty()
        && documents.iter().all(|doc| {
            matches!(
                doc.ingest_status,
                IngestStatus::Parsed | IngestStatus::Indexing | IngestStatus::Indexed
            )
        });
    let search_ready = !documents.is_empty()
        && documents
            .iter()
            .all(|doc| doc.ingest_status == IngestStatus::Indexed);
    let ready = match mode {
        ReadinessMode::Lax => parsed_ready,
        ReadinessMode::Strict => {
            if enable_search {
                parsed_ready && search_ready
            } else {
                parsed_ready
            }
        }
    };
    SessionReadiness {
        parsed_ready,
        search_ready,
        ready,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(index: u32, status: IngestStatus) -> DocumentRecord {
        DocumentRecord {
            tenant_id: "t".into(),
            session_id: "s".into(),
            doc_id: format!("d{index}"),
            doc_index: index,
            source_name: format!("doc-{index}.txt"),
            mime_type: "text/plain".into(),
            raw_s3_uri: format!("s3://bucket/raw/{index}"),
            text_s3_uri: None,
            meta_s3_uri: None,
            offsets_s3_uri: None,
            search_index_s3_uri: None,
            char_length: None,
            byte_length: None,
            text_checksum: None,
            parser_version: None,
            ingest_status: status,
            failure_reason: None,
        }
    }

    #[test]
    fn lax_ready_when_all_parsed() {
        let docs = vec![doc(0, IngestStatus::Parsed), doc(1, IngestStatus::Indexed)];
        let readiness = compute_readiness(&docs, ReadinessMode::Lax, true);
        assert!(readiness.parsed_ready);
        assert!(readiness.ready);
        assert!(!readiness.search_ready);
    }

    #[test]
    fn lax_not_ready_while_parsing() {
        let docs = vec![doc(0, IngestStatus::Parsing)];
        assert!(!compute_readiness(&docs, ReadinessMode::Lax, false).ready);
    }

    #[test]
    fn strict_requires_indexing_when_search_enabled() {
        let docs = vec![doc(0, IngestStatus::Parsed)];
        assert!(!compute_readiness(&docs, ReadinessMode::Strict, true).ready);
        let docs = vec![doc(0, IngestStatus::Indexed)];
        assert!(compute_readiness(&docs, ReadinessMode::Strict, true).ready);
    }

    #[test]
    fn strict_without_search_degrades_to_parsed() {
        let docs = vec![doc(0, IngestStatus::Parsed)];
        assert!(compute_readiness(&docs, ReadinessMode::Strict, false).ready);
    }

    #[test]
    fn empty_document_set_is_never_ready() {
        assert!(!compute_readiness(&[], ReadinessMode::Lax, false).ready);
    }
}
