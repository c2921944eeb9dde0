//! Unified error taxonomy with stable error codes for the RLM runtime.
//!
//! Every runtime error carries an [`ErrorCode`] (a machine-readable, stable
//! string tag), a human-readable message, an optional cause chain, and
//! arbitrary JSON details. Use the builder returned by [`RlmError::new`] to
//! construct errors fluently.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Authentication / authorization failures.
    Auth,
    /// Session lookup and lifecycle errors.
    Session,
    /// Execution lookup errors.
    Execution,
    /// Malformed or oversized caller input.
    Request,
    /// Budget and turn-count exhaustion.
    Budget,
    /// Sandbox rejection and in-step resource trips.
    Sandbox,
    /// State payload validation and integrity errors.
    State,
    /// Blob / record store errors.
    Storage,
    /// Errors from external collaborators (parser, completion provider).
    Upstream,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Auth => "auth",
            Self::Session => "session",
            Self::Execution => "execution",
            Self::Request => "request",
            Self::Budget => "budget",
            Self::Sandbox => "sandbox",
            Self::State => "state",
            Self::Storage => "storage",
            Self::Upstream => "upstream",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases. These are the codes
/// surfaced to callers in error envelopes, step errors, and tool-result
/// metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Auth --
    /// Missing or invalid credentials.
    Unauthorized,
    /// Authenticated but not allowed to touch this resource.
    Forbidden,

    // -- Session --
    /// Session does not exist for this tenant.
    SessionNotFound,
    /// Session documents are not parsed (or indexed, in strict mode) yet.
    SessionNotReady,
    /// Session TTL has elapsed.
    SessionExpired,

    // -- Execution --
    /// Execution does not exist for this tenant.
    ExecutionNotFound,

    // -- Request --
    /// Caller input failed validation.
    ValidationError,
    /// Too many requests.
    RateLimited,
    /// Request body exceeds the configured size cap.
    RequestTooLarge,

    // -- Budget --
    /// A budget dimension (subcalls, prompt chars, wall clock, ...) is spent.
    BudgetExceeded,
    /// The execution consumed its turn budget.
    MaxTurnsExceeded,

    // -- Sandbox --
    /// A step exceeded `max_step_seconds`.
    StepTimeout,
    /// The program was rejected by the syntactic policy validator.
    SandboxAstRejected,
    /// The program exceeds the configured line cap.
    SandboxLineLimit,

    // -- State --
    /// State payload is not a valid JSON tree of the allowed shape.
    StateInvalidType,
    /// Canonical state exceeds the per-step character limit.
    StateTooLarge,
    /// Re-read span text does not hash to the recorded checksum.
    ChecksumMismatch,

    // -- Storage --
    /// A blob store read failed (not a cache-miss-shaped error).
    S3ReadError,

    // -- Upstream --
    /// The document parser reported a failure.
    ParserError,
    /// The completion provider failed after retries.
    LlmProviderError,

    // -- Internal --
    /// Catch-all for unexpected internal errors.
    InternalError,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Unauthorized | Self::Forbidden => ErrorCategory::Auth,

            Self::SessionNotFound | Self::SessionNotReady | Self::SessionExpired => {
                ErrorCategory::Session
            }

            Self::ExecutionNotFound => ErrorCategory::Execution,

            Self::ValidationError | Self::RateLimited | Self::RequestTooLarge => {
                ErrorCategory::Request
            }

            Self::BudgetExceeded | Self::MaxTurnsExceeded => ErrorCategory::Budget,

            Self::StepTimeout | Self::SandboxAstRejected | Self::SandboxLineLimit => {
                ErrorCategory::Sandbox
            }

            Self::StateInvalidType | Self::StateTooLarge | Self::ChecksumMismatch => {
                ErrorCategory::State
            }

            Self::S3ReadError => ErrorCategory::Storage,

            Self::ParserError | Self::LlmProviderError => ErrorCategory::Upstream,

            Self::InternalError => ErrorCategory::Internal,
        }
    }

    /// Stable `&'static str` representation of the code (e.g.
    /// `"SANDBOX_AST_REJECTED"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::SessionNotReady => "SESSION_NOT_READY",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::ExecutionNotFound => "EXECUTION_NOT_FOUND",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::RateLimited => "RATE_LIMITED",
            Self::RequestTooLarge => "REQUEST_TOO_LARGE",
            Self::BudgetExceeded => "BUDGET_EXCEEDED",
            Self::MaxTurnsExceeded => "MAX_TURNS_EXCEEDED",
            Self::StepTimeout => "STEP_TIMEOUT",
            Self::SandboxAstRejected => "SANDBOX_AST_REJECTED",
            Self::SandboxLineLimit => "SANDBOX_LINE_LIMIT",
            Self::StateInvalidType => "STATE_INVALID_TYPE",
            Self::StateTooLarge => "STATE_TOO_LARGE",
            Self::ChecksumMismatch => "CHECKSUM_MISMATCH",
            Self::S3ReadError => "S3_READ_ERROR",
            Self::ParserError => "PARSER_ERROR",
            Self::LlmProviderError => "LLM_PROVIDER_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RlmError
// ---------------------------------------------------------------------------

/// Unified runtime error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and structured JSON details.
///
/// # Builder usage
///
/// ```
/// use rlm_error::{ErrorCode, RlmError};
///
/// let err = RlmError::new(ErrorCode::BudgetExceeded, "LLM subcall budget exceeded")
///     .with_detail("limit", 4)
///     .with_detail("observed", 5);
/// ```
pub struct RlmError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Structured details for diagnostics and caller envelopes.
    pub details: BTreeMap<String, serde_json::Value>,
}

impl RlmError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            details: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the details map.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }
}

impl fmt::Debug for RlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("RlmError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.details.is_empty() {
            d.field("details", &self.details);
        }
        d.finish()
    }
}

impl fmt::Display for RlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.details.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(details) = serde_json::to_string(&self.details) {
                write!(f, " {details}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RlmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Wire envelope
// ---------------------------------------------------------------------------

/// Serialisable snapshot of an [`RlmError`] (without the opaque source).
///
/// This is the `{code, message, details?}` shape surfaced to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorInfo {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured details.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
}

impl From<&RlmError> for ErrorInfo {
    fn from(err: &RlmError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            details: err.details.clone(),
        }
    }
}

impl From<ErrorInfo> for RlmError {
    fn from(info: ErrorInfo) -> Self {
        Self {
            code: info.code,
            message: info.message,
            source: None,
            details: info.details,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
