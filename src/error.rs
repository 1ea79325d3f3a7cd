//! Error types for the document pipeline.
//!
//! Two distinct failure modes, the same split the donor crate draws between
//! a fatal, process/job-level error and a per-unit error that does not abort
//! the surrounding operation:
//!
//! * [`ServiceError`] — **Fatal**: the job (or the process) cannot proceed at
//!   all (bad document reference, object store unreachable, queue
//!   unreachable, decryption failure).
//!
//! * [`FailureKind`] — **Per-attempt**: classifies a single failover attempt
//!   so the worker loop (§4.3.1) knows whether to continue the chain, open
//!   the breaker, or abort outright.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors surfaced by the document pipeline.
///
/// Per-attempt failures use [`FailureKind`] and do not propagate here — a
/// single page's failure never aborts the job.
#[derive(Debug, Error)]
pub enum ServiceError {
    // ── Input / validation errors ────────────────────────────────────────

    /// The document reference could not be parsed into `scheme://bucket/key`.
    #[error("invalid document reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    /// Required request field missing or malformed JSON body.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Referenced object does not exist in the object store.
    #[error("object not found: {key}")]
    ObjectNotFound { key: String },

    /// The document could not be decrypted with the supplied password.
    #[error("decryption failed for '{key}': {detail}")]
    DecryptionFailed { key: String, detail: String },

    /// The envelope magic/format was not recognised.
    #[error("unrecognised object envelope for '{key}'")]
    UnrecognisedEnvelope { key: String },

    // ── Conversion / extraction errors ───────────────────────────────────

    /// Office-to-PDF conversion failed or timed out.
    #[error("document conversion failed for '{key}': {detail}")]
    ConversionFailed { key: String, detail: String },

    /// PDF is encrypted and no password was supplied, or the password is wrong.
    #[error("PDF '{key}' requires a password")]
    PasswordRequired { key: String },

    /// pdfium could not parse the document at all.
    #[error("PDF '{key}' is corrupt: {detail}")]
    CorruptPdf { key: String, detail: String },

    /// pdfium failed to rasterise a specific page.
    #[error("rasterisation failed for {key} page {page}: {detail}")]
    RasterisationFailed {
        key: String,
        page: usize,
        detail: String,
    },

    // ── Shared-store errors ──────────────────────────────────────────────

    /// The queue (Redis) is unreachable or returned a protocol error.
    #[error("queue error: {0}")]
    Queue(String),

    /// The status or page artifact store is unreachable or returned a protocol error.
    #[error("store error: {0}")]
    Store(String),

    // ── Object store I/O ─────────────────────────────────────────────────

    /// Local-filesystem object store I/O failure.
    #[error("object store I/O failed for '{path}': {source}")]
    ObjectIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────

    /// Builder validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Could not bind to a pdfium library.
    #[error("failed to bind to pdfium library: {0}")]
    PdfiumBindingFailed(String),

    // ── Catch-all ─────────────────────────────────────────────────────────

    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<redis::RedisError> for ServiceError {
    fn from(e: redis::RedisError) -> Self {
        ServiceError::Queue(e.to_string())
    }
}

/// Classification of a failed attempt, per §7's error taxonomy. Carried by
/// [`crate::providers::AttemptOutcome`] and [`crate::worker::failover::ChainOutcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// HTTP 429 or an explicit rate-limit signal. Opens the breaker; chain continues.
    RateLimited,
    /// Deadline exceeded for this attempt. Treated as `RateLimited` for breaker purposes.
    Timeout,
    /// HTTP 5xx, connection reset/refused, EOF, generic network error, or content refusal.
    /// Opens the breaker; chain continues.
    Transient,
    /// HTTP 4xx other than 429, or an explicit validation failure. Aborts the chain;
    /// does not open the breaker.
    Fatal,
}

pub type ServiceResult<T> = Result<T, ServiceError>;
