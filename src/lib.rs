//! # edgequake-docpipe
//!
//! A distributed document-to-text pipeline: documents (PDF, and Office
//! formats converted via LibreOffice) are split into pages, each page is
//! dispatched to a vision-capable AI model with MuPDF-extracted text as a
//! fallback and cross-check, and results are aggregated back into a single
//! document.
//!
//! ## Why this shape?
//!
//! A single long HTTP request per document does not survive provider rate
//! limits, multi-minute documents, or a worker crashing mid-job. This crate
//! instead durably queues one unit of work per page (Redis Streams, at-least-
//! once with consumer groups), dispatches pages through a bounded
//! provider/model failover chain guarded by per-(provider,model) circuit
//! breakers, and lets an independent job controller assemble the result once
//! every page has reported in — or once a deadline forces a partial result.
//!
//! ## Pipeline overview
//!
//! ```text
//! document
//!  │
//!  ├─ 1. download & prepare   object store fetch, office → PDF via LibreOffice
//!  ├─ 2. extract              per-page MuPDF text (pdfium), extractable-text sampling
//!  ├─ 3. prepare payloads     render pages to JPEG, truncate shared context
//!  ├─ 4. enqueue              one queue entry per page (Redis Streams)
//!  ├─ 5. dispatch             failover chain across provider/model steps, circuit breakers
//!  └─ 6. finalize             aggregate page results in page order, upload, promote
//! ```
//!
//! ## Feature flags
//!
//! | Feature   | Default | Description |
//! |-----------|---------|-------------|
//! | `bundled` | on      | Bundles a pdfium binary via `pdfium-auto` instead of requiring a system install |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod breaker;
pub mod config;
pub mod controller;
pub mod error;
pub mod extract;
pub mod http;
pub mod metrics;
pub mod objectstore;
pub mod pages;
pub mod providers;
pub mod queue;
pub mod status;
pub mod worker;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::ServiceConfig;
pub use error::{FailureKind, ServiceError, ServiceResult};
pub use objectstore::{DocRef, ObjectStore};
pub use queue::{PageResult, PageSource, PageWorkItem, Queue};
